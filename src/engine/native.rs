//! Native TCP upload engine -- blocking client used when no external engine
//! is embedded.
//!
//! Deliberately synchronous: the bridge runs it on the blocking pool, which
//! is exactly the contract the adapter traits describe. Interval and summary
//! lines go to the attached sink in iperf-like formatting.

use std::io::Write;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::{Engine, EngineError, EngineHandle, StopSwitch};

const DEFAULT_PORT: u16 = 5201;
const DEFAULT_TIME_SECS: u64 = 10;
const DEFAULT_BLOCK_LEN: usize = 128 * 1024;
const DEFAULT_INTERVAL_SECS: u64 = 1;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Engine factory for [`NativeTcpHandle`].
pub struct NativeTcpEngine;

impl Engine for NativeTcpEngine {
    fn create(&self) -> Option<Box<dyn EngineHandle>> {
        Some(Box::new(NativeTcpHandle::default()))
    }
}

/// One configured TCP upload run.
pub struct NativeTcpHandle {
    host: Option<String>,
    port: u16,
    time_secs: u64,
    block_len: usize,
    interval_secs: u64,
    /// `-b` target rate in bits per second; `None` runs unpaced.
    bandwidth_bps: Option<u64>,
    sink: Option<Box<dyn Write + Send>>,
    stop: StopSwitch,
}

impl Default for NativeTcpHandle {
    fn default() -> Self {
        Self {
            host: None,
            port: DEFAULT_PORT,
            time_secs: DEFAULT_TIME_SECS,
            block_len: DEFAULT_BLOCK_LEN,
            interval_secs: DEFAULT_INTERVAL_SECS,
            bandwidth_bps: None,
            sink: None,
            stop: StopSwitch::default(),
        }
    }
}

impl NativeTcpHandle {
    fn run_client(&mut self) -> Result<(), EngineError> {
        let host = self
            .host
            .clone()
            .ok_or_else(|| EngineError::MissingArgument("-c/--client <host>".to_owned()))?;
        let mut sink: Box<dyn Write + Send> = self
            .sink
            .take()
            .unwrap_or_else(|| Box::new(std::io::sink()));
        let target = format!("{}:{}", host, self.port);

        let addr = target
            .to_socket_addrs()
            .map_err(|e| EngineError::Connect {
                target: target.clone(),
                source: e,
            })?
            .next()
            .ok_or_else(|| EngineError::Connect {
                target: target.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    "hostname did not resolve",
                ),
            })?;

        let mut stream =
            TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(|e| {
                EngineError::Connect {
                    target: target.clone(),
                    source: e,
                }
            })?;

        // A stop request interrupts a blocked write by shutting the socket
        // down in both directions.
        let waker = stream.try_clone()?;
        self.stop.set_waker(move || {
            let _ = waker.shutdown(Shutdown::Both);
        });
        if self.stop.is_stopped() {
            // Stop raced connection setup; the hook may have registered too
            // late to fire, so shut the socket down here.
            let _ = stream.shutdown(Shutdown::Both);
            return Ok(());
        }

        writeln!(sink, "connected to {} port {}", host, self.port)?;
        info!(
            peer = %target,
            time_secs = self.time_secs,
            block_len = self.block_len,
            "starting tcp upload"
        );

        let block = vec![0u8; self.block_len.max(1)];
        let total = Duration::from_secs(self.time_secs.max(1));
        let interval = Duration::from_secs(self.interval_secs.max(1));
        let start = Instant::now();
        let mut window_start = start;
        let mut window_bytes: u64 = 0;
        let mut total_bytes: u64 = 0;

        while start.elapsed() < total && !self.stop.is_stopped() {
            match stream.write(&block) {
                Ok(0) => break,
                Ok(n) => {
                    window_bytes += n as u64;
                    total_bytes += n as u64;
                }
                Err(e) => {
                    if self.stop.is_stopped() {
                        break;
                    }
                    return Err(EngineError::Io(e));
                }
            }
            if let Some(bps) = self.bandwidth_bps {
                self.pace(total_bytes, start, bps);
            }
            if window_start.elapsed() >= interval {
                let from = window_start.duration_since(start).as_secs_f64();
                let to = start.elapsed().as_secs_f64();
                writeln!(
                    sink,
                    "[{:5.2}-{:5.2} sec]  {:8.2} MBytes  {:8.1} Mbits/sec",
                    from,
                    to,
                    window_bytes as f64 / (1024.0 * 1024.0),
                    window_bytes as f64 * 8.0 / (to - from).max(1e-9) / 1_000_000.0,
                )?;
                window_start = Instant::now();
                window_bytes = 0;
            }
        }

        let elapsed = start.elapsed().as_secs_f64().max(1e-9);
        writeln!(sink, "- - - - - - - - - - - - - - - - - - - -")?;
        writeln!(
            sink,
            "[ 0.00-{:.2} sec]  {:.2} MBytes  {:.1} Mbits/sec  sender",
            elapsed,
            total_bytes as f64 / (1024.0 * 1024.0),
            total_bytes as f64 * 8.0 / elapsed / 1_000_000.0,
        )?;
        sink.flush()?;

        let _ = stream.shutdown(Shutdown::Both);
        debug!(total_bytes, "tcp upload finished");
        Ok(())
    }

    /// Sleep until the transferred volume matches the target rate, in short
    /// slices so a stop request stays responsive.
    fn pace(&self, total_bytes: u64, start: Instant, bits_per_sec: u64) {
        while !self.stop.is_stopped() {
            match pace_delay(total_bytes, start.elapsed(), bits_per_sec) {
                Some(ahead) => std::thread::sleep(ahead.min(Duration::from_millis(50))),
                None => return,
            }
        }
    }
}

/// How far ahead of the target rate the sender currently is, or `None` when
/// it is on or behind schedule.
fn pace_delay(total_bytes: u64, elapsed: Duration, bits_per_sec: u64) -> Option<Duration> {
    let expected = Duration::from_secs_f64(total_bytes as f64 * 8.0 / bits_per_sec as f64);
    match expected.checked_sub(elapsed) {
        Some(ahead) if !ahead.is_zero() => Some(ahead),
        _ => None,
    }
}

impl EngineHandle for NativeTcpHandle {
    fn apply_defaults(&mut self) {
        let sink = self.sink.take();
        let stop = self.stop.clone();
        *self = Self::default();
        self.sink = sink;
        self.stop = stop;
    }

    fn parse_arguments(&mut self, argv: &[String]) -> Result<(), EngineError> {
        // argv[0] is the program name by convention.
        let mut it = argv.iter().skip(1);
        while let Some(arg) = it.next() {
            match arg.as_str() {
                "-c" | "--client" => self.host = Some(value_for(arg, it.next())?.to_owned()),
                "-p" | "--port" => self.port = parse_value(arg, it.next())?,
                "-t" | "--time" => self.time_secs = parse_value(arg, it.next())?,
                "-l" | "--length" => self.block_len = parse_value(arg, it.next())?,
                "-i" | "--interval" => self.interval_secs = parse_value(arg, it.next())?,
                "-b" | "--bandwidth" => {
                    self.bandwidth_bps = Some(parse_bandwidth(arg, it.next())?)
                }
                other => return Err(EngineError::UnknownArgument(other.to_owned())),
            }
        }
        Ok(())
    }

    fn attach_output(&mut self, sink: Box<dyn Write + Send>) {
        self.sink = Some(sink);
    }

    fn stop_switch(&self) -> StopSwitch {
        self.stop.clone()
    }

    fn run(&mut self) -> Result<(), EngineError> {
        let result = self.run_client();
        // The hook holds a socket clone; never let it outlive the run.
        self.stop.clear_waker();
        result
    }
}

fn value_for<'a>(flag: &str, value: Option<&'a String>) -> Result<&'a str, EngineError> {
    value
        .map(String::as_str)
        .ok_or_else(|| EngineError::MissingValue(flag.to_owned()))
}

fn parse_value<T: std::str::FromStr>(flag: &str, value: Option<&String>) -> Result<T, EngineError> {
    let raw = value_for(flag, value)?;
    raw.parse().map_err(|_| EngineError::InvalidValue {
        flag: flag.to_owned(),
        value: raw.to_owned(),
    })
}

/// Rate value in iperf notation: a number with an optional K/M/G suffix,
/// in bits per second.
fn parse_bandwidth(flag: &str, value: Option<&String>) -> Result<u64, EngineError> {
    let raw = value_for(flag, value)?;
    let (digits, scale) = match raw.as_bytes().last() {
        Some(b'K') | Some(b'k') => (&raw[..raw.len() - 1], 1_000.0),
        Some(b'M') | Some(b'm') => (&raw[..raw.len() - 1], 1_000_000.0),
        Some(b'G') | Some(b'g') => (&raw[..raw.len() - 1], 1_000_000_000.0),
        _ => (raw, 1.0),
    };
    match digits.parse::<f64>() {
        Ok(value) if value > 0.0 => Ok((value * scale) as u64),
        _ => Err(EngineError::InvalidValue {
            flag: flag.to_owned(),
            value: raw.to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct CaptureSink(Arc<Mutex<Vec<u8>>>);

    impl CaptureSink {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl Write for CaptureSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn args(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn test_parse_arguments_full_grammar() {
        let mut handle = NativeTcpHandle::default();
        handle
            .parse_arguments(&args(&[
                "perfbridge",
                "-c",
                "example.com",
                "--port",
                "5202",
                "-t",
                "3",
                "-l",
                "4096",
                "-i",
                "2",
            ]))
            .unwrap();
        assert_eq!(handle.host.as_deref(), Some("example.com"));
        assert_eq!(handle.port, 5202);
        assert_eq!(handle.time_secs, 3);
        assert_eq!(handle.block_len, 4096);
        assert_eq!(handle.interval_secs, 2);
    }

    #[test]
    fn test_parse_arguments_rejects_unknown_flag() {
        let mut handle = NativeTcpHandle::default();
        let err = handle
            .parse_arguments(&args(&["perfbridge", "--bogus"]))
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownArgument(_)));
    }

    #[test]
    fn test_parse_arguments_missing_value() {
        let mut handle = NativeTcpHandle::default();
        let err = handle
            .parse_arguments(&args(&["perfbridge", "-c"]))
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingValue(_)));
    }

    #[test]
    fn test_parse_arguments_bandwidth_units() {
        let mut handle = NativeTcpHandle::default();
        handle
            .parse_arguments(&args(&["perfbridge", "-b", "50M"]))
            .unwrap();
        assert_eq!(handle.bandwidth_bps, Some(50_000_000));

        handle
            .parse_arguments(&args(&["perfbridge", "--bandwidth", "500K"]))
            .unwrap();
        assert_eq!(handle.bandwidth_bps, Some(500_000));

        handle
            .parse_arguments(&args(&["perfbridge", "-b", "1G"]))
            .unwrap();
        assert_eq!(handle.bandwidth_bps, Some(1_000_000_000));

        let err = handle
            .parse_arguments(&args(&["perfbridge", "-b", "fast"]))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidValue { .. }));
    }

    #[test]
    fn test_accepts_session_ramp_bandwidth_flag() {
        // The session manager rewrites `-b` between iterations; the native
        // grammar has to accept the vectors it produces.
        let base = args(&["perfbridge", "-c", "host", "-t", "1"]);
        let ramped = crate::session::parse::update_bandwidth(&base, 50);

        let mut handle = NativeTcpHandle::default();
        handle.parse_arguments(&ramped).unwrap();
        assert_eq!(handle.bandwidth_bps, Some(50_000_000));
    }

    #[test]
    fn test_pace_delay_tracks_target_rate() {
        // 125 kB at 1 Mbit/s should take one second.
        let ahead = pace_delay(125_000, Duration::from_millis(200), 1_000_000)
            .expect("sender is ahead of schedule");
        assert!(ahead > Duration::from_millis(700) && ahead <= Duration::from_millis(800));
        assert_eq!(pace_delay(125_000, Duration::from_secs(2), 1_000_000), None);
    }

    #[test]
    fn test_parse_arguments_invalid_port() {
        let mut handle = NativeTcpHandle::default();
        let err = handle
            .parse_arguments(&args(&["perfbridge", "-p", "notaport"]))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidValue { .. }));
    }

    #[test]
    fn test_run_without_host_fails() {
        let mut handle = NativeTcpHandle::default();
        let err = handle.run().unwrap_err();
        assert!(matches!(err, EngineError::MissingArgument(_)));
    }

    #[test]
    fn test_run_streams_summary_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            if let Ok((mut conn, _)) = listener.accept() {
                let mut buf = [0u8; 64 * 1024];
                while matches!(conn.read(&mut buf), Ok(n) if n > 0) {}
            }
        });

        let mut handle = NativeTcpHandle::default();
        handle.apply_defaults();
        handle
            .parse_arguments(&args(&[
                "perfbridge",
                "-c",
                "127.0.0.1",
                "-p",
                &port.to_string(),
                "-t",
                "1",
                "-l",
                "8192",
            ]))
            .unwrap();
        let sink = CaptureSink::default();
        handle.attach_output(Box::new(sink.clone()));
        handle.run().unwrap();

        let text = sink.text();
        assert!(text.contains("connected to 127.0.0.1"), "got: {text}");
        assert!(text.contains("Mbits/sec"), "got: {text}");
        assert!(text.contains("sender"), "got: {text}");
    }

    #[test]
    fn test_stop_interrupts_long_run() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept but never read, so the engine's writes eventually block on
        // a full socket buffer.
        std::thread::spawn(move || {
            if let Ok((conn, _)) = listener.accept() {
                std::thread::sleep(Duration::from_secs(20));
                drop(conn);
            }
        });

        let mut handle = NativeTcpHandle::default();
        handle
            .parse_arguments(&args(&[
                "perfbridge",
                "-c",
                "127.0.0.1",
                "-p",
                &port.to_string(),
                "-t",
                "30",
            ]))
            .unwrap();
        handle.attach_output(Box::new(CaptureSink::default()));
        let stop = handle.stop_switch();

        let started = Instant::now();
        let worker = std::thread::spawn(move || handle.run());
        std::thread::sleep(Duration::from_millis(200));
        stop.request_stop();

        let result = worker.join().unwrap();
        assert!(result.is_ok(), "cooperative stop is not an error");
        assert!(
            started.elapsed() < Duration::from_secs(10),
            "stop should interrupt the run promptly"
        );
    }
}
