//! Line and argument parsing for session bookkeeping.
//!
//! The engine's output is forwarded verbatim; these helpers only skim it
//! for the numbers the session manager cares about (achieved throughput,
//! packet loss) and manipulate the iperf-style `-b`/`-t` flags between
//! iterations.

use std::time::Duration;

/// Extract a throughput figure in Mbit/s from an interval or summary line,
/// scaling K/M/G units. Returns `None` for lines without a rate.
pub fn parse_throughput_mbps(line: &str) -> Option<f64> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    for (i, token) in tokens.iter().enumerate() {
        let Some(unit) = token.strip_suffix("bits/sec") else {
            continue;
        };
        if i == 0 {
            continue;
        }
        let Ok(value) = tokens[i - 1].parse::<f64>() else {
            continue;
        };
        let scale = match unit {
            "K" => 1e-3,
            "M" => 1.0,
            "G" => 1e3,
            "" => 1e-6,
            _ => continue,
        };
        return Some(value * scale);
    }
    None
}

/// Extract a packet-loss percentage from a UDP report line, e.g. the
/// `(12.5%)` in `0/1000 (12.5%)`.
pub fn parse_packet_loss(line: &str) -> Option<f32> {
    line.split_whitespace()
        .filter_map(|token| token.strip_prefix('('))
        .filter_map(|token| token.strip_suffix("%)"))
        .find_map(|token| token.parse().ok())
}

/// Current `-b` target bandwidth in Mbit/s, if the vector carries one.
pub fn extract_bandwidth_mbps(args: &[String]) -> Option<u32> {
    let index = args.iter().position(|a| a == "-b")?;
    args.get(index + 1)?
        .trim_end_matches('M')
        .parse()
        .ok()
}

/// Return a copy of `args` with the `-b` flag set to `mbps`, appending the
/// flag if it was absent.
pub fn update_bandwidth(args: &[String], mbps: u32) -> Vec<String> {
    let mut updated = args.to_vec();
    let value = format!("{mbps}M");
    match updated.iter().position(|a| a == "-b") {
        Some(index) if index + 1 < updated.len() => updated[index + 1] = value,
        _ => {
            updated.push("-b".to_owned());
            updated.push(value);
        }
    }
    updated
}

/// Expected run duration derived from the `-t` flag (default 10 s) plus a
/// grace buffer, used as the per-iteration watchdog budget.
pub fn test_duration(args: &[String], buffer_secs: u64) -> Duration {
    let seconds = args
        .iter()
        .position(|a| a == "-t")
        .and_then(|index| args.get(index + 1))
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(10);
    Duration::from_secs(seconds + buffer_secs)
}
