use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::Notify;

use perfbridge::session::{RampMode, Session, SessionConfig};
use perfbridge::{FnObserver, LiveBridge, NativeTcpEngine};

#[derive(Parser)]
#[command(
    name = "perfbridge",
    about = "Embeddable live bridge for blocking network throughput tests",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single throughput test, streaming engine output to stdout
    Run {
        /// Server host to test against
        #[arg(long)]
        host: String,

        /// Server port
        #[arg(long, default_value = "5201")]
        port: u16,

        /// Test duration in seconds
        #[arg(long, default_value = "10")]
        time: u64,

        /// Seconds between progress reports
        #[arg(long, default_value = "1")]
        interval: u64,

        /// Write block size in bytes
        #[arg(long, default_value = "131072")]
        length: usize,
    },

    /// Run a multi-iteration test session
    Session {
        /// Server host to test against
        #[arg(long)]
        host: String,

        /// Server port
        #[arg(long, default_value = "5201")]
        port: u16,

        /// Per-iteration test duration in seconds
        #[arg(long, default_value = "10")]
        time: u64,

        /// Number of test iterations
        #[arg(long, default_value = "3")]
        iterations: u32,

        /// Seconds to wait between iterations
        #[arg(long, default_value = "5")]
        wait: u64,

        /// Bandwidth ramp mode
        #[arg(long, value_enum, default_value_t = RampArg::None)]
        ramp: RampArg,

        /// Directory for run logs
        #[arg(long)]
        log_dir: Option<std::path::PathBuf>,

        /// JSON session summary
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum RampArg {
    None,
    Incremental,
    Smart,
}

impl From<RampArg> for RampMode {
    fn from(arg: RampArg) -> Self {
        match arg {
            RampArg::None => RampMode::None,
            RampArg::Incremental => RampMode::Incremental,
            RampArg::Smart => RampMode::Smart,
        }
    }
}

fn engine_args(host: &str, port: u16, time: u64, interval: u64, length: usize) -> Vec<String> {
    vec![
        "perfbridge".to_owned(),
        "-c".to_owned(),
        host.to_owned(),
        "-p".to_owned(),
        port.to_string(),
        "-t".to_owned(),
        time.to_string(),
        "-i".to_owned(),
        interval.to_string(),
        "-l".to_owned(),
        length.to_string(),
    ]
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            host,
            port,
            time,
            interval,
            length,
        } => {
            let bridge = LiveBridge::new(Arc::new(NativeTcpEngine));
            let done = Arc::new(Notify::new());
            let observer = {
                let done = done.clone();
                Arc::new(FnObserver::new(
                    |line: &str| println!("{line}"),
                    |message: &str| eprintln!("error: {message}"),
                    move || done.notify_one(),
                ))
            };

            let args = engine_args(&host, port, time, interval, length);
            bridge.start(&args, observer).await;

            tokio::select! {
                _ = done.notified() => {}
                _ = tokio::signal::ctrl_c() => {
                    bridge.stop().await;
                    done.notified().await;
                }
            }
        }
        Commands::Session {
            host,
            port,
            time,
            iterations,
            wait,
            ramp,
            log_dir,
            json,
        } => {
            let bridge = LiveBridge::new(Arc::new(NativeTcpEngine));
            let config = SessionConfig {
                iterations,
                wait_secs: wait,
                ramp: ramp.into(),
                log_dir,
            };
            let session = Arc::new(Session::new(bridge, config));

            let ctl = session.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    ctl.stop().await;
                }
            });

            let done = Arc::new(Notify::new());
            let observer = {
                let done = done.clone();
                Arc::new(FnObserver::new(
                    |line: &str| println!("{line}"),
                    |message: &str| eprintln!("error: {message}"),
                    move || done.notify_one(),
                ))
            };

            let args = engine_args(&host, port, time, 1, 128 * 1024);
            let report = session.run(&args, observer).await;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!();
                println!("Session summary");
                println!("  iterations run : {}", report.iterations_run);
                println!("  stopped by user: {}", report.stopped_by_user);
                println!("  had errors     : {}", report.had_errors);
                if let Some(mbps) = report.max_throughput_mbps {
                    println!("  max throughput : {mbps:.1} Mbit/s");
                }
                for part in &report.log_parts {
                    println!("  log part       : {part}");
                }
            }
        }
    }

    Ok(())
}
