//! Multi-iteration test sessions on top of the live bridge.
//!
//! A [`Session`] drives one argument vector through N bridge runs with a
//! configurable wait between iterations, optional bandwidth ramp-up, a
//! per-iteration watchdog, and a rotating run log. The caller's observer
//! sees every streamed line plus the session's own banner and summary
//! lines, and exactly one `on_complete` for the whole session.

pub mod log;
pub mod parse;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::bridge::observer::TestObserver;
use crate::bridge::LiveBridge;
use log::RotatingLog;

/// How the `-b` bandwidth target evolves across iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RampMode {
    /// Run every iteration with the caller's arguments as-is.
    #[default]
    None,
    /// Step the target up by 50 Mbit/s per iteration, capped at the
    /// caller's original `-b` value. Skipped when the original target is
    /// 100 Mbit/s or lower.
    Incremental,
    /// Start at 50 Mbit/s and grow the step only when the achieved
    /// throughput reached 90 % of the current target.
    Smart,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub iterations: u32,
    pub wait_secs: u64,
    pub ramp: RampMode,
    /// Directory for rotating run logs; `None` disables logging to disk.
    pub log_dir: Option<std::path::PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            iterations: 1,
            wait_secs: 5,
            ramp: RampMode::None,
            log_dir: None,
        }
    }
}

/// Machine-readable outcome of one session.
#[derive(Debug, Serialize)]
pub struct SessionReport {
    pub iterations_run: u32,
    pub stopped_by_user: bool,
    pub had_errors: bool,
    pub max_throughput_mbps: Option<f64>,
    pub packet_loss_percent: Vec<f32>,
    pub log_parts: Vec<String>,
}

pub struct Session {
    bridge: LiveBridge,
    config: SessionConfig,
    stopped: AtomicBool,
    log: Option<Arc<RotatingLog>>,
}

impl Session {
    pub fn new(bridge: LiveBridge, config: SessionConfig) -> Self {
        let log = config.log_dir.as_ref().map(|dir| {
            let stem = format!("run_{}", chrono::Local::now().format("%Y%m%d_%H%M%S"));
            Arc::new(RotatingLog::new(dir.clone(), stem))
        });
        Self {
            bridge,
            config,
            stopped: AtomicBool::new(false),
            log,
        }
    }

    /// Stop the session: no further iterations start, and the in-flight
    /// bridge run (if any) is cancelled. Idempotent.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.bridge.stop().await;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Run the configured number of iterations, returning a summary report.
    pub async fn run(&self, args: &[String], observer: Arc<dyn TestObserver>) -> SessionReport {
        let mut current_args = args.to_vec();
        let original_bw = parse::extract_bandwidth_mbps(args);
        let mut step_bw: u32 = 50;
        let mut iterations_run = 0;
        let mut had_errors = false;
        let mut max_mbps: Option<f64> = None;
        let mut loss_history: Vec<f32> = Vec::new();

        for iteration in 0..self.config.iterations {
            if self.is_stopped() {
                break;
            }

            match self.config.ramp {
                RampMode::None => {}
                RampMode::Incremental => match original_bw {
                    Some(original) if original > 100 => {
                        let target = ((iteration + 1) * 50).min(original);
                        current_args = parse::update_bandwidth(&current_args, target);
                        self.emit(&observer, &format!("ramp-up bandwidth set to {target}M"))
                            .await;
                    }
                    _ => {
                        self.emit(&observer, "bandwidth target too low for ramp-up, skipping")
                            .await;
                    }
                },
                RampMode::Smart => {
                    current_args = parse::update_bandwidth(&current_args, step_bw);
                    self.emit(&observer, &format!("bandwidth set to {step_bw}M")).await;
                }
            }

            let now = chrono::Local::now().format("%H:%M:%S");
            self.emit(
                &observer,
                &format!(
                    "[{now}] starting test {}/{}: {}",
                    iteration + 1,
                    self.config.iterations,
                    current_args.join(" ")
                ),
            )
            .await;

            let iter_obs = Arc::new(IterationObserver::new(observer.clone(), self.log.clone()));
            self.bridge.start(&current_args, iter_obs.clone()).await;

            // Watchdog: the bridge itself imposes no timeout, so bound each
            // iteration by the expected duration plus grace and force a stop
            // past it.
            let budget = parse::test_duration(&current_args, 10);
            if tokio::time::timeout(budget, iter_obs.done.notified())
                .await
                .is_err()
            {
                warn!(iteration = iteration + 1, ?budget, "iteration exceeded its budget");
                self.emit(
                    &observer,
                    &format!(
                        "test {} did not finish within {} seconds, stopping it",
                        iteration + 1,
                        budget.as_secs()
                    ),
                )
                .await;
                self.bridge.stop().await;
                iter_obs.done.notified().await;
            }
            iterations_run += 1;

            let iteration_error = iter_obs.saw_error();
            had_errors |= iteration_error;
            if let Some(mbps) = iter_obs.max_mbps() {
                max_mbps = Some(max_mbps.map_or(mbps, |m: f64| m.max(mbps)));
            }
            loss_history.extend(iter_obs.losses());

            self.emit(&observer, &format!("finished test {}/{}", iteration + 1, self.config.iterations))
                .await;

            if self.config.ramp == RampMode::Smart && !iteration_error {
                let achieved = iter_obs.max_mbps().unwrap_or(0.0);
                let next = next_ramp_step(step_bw, iteration, achieved, original_bw);
                if next > step_bw {
                    self.emit(
                        &observer,
                        &format!("achieved {achieved:.0}M, increasing bandwidth to {next}M"),
                    )
                    .await;
                } else {
                    self.emit(&observer, &format!("holding bandwidth at {step_bw}M")).await;
                }
                step_bw = next;
            }

            if iteration + 1 < self.config.iterations && !self.is_stopped() {
                if iteration_error {
                    // Back off harder after a failed iteration, as flaky
                    // paths rarely recover within the normal wait.
                    let backoff = error_backoff(&current_args);
                    self.emit(
                        &observer,
                        &format!(
                            "error occurred, waiting {} seconds before next test",
                            backoff.as_secs()
                        ),
                    )
                    .await;
                    tokio::time::sleep(backoff).await;
                } else {
                    self.emit(
                        &observer,
                        &format!("waiting {} seconds before next test", self.config.wait_secs),
                    )
                    .await;
                    tokio::time::sleep(Duration::from_secs(self.config.wait_secs)).await;
                }
            }
        }

        let stopped_by_user = self.is_stopped();
        if stopped_by_user {
            self.emit(&observer, "test stopped by user before completing all iterations")
                .await;
        } else if had_errors {
            self.emit(&observer, "all iterations completed with errors").await;
        } else {
            self.emit(&observer, "all iterations completed").await;
        }

        let log_parts: Vec<String> = self
            .log
            .as_ref()
            .map(|log| {
                log.created_parts()
                    .iter()
                    .map(|p| p.to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        for part in &log_parts {
            self.emit(&observer, &format!("log saved: {part}")).await;
        }

        info!(iterations_run, stopped_by_user, had_errors, "session finished");
        observer.on_complete().await;

        SessionReport {
            iterations_run,
            stopped_by_user,
            had_errors,
            max_throughput_mbps: max_mbps,
            packet_loss_percent: loss_history,
            log_parts,
        }
    }

    async fn emit(&self, observer: &Arc<dyn TestObserver>, line: &str) {
        if let Some(log) = &self.log {
            if let Err(e) = log.append(line) {
                warn!(error = %e, "failed to append run log");
            }
        }
        observer.on_output(line).await;
    }
}

/// Smart ramp step evaluation: grow only when the engine actually delivered
/// close to the current target, capped at the caller's original `-b`.
fn next_ramp_step(current: u32, iteration: u32, achieved_mbps: f64, original: Option<u32>) -> u32 {
    let cap = original.unwrap_or(u32::MAX);
    if achieved_mbps >= f64::from(current) * 0.9 && current < cap {
        (current + (iteration + 1) * 50).min(cap)
    } else {
        current
    }
}

fn error_backoff(args: &[String]) -> Duration {
    let duration = parse::test_duration(args, 0);
    Duration::from_secs((duration.as_secs() / 3).max(20))
}

/// Per-iteration observer: forwards lines and errors to the session's
/// outer observer, skims statistics, and turns the bridge's per-run
/// `on_complete` into an internal completion signal (the outer observer
/// gets one `on_complete` per session, not per run).
struct IterationObserver {
    outer: Arc<dyn TestObserver>,
    log: Option<Arc<RotatingLog>>,
    max_mbps: Mutex<Option<f64>>,
    losses: Mutex<Vec<f32>>,
    saw_error: AtomicBool,
    done: Notify,
}

impl IterationObserver {
    fn new(outer: Arc<dyn TestObserver>, log: Option<Arc<RotatingLog>>) -> Self {
        Self {
            outer,
            log,
            max_mbps: Mutex::new(None),
            losses: Mutex::new(Vec::new()),
            saw_error: AtomicBool::new(false),
            done: Notify::new(),
        }
    }

    fn max_mbps(&self) -> Option<f64> {
        *self.max_mbps.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn losses(&self) -> Vec<f32> {
        self.losses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn saw_error(&self) -> bool {
        self.saw_error.load(Ordering::SeqCst)
    }

    fn log_line(&self, line: &str) {
        if let Some(log) = &self.log {
            if let Err(e) = log.append(line) {
                warn!(error = %e, "failed to append run log");
            }
        }
    }
}

#[async_trait]
impl TestObserver for IterationObserver {
    async fn on_output(&self, line: &str) {
        self.log_line(line);
        if let Some(mbps) = parse::parse_throughput_mbps(line) {
            let mut max = self.max_mbps.lock().unwrap_or_else(|e| e.into_inner());
            *max = Some(max.map_or(mbps, |m| m.max(mbps)));
        }
        if let Some(loss) = parse::parse_packet_loss(line) {
            self.losses
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(loss);
        }
        self.outer.on_output(line).await;
    }

    async fn on_error(&self, message: &str) {
        self.saw_error.store(true, Ordering::SeqCst);
        self.log_line(&format!("error: {message}"));
        self.outer.on_error(message).await;
    }

    async fn on_complete(&self) {
        self.done.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_ramp_step_grows_when_target_met() {
        assert_eq!(next_ramp_step(50, 0, 48.0, Some(500)), 100);
        assert_eq!(next_ramp_step(100, 1, 95.0, Some(500)), 200);
    }

    #[test]
    fn test_next_ramp_step_holds_when_target_missed() {
        assert_eq!(next_ramp_step(100, 1, 40.0, Some(500)), 100);
    }

    #[test]
    fn test_next_ramp_step_caps_at_original_bandwidth() {
        assert_eq!(next_ramp_step(100, 3, 100.0, Some(150)), 150);
        assert_eq!(next_ramp_step(150, 4, 150.0, Some(150)), 150);
    }

    #[test]
    fn test_error_backoff_floor() {
        let short: Vec<String> = ["perfbridge", "-t", "10"]
            .iter()
            .map(|s| (*s).to_owned())
            .collect();
        assert_eq!(error_backoff(&short), Duration::from_secs(20));

        let long: Vec<String> = ["perfbridge", "-t", "300"]
            .iter()
            .map(|s| (*s).to_owned())
            .collect();
        assert_eq!(error_backoff(&long), Duration::from_secs(100));
    }
}
