//! Live test bridge -- run controller owning at most one test run.
//!
//! [`LiveBridge`] wires an [`Engine`](crate::engine::Engine) run to a
//! caller-supplied [`TestObserver`]: configuration happens synchronously on
//! the caller's context, the blocking run executes on the blocking pool, a
//! relay task drains the engine's output line-by-line in real time, and
//! `stop` cancels cooperatively without ever tearing a context down.

pub mod observer;
mod relay;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error, info, warn};

use crate::engine::{Engine, EngineError, EngineHandle, StopSwitch, MAX_ARGS};
use observer::TestObserver;

/// Liveness line delivered right after a run has been accepted.
pub const STATUS_STARTING: &str = "starting test run";
/// Informational line delivered when a stop request lands on an active run.
pub const STATUS_STOP_REQUESTED: &str = "stop requested, waiting for the test to wind down";
/// Terminal line: the caller stopped the run.
pub const STATUS_STOPPED: &str = "stopped by caller";
/// Terminal line: the engine's run call returned a failure.
pub const STATUS_FAILED: &str = "failed";
/// Terminal line: the run finished normally.
pub const STATUS_COMPLETED: &str = "completed";

/// Error text for a `start` while another run is active.
pub const ERR_ALREADY_ACTIVE: &str = "a test run is already active";
/// Error text when the engine cannot construct a run handle.
pub const ERR_CREATE_FAILED: &str = "failed to create test engine";

/// Run controller. Cheap to clone; clones share the same one-active-run
/// guard.
#[derive(Clone)]
pub struct LiveBridge {
    engine: Arc<dyn Engine>,
    active: Arc<Mutex<Option<ActiveRun>>>,
}

struct ActiveRun {
    /// Bridge-level stop flag; decides the terminal line.
    stop_requested: Arc<AtomicBool>,
    /// Engine-level switch; flips the done-flag and wakes blocked I/O.
    stop: StopSwitch,
    /// Handle onto the run's output pipe. Status lines travel through the
    /// pipe so the relay stays the single delivery context for the run and
    /// nothing can land after its completion callback.
    notices: relay::LineSender,
}

enum Setup {
    Busy,
    CreateFailed,
    ParseFailed(EngineError),
    Started,
}

impl LiveBridge {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Start a test run described by an iperf-style argument vector,
    /// streaming all output to `observer`.
    ///
    /// Never returns an error: every failure is absorbed and translated into
    /// observer callbacks. Each call that passes the one-active-run guard
    /// ends in exactly one `on_complete`, on every path; a rejected start
    /// delivers a single `on_error` and nothing else.
    pub async fn start(&self, args: &[String], observer: Arc<dyn TestObserver>) {
        // Everything up to spawning happens under the run guard, so two
        // racing starts cannot both construct a handle.
        let setup = {
            let mut active = self.lock_active();
            if active.is_some() {
                Setup::Busy
            } else {
                match self.engine.create() {
                    None => Setup::CreateFailed,
                    Some(mut handle) => {
                        handle.apply_defaults();
                        if args.len() > MAX_ARGS {
                            warn!(
                                dropped = args.len() - MAX_ARGS,
                                "argument vector truncated to {MAX_ARGS} entries"
                            );
                        }
                        let argv: Vec<String> = args.iter().take(MAX_ARGS).cloned().collect();
                        match handle.parse_arguments(&argv) {
                            Err(e) => Setup::ParseFailed(e),
                            Ok(()) => {
                                let (writer, rx) = relay::byte_pipe();
                                let notices = writer.line_sender();
                                handle.attach_output(Box::new(writer));
                                let stop = handle.stop_switch();
                                let stop_requested = Arc::new(AtomicBool::new(false));
                                // Queued before the engine can write, so the
                                // liveness line always precedes its output.
                                notices.send_line(STATUS_STARTING);
                                *active = Some(ActiveRun {
                                    stop_requested: stop_requested.clone(),
                                    stop,
                                    notices,
                                });
                                let relay_task = tokio::spawn(relay::drain(rx, observer.clone()));
                                let bridge = self.clone();
                                let run_observer = observer.clone();
                                tokio::spawn(async move {
                                    bridge
                                        .supervise(handle, relay_task, stop_requested, run_observer)
                                        .await;
                                });
                                Setup::Started
                            }
                        }
                    }
                }
            }
        };

        match setup {
            Setup::Busy => {
                warn!("start rejected: a run is already active");
                observer.on_error(ERR_ALREADY_ACTIVE).await;
            }
            Setup::CreateFailed => {
                error!("engine handle construction failed");
                observer.on_error(ERR_CREATE_FAILED).await;
                observer.on_complete().await;
            }
            Setup::ParseFailed(e) => {
                info!(error = %e, "argument parsing rejected by engine");
                observer.on_error(&e.to_string()).await;
                observer.on_complete().await;
            }
            Setup::Started => {
                info!("test run started");
            }
        }
    }

    /// Request cancellation of the active run, if any. Idempotent and
    /// always safe: with no active run this is a no-op, a second stop on
    /// the same run is a no-op, and cancellation is never reported as an
    /// error.
    pub async fn stop(&self) {
        let run = {
            let active = self.lock_active();
            active
                .as_ref()
                .map(|r| (r.stop_requested.clone(), r.stop.clone(), r.notices.clone()))
        };
        let Some((stop_requested, stop, notices)) = run else {
            debug!("stop requested with no active run");
            return;
        };
        if stop_requested.swap(true, Ordering::SeqCst) {
            debug!("stop already requested for this run");
            return;
        }
        info!("stopping active test run");
        stop.request_stop();
        // Through the pipe, not the caller's context: the relay delivers
        // the notice in order with engine output and strictly before the
        // terminal callbacks. If the run already wound down, the line is
        // dropped with the closed pipe.
        notices.send_line(STATUS_STOP_REQUESTED);
    }

    /// Completion path: runs exactly once per accepted run, whatever the
    /// engine returned.
    async fn supervise(
        self,
        handle: Box<dyn EngineHandle>,
        relay_task: tokio::task::JoinHandle<()>,
        stop_requested: Arc<AtomicBool>,
        observer: Arc<dyn TestObserver>,
    ) {
        let mut handle = handle;
        let result = tokio::task::spawn_blocking(move || {
            let result = handle.run();
            // Dropping the handle closes the output pipe (the relay's
            // end-of-stream) and destroys the engine, exactly once.
            drop(handle);
            result
        })
        .await;

        let status = match result {
            Ok(status) => status,
            Err(join_err) => {
                error!(error = %join_err, "engine worker terminated abnormally");
                Err(EngineError::Worker(join_err.to_string()))
            }
        };

        // Clear the run first: its state holds a pipe handle, and the relay
        // only reaches end-of-stream once every handle is gone. A stop()
        // arriving past this point is a clean no-op.
        let finished = self.lock_active().take();
        drop(finished);

        // Join the relay next: every byte the engine wrote and every queued
        // status line is delivered before any terminal callback.
        if let Err(e) = relay_task.await {
            error!(error = %e, "output relay task failed");
        }

        if stop_requested.load(Ordering::SeqCst) {
            info!("test run stopped by caller");
            observer.on_output(STATUS_STOPPED).await;
        } else if let Err(e) = status {
            warn!(error = %e, "test run failed");
            observer.on_error(&e.to_string()).await;
            observer.on_output(STATUS_FAILED).await;
        } else {
            info!("test run completed");
            observer.on_output(STATUS_COMPLETED).await;
        }
        observer.on_complete().await;
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}
