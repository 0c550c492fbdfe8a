//! Engine adapter -- traits wrapping the opaque blocking throughput engine.
//!
//! The engine is treated as a black box: it parses an iperf-style argument
//! vector, writes textual progress to whatever sink it is given, and blocks
//! inside [`EngineHandle::run`] until the test finishes. Cancellation is
//! cooperative through a [`StopSwitch`] handed out by the handle.

pub mod native;

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Maximum number of argument-vector entries marshalled into the engine.
/// Entries beyond this bound are silently discarded.
pub const MAX_ARGS: usize = 64;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown or unsupported argument: {0}")]
    UnknownArgument(String),

    #[error("missing value for {0}")]
    MissingValue(String),

    #[error("invalid value for {flag}: {value}")]
    InvalidValue { flag: String, value: String },

    #[error("missing required argument: {0}")]
    MissingArgument(String),

    #[error("unable to connect to {target}: {source}")]
    Connect {
        target: String,
        source: std::io::Error,
    },

    #[error("i/o failure during test run: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine worker terminated abnormally: {0}")]
    Worker(String),
}

/// Factory for test-run handles.
pub trait Engine: Send + Sync + 'static {
    /// Construct a fresh run handle. `None` models resource exhaustion in
    /// the underlying engine.
    fn create(&self) -> Option<Box<dyn EngineHandle>>;
}

/// One configured test run. Dropping the handle releases every engine
/// resource, including the attached output sink.
pub trait EngineHandle: Send {
    /// Reset the handle to the engine's default configuration.
    fn apply_defaults(&mut self);

    /// Parse an iperf-style argument vector into the run configuration.
    /// `argv[0]` is the program name and is ignored.
    fn parse_arguments(&mut self, argv: &[String]) -> Result<(), EngineError>;

    /// Attach the sink that receives all textual progress and summary
    /// output. Bytes pass through unmodified.
    fn attach_output(&mut self, sink: Box<dyn Write + Send>);

    /// Clonable cancellation switch for this run, safe to trigger from any
    /// thread while [`EngineHandle::run`] is in progress.
    fn stop_switch(&self) -> StopSwitch;

    /// Execute the test. Blocks until the run completes, fails, or observes
    /// a stop request. A cooperative stop is not an error.
    fn run(&mut self) -> Result<(), EngineError>;
}

/// Shared cancellation switch: a done-flag plus an optional wake-up hook
/// that interrupts whatever blocking wait the engine currently holds.
///
/// The engine registers the hook once it has something interruptible (for
/// the native engine, a socket to shut down) and clears it before its run
/// call returns, so a late [`StopSwitch::request_stop`] only sets the flag.
#[derive(Clone, Default)]
pub struct StopSwitch {
    inner: Arc<StopInner>,
}

#[derive(Default)]
struct StopInner {
    stopped: AtomicBool,
    waker: Mutex<Option<Box<dyn Fn() + Send>>>,
}

impl StopSwitch {
    /// Flip the done-flag and fire the wake-up hook, if one is registered.
    /// Safe to call repeatedly and after the run has ended.
    pub fn request_stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        let waker = self
            .inner
            .waker
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(wake) = waker.as_ref() {
            wake();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Register the hook that unblocks the engine's pending I/O wait.
    pub fn set_waker(&self, wake: impl Fn() + Send + 'static) {
        let mut waker = self
            .inner
            .waker
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *waker = Some(Box::new(wake));
    }

    /// Drop the registered hook. Called by the engine on its way out of
    /// `run` so the hook never outlives the resource it pokes.
    pub fn clear_waker(&self) {
        let mut waker = self
            .inner
            .waker
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *waker = None;
    }
}

impl std::fmt::Debug for StopSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopSwitch")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
