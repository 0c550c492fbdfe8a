//! perfbridge -- embeddable live bridge for blocking network throughput tests.
//!
//! Wraps an opaque, blocking throughput-test engine behind an asynchronous
//! observer interface: a host starts a run, receives the engine's textual
//! output line-by-line while the test is still in flight, and can cancel
//! cooperatively at any point. One [`LiveBridge`] owns at most one run at a
//! time; [`session::Session`] layers multi-iteration test plans on top.

pub mod bridge;
pub mod engine;
pub mod session;

pub use bridge::observer::{FnObserver, TestObserver};
pub use bridge::LiveBridge;
pub use engine::native::NativeTcpEngine;
pub use engine::{Engine, EngineError, EngineHandle, StopSwitch};
