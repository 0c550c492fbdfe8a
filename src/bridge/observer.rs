//! Observer contract consumed by the bridge.

use async_trait::async_trait;

/// Caller-supplied callback set for one test run.
///
/// Delivery contract per accepted `start`: zero or more `on_output` calls
/// (one logical UTF-8 line each, in engine write order), zero or more
/// `on_error` calls, and exactly one `on_complete`, always last.
#[async_trait]
pub trait TestObserver: Send + Sync {
    async fn on_output(&self, line: &str);
    async fn on_error(&self, message: &str);
    async fn on_complete(&self);
}

/// Closure-backed observer for hosts that don't want a dedicated type.
pub struct FnObserver<O, E, C>
where
    O: Fn(&str) + Send + Sync,
    E: Fn(&str) + Send + Sync,
    C: Fn() + Send + Sync,
{
    output: O,
    error: E,
    complete: C,
}

impl<O, E, C> FnObserver<O, E, C>
where
    O: Fn(&str) + Send + Sync,
    E: Fn(&str) + Send + Sync,
    C: Fn() + Send + Sync,
{
    pub fn new(output: O, error: E, complete: C) -> Self {
        Self {
            output,
            error,
            complete,
        }
    }
}

#[async_trait]
impl<O, E, C> TestObserver for FnObserver<O, E, C>
where
    O: Fn(&str) + Send + Sync,
    E: Fn(&str) + Send + Sync,
    C: Fn() + Send + Sync,
{
    async fn on_output(&self, line: &str) {
        (self.output)(line);
    }

    async fn on_error(&self, message: &str) {
        (self.error)(message);
    }

    async fn on_complete(&self) {
        (self.complete)();
    }
}
