// registry-level configuration.

use crate::context::ExecutionContext;
use std::{
    fmt::{self, Formatter, Debug},
    sync::Arc,
    time::Duration,
};


/// Defaults applied to operations an [`OperationRegistry`](crate::OperationRegistry) starts
///
/// Anything set explicitly on an operation's builder takes precedence.
#[derive(Clone, Default)]
pub struct Config {
    default_context: Option<Arc<dyn ExecutionContext>>,
    default_timeout: Option<Duration>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the execution context operations run their continuations on
    ///
    /// Defaults to none, in which case the process-wide main looper is used.
    pub fn set_default_context(&mut self, context: impl ExecutionContext) -> &mut Self {
        self.default_context = Some(Arc::new(context));
        self
    }

    /// Ownership-chaining version of [`set_default_context`](Self::set_default_context)
    pub fn with_default_context(mut self, context: impl ExecutionContext) -> Self {
        self.set_default_context(context);
        self
    }

    /// Set how long a blocking wait lasts before it gives up and cancels the operation
    ///
    /// Defaults to none, meaning blocking waits wait forever.
    pub fn set_default_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Ownership-chaining version of [`set_default_timeout`](Self::set_default_timeout)
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.set_default_timeout(timeout);
        self
    }

    pub fn default_context(&self) -> Option<&Arc<dyn ExecutionContext>> {
        self.default_context.as_ref()
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }
}

impl Debug for Config {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Config")
            .field("default_context", &self.default_context.as_ref().map(|_| ".."))
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}
