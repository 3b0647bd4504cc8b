//! Process-wide configuration and server options.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::channel::Channel;
use crate::error::Error;

static QUEUE_BUFFER_SIZE: AtomicUsize = AtomicUsize::new(50);

/// Set the outbound queue capacity used by every channel created afterwards.
///
/// Must be called before any server or client is constructed; it is not
/// meant to be changed concurrently with running sessions. Values below 2
/// are clamped to 2 (the overflood boundary sits one slot under capacity).
pub fn set_queue_buffer_size(size: usize) {
    QUEUE_BUFFER_SIZE.store(size.max(2), Ordering::Relaxed);
}

/// The current outbound queue capacity (default 50).
pub fn queue_buffer_size() -> usize {
    QUEUE_BUFFER_SIZE.load(Ordering::Relaxed)
}

/// Callback invoked for failures inside engine tasks that cannot be
/// returned to any caller.
///
/// Must be safe to invoke concurrently. When unset, such failures are
/// logged at debug level and dropped.
#[derive(Clone, Default)]
pub struct ErrorHandler(Option<Arc<dyn Fn(Error) + Send + Sync>>);

impl ErrorHandler {
    pub fn new(f: impl Fn(Error) + Send + Sync + 'static) -> Self {
        Self(Some(Arc::new(f)))
    }

    pub(crate) fn call(&self, err: Error) {
        match &self.0 {
            Some(f) => f(err),
            None => tracing::debug!(error = %err, "unhandled engine error"),
        }
    }
}

/// Callback invoked when a user callback panics inside an engine task.
///
/// Receives the channel the panic occurred on (absent for client-mode loops
/// without one) and the opaque panic payload. Must be safe to invoke
/// concurrently. When unset, the failing task terminates silently.
#[derive(Clone, Default)]
pub struct RecoveryHandler(
    Option<Arc<dyn Fn(Option<Arc<Channel>>, Box<dyn Any + Send>) + Send + Sync>>,
);

impl RecoveryHandler {
    pub fn new(
        f: impl Fn(Option<Arc<Channel>>, Box<dyn Any + Send>) + Send + Sync + 'static,
    ) -> Self {
        Self(Some(Arc::new(f)))
    }

    pub(crate) fn call(&self, channel: Option<Arc<Channel>>, payload: Box<dyn Any + Send>) {
        match &self.0 {
            Some(f) => f(channel, payload),
            None => tracing::debug!("panic in dispatched callback absorbed"),
        }
    }
}

/// Server construction options.
///
/// `rate_limit` selects the per-session dispatch mode by sign: negative is
/// unlimited (every dispatch in a fresh task), zero runs callbacks inline on
/// the read loop, positive bounds concurrent dispatches at that many tasks
/// and drops overflow.
#[derive(Clone, Default)]
pub struct ServerConfig {
    pub rate_limit: i32,
    pub error_handler: ErrorHandler,
    pub recovery_handler: RecoveryHandler,
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate_limit(mut self, limit: i32) -> Self {
        self.rate_limit = limit;
        self
    }

    pub fn with_error_handler(mut self, f: impl Fn(Error) + Send + Sync + 'static) -> Self {
        self.error_handler = ErrorHandler::new(f);
        self
    }

    pub fn with_recovery_handler(
        mut self,
        f: impl Fn(Option<Arc<Channel>>, Box<dyn Any + Send>) + Send + Sync + 'static,
    ) -> Self {
        self.recovery_handler = RecoveryHandler::new(f);
        self
    }
}
