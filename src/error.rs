//! Fault taxonomy shared across the worker lifecycle, and the sink for
//! unrecoverable post-startup conditions.

use log::error;
use thiserror::Error;

/// Broad class of a failure, used to decide who has to act on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// A setting violates a static constraint; the operator must fix it.
    Configuration,
    /// Local filesystem or socket problem surfaced during boot.
    Io,
    /// No session could be established with the known leader.
    Connection,
    /// A fault escaped guarded background work.
    BackgroundTask,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FatalError {
    #[error("background task on {thread} failed: {message}")]
    BackgroundTask { thread: String, message: String },
    #[error("leader retrieval failed: {0}")]
    LeaderRetrieval(String),
}

impl FatalError {
    pub fn kind(&self) -> FaultKind {
        match self {
            FatalError::BackgroundTask { .. } => FaultKind::BackgroundTask,
            FatalError::LeaderRetrieval(_) => FaultKind::Connection,
        }
    }
}

/// Receives conditions the worker cannot recover from after startup. The
/// embedding process is expected to terminate or restart the worker.
pub trait FatalErrorHandler: Send + Sync {
    fn on_fatal_error(&self, error: FatalError);
}

impl<F> FatalErrorHandler for F
where
    F: Fn(FatalError) + Send + Sync,
{
    fn on_fatal_error(&self, error: FatalError) {
        self(error)
    }
}

/// Logs the fatal error and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingFatalErrorHandler;

impl FatalErrorHandler for LoggingFatalErrorHandler {
    fn on_fatal_error(&self, fatal: FatalError) {
        error!("event=fatal_error kind={:?} error={fatal}", fatal.kind());
    }
}
