//! Worker bootstrap and teardown.
//!
//! [`StartupSequencer::boot`] acquires the working directory, validates the
//! memory layout, binds the data endpoint, registers metrics and subscribes
//! to leader notifications, strictly in that order. Any failure releases
//! what was already acquired and is returned as a [`StartupError`]; nothing
//! is retried. Success yields a [`RunningWorker`].

mod sequencer;
mod worker;

pub use crate::error::{FatalError, FatalErrorHandler, LoggingFatalErrorHandler};
pub use sequencer::{
    boot, StartupError, StartupEvent, StartupSequencer, StartupStep, WorkerServices,
};
pub use worker::{RunningWorker, ShutdownError};
