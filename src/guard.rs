//! Guarded execution of background work.
//!
//! Periodic schedules drop a recurring task for good the first time it
//! panics, and nothing else learns about it. [`guard`] wraps the work so
//! that every fault (a returned error or a panic) is handed to a
//! [`FaultHandler`] on the thread that ran it, and the wrapped task then
//! returns normally so the schedule keeps going.

use log::error;
use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, ThreadId};

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;
pub type TaskResult = Result<(), BoxError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadIdentity {
    name: Option<String>,
    id: ThreadId,
}

impl ThreadIdentity {
    pub fn current() -> Self {
        let current = thread::current();
        Self {
            name: current.name().map(str::to_string),
            id: current.id(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }
}

impl fmt::Display for ThreadIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => f.write_str(name),
            None => write!(f, "{:?}", self.id),
        }
    }
}

#[derive(Debug)]
pub enum Fault {
    /// The work returned an error.
    Error(BoxError),
    /// The work panicked; carries the panic message.
    Panic(String),
}

impl Fault {
    fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&'static str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Fault::Panic(message)
    }

    pub fn message(&self) -> String {
        match self {
            Fault::Error(err) => err.to_string(),
            Fault::Panic(message) => message.clone(),
        }
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, Fault::Panic(_))
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Error(err) => write!(f, "error: {err}"),
            Fault::Panic(message) => write!(f, "panic: {message}"),
        }
    }
}

/// The failing thread and its fault. Lives only for the handler call.
#[derive(Debug)]
pub struct FaultRecord {
    pub thread: ThreadIdentity,
    pub fault: Fault,
}

pub trait FaultHandler: Send + Sync {
    fn handle(&self, record: FaultRecord);
}

impl<F> FaultHandler for F
where
    F: Fn(FaultRecord) + Send + Sync,
{
    fn handle(&self, record: FaultRecord) {
        self(record)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Faulted { thread: String, message: String },
}

impl TaskOutcome {
    pub fn is_faulted(&self) -> bool {
        matches!(self, TaskOutcome::Faulted { .. })
    }
}

pub struct GuardedTask<W> {
    work: W,
    handler: Arc<dyn FaultHandler>,
}

pub fn guard<W, H>(work: W, handler: H) -> GuardedTask<W>
where
    W: FnMut() -> TaskResult,
    H: FaultHandler + 'static,
{
    GuardedTask::with_shared_handler(work, Arc::new(handler))
}

impl<W> GuardedTask<W>
where
    W: FnMut() -> TaskResult,
{
    pub fn with_shared_handler(work: W, handler: Arc<dyn FaultHandler>) -> Self {
        Self { work, handler }
    }

    /// Runs the work once. A fault is delivered to the handler exactly once
    /// and never propagates out of this call.
    pub fn run(&mut self) -> TaskOutcome {
        let work = &mut self.work;
        let fault = match panic::catch_unwind(AssertUnwindSafe(work)) {
            Ok(Ok(())) => return TaskOutcome::Completed,
            Ok(Err(err)) => Fault::Error(err),
            Err(payload) => Fault::from_panic(payload),
        };
        let thread = ThreadIdentity::current();
        let outcome = TaskOutcome::Faulted {
            thread: thread.to_string(),
            message: fault.message(),
        };
        let handler = &self.handler;
        let record = FaultRecord { thread, fault };
        if panic::catch_unwind(AssertUnwindSafe(|| handler.handle(record))).is_err() {
            if let TaskOutcome::Faulted { thread, message } = &outcome {
                error!("event=fault_handler_panicked thread={thread} fault={message}");
            }
        }
        outcome
    }

    /// Adapts the guarded task to the plain closure shape the
    /// [`PeriodicExecutor`](crate::scheduler::PeriodicExecutor) runs.
    pub fn into_runnable(mut self) -> impl FnMut() + Send + 'static
    where
        W: Send + 'static,
    {
        move || {
            self.run();
        }
    }
}
