//! Periodic and one-shot background work on a tokio runtime owned by the
//! executor.
//!
//! The runtime has a single worker thread named `<prefix>-0`, so ticks and
//! one-shot work always report the same thread, and ticks of one schedule
//! never overlap. A tick that panics ends its schedule quietly (only a debug
//! line is logged); wrap work with [`guard`](crate::guard::guard) to keep a
//! schedule alive across faults. One-shot work instead reports panics to the
//! executor's uncaught-fault handler. Work that may block for a long time
//! belongs on [`PeriodicExecutor::execute_blocking`], which runs it on the
//! runtime's blocking pool (threads `<prefix>-1`, `<prefix>-2`, ...).

use crate::guard::{Fault, FaultHandler, FaultRecord, ThreadIdentity};
use crate::timeouts::EXECUTOR_SHUTDOWN_GRACE;
use log::{debug, error};
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::Notify;
use tokio::time::sleep;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("executor {0} is shut down")]
    ShutDown(String),
}

#[derive(Default)]
struct ScheduleControl {
    cancelled: AtomicBool,
    wake: Notify,
    terminated: AtomicBool,
    ticks: AtomicU64,
}

impl ScheduleControl {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Waits `duration` unless cancelled first. Returns whether the schedule
    /// should keep running.
    async fn pause(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = sleep(duration) => !self.is_cancelled(),
            _ = self.wake.notified() => false,
        }
    }
}

/// Marks the schedule terminated however its future ends: normal exit,
/// panic or runtime shutdown.
struct TerminateOnDrop(Arc<ScheduleControl>);

impl Drop for TerminateOnDrop {
    fn drop(&mut self) {
        self.0.terminated.store(true, Ordering::Release);
    }
}

/// Control handle for one fixed-delay schedule.
#[derive(Clone)]
pub struct ScheduleHandle {
    control: Arc<ScheduleControl>,
}

impl ScheduleHandle {
    /// Stops future ticks. A tick already running finishes normally.
    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    /// Whether the schedule has stopped, by cancellation, by an uncaught
    /// panic or by executor shutdown.
    pub fn is_terminated(&self) -> bool {
        self.control.terminated.load(Ordering::Acquire)
    }

    /// Completed (non-panicking) ticks so far.
    pub fn ticks(&self) -> u64 {
        self.control.ticks.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ScheduleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleHandle")
            .field("cancelled", &self.is_cancelled())
            .field("terminated", &self.is_terminated())
            .field("ticks", &self.ticks())
            .finish()
    }
}

pub struct PeriodicExecutor {
    prefix: String,
    runtime: Mutex<Option<Runtime>>,
    uncaught: Option<Arc<dyn FaultHandler>>,
}

impl PeriodicExecutor {
    /// Starts the runtime. Threads are named `<prefix>-<n>` with `n`
    /// counting from zero.
    pub fn new(prefix: impl Into<String>) -> io::Result<Self> {
        let prefix = prefix.into();
        let next_thread = Arc::new(AtomicUsize::new(0));
        let thread_prefix = prefix.clone();
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name_fn(move || {
                let index = next_thread.fetch_add(1, Ordering::Relaxed);
                format!("{thread_prefix}-{index}")
            })
            .enable_time()
            .build()?;
        debug!("event=executor_started prefix={prefix}");
        Ok(Self {
            prefix,
            runtime: Mutex::new(Some(runtime)),
            uncaught: None,
        })
    }

    /// Receives panics escaping one-shot work.
    pub fn with_uncaught_fault_handler(mut self, handler: Arc<dyn FaultHandler>) -> Self {
        self.uncaught = Some(handler);
        self
    }

    pub fn is_shut_down(&self) -> bool {
        self.runtime.lock().is_none()
    }

    fn submit<T>(&self, spawn: impl FnOnce(&Runtime) -> T) -> Result<T, SchedulerError> {
        match self.runtime.lock().as_ref() {
            Some(runtime) => Ok(spawn(runtime)),
            None => Err(SchedulerError::ShutDown(self.prefix.clone())),
        }
    }

    /// Runs `task` once on the executor thread. Shutdown does not wait for
    /// it beyond the shutdown grace period.
    pub fn execute<F>(&self, task: F) -> Result<(), SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        let uncaught = self.uncaught.clone();
        self.submit(|runtime| {
            runtime.spawn(async move { run_once(task, uncaught) });
        })
    }

    /// Like [`execute`](Self::execute), for work that blocks (network
    /// connects, slow I/O). Runs on the blocking pool.
    pub fn execute_blocking<F>(&self, task: F) -> Result<(), SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        let uncaught = self.uncaught.clone();
        self.submit(|runtime| {
            runtime.spawn_blocking(move || run_once(task, uncaught));
        })
    }

    /// Runs `task` after `initial_delay`, then again `delay` after each tick
    /// completes, until cancelled or until a tick panics.
    pub fn schedule_with_fixed_delay<F>(
        &self,
        initial_delay: Duration,
        delay: Duration,
        mut task: F,
    ) -> Result<ScheduleHandle, SchedulerError>
    where
        F: FnMut() + Send + 'static,
    {
        let control = Arc::new(ScheduleControl::default());
        let schedule = control.clone();
        let prefix = self.prefix.clone();
        self.submit(|runtime| {
            runtime.spawn(async move {
                let _terminated = TerminateOnDrop(schedule.clone());
                if !schedule.pause(initial_delay).await {
                    return;
                }
                loop {
                    if panic::catch_unwind(AssertUnwindSafe(&mut task)).is_err() {
                        debug!("event=schedule_terminated prefix={prefix} reason=uncaught_panic");
                        return;
                    }
                    schedule.ticks.fetch_add(1, Ordering::AcqRel);
                    if !schedule.pause(delay).await {
                        return;
                    }
                }
            });
        })?;
        Ok(ScheduleHandle { control })
    }

    /// Stops the runtime: every schedule ends and later submissions are
    /// rejected. Waits up to the shutdown grace period for running work,
    /// except when called from inside a runtime, where it cannot block.
    pub fn shutdown(&self) {
        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };
        debug!("event=executor_shutdown prefix={}", self.prefix);
        if Handle::try_current().is_ok() {
            runtime.shutdown_background();
        } else {
            runtime.shutdown_timeout(EXECUTOR_SHUTDOWN_GRACE);
        }
    }
}

impl Drop for PeriodicExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_once<F: FnOnce()>(task: F, uncaught: Option<Arc<dyn FaultHandler>>) {
    let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) else {
        return;
    };
    let fault = match payload.downcast::<String>() {
        Ok(message) => Fault::Panic(*message),
        Err(payload) => Fault::Panic(
            payload
                .downcast_ref::<&'static str>()
                .map(|message| (*message).to_string())
                .unwrap_or_else(|| "non-string panic payload".to_string()),
        ),
    };
    let record = FaultRecord {
        thread: ThreadIdentity::current(),
        fault,
    };
    match uncaught {
        Some(handler) => handler.handle(record),
        None => error!(
            "event=executor_task_panicked thread={} fault={}",
            record.thread, record.fault
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if predicate() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        predicate()
    }

    #[test]
    fn fixed_delay_schedule_ticks_until_cancelled() {
        let executor = PeriodicExecutor::new("tick").unwrap();
        let handle = executor
            .schedule_with_fixed_delay(Duration::ZERO, Duration::from_millis(1), || {})
            .unwrap();
        assert!(wait_until(Duration::from_secs(5), || handle.ticks() >= 3));
        handle.cancel();
        assert!(wait_until(Duration::from_secs(5), || handle.is_terminated()));
        let ticks = handle.ticks();
        thread::sleep(Duration::from_millis(10));
        assert_eq!(handle.ticks(), ticks);
    }

    #[test]
    fn cancel_wakes_a_sleeping_schedule() {
        let executor = PeriodicExecutor::new("dozy").unwrap();
        let handle = executor
            .schedule_with_fixed_delay(Duration::from_secs(3600), Duration::from_secs(3600), || {})
            .unwrap();
        handle.cancel();
        assert!(wait_until(Duration::from_secs(5), || handle.is_terminated()));
        assert_eq!(handle.ticks(), 0);
        assert!(!executor.is_shut_down());
    }

    #[test]
    fn unguarded_panic_ends_schedule_silently() {
        let executor = PeriodicExecutor::new("fragile").unwrap();
        let handle = executor
            .schedule_with_fixed_delay(Duration::ZERO, Duration::from_millis(1), || {
                panic!("foo")
            })
            .unwrap();
        assert!(wait_until(Duration::from_secs(5), || handle.is_terminated()));
        assert_eq!(handle.ticks(), 0);
        assert!(!handle.is_cancelled());
    }

    #[test]
    fn ticks_of_one_schedule_never_overlap() {
        let executor = PeriodicExecutor::new("serial").unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let (a, o) = (active.clone(), overlaps.clone());
        let handle = executor
            .schedule_with_fixed_delay(Duration::ZERO, Duration::ZERO, move || {
                if a.fetch_add(1, Ordering::SeqCst) != 0 {
                    o.fetch_add(1, Ordering::SeqCst);
                }
                thread::sleep(Duration::from_millis(1));
                a.fetch_sub(1, Ordering::SeqCst);
            })
            .unwrap();
        assert!(wait_until(Duration::from_secs(5), || handle.ticks() >= 5));
        executor.shutdown();
        assert!(handle.is_terminated());
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn shutdown_ends_sleeping_schedules_and_rejects_new_work() {
        let executor = PeriodicExecutor::new("sleepy").unwrap();
        let handle = executor
            .schedule_with_fixed_delay(Duration::from_secs(3600), Duration::from_secs(3600), || {})
            .unwrap();
        let started = Instant::now();
        executor.shutdown();
        executor.shutdown();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(handle.is_terminated());
        assert!(executor.is_shut_down());
        assert!(matches!(
            executor.execute(|| {}),
            Err(SchedulerError::ShutDown(_))
        ));
        assert!(matches!(
            executor.schedule_with_fixed_delay(Duration::ZERO, Duration::ZERO, || {}),
            Err(SchedulerError::ShutDown(_))
        ));
    }

    #[test]
    fn work_runs_on_named_executor_threads() {
        let executor = PeriodicExecutor::new("named").unwrap();
        let (tx, rx) = mpsc::channel();
        let plain = tx.clone();
        executor
            .execute(move || {
                let _ = plain.send(thread::current().name().map(str::to_string));
            })
            .unwrap();
        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first.as_deref(), Some("named-0"));

        executor
            .execute_blocking(move || {
                let _ = tx.send(thread::current().name().map(str::to_string));
            })
            .unwrap();
        let blocking = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert!(blocking.starts_with("named-"), "{blocking}");
        assert_ne!(blocking, "named-0");
    }

    #[test]
    fn one_shot_panic_reaches_uncaught_handler() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let handler: Arc<dyn FaultHandler> = Arc::new(move |record: FaultRecord| {
            let _ = tx.lock().send((record.thread.name().map(str::to_string), record.fault.message()));
        });
        let executor = PeriodicExecutor::new("oneshot")
            .unwrap()
            .with_uncaught_fault_handler(handler);
        executor.execute(|| panic!("foo")).unwrap();
        executor.execute_blocking(|| panic!("bar")).unwrap();
        let mut reports = vec![
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        ];
        reports.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(reports[1], (Some("oneshot-0".to_string()), "foo".to_string()));
        assert_eq!(reports[0].1, "bar");
    }

    #[test]
    fn shutdown_from_inside_the_executor_does_not_block() {
        let executor = Arc::new(PeriodicExecutor::new("selfstop").unwrap());
        let (tx, rx) = mpsc::channel();
        let inner = executor.clone();
        executor
            .execute(move || {
                let started = Instant::now();
                inner.shutdown();
                let _ = tx.send(started.elapsed());
            })
            .unwrap();
        let elapsed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(elapsed < EXECUTOR_SHUTDOWN_GRACE);
        assert!(executor.is_shut_down());
    }
}
