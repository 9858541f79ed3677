use super::sequencer::StartupEvent;
use crate::error::{FatalError, FatalErrorHandler};
use crate::guard::{FaultHandler, FaultRecord, GuardedTask, TaskResult};
use crate::leader::{ConnectionState, LeaderConnector, LeaderRetrievalService};
use crate::memory::{MemoryPool, NetworkBufferPool};
use crate::metrics::MetricGroup;
use crate::net::NetworkEndpoint;
use crate::resource_id::ResourceId;
use crate::resources::MemoryBudget;
use crate::scheduler::{PeriodicExecutor, ScheduleHandle, SchedulerError};
use crate::workdir::{WorkingDirectory, WorkingDirectoryError};
use log::{info, warn};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("failed to release working directory: {0}")]
    WorkingDirectory(#[from] WorkingDirectoryError),
}

/// Counts every captured background fault; panics are escalated to the
/// fatal-error handler, returned errors are only logged.
pub(crate) struct BackgroundFaultReporter {
    faults: Arc<AtomicU64>,
    fatal_error_handler: Arc<dyn FatalErrorHandler>,
}

impl BackgroundFaultReporter {
    pub(crate) fn new(
        faults: Arc<AtomicU64>,
        fatal_error_handler: Arc<dyn FatalErrorHandler>,
    ) -> Self {
        Self {
            faults,
            fatal_error_handler,
        }
    }
}

impl FaultHandler for BackgroundFaultReporter {
    fn handle(&self, record: FaultRecord) {
        self.faults.fetch_add(1, Ordering::AcqRel);
        if record.fault.is_panic() {
            self.fatal_error_handler
                .on_fatal_error(FatalError::BackgroundTask {
                    thread: record.thread.to_string(),
                    message: record.fault.message(),
                });
        } else {
            warn!(
                "event=background_task_failed thread={} error={}",
                record.thread, record.fault
            );
        }
    }
}

pub(crate) struct WorkerParts {
    pub resource_id: ResourceId,
    pub memory_budget: MemoryBudget,
    pub managed_memory: Arc<MemoryPool>,
    pub network_buffers: Arc<NetworkBufferPool>,
    pub background_faults: Arc<AtomicU64>,
    pub startup_events: Vec<StartupEvent>,
    pub leader_retrieval: Arc<dyn LeaderRetrievalService>,
    pub fatal_error_handler: Arc<dyn FatalErrorHandler>,
    pub connector: LeaderConnector,
    pub executor: Arc<PeriodicExecutor>,
    pub endpoint: NetworkEndpoint,
    pub metric_group: MetricGroup,
    pub working_directory: WorkingDirectory,
    pub cleanup_on_shutdown: bool,
}

/// A fully booted worker. Owns its endpoint, metric group, leader connector
/// and working directory until [`RunningWorker::shutdown`] or drop.
pub struct RunningWorker {
    resource_id: ResourceId,
    data_address: SocketAddr,
    memory_budget: MemoryBudget,
    managed_memory: Arc<MemoryPool>,
    network_buffers: Arc<NetworkBufferPool>,
    background_faults: Arc<AtomicU64>,
    startup_events: Vec<StartupEvent>,
    leader_retrieval: Arc<dyn LeaderRetrievalService>,
    fatal_error_handler: Arc<dyn FatalErrorHandler>,
    connector: LeaderConnector,
    executor: Arc<PeriodicExecutor>,
    endpoint: Mutex<NetworkEndpoint>,
    metric_group: MetricGroup,
    root: PathBuf,
    working_directory: Mutex<Option<WorkingDirectory>>,
    cleanup_on_shutdown: bool,
    shut_down: AtomicBool,
}

impl RunningWorker {
    pub(crate) fn new(parts: WorkerParts) -> Self {
        Self {
            data_address: parts.endpoint.local_addr(),
            root: parts.working_directory.root().to_path_buf(),
            resource_id: parts.resource_id,
            memory_budget: parts.memory_budget,
            managed_memory: parts.managed_memory,
            network_buffers: parts.network_buffers,
            background_faults: parts.background_faults,
            startup_events: parts.startup_events,
            leader_retrieval: parts.leader_retrieval,
            fatal_error_handler: parts.fatal_error_handler,
            connector: parts.connector,
            executor: parts.executor,
            endpoint: Mutex::new(parts.endpoint),
            metric_group: parts.metric_group,
            working_directory: Mutex::new(Some(parts.working_directory)),
            cleanup_on_shutdown: parts.cleanup_on_shutdown,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn resource_id(&self) -> &ResourceId {
        &self.resource_id
    }

    /// Address the data endpoint was bound to (with the real port when an
    /// ephemeral one was requested).
    pub fn data_address(&self) -> SocketAddr {
        self.data_address
    }

    pub fn is_data_endpoint_open(&self) -> bool {
        self.endpoint.lock().is_open()
    }

    pub fn memory_budget(&self) -> &MemoryBudget {
        &self.memory_budget
    }

    pub fn managed_memory(&self) -> &Arc<MemoryPool> {
        &self.managed_memory
    }

    pub fn network_buffers(&self) -> &Arc<NetworkBufferPool> {
        &self.network_buffers
    }

    pub fn metric_group(&self) -> &MetricGroup {
        &self.metric_group
    }

    pub fn connector(&self) -> &LeaderConnector {
        &self.connector
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connector.state()
    }

    pub fn working_directory(&self) -> &Path {
        &self.root
    }

    pub fn startup_events(&self) -> &[StartupEvent] {
        &self.startup_events
    }

    pub fn background_faults(&self) -> u64 {
        self.background_faults.load(Ordering::Acquire)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Runs `work` every `interval` on the worker's executor. Faults are
    /// counted in the background-fault metric and never end the schedule;
    /// panics additionally reach the fatal-error handler.
    pub fn schedule_background<W>(
        &self,
        interval: Duration,
        work: W,
    ) -> Result<ScheduleHandle, SchedulerError>
    where
        W: FnMut() -> TaskResult + Send + 'static,
    {
        let reporter = Arc::new(BackgroundFaultReporter::new(
            self.background_faults.clone(),
            self.fatal_error_handler.clone(),
        ));
        let task = GuardedTask::with_shared_handler(work, reporter).into_runnable();
        self.executor
            .schedule_with_fixed_delay(interval, interval, task)
    }

    /// Releases everything in reverse dependency order. Later calls are
    /// no-ops.
    pub fn shutdown(&self) -> Result<(), ShutdownError> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("event=worker_shutdown_begin worker={}", self.resource_id);
        self.leader_retrieval.stop();
        self.connector.shutdown();
        self.executor.shutdown();
        self.endpoint.lock().close();
        self.metric_group.close();
        let working_directory = self.working_directory.lock().take();
        if let Some(dir) = working_directory {
            dir.release(self.cleanup_on_shutdown)?;
        }
        info!("event=worker_shutdown_complete worker={}", self.resource_id);
        Ok(())
    }
}

impl Drop for RunningWorker {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(
                "event=worker_shutdown_failed worker={} error={err}",
                self.resource_id
            );
        }
    }
}
