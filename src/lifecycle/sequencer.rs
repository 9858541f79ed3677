use super::worker::{BackgroundFaultReporter, RunningWorker, WorkerParts};
use crate::config::StartupConfiguration;
use crate::error::{FatalErrorHandler, FaultKind, LoggingFatalErrorHandler};
use crate::leader::{
    ConnectorConfig, ConnectorContext, LeaderConnector, LeaderGateway, LeaderRetrievalError,
    LeaderRetrievalService,
};
use crate::memory::{MemoryPool, NetworkBufferPool};
use crate::metrics::{
    register_all, MetricCatalog, MetricRegistry, MetricSources, NoOpMetricRegistry, ScopeFormat,
    TelemetryError,
};
use crate::net::{self, BindError};
use crate::resource_id::ResourceId;
use crate::resources::{derive_memory_budget, ConfigError};
use crate::scheduler::PeriodicExecutor;
use crate::workdir::{probe, WorkingDirectory, WorkingDirectoryError};
use log::{debug, info, warn};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Startup steps, in the only order they ever run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StartupStep {
    WorkingDirectory,
    MemoryValidation,
    NetworkBind,
    MetricRegistration,
    LeaderSubscription,
}

impl StartupStep {
    pub const ORDER: [StartupStep; 5] = [
        StartupStep::WorkingDirectory,
        StartupStep::MemoryValidation,
        StartupStep::NetworkBind,
        StartupStep::MetricRegistration,
        StartupStep::LeaderSubscription,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StartupStep::WorkingDirectory => "working_directory",
            StartupStep::MemoryValidation => "memory_validation",
            StartupStep::NetworkBind => "network_bind",
            StartupStep::MetricRegistration => "metric_registration",
            StartupStep::LeaderSubscription => "leader_subscription",
        }
    }
}

impl fmt::Display for StartupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct StartupEvent {
    pub step: StartupStep,
    pub started_at: Instant,
    pub finished_at: Instant,
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    Configuration(#[from] ConfigError),
    #[error("invalid metric scope format: {0}")]
    ScopeFormat(#[source] TelemetryError),
    #[error("working directory {path:?} is already used by another worker")]
    WorkingDirectoryLocked { path: PathBuf },
    #[error("directory {path:?} is not usable: {source}")]
    WorkingDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    NetworkBind(#[from] BindError),
    #[error("metric registration failed: {0}")]
    MetricRegistration(#[from] TelemetryError),
    #[error("leader retrieval could not be started: {0}")]
    LeaderSubscription(#[from] LeaderRetrievalError),
    #[error("failed to start background work: {source}")]
    Executor {
        #[source]
        source: io::Error,
    },
}

impl StartupError {
    pub fn step(&self) -> StartupStep {
        match self {
            StartupError::WorkingDirectoryLocked { .. } | StartupError::WorkingDirectory { .. } => {
                StartupStep::WorkingDirectory
            }
            StartupError::Configuration(_) | StartupError::ScopeFormat(_) => {
                StartupStep::MemoryValidation
            }
            StartupError::NetworkBind(_) => StartupStep::NetworkBind,
            StartupError::MetricRegistration(_) => StartupStep::MetricRegistration,
            StartupError::LeaderSubscription(_) | StartupError::Executor { .. } => {
                StartupStep::LeaderSubscription
            }
        }
    }

    pub fn kind(&self) -> FaultKind {
        match self {
            StartupError::Configuration(_) | StartupError::ScopeFormat(_) => {
                FaultKind::Configuration
            }
            StartupError::LeaderSubscription(_) => FaultKind::Connection,
            StartupError::WorkingDirectoryLocked { .. }
            | StartupError::WorkingDirectory { .. }
            | StartupError::NetworkBind(_)
            | StartupError::MetricRegistration(_)
            | StartupError::Executor { .. } => FaultKind::Io,
        }
    }

    /// The filesystem path involved, for directory failures.
    pub fn path(&self) -> Option<&Path> {
        match self {
            StartupError::WorkingDirectoryLocked { path }
            | StartupError::WorkingDirectory { path, .. } => Some(path),
            _ => None,
        }
    }
}

impl From<WorkingDirectoryError> for StartupError {
    fn from(err: WorkingDirectoryError) -> Self {
        match err {
            WorkingDirectoryError::Locked { path } => StartupError::WorkingDirectoryLocked { path },
            WorkingDirectoryError::Io { path, source } => {
                StartupError::WorkingDirectory { path, source }
            }
        }
    }
}

/// External collaborators a worker is booted against.
#[derive(Clone)]
pub struct WorkerServices {
    pub leader_retrieval: Arc<dyn LeaderRetrievalService>,
    pub gateway: Arc<dyn LeaderGateway>,
    pub metric_registry: Arc<dyn MetricRegistry>,
    pub fatal_error_handler: Arc<dyn FatalErrorHandler>,
}

impl WorkerServices {
    /// Metrics go nowhere and fatal errors are only logged until replaced.
    pub fn new(
        leader_retrieval: Arc<dyn LeaderRetrievalService>,
        gateway: Arc<dyn LeaderGateway>,
    ) -> Self {
        Self {
            leader_retrieval,
            gateway,
            metric_registry: Arc::new(NoOpMetricRegistry),
            fatal_error_handler: Arc::new(LoggingFatalErrorHandler),
        }
    }

    pub fn with_metric_registry(mut self, registry: Arc<dyn MetricRegistry>) -> Self {
        self.metric_registry = registry;
        self
    }

    pub fn with_fatal_error_handler(mut self, handler: Arc<dyn FatalErrorHandler>) -> Self {
        self.fatal_error_handler = handler;
        self
    }
}

pub struct StartupSequencer {
    services: WorkerServices,
    catalog: MetricCatalog,
    resource_id: Option<ResourceId>,
}

/// Boots a worker with the standard metric catalog and a fresh ResourceId.
pub fn boot(
    config: &StartupConfiguration,
    services: WorkerServices,
) -> Result<RunningWorker, StartupError> {
    StartupSequencer::new(services).boot(config)
}

impl StartupSequencer {
    pub fn new(services: WorkerServices) -> Self {
        Self {
            services,
            catalog: MetricCatalog::standard(),
            resource_id: None,
        }
    }

    pub fn with_catalog(mut self, catalog: MetricCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_resource_id(mut self, resource_id: ResourceId) -> Self {
        self.resource_id = Some(resource_id);
        self
    }

    /// Runs every step in order. The first failure aborts the boot; whatever
    /// earlier steps acquired is released before the error is returned.
    pub fn boot(self, config: &StartupConfiguration) -> Result<RunningWorker, StartupError> {
        let resource_id = self.resource_id.clone().unwrap_or_else(ResourceId::generate);
        info!(
            "event=startup_begin worker={resource_id} working_directory={}",
            config.working_directory.display()
        );
        let mut events = Vec::with_capacity(StartupStep::ORDER.len());
        match self.run_steps(config, resource_id.clone(), &mut events) {
            Ok(worker) => {
                info!(
                    "event=startup_complete worker={resource_id} data_address={}",
                    worker.data_address()
                );
                Ok(worker)
            }
            Err(err) => {
                warn!(
                    "event=startup_aborted worker={resource_id} step={} kind={:?} error={err}",
                    err.step(),
                    err.kind()
                );
                Err(err)
            }
        }
    }

    // Locals are dropped in reverse order on `?`, which is the cleanup order
    // for a partial boot.
    fn run_steps(
        self,
        config: &StartupConfiguration,
        resource_id: ResourceId,
        events: &mut Vec<StartupEvent>,
    ) -> Result<RunningWorker, StartupError> {
        let boot_started = Instant::now();

        let working_directory = run_step(events, StartupStep::WorkingDirectory, || {
            let dir = WorkingDirectory::open(&config.working_directory)?;
            let mut checked: Vec<&Path> = vec![dir.root()];
            if config.tmp_dirs.is_empty() {
                checked.push(dir.tmp_dir());
            } else {
                checked.extend(config.tmp_dirs.iter().map(PathBuf::as_path));
            }
            for path in checked {
                probe(path).map_err(|err| StartupError::WorkingDirectory {
                    path: err.path,
                    source: err.source,
                })?;
            }
            Ok(dir)
        })?;

        let (budget, scope_format) = run_step(events, StartupStep::MemoryValidation, || {
            let budget = derive_memory_budget(config)?;
            let scope_format = ScopeFormat::parse(&config.metrics.scope_format)
                .map_err(StartupError::ScopeFormat)?;
            Ok((budget, scope_format))
        })?;

        let endpoint = run_step(events, StartupStep::NetworkBind, || {
            Ok(net::bind(&config.network.bind_host, config.network.data_port)?)
        })?;

        let managed_memory = Arc::new(MemoryPool::new("managed", budget.managed));
        let network_buffers = Arc::new(NetworkBufferPool::new(
            budget.segment_size,
            budget.network_segments,
        ));
        let background_faults = Arc::new(AtomicU64::new(0));
        let metric_group = run_step(events, StartupStep::MetricRegistration, || {
            let sources = MetricSources {
                heap: budget.heap,
                off_heap: budget.off_heap,
                managed: managed_memory.clone(),
                network: network_buffers.clone(),
                background_faults: background_faults.clone(),
                started_at: boot_started,
            };
            Ok(register_all(
                &self.catalog,
                &scope_format,
                &resource_id,
                config.network.advertised_host(),
                &sources,
                self.services.metric_registry.clone(),
            )?)
        })?;

        let reporter = Arc::new(BackgroundFaultReporter::new(
            background_faults.clone(),
            self.services.fatal_error_handler.clone(),
        ));
        let (executor, connector) = run_step(events, StartupStep::LeaderSubscription, || {
            let executor = Arc::new(
                PeriodicExecutor::new("tasknode-io")
                    .map_err(|source| StartupError::Executor { source })?
                    .with_uncaught_fault_handler(reporter),
            );
            let connector = LeaderConnector::start(ConnectorContext {
                resource_id: resource_id.clone(),
                gateway: self.services.gateway.clone(),
                executor: executor.clone(),
                config: ConnectorConfig::from_heartbeat(&config.heartbeat),
                fatal_error_handler: self.services.fatal_error_handler.clone(),
                background_faults: background_faults.clone(),
            })
            .map_err(|source| StartupError::Executor { source })?;
            self.services
                .leader_retrieval
                .start(connector.listener())?;
            Ok((executor, connector))
        })?;

        Ok(RunningWorker::new(WorkerParts {
            resource_id,
            memory_budget: budget,
            managed_memory,
            network_buffers,
            background_faults,
            startup_events: std::mem::take(events),
            leader_retrieval: self.services.leader_retrieval.clone(),
            fatal_error_handler: self.services.fatal_error_handler.clone(),
            connector,
            executor,
            endpoint,
            metric_group,
            working_directory,
            cleanup_on_shutdown: config.cleanup_working_directory_on_shutdown,
        }))
    }
}

fn run_step<T>(
    events: &mut Vec<StartupEvent>,
    step: StartupStep,
    action: impl FnOnce() -> Result<T, StartupError>,
) -> Result<T, StartupError> {
    let started_at = Instant::now();
    debug!("event=startup_step_begin step={step}");
    let value = action()?;
    let finished_at = Instant::now();
    debug!(
        "event=startup_step_finished step={step} elapsed_ms={}",
        finished_at.duration_since(started_at).as_millis()
    );
    events.push(StartupEvent {
        step,
        started_at,
        finished_at,
    });
    Ok(value)
}
