//! Bootstrap and lifecycle core of a dataflow worker node.
//! A worker validates its local resources, binds its data endpoint,
//! registers metrics and follows the cluster leader before it accepts work;
//! see [`lifecycle`] for the entry point.

pub mod config;
pub mod error;
pub mod guard;
pub mod leader;
pub mod lifecycle;
pub mod memory;
pub mod metrics;
pub mod net;
pub mod resource_id;
pub mod resources;
pub mod scheduler;
pub mod timeouts;
pub mod workdir;

pub use config::{
    ConfigLoadError, ExternalResource, HeartbeatConfiguration, MemoryConfiguration, MemorySize,
    MemorySizeParseError, MetricsConfiguration, NetworkConfiguration, StartupConfiguration,
    DEFAULT_SCOPE_FORMAT,
};
pub use error::{FatalError, FatalErrorHandler, FaultKind, LoggingFatalErrorHandler};
pub use guard::{
    guard, BoxError, Fault, FaultHandler, FaultRecord, GuardedTask, TaskOutcome, TaskResult,
    ThreadIdentity,
};
pub use leader::{
    ConnectionError, ConnectionState, ConnectorConfig, ConnectorContext, ConnectorStatus,
    FencingToken, LeaderAddress, LeaderConnector, LeaderGateway, LeaderRetrievalError,
    LeaderRetrievalListener, LeaderRetrievalService, LeaderSession, SettableLeaderRetrieval,
};
pub use lifecycle::{
    boot, RunningWorker, ShutdownError, StartupError, StartupEvent, StartupSequencer, StartupStep,
    WorkerServices,
};
pub use memory::{MemoryPool, NetworkBufferPool};
pub use metrics::{
    register_all, InMemoryMetricRegistry, Metric, MetricCatalog, MetricCatalogEntry, MetricGroup,
    MetricKind, MetricRegistry, MetricSource, MetricSources, MetricsSnapshot, NoOpMetricRegistry,
    ScopeFormat, TelemetryError,
};
pub use net::{bind, BindError, NetworkEndpoint};
pub use resource_id::ResourceId;
pub use resources::{derive_memory_budget, validate, ConfigError, MemoryBudget};
pub use scheduler::{PeriodicExecutor, ScheduleHandle, SchedulerError};
pub use workdir::{probe, ProbeError, WorkingDirectory, WorkingDirectoryError};
