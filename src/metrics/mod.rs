//! Worker metric registration.
//!
//! The [`MetricCatalog`] is a plain value listing every metric a worker
//! reports. [`register_all`] qualifies each entry with the worker scope
//! (see [`ScopeFormat`]) and hands it to a [`MetricRegistry`] backend; the
//! resulting [`MetricGroup`] unregisters everything when closed.

mod catalog;
mod error;
mod group;
mod process;
mod registry;
mod scope;

pub use catalog::{
    MetricCatalog, MetricCatalogEntry, MetricKind, MetricSource, STANDARD_CATALOG_VERSION,
};
pub use error::TelemetryError;
pub use group::{register_all, MetricGroup, MetricSources};
pub use process::{process_cpu_time, process_stats, CpuLoad, ProcessStats};
pub use registry::{
    GaugeFn, InMemoryMetricRegistry, Metric, MetricRegistry, MetricsSnapshot, NoOpMetricRegistry,
};
pub use scope::{qualify, ScopeFormat, ScopeVariables};
