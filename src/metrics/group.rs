use super::catalog::{MetricCatalog, MetricSource};
use super::error::TelemetryError;
use super::process::{process_cpu_time, process_stats, CpuLoad};
use super::registry::{Metric, MetricRegistry};
use super::scope::{qualify, ScopeFormat, ScopeVariables};
use crate::config::MemorySize;
use crate::memory::{MemoryPool, NetworkBufferPool};
use crate::resource_id::ResourceId;
use log::{debug, warn};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Live values the standard catalog reads from.
#[derive(Clone)]
pub struct MetricSources {
    pub heap: MemorySize,
    pub off_heap: MemorySize,
    pub managed: Arc<MemoryPool>,
    pub network: Arc<NetworkBufferPool>,
    pub background_faults: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl MetricSources {
    fn metric(&self, source: MetricSource) -> Metric {
        match source {
            MetricSource::ProcessThreads => Metric::gauge(|| process_stats().threads),
            MetricSource::ProcessResident => Metric::gauge(|| process_stats().resident_bytes),
            MetricSource::ProcessUptime => {
                let started_at = self.started_at;
                Metric::gauge(move || started_at.elapsed().as_millis() as u64)
            }
            MetricSource::ProcessCpuTime => {
                Metric::gauge(|| process_cpu_time().as_millis() as u64)
            }
            MetricSource::ProcessCpuLoad => {
                let load = CpuLoad::new();
                Metric::gauge(move || load.sample())
            }
            MetricSource::HeapConfigured => {
                let heap = self.heap.bytes();
                Metric::gauge(move || heap)
            }
            MetricSource::OffHeapConfigured => {
                let off_heap = self.off_heap.bytes();
                Metric::gauge(move || off_heap)
            }
            MetricSource::ManagedUsed => {
                let pool = self.managed.clone();
                Metric::gauge(move || pool.used().bytes())
            }
            MetricSource::ManagedTotal => {
                let pool = self.managed.clone();
                Metric::gauge(move || pool.total().bytes())
            }
            MetricSource::NetworkTotalSegments => {
                let pool = self.network.clone();
                Metric::gauge(move || pool.total_segments())
            }
            MetricSource::NetworkTotalMemory => {
                let pool = self.network.clone();
                Metric::gauge(move || pool.total_memory().bytes())
            }
            MetricSource::NetworkAvailableSegments => {
                let pool = self.network.clone();
                Metric::gauge(move || pool.available_segments())
            }
            MetricSource::NetworkAvailableMemory => {
                let pool = self.network.clone();
                Metric::gauge(move || pool.available_memory().bytes())
            }
            MetricSource::NetworkUsedSegments => {
                let pool = self.network.clone();
                Metric::gauge(move || pool.used_segments())
            }
            MetricSource::NetworkUsedMemory => {
                let pool = self.network.clone();
                Metric::gauge(move || pool.used_memory().bytes())
            }
            MetricSource::BackgroundFaults => Metric::counter(self.background_faults.clone()),
        }
    }
}

/// Registers every catalog entry under the worker's scope. Either all
/// entries end up registered or none do.
pub fn register_all(
    catalog: &MetricCatalog,
    scope_format: &ScopeFormat,
    resource_id: &ResourceId,
    host: &str,
    sources: &MetricSources,
    registry: Arc<dyn MetricRegistry>,
) -> Result<MetricGroup, TelemetryError> {
    let scope = scope_format.format(&ScopeVariables {
        host,
        tm_id: resource_id.as_str(),
    });
    let mut identifiers: Vec<String> = Vec::with_capacity(catalog.len());
    for entry in catalog.entries() {
        let identifier = qualify(&scope, &entry.name);
        if let Err(err) = registry.register(&identifier, sources.metric(entry.source)) {
            warn!("event=metric_registration_failed identifier={identifier} error={err}");
            for registered in identifiers.iter().rev() {
                registry.unregister(registered.as_str());
            }
            return Err(err);
        }
        identifiers.push(identifier);
    }
    debug!(
        "event=metrics_registered scope={scope} count={} catalog_version={}",
        identifiers.len(),
        catalog.version()
    );
    Ok(MetricGroup {
        scope,
        resource_id: resource_id.clone(),
        identifiers,
        registry,
        closed: AtomicBool::new(false),
    })
}

/// The identifiers one worker registered; unregisters them on close.
pub struct MetricGroup {
    scope: String,
    resource_id: ResourceId,
    identifiers: Vec<String>,
    registry: Arc<dyn MetricRegistry>,
    closed: AtomicBool,
}

impl MetricGroup {
    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn identifiers(&self) -> &[String] {
        &self.identifiers
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Erases everything up to and including the ResourceId segment.
    /// Identifiers that do not carry the id come back unchanged.
    pub fn strip_resource_id<'a>(&self, identifier: &'a str) -> &'a str {
        let id = self.resource_id.as_str();
        if let Some(rest) = identifier
            .strip_prefix(id)
            .and_then(|rest| rest.strip_prefix('.'))
        {
            return rest;
        }
        match identifier.split_once(&format!(".{id}.")) {
            Some((_, name)) => name,
            None => identifier,
        }
    }

    /// Registered names with the worker-specific part erased.
    pub fn names(&self) -> BTreeSet<String> {
        self.identifiers
            .iter()
            .map(|identifier| self.strip_resource_id(identifier).to_string())
            .collect()
    }

    /// Unregisters every identifier. Only the first call has an effect.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        for identifier in &self.identifiers {
            self.registry.unregister(identifier);
        }
        debug!(
            "event=metrics_unregistered scope={} count={}",
            self.scope,
            self.identifiers.len()
        );
        true
    }
}

impl Drop for MetricGroup {
    fn drop(&mut self) {
        self.close();
    }
}
