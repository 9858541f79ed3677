use super::error::TelemetryError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashSet};

pub const STANDARD_CATALOG_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Gauge,
    Counter,
}

/// Where a catalog entry reads its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricSource {
    ProcessThreads,
    ProcessResident,
    ProcessUptime,
    ProcessCpuTime,
    ProcessCpuLoad,
    HeapConfigured,
    OffHeapConfigured,
    ManagedUsed,
    ManagedTotal,
    NetworkTotalSegments,
    NetworkTotalMemory,
    NetworkAvailableSegments,
    NetworkAvailableMemory,
    NetworkUsedSegments,
    NetworkUsedMemory,
    BackgroundFaults,
}

impl MetricSource {
    pub fn kind(self) -> MetricKind {
        match self {
            MetricSource::BackgroundFaults => MetricKind::Counter,
            _ => MetricKind::Gauge,
        }
    }
}

const STANDARD_METRICS: &[(&str, MetricSource)] = &[
    ("Status.Process.Threads.Count", MetricSource::ProcessThreads),
    ("Status.Process.Memory.Resident", MetricSource::ProcessResident),
    ("Status.Process.Uptime", MetricSource::ProcessUptime),
    ("Status.Process.CPU.Time", MetricSource::ProcessCpuTime),
    ("Status.Process.CPU.Load", MetricSource::ProcessCpuLoad),
    ("Status.Memory.Heap.Configured", MetricSource::HeapConfigured),
    ("Status.Memory.OffHeap.Configured", MetricSource::OffHeapConfigured),
    ("Status.Memory.Managed.Used", MetricSource::ManagedUsed),
    ("Status.Memory.Managed.Total", MetricSource::ManagedTotal),
    (
        "Status.Shuffle.Network.TotalMemorySegments",
        MetricSource::NetworkTotalSegments,
    ),
    ("Status.Shuffle.Network.TotalMemory", MetricSource::NetworkTotalMemory),
    (
        "Status.Shuffle.Network.AvailableMemorySegments",
        MetricSource::NetworkAvailableSegments,
    ),
    (
        "Status.Shuffle.Network.AvailableMemory",
        MetricSource::NetworkAvailableMemory,
    ),
    (
        "Status.Shuffle.Network.UsedMemorySegments",
        MetricSource::NetworkUsedSegments,
    ),
    ("Status.Shuffle.Network.UsedMemory", MetricSource::NetworkUsedMemory),
    ("Status.Tasks.BackgroundFaults", MetricSource::BackgroundFaults),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricCatalogEntry {
    pub name: String,
    pub source: MetricSource,
}

impl MetricCatalogEntry {
    pub fn new(name: impl Into<String>, source: MetricSource) -> Self {
        Self {
            name: name.into(),
            source,
        }
    }

    pub fn kind(&self) -> MetricKind {
        self.source.kind()
    }
}

/// Immutable, versioned table of everything a worker reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricCatalog {
    version: u32,
    entries: Vec<MetricCatalogEntry>,
}

impl MetricCatalog {
    pub fn new(version: u32, entries: Vec<MetricCatalogEntry>) -> Result<Self, TelemetryError> {
        let mut seen = HashSet::new();
        for entry in &entries {
            if entry.name.trim().is_empty() {
                return Err(TelemetryError::EmptyMetricName);
            }
            if !seen.insert(entry.name.as_str()) {
                return Err(TelemetryError::DuplicateCatalogEntry(entry.name.clone()));
            }
        }
        Ok(Self { version, entries })
    }

    pub fn standard() -> Self {
        Self {
            version: STANDARD_CATALOG_VERSION,
            entries: STANDARD_METRICS
                .iter()
                .map(|(name, source)| MetricCatalogEntry::new(*name, *source))
                .collect(),
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn entries(&self) -> &[MetricCatalogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.entries.iter().map(|entry| entry.name.clone()).collect()
    }

    /// Hex SHA-256 over the version and the sorted names; changes whenever
    /// the reported surface changes.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.version.to_be_bytes());
        for name in self.names() {
            hasher.update(name.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}
