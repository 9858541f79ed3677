use super::catalog::MetricKind;
use super::error::TelemetryError;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type GaugeFn = Arc<dyn Fn() -> u64 + Send + Sync>;

/// A registered value: gauges are sampled on read, counters are shared
/// cells owned by whoever increments them.
#[derive(Clone)]
pub enum Metric {
    Gauge(GaugeFn),
    Counter(Arc<AtomicU64>),
}

impl Metric {
    pub fn gauge(sample: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        Metric::Gauge(Arc::new(sample))
    }

    pub fn counter(cell: Arc<AtomicU64>) -> Self {
        Metric::Counter(cell)
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            Metric::Gauge(_) => MetricKind::Gauge,
            Metric::Counter(_) => MetricKind::Counter,
        }
    }

    pub fn value(&self) -> u64 {
        match self {
            Metric::Gauge(sample) => sample(),
            Metric::Counter(cell) => cell.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metric")
            .field("kind", &self.kind())
            .field("value", &self.value())
            .finish()
    }
}

/// Reporting backend boundary. Registration of an identifier that is
/// already present must fail.
pub trait MetricRegistry: Send + Sync {
    fn register(&self, identifier: &str, metric: Metric) -> Result<(), TelemetryError>;
    /// Returns whether the identifier was registered.
    fn unregister(&self, identifier: &str) -> bool;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub gauges: BTreeMap<String, u64>,
    pub counters: BTreeMap<String, u64>,
}

#[derive(Debug, Default)]
pub struct InMemoryMetricRegistry {
    metrics: Mutex<BTreeMap<String, Metric>>,
}

impl InMemoryMetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identifiers(&self) -> Vec<String> {
        self.metrics.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.metrics.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.lock().is_empty()
    }

    pub fn value(&self, identifier: &str) -> Option<u64> {
        let metric = self.metrics.lock().get(identifier).cloned();
        metric.map(|metric| metric.value())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        // Gauges may take their own locks; sample outside ours.
        let metrics: Vec<(String, Metric)> = self
            .metrics
            .lock()
            .iter()
            .map(|(identifier, metric)| (identifier.clone(), metric.clone()))
            .collect();
        let mut snapshot = MetricsSnapshot::default();
        for (identifier, metric) in metrics {
            let value = metric.value();
            match metric.kind() {
                MetricKind::Gauge => snapshot.gauges.insert(identifier, value),
                MetricKind::Counter => snapshot.counters.insert(identifier, value),
            };
        }
        snapshot
    }
}

impl MetricRegistry for InMemoryMetricRegistry {
    fn register(&self, identifier: &str, metric: Metric) -> Result<(), TelemetryError> {
        let mut metrics = self.metrics.lock();
        if metrics.contains_key(identifier) {
            return Err(TelemetryError::DuplicateMetric(identifier.to_string()));
        }
        metrics.insert(identifier.to_string(), metric);
        Ok(())
    }

    fn unregister(&self, identifier: &str) -> bool {
        self.metrics.lock().remove(identifier).is_some()
    }
}

/// Accepts everything and keeps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpMetricRegistry;

impl MetricRegistry for NoOpMetricRegistry {
    fn register(&self, _identifier: &str, _metric: Metric) -> Result<(), TelemetryError> {
        Ok(())
    }

    fn unregister(&self, _identifier: &str) -> bool {
        false
    }
}
