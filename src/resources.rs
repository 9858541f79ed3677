//! Pure validation of the memory and resource sections of a
//! [`StartupConfiguration`].
//!
//! Nothing here allocates or touches the system; the sequencer calls
//! [`validate`] before any directory, socket or metric is acquired, and a
//! failure is never retried: the configuration itself has to change.

use crate::config::{MemorySize, StartupConfiguration};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("network memory min {min} exceeds network memory max {max}")]
    NetworkMemoryBounds { min: MemorySize, max: MemorySize },
    #[error("{option} must be within [0, 1], got {value}")]
    InvalidFraction { option: &'static str, value: f64 },
    #[error("network segment size {segment} must be non-zero and at most network memory max {max}")]
    InvalidSegmentSize {
        segment: MemorySize,
        max: MemorySize,
    },
    #[error("reserved memory {reserved} exceeds total process memory {total}")]
    ReservedExceedsTotal {
        reserved: MemorySize,
        total: MemorySize,
    },
    #[error("external resource {name} declares negative amount {amount}")]
    NegativeExternalResource { name: String, amount: i64 },
    #[error("external resource {0} declared more than once")]
    DuplicateExternalResource(String),
    #[error("heartbeat {0} must be greater than zero")]
    InvalidHeartbeat(&'static str),
}

impl ConfigError {
    /// Stable machine-readable code for the violated constraint.
    pub fn reason(&self) -> &'static str {
        match self {
            ConfigError::NetworkMemoryBounds { .. } => "network_memory_bounds",
            ConfigError::InvalidFraction { .. } => "invalid_fraction",
            ConfigError::InvalidSegmentSize { .. } => "invalid_segment_size",
            ConfigError::ReservedExceedsTotal { .. } => "reserved_exceeds_total",
            ConfigError::NegativeExternalResource { .. } => "negative_external_resource",
            ConfigError::DuplicateExternalResource(_) => "duplicate_external_resource",
            ConfigError::InvalidHeartbeat(_) => "invalid_heartbeat",
        }
    }
}

/// Memory layout derived from a valid configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBudget {
    /// Process memory minus runtime overhead.
    pub worker: MemorySize,
    pub heap: MemorySize,
    pub off_heap: MemorySize,
    pub network: MemorySize,
    pub managed: MemorySize,
    pub segment_size: MemorySize,
    pub network_segments: u64,
}

pub fn validate(config: &StartupConfiguration) -> Result<(), ConfigError> {
    derive_memory_budget(config).map(|_| ())
}

/// Validates `config` and computes the resulting [`MemoryBudget`]. The first
/// violated constraint is returned.
pub fn derive_memory_budget(config: &StartupConfiguration) -> Result<MemoryBudget, ConfigError> {
    let memory = &config.memory;
    check_fraction("memory.managed_fraction", memory.managed_fraction)?;
    check_fraction("memory.network_fraction", memory.network_fraction)?;

    if memory.network_min > memory.network_max {
        return Err(ConfigError::NetworkMemoryBounds {
            min: memory.network_min,
            max: memory.network_max,
        });
    }
    if memory.segment_size.is_zero() || memory.segment_size > memory.network_max {
        return Err(ConfigError::InvalidSegmentSize {
            segment: memory.segment_size,
            max: memory.network_max,
        });
    }

    let worker = memory.process_size.saturating_sub(memory.runtime_overhead);
    let network = memory
        .network_min
        .max(worker.multiply(memory.network_fraction))
        .min(memory.network_max);
    let managed = memory
        .managed_size
        .unwrap_or_else(|| worker.multiply(memory.managed_fraction));
    let heap = memory.framework_heap.saturating_add(memory.task_heap);
    let off_heap = memory
        .framework_off_heap
        .saturating_add(memory.task_off_heap);

    let reserved = [memory.runtime_overhead, off_heap, network, managed]
        .into_iter()
        .fold(heap, MemorySize::saturating_add);
    if reserved > memory.process_size {
        return Err(ConfigError::ReservedExceedsTotal {
            reserved,
            total: memory.process_size,
        });
    }

    let mut seen = HashSet::new();
    for resource in &config.external_resources {
        if resource.amount < 0 {
            return Err(ConfigError::NegativeExternalResource {
                name: resource.name.clone(),
                amount: resource.amount,
            });
        }
        if !seen.insert(resource.name.as_str()) {
            return Err(ConfigError::DuplicateExternalResource(resource.name.clone()));
        }
    }

    if config.heartbeat.interval_ms == 0 {
        return Err(ConfigError::InvalidHeartbeat("interval"));
    }
    if config.heartbeat.max_consecutive_failures == 0 {
        return Err(ConfigError::InvalidHeartbeat("failure threshold"));
    }

    Ok(MemoryBudget {
        worker,
        heap,
        off_heap,
        network,
        managed,
        segment_size: memory.segment_size,
        network_segments: network.bytes() / memory.segment_size.bytes(),
    })
}

fn check_fraction(option: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidFraction { option, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExternalResource;

    fn local() -> StartupConfiguration {
        StartupConfiguration::for_local_execution("/tmp/unused")
    }

    #[test]
    fn default_and_local_presets_are_valid() {
        assert!(validate(&StartupConfiguration::default()).is_ok());
        let budget = derive_memory_budget(&local()).unwrap();
        assert_eq!(budget.network, MemorySize::from_mebibytes(64));
        assert_eq!(budget.managed, MemorySize::from_mebibytes(128));
        assert_eq!(budget.network_segments, 2048);
    }

    #[test]
    fn network_min_above_max_is_rejected() {
        let mut config = local();
        config.memory.network_min = MemorySize::parse("100m").unwrap();
        config.memory.network_max = MemorySize::parse("10m").unwrap();
        let err = validate(&config).unwrap_err();
        assert_eq!(err.reason(), "network_memory_bounds");
        assert_eq!(
            err.to_string(),
            "network memory min 100m exceeds network memory max 10m"
        );
    }

    #[test]
    fn network_memory_is_clamped_between_bounds() {
        let mut config = StartupConfiguration::default();
        config.memory.network_fraction = 0.0;
        assert_eq!(
            derive_memory_budget(&config).unwrap().network,
            config.memory.network_min
        );
        config.memory.network_fraction = 1.0;
        config.memory.managed_fraction = 0.0;
        config.memory.network_max = MemorySize::from_mebibytes(256);
        assert_eq!(
            derive_memory_budget(&config).unwrap().network,
            MemorySize::from_mebibytes(256)
        );
    }

    #[test]
    fn reserved_memory_must_fit_process_size() {
        let mut config = local();
        config.memory.task_heap = MemorySize::from_gibibytes(2);
        let err = validate(&config).unwrap_err();
        assert!(matches!(err, ConfigError::ReservedExceedsTotal { .. }));
    }

    #[test]
    fn fractions_outside_unit_interval_are_rejected() {
        let mut config = local();
        config.memory.managed_fraction = 1.5;
        assert_eq!(
            validate(&config).unwrap_err(),
            ConfigError::InvalidFraction {
                option: "memory.managed_fraction",
                value: 1.5
            }
        );
        config.memory.managed_fraction = f64::NAN;
        assert_eq!(validate(&config).unwrap_err().reason(), "invalid_fraction");
    }

    #[test]
    fn segment_size_must_fit_network_max() {
        let mut config = local();
        config.memory.segment_size = MemorySize::ZERO;
        assert_eq!(validate(&config).unwrap_err().reason(), "invalid_segment_size");
        config.memory.segment_size = MemorySize::from_mebibytes(128);
        assert_eq!(validate(&config).unwrap_err().reason(), "invalid_segment_size");
    }

    #[test]
    fn external_resources_must_be_non_negative_and_unique() {
        let mut config = local();
        config.external_resources = vec![ExternalResource::new("gpu", 0)];
        assert!(validate(&config).is_ok());
        config.external_resources.push(ExternalResource::new("fpga", -1));
        assert_eq!(
            validate(&config).unwrap_err(),
            ConfigError::NegativeExternalResource {
                name: "fpga".into(),
                amount: -1
            }
        );
        config.external_resources[1].amount = 2;
        config.external_resources.push(ExternalResource::new("gpu", 1));
        assert_eq!(
            validate(&config).unwrap_err(),
            ConfigError::DuplicateExternalResource("gpu".into())
        );
    }

    #[test]
    fn first_violation_wins() {
        let mut config = local();
        config.memory.network_min = MemorySize::from_mebibytes(100);
        config.memory.network_max = MemorySize::from_mebibytes(10);
        config.heartbeat.interval_ms = 0;
        assert_eq!(validate(&config).unwrap_err().reason(), "network_memory_bounds");
    }

    #[test]
    fn heartbeat_settings_must_be_positive() {
        let mut config = local();
        config.heartbeat.max_consecutive_failures = 0;
        assert_eq!(
            validate(&config).unwrap_err(),
            ConfigError::InvalidHeartbeat("failure threshold")
        );
    }
}
