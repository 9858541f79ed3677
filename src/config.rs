//! Startup configuration for a single boot attempt.
//!
//! A [`StartupConfiguration`] is an immutable snapshot: it is built (or
//! loaded from JSON) once, handed to the startup sequencer, and discarded
//! after the sequencer finishes. Nothing in here touches the filesystem or
//! the network except [`StartupConfiguration::load`], which only reads the
//! configuration file itself.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const KIB: u64 = 1 << 10;
const MIB: u64 = 1 << 20;
const GIB: u64 = 1 << 30;
const TIB: u64 = 1 << 40;

pub const DEFAULT_SCOPE_FORMAT: &str = "<host>.taskmanager.<tm_id>";

/// A byte count with human-friendly parsing (`"64m"`, `"1 gb"`, `"512kb"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MemorySize(u64);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemorySizeParseError {
    #[error("memory size is empty")]
    Empty,
    #[error("memory size {0:?} does not start with a number")]
    MissingNumber(String),
    #[error("memory size {input:?} has unknown unit {unit:?}")]
    UnknownUnit { input: String, unit: String },
    #[error("memory size {0:?} overflows 64 bits")]
    Overflow(String),
}

impl MemorySize {
    pub const ZERO: MemorySize = MemorySize(0);

    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub const fn from_kibibytes(kibibytes: u64) -> Self {
        Self(kibibytes.saturating_mul(KIB))
    }

    pub const fn from_mebibytes(mebibytes: u64) -> Self {
        Self(mebibytes.saturating_mul(MIB))
    }

    pub const fn from_gibibytes(gibibytes: u64) -> Self {
        Self(gibibytes.saturating_mul(GIB))
    }

    pub const fn bytes(self) -> u64 {
        self.0
    }

    pub fn mebibytes(self) -> u64 {
        self.0 / MIB
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: MemorySize) -> Option<MemorySize> {
        self.0.checked_add(other.0).map(MemorySize)
    }

    pub fn saturating_add(self, other: MemorySize) -> MemorySize {
        MemorySize(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: MemorySize) -> MemorySize {
        MemorySize(self.0.saturating_sub(other.0))
    }

    /// Scales by a fraction in `[0, 1]`, rounding down.
    pub fn multiply(self, fraction: f64) -> MemorySize {
        let scaled = (self.0 as f64 * fraction).floor();
        if scaled <= 0.0 {
            MemorySize::ZERO
        } else if scaled >= u64::MAX as f64 {
            MemorySize(u64::MAX)
        } else {
            MemorySize(scaled as u64)
        }
    }

    pub fn parse(text: &str) -> Result<Self, MemorySizeParseError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(MemorySizeParseError::Empty);
        }
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, unit) = trimmed.split_at(split);
        if digits.is_empty() {
            return Err(MemorySizeParseError::MissingNumber(text.to_string()));
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| MemorySizeParseError::Overflow(text.to_string()))?;
        let unit = unit.trim().to_ascii_lowercase();
        let multiplier = match unit.as_str() {
            "" | "b" | "bytes" => 1,
            "k" | "kb" | "kib" | "kibibytes" => KIB,
            "m" | "mb" | "mib" | "mebibytes" => MIB,
            "g" | "gb" | "gib" | "gibibytes" => GIB,
            "t" | "tb" | "tib" | "tebibytes" => TIB,
            _ => {
                return Err(MemorySizeParseError::UnknownUnit {
                    input: text.to_string(),
                    unit,
                })
            }
        };
        value
            .checked_mul(multiplier)
            .map(MemorySize)
            .ok_or_else(|| MemorySizeParseError::Overflow(text.to_string()))
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 != 0 {
            for (unit, suffix) in [(TIB, "t"), (GIB, "g"), (MIB, "m"), (KIB, "k")] {
                if self.0 % unit == 0 {
                    return write!(f, "{}{}", self.0 / unit, suffix);
                }
            }
        }
        write!(f, "{}b", self.0)
    }
}

impl FromStr for MemorySize {
    type Err = MemorySizeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MemorySize::parse(s)
    }
}

impl Serialize for MemorySize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MemorySize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bytes(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Bytes(bytes) => Ok(MemorySize(bytes)),
            Raw::Text(text) => MemorySize::parse(&text).map_err(serde::de::Error::custom),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfiguration {
    /// Declared total memory of the worker process.
    pub process_size: MemorySize,
    pub framework_heap: MemorySize,
    pub task_heap: MemorySize,
    pub framework_off_heap: MemorySize,
    pub task_off_heap: MemorySize,
    /// Native/runtime overhead that never becomes available to the worker.
    pub runtime_overhead: MemorySize,
    /// Explicit managed memory; overrides `managed_fraction` when set.
    pub managed_size: Option<MemorySize>,
    pub managed_fraction: f64,
    pub network_fraction: f64,
    pub network_min: MemorySize,
    pub network_max: MemorySize,
    /// Size of one network buffer segment.
    pub segment_size: MemorySize,
}

impl Default for MemoryConfiguration {
    fn default() -> Self {
        Self {
            process_size: MemorySize::from_mebibytes(1728),
            framework_heap: MemorySize::from_mebibytes(128),
            task_heap: MemorySize::from_mebibytes(384),
            framework_off_heap: MemorySize::from_mebibytes(128),
            task_off_heap: MemorySize::ZERO,
            runtime_overhead: MemorySize::from_mebibytes(192),
            managed_size: None,
            managed_fraction: 0.4,
            network_fraction: 0.1,
            network_min: MemorySize::from_mebibytes(64),
            network_max: MemorySize::from_gibibytes(1),
            segment_size: MemorySize::from_kibibytes(32),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfiguration {
    pub bind_host: String,
    /// Data-transport port; `0` picks an ephemeral port.
    pub data_port: u16,
    /// Host name reported in metric scopes; defaults to `bind_host`.
    pub advertised_host: Option<String>,
}

impl NetworkConfiguration {
    pub fn advertised_host(&self) -> &str {
        self.advertised_host.as_deref().unwrap_or(&self.bind_host)
    }
}

impl Default for NetworkConfiguration {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            data_port: 0,
            advertised_host: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfiguration {
    pub interval_ms: u64,
    /// Consecutive failed heartbeats after which the leader session is
    /// re-established.
    pub max_consecutive_failures: u32,
}

impl HeartbeatConfiguration {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for HeartbeatConfiguration {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            max_consecutive_failures: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfiguration {
    pub scope_format: String,
}

impl Default for MetricsConfiguration {
    fn default() -> Self {
        Self {
            scope_format: DEFAULT_SCOPE_FORMAT.to_string(),
        }
    }
}

/// A user-declared external resource (GPUs, FPGAs, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalResource {
    pub name: String,
    pub amount: i64,
}

impl ExternalResource {
    pub fn new(name: impl Into<String>, amount: i64) -> Self {
        Self {
            name: name.into(),
            amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupConfiguration {
    /// Root of the directory tree owned by this worker instance.
    pub working_directory: PathBuf,
    /// I/O temp directories; the working directory's `tmp/` when empty.
    pub tmp_dirs: Vec<PathBuf>,
    pub cleanup_working_directory_on_shutdown: bool,
    pub memory: MemoryConfiguration,
    pub network: NetworkConfiguration,
    pub heartbeat: HeartbeatConfiguration,
    pub metrics: MetricsConfiguration,
    pub external_resources: Vec<ExternalResource>,
}

impl Default for StartupConfiguration {
    fn default() -> Self {
        Self {
            working_directory: PathBuf::from("tasknode-work"),
            tmp_dirs: Vec::new(),
            cleanup_working_directory_on_shutdown: true,
            memory: MemoryConfiguration::default(),
            network: NetworkConfiguration::default(),
            heartbeat: HeartbeatConfiguration::default(),
            metrics: MetricsConfiguration::default(),
            external_resources: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read configuration {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed configuration: {0}")]
    Json(#[from] serde_json::Error),
}

impl StartupConfiguration {
    /// Small, valid preset for running a worker inside a single host
    /// (tests, local clusters): loopback bind, ephemeral data port and a
    /// 1 GiB memory envelope.
    pub fn for_local_execution(working_directory: impl Into<PathBuf>) -> Self {
        Self {
            working_directory: working_directory.into(),
            memory: MemoryConfiguration {
                process_size: MemorySize::from_mebibytes(1024),
                framework_heap: MemorySize::from_mebibytes(128),
                task_heap: MemorySize::from_mebibytes(256),
                framework_off_heap: MemorySize::from_mebibytes(128),
                task_off_heap: MemorySize::ZERO,
                runtime_overhead: MemorySize::from_mebibytes(192),
                managed_size: Some(MemorySize::from_mebibytes(128)),
                network_min: MemorySize::from_mebibytes(64),
                network_max: MemorySize::from_mebibytes(64),
                ..MemoryConfiguration::default()
            },
            network: NetworkConfiguration {
                bind_host: "127.0.0.1".to_string(),
                data_port: 0,
                advertised_host: Some("localhost".to_string()),
            },
            heartbeat: HeartbeatConfiguration {
                interval_ms: 1_000,
                ..HeartbeatConfiguration::default()
            },
            ..Self::default()
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigLoadError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Loads a JSON configuration file. Relative directories are resolved
    /// against the file's parent directory.
    pub fn load(path: &Path) -> Result<Self, ConfigLoadError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_json_str(&raw)?;
        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        if config.working_directory.is_relative() {
            config.working_directory = base.join(&config.working_directory);
        }
        for dir in &mut config.tmp_dirs {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
        Ok(config)
    }
}
