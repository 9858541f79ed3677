use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TelemetryError {
    #[error("metric {0} already registered")]
    DuplicateMetric(String),
    #[error("metric catalog lists {0} more than once")]
    DuplicateCatalogEntry(String),
    #[error("metric catalog entry has an empty name")]
    EmptyMetricName,
    #[error("unknown scope variable <{variable}> in {template}")]
    UnknownScopeVariable { template: String, variable: String },
    #[error("malformed scope format {0}")]
    MalformedScopeFormat(String),
    #[error("metric registry rejected {identifier}: {reason}")]
    Rejected { identifier: String, reason: String },
}
