use thiserror::Error;

/// Fatal at startup; no run record is written.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required config field: {0}")]
    MissingField(String),
    #[error("invalid value for config field {0}: {1}")]
    InvalidValue(String, String),
}

/// Upstream adapter failures, split by whether retries were already
/// exhausted.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("transient upstream error after exhausting retries: {0}")]
    Transient(String),
    #[error("permanent upstream error: {0}")]
    Permanent(String),
}

/// A single record could not be mapped; the orchestrator drops it and moves
/// on.
#[derive(Debug, Error)]
#[error("mapping error on {field}: {reason}")]
pub struct MappingError {
    pub field: String,
    pub reason: String,
}

impl MappingError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self { field: field.into(), reason: reason.into() }
    }
}

/// Fatal to the run; pending batches are retained for an operator retry.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to serialize batch for table {table}: {reason}")]
    Serialize { table: String, reason: String },
    #[error("failed to insert batch into table {table}: {reason}")]
    Insert { table: String, reason: String },
}
