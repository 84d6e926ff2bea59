use std::path::PathBuf;
use thiserror::Error;

use crate::drafts::{DraftOperation, WorkflowStatus};

#[derive(Error, Debug)]
pub enum MetricaError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Recognition error: {0}")]
    Engine(#[from] EngineError),

    #[error("Preprocessing error: {0}")]
    Preprocess(#[from] PreprocessError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Ingestion error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Draft error: {0}")]
    Draft(#[from] DraftError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Invalid layout template '{path}': {reason}")]
    InvalidTemplate { path: PathBuf, reason: String },

    #[error("Failed to resolve secret: {0}")]
    Secret(#[from] crate::secrets::SecretError),
}

/// Failure categories the recognition client retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    Timeout,
    RateLimited,
    Server(u16),
    Network,
}

/// Failure categories that are never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermanentKind {
    UnsupportedFormat,
    BadImage,
    Auth,
    InvalidRequest,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("transient recognition failure ({kind:?}): {message}")]
    Transient { kind: TransientKind, message: String },

    #[error("permanent recognition failure ({kind:?}): {message}")]
    Permanent { kind: PermanentKind, message: String },
}

impl EngineError {
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        Self::Transient {
            kind,
            message: message.into(),
        }
    }

    pub fn permanent(kind: PermanentKind, message: impl Into<String>) -> Self {
        Self::Permanent {
            kind,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Maps an HTTP status returned by a remote recognition service.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = format!("HTTP {}: {}", status, truncate(body, 200));
        match status {
            408 => Self::transient(TransientKind::Timeout, message),
            429 => Self::transient(TransientKind::RateLimited, message),
            500..=599 => Self::transient(TransientKind::Server(status), message),
            401 | 403 => Self::permanent(PermanentKind::Auth, message),
            415 => Self::permanent(PermanentKind::UnsupportedFormat, message),
            _ => Self::permanent(PermanentKind::InvalidRequest, message),
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Failed to encode image: {0}")]
    Encode(String),

    #[error("Image has no pixels")]
    EmptyImage,
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move file from '{from}' to '{to}': {source}")]
    MoveFile {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Failed to (de)serialize artifact: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Job submission contains no files")]
    Empty,

    #[error("Unsupported file '{filename}' ({mime})")]
    UnsupportedFile { filename: String, mime: String },

    #[error("Failed to split PDF '{filename}': {reason}")]
    PdfSplit { filename: String, reason: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum DraftError {
    #[error("Draft {draft_id}: cannot {operation} while {from}")]
    InvalidStateTransition {
        draft_id: String,
        from: WorkflowStatus,
        operation: DraftOperation,
    },

    #[error("Draft not found: {0}")]
    NotFound(String),

    #[error("Draft {draft_id} has unacknowledged review fields: {}", fields.join(", "))]
    UnacknowledgedFields {
        draft_id: String,
        fields: Vec<String>,
    },

    #[error("Draft {draft_id} has no field '{field}'")]
    UnknownField { draft_id: String, field: String },

    #[error("Draft {draft_id} is unreadable: {reason}")]
    Corrupt { draft_id: String, reason: String },

    #[error("Records store rejected draft {draft_id}: {reason}")]
    RecordsStore { draft_id: String, reason: String },

    #[error("Auto-commit batch not found: {0}")]
    BatchNotFound(String),

    #[error(transparent)]
    Database(#[from] crate::db::DatabaseError),

    #[error("Failed to (de)serialize draft payload: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Worker channel closed unexpectedly")]
    ChannelClosed,

    #[error("Timed out waiting for a worker report")]
    Timeout,
}

/// A job held in `processing` past the staleness timeout.
#[derive(Error, Debug, Clone)]
#[error("job {job_id} claimed by {claimed_by} at {claimed_at} exceeded the staleness timeout")]
pub struct StaleJobError {
    pub job_id: String,
    pub claimed_by: String,
    pub claimed_at: String,
}

pub type Result<T> = std::result::Result<T, MetricaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(EngineError::from_status(429, "slow down").is_transient());
        assert!(EngineError::from_status(503, "").is_transient());
        assert!(EngineError::from_status(408, "").is_transient());
        assert!(!EngineError::from_status(401, "").is_transient());
        assert_eq!(
            EngineError::from_status(415, ""),
            EngineError::permanent(PermanentKind::UnsupportedFormat, "HTTP 415: ")
        );
    }

    #[test]
    fn test_truncate_is_char_safe() {
        assert_eq!(truncate("βάπτιση", 3), "βάπ");
        assert_eq!(truncate("ok", 10), "ok");
    }
}
