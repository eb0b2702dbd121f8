use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("insufficient resources: host too active to accept work")]
    InsufficientResources,

    #[error("download failed with HTTP status {status}")]
    Download { status: u16 },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("invalid module: {0}")]
    Validation(String),

    #[error("guest trapped: {0}")]
    Trap(String),

    #[error("all compute credit exhausted")]
    FuelExhausted,

    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("{path} returned status {status}: {body}")]
    Api {
        path: String,
        status: u16,
        body: String,
    },

    #[error("no release asset for platform {os}/{arch}")]
    NoApplicableRelease { os: String, arch: String },

    #[error("update download failed: {0}")]
    UpdateDownload(String),

    #[error("update verification failed: {0}")]
    UpdateVerification(String),

    #[error("update apply failed: {0}")]
    UpdateApply(String),

    #[error("rollback failed, manual intervention required: {0}")]
    RollbackFailure(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;
