//! Error types shared across the pool session, RandomX context, and share submitter.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MinerError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("transport error: {0}")]
    TransportTransient(String),

    #[error("could not reach pool: {0}")]
    TransportFatal(String),

    #[error("malformed message from pool: {0}")]
    ProtocolMalformed(String),

    #[error("share rejected as stale")]
    StaleShare,

    #[error("job not found at pool")]
    JobNotFound,

    #[error("share rejected: {0}")]
    ShareRejectedOther(String),

    #[error("randomx vm error: {0}")]
    VmError(String),

    #[error("failed to build randomx dataset: {0}")]
    SeedBuildFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MinerError>;
