//! Error kinds for the recorder core, mirroring the policy table in
//! SPEC_FULL.md §7: most of these are handled locally (drop frame, log
//! and continue) rather than propagated — see `pipeline.rs` and
//! `workers.rs` for where each variant is actually produced and caught.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("stream with id {0} already exists")]
    AlreadyExists(String),
    #[error("unknown stream id {0}")]
    UnknownId(String),
    #[error("lock acquisition timed out")]
    LockTimeout,
    #[error("codec decode error: {0}")]
    Decode(String),
    #[error("invalid recording path: {0}")]
    InvalidPath(String),
    #[error("output sink error: {0}")]
    Sink(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type RecorderResult<T> = Result<T, RecorderError>;
