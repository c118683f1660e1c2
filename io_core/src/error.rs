//! Error kinds for the io core, mapped 1:1 to the policy table the reactor
//! follows when a subsystem fails.

use thiserror::Error;

/// Errors surfaced by the domain registry, connection table, reactor,
/// HTTP framer, websocket engine and router.
#[derive(Debug, Error)]
pub enum IoError {
    /// A domain configuration file failed to load or validate. Fatal at
    /// startup: the whole registry load is refused.
    #[error("domain config error: {0}")]
    Domain(String),

    /// More than one domain in a registry directory is marked default.
    #[error("more than one default domain configured")]
    MultipleDefaultDomains,

    /// TLS handshake failed in a way that is not recoverable by retrying
    /// on the next readiness event.
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// Wire-level parse failure (HTTP, websocket framing). The connection
    /// that produced it must be closed without retry.
    #[error("parse error: {0}")]
    Parse(String),

    /// A websocket frame sequence violated the fragmentation invariant.
    #[error("websocket protocol violation: {0}")]
    WsProtocol(String),

    /// No connection exists for the given id.
    #[error("unknown connection")]
    UnknownConnection,

    /// No domain exists with the given SNI name and no default is
    /// configured to fall back to.
    #[error("unknown SNI name: {0}")]
    UnknownSni(String),

    /// Underlying I/O failure from the OS.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure in a config or wire payload.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type used across the io core.
pub type IoResult<T> = Result<T, IoError>;
