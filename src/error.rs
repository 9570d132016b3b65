//! Error types for the gateway's own operational failures.
//!
//! Upstream call failures are not errors at this level: they travel as
//! strings inside `ServiceCallRsp.error`, and a batch always answers the
//! client with per-row errors rather than a transport failure.

use thiserror::Error;

/// Top-level error type for gateway operations.
#[derive(Debug, Error)]
pub enum FibpError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFile(#[from] quick_xml::DeError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("listener error on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("discovery error: {0}")]
    Discovery(String),

    #[error("gateway is already running")]
    AlreadyRunning,
}

pub type Result<T> = std::result::Result<T, FibpError>;
