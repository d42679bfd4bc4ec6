//! Error types for the agentbox-proxy crate.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in the network proxy and its collaborators.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Proxy bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Upstream connection failed to {host}: {reason}")]
    UpstreamConnect { host: String, reason: String },

    #[error("HTTP parse error: {0}")]
    HttpParse(String),

    /// A forwarded request would reach the proxy itself again.
    #[error("Forwarding loop: request for {0} targets the proxy")]
    ForwardLoop(String),

    /// The hosting HTTP server cannot hand over the raw client socket.
    #[error("Protocol upgrade unsupported: {0}")]
    UpgradeUnsupported(String),

    #[error("Cannot open audit log {}: {source}", path.display())]
    AuditLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP error: {0}")]
    Hyper(#[from] hyper::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
