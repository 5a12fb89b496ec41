//! Error types for the tunnel client
//!
//! Errors are split the same way the client reacts to them:
//!
//! - **Transient**: the link or one endpoint failed; re-selection may help
//! - **Fatal**: nothing can be done without operator intervention

use gametunnel_core::FrameError;
use std::io;
use thiserror::Error;

/// Errors that can occur in client operations
#[derive(Debug, Error)]
pub enum ClientError {
    // ============ Connection Errors ============
    /// Relay endpoint refused or failed the connection
    #[error("Failed to connect to {endpoint}: {source}")]
    Connect {
        /// `host:port` of the endpoint
        endpoint: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Connection attempt exceeded the connect timeout
    #[error("Connection to {0} timed out")]
    ConnectTimeout(String),

    /// The link's writer has shut down
    #[error("Tunnel link closed")]
    LinkClosed,

    /// Stream framing failed on the link
    #[error("Tunnel framing error: {0}")]
    Frame(#[from] FrameError),

    // ============ Selection Errors ============
    /// Every candidate endpoint is unreachable
    #[error("No reachable relay endpoint")]
    NoneAvailable,

    /// Endpoint name not in the catalog
    #[error("Unknown relay endpoint: {0}")]
    UnknownEndpoint(String),

    // ============ Local Errors ============
    /// Local datagram socket could not be bound
    #[error("Failed to bind local socket {addr}: {source}")]
    Bind {
        /// Requested bind address
        addr: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Operation needs a started client
    #[error("Client not started")]
    NotStarted,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

impl ClientError {
    /// Returns true if picking another endpoint or retrying may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClientError::Connect { .. }
                | ClientError::ConnectTimeout(_)
                | ClientError::LinkClosed
                | ClientError::Frame(_)
                | ClientError::Io(_)
        )
    }
}
