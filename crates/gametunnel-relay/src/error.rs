//! Relay error types.

use gametunnel_core::FrameError;
use std::io;
use thiserror::Error;

/// Errors that can occur on the relay
#[derive(Debug, Error)]
pub enum RelayError {
    /// Listener could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Requested bind address
        addr: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Outbound connection to a destination failed
    #[error("Failed to connect to destination {destination}: {source}")]
    Connect {
        /// `host:port` of the destination
        destination: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Outbound connect exceeded its timeout
    #[error("Connection to destination {0} timed out")]
    ConnectTimeout(String),

    /// Destination closed the cached connection
    #[error("Destination {0} closed the connection")]
    DestinationClosed(String),

    /// Session ceiling reached
    #[error("Session limit reached ({0})")]
    CapacityExceeded(usize),

    /// Stream framing failed on a session
    #[error("Session framing error: {0}")]
    Frame(#[from] FrameError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// Whether the error concerns one destination rather than the session
    #[must_use]
    pub fn is_destination_error(&self) -> bool {
        matches!(
            self,
            RelayError::Connect { .. }
                | RelayError::ConnectTimeout(_)
                | RelayError::DestinationClosed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            RelayError::CapacityExceeded(1000).to_string(),
            "Session limit reached (1000)"
        );
        assert_eq!(
            RelayError::ConnectTimeout("game:27015".into()).to_string(),
            "Connection to destination game:27015 timed out"
        );
    }

    #[test]
    fn test_destination_errors() {
        assert!(RelayError::DestinationClosed("x".into()).is_destination_error());
        assert!(!RelayError::CapacityExceeded(1).is_destination_error());
    }
}
