//! Error types for the GameTunnel core protocol.

use thiserror::Error;

/// Envelope decoding errors
///
/// Every variant means the whole envelope is rejected; the decoder never
/// returns a partially parsed envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    /// Buffer shorter than the declared lengths
    #[error("envelope too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Bytes required by the length fields seen so far
        expected: usize,
        /// Bytes actually available
        actual: usize,
    },

    /// Bytes left over after the declared payload
    #[error("{0} trailing bytes after envelope")]
    TrailingBytes(usize),

    /// Address segment length above the protocol maximum
    #[error("address length {0} exceeds maximum")]
    AddressTooLong(usize),

    /// Payload segment length above the protocol maximum
    #[error("payload length {0} exceeds maximum")]
    PayloadTooLong(usize),

    /// Address segment is not valid UTF-8
    #[error("address is not valid UTF-8")]
    InvalidUtf8,

    /// Address is not of the form `host:port`
    #[error("invalid address: {0:?}")]
    InvalidAddress(String),

    /// Port segment is not a number in `0..=65535`
    #[error("invalid port: {0:?}")]
    InvalidPort(String),
}

/// Errors raised while reading frames off a stream
#[derive(Debug, Error)]
pub enum FrameError {
    /// A whole envelope was read but failed to decode.
    ///
    /// Its bytes have been consumed, so reading can continue.
    #[error("malformed envelope: {0}")]
    Malformed(#[source] EnvelopeError),

    /// A length field cannot be trusted; the stream cannot be resynchronized
    #[error("stream out of sync: {0}")]
    Desync(#[source] EnvelopeError),

    /// Peer closed the stream in the middle of a frame
    #[error("stream closed with {0} bytes of a partial frame buffered")]
    Truncated(usize),

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Whether the reader may keep going after this error
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FrameError::Malformed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_error_display() {
        let err = EnvelopeError::TooShort {
            expected: 12,
            actual: 3,
        };
        assert_eq!(
            err.to_string(),
            "envelope too short: expected at least 12, got 3"
        );

        let err = EnvelopeError::InvalidPort("http".to_string());
        assert_eq!(err.to_string(), "invalid port: \"http\"");
    }

    #[test]
    fn test_frame_error_recoverable() {
        assert!(FrameError::Malformed(EnvelopeError::InvalidUtf8).is_recoverable());
        assert!(!FrameError::Desync(EnvelopeError::AddressTooLong(5000)).is_recoverable());
        assert!(!FrameError::Truncated(3).is_recoverable());

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(!FrameError::from(io).is_recoverable());
    }
}
