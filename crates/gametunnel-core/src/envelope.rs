//! Envelope encoding and decoding for the tunnel wire protocol.
//!
//! An envelope carries one datagram across the stream link together with
//! the address it is routed by. All multi-byte fields are big-endian
//! (network byte order):
//!
//! ```text
//! [u32 addr_len][addr_len bytes "host:port"][u32 data_len][data_len bytes payload]
//! ```
//!
//! Decoding is all-or-nothing: any inconsistency between the length fields
//! and the buffer rejects the envelope.

use crate::error::EnvelopeError;
use crate::{ENVELOPE_OVERHEAD, LENGTH_FIELD_SIZE, MAX_ADDR_LEN, MAX_PAYLOAD_LEN};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// A `host:port` pair as carried in the envelope address segment
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    /// Hostname or IP literal (IPv6 without brackets)
    pub host: String,
    /// Port number
    pub port: u16,
}

impl Destination {
    /// Create a new destination
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl From<SocketAddr> for Destination {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Destination {
    type Err = EnvelopeError;

    /// Split at the last `:` so unbracketed IPv6 hosts survive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| EnvelopeError::InvalidAddress(s.to_string()))?;

        if host.is_empty() {
            return Err(EnvelopeError::InvalidAddress(s.to_string()));
        }

        // u16::from_str accepts a leading '+', the wire format does not
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(EnvelopeError::InvalidPort(port.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| EnvelopeError::InvalidPort(port.to_string()))?;

        Ok(Self::new(host, port))
    }
}

/// One datagram plus its routing address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Address segment
    pub destination: Destination,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Create a new envelope
    pub fn new(destination: Destination, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            destination,
            payload: payload.into(),
        }
    }

    /// Size of the encoded envelope in bytes
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        ENVELOPE_OVERHEAD + self.destination.to_string().len() + self.payload.len()
    }

    /// Encode to wire bytes
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        encode(&self.payload, &self.destination)
    }

    /// Decode exactly one envelope.
    ///
    /// # Errors
    ///
    /// Returns `EnvelopeError` if the buffer is short, carries trailing
    /// bytes, or has an invalid address segment.
    pub fn decode(data: &[u8]) -> Result<Self, EnvelopeError> {
        let (envelope, consumed) = Self::decode_prefix(data)?;
        if consumed != data.len() {
            return Err(EnvelopeError::TrailingBytes(data.len() - consumed));
        }
        Ok(envelope)
    }

    /// Decode the envelope at the start of `data`.
    ///
    /// Returns the envelope and the number of bytes it occupied.
    ///
    /// # Errors
    ///
    /// Returns `EnvelopeError` if the buffer is short or the address
    /// segment is invalid.
    pub fn decode_prefix(data: &[u8]) -> Result<(Self, usize), EnvelopeError> {
        let addr_len = read_length(data, 0)?;
        if addr_len > MAX_ADDR_LEN {
            return Err(EnvelopeError::AddressTooLong(addr_len));
        }

        let addr_end = LENGTH_FIELD_SIZE + addr_len;
        let data_len = read_length(data, addr_end)?;
        if data_len > MAX_PAYLOAD_LEN {
            return Err(EnvelopeError::PayloadTooLong(data_len));
        }

        let payload_start = addr_end + LENGTH_FIELD_SIZE;
        let end = payload_start + data_len;
        if data.len() < end {
            return Err(EnvelopeError::TooShort {
                expected: end,
                actual: data.len(),
            });
        }

        let addr = std::str::from_utf8(&data[LENGTH_FIELD_SIZE..addr_end])
            .map_err(|_| EnvelopeError::InvalidUtf8)?;
        let destination = addr.parse()?;

        Ok((
            Self {
                destination,
                payload: data[payload_start..end].to_vec(),
            },
            end,
        ))
    }

    /// Total length of the envelope at the start of `data`, if its headers
    /// are fully buffered.
    ///
    /// Returns `Ok(None)` when more bytes are needed to know the length.
    ///
    /// # Errors
    ///
    /// Returns `EnvelopeError` if a length field exceeds the protocol maxima.
    pub fn frame_len(data: &[u8]) -> Result<Option<usize>, EnvelopeError> {
        let Ok(addr_len) = read_length(data, 0) else {
            return Ok(None);
        };
        if addr_len > MAX_ADDR_LEN {
            return Err(EnvelopeError::AddressTooLong(addr_len));
        }

        let Ok(data_len) = read_length(data, LENGTH_FIELD_SIZE + addr_len) else {
            return Ok(None);
        };
        if data_len > MAX_PAYLOAD_LEN {
            return Err(EnvelopeError::PayloadTooLong(data_len));
        }

        Ok(Some(ENVELOPE_OVERHEAD + addr_len + data_len))
    }
}

/// Encode `payload` addressed to `destination` into wire bytes.
///
/// The address must be at most [`MAX_ADDR_LEN`] bytes and the payload at
/// most [`MAX_PAYLOAD_LEN`]; anything larger would be rejected by every
/// decoder. Callers bound both: payloads by their read buffer size, and
/// addresses by config validation.
///
/// # Panics
///
/// In debug builds, if either limit is exceeded.
#[must_use]
pub fn encode(payload: &[u8], destination: &Destination) -> Vec<u8> {
    let addr = destination.to_string();
    debug_assert!(
        addr.len() <= MAX_ADDR_LEN,
        "address length {} exceeds maximum",
        addr.len()
    );
    debug_assert!(
        payload.len() <= MAX_PAYLOAD_LEN,
        "payload length {} exceeds maximum",
        payload.len()
    );
    let mut out = Vec::with_capacity(ENVELOPE_OVERHEAD + addr.len() + payload.len());

    out.extend_from_slice(&(addr.len() as u32).to_be_bytes());
    out.extend_from_slice(addr.as_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);

    out
}

/// Decode wire bytes into `(payload, destination)`
///
/// # Errors
///
/// Returns `EnvelopeError` if the bytes are not exactly one valid envelope.
pub fn decode(data: &[u8]) -> Result<(Vec<u8>, Destination), EnvelopeError> {
    let envelope = Envelope::decode(data)?;
    Ok((envelope.payload, envelope.destination))
}

fn read_length(data: &[u8], at: usize) -> Result<usize, EnvelopeError> {
    let end = at + LENGTH_FIELD_SIZE;
    if data.len() < end {
        return Err(EnvelopeError::TooShort {
            expected: end,
            actual: data.len(),
        });
    }
    Ok(u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]) as usize)
}
