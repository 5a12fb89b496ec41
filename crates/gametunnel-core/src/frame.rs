//! Stream framing: reassembles envelopes and control messages from a byte
//! stream.
//!
//! Stream reads may return any slice of the sender's writes, so bytes are
//! accumulated until a whole unit is buffered. A unit is either one of the
//! literal control messages or a length-prefixed envelope. The two cannot
//! be confused: a valid envelope starts with a length at most
//! [`MAX_ADDR_LEN`](crate::MAX_ADDR_LEN), so its first byte is zero, while
//! every control literal starts with `H`.

use crate::envelope::Envelope;
use crate::error::FrameError;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Keepalive probe sent by the client
pub const KEEPALIVE: &[u8] = b"HEARTBEAT";

/// Keepalive acknowledgment sent by the relay
pub const KEEPALIVE_ACK: &[u8] = b"HEARTBEAT_ACK";

/// Literal control messages that bypass the envelope format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// `HEARTBEAT`
    Keepalive,
    /// `HEARTBEAT_ACK`
    KeepaliveAck,
}

impl Control {
    /// Wire bytes of the control message
    #[must_use]
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Control::Keepalive => KEEPALIVE,
            Control::KeepaliveAck => KEEPALIVE_ACK,
        }
    }
}

/// One unit read from the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Literal control message
    Control(Control),
    /// Decoded envelope
    Envelope(Envelope),
}

/// Split the next whole frame off the front of `buf`.
///
/// `control` is the literal this side of the link expects to receive.
/// Returns `Ok(None)` when more bytes are needed. Bytes of a returned frame,
/// and of an envelope rejected as [`FrameError::Malformed`], are drained
/// from `buf`.
///
/// # Errors
///
/// [`FrameError::Malformed`] for a whole but invalid envelope,
/// [`FrameError::Desync`] for an untrustworthy length field.
pub fn split_frame(buf: &mut Vec<u8>, control: Control) -> Result<Option<Frame>, FrameError> {
    if buf.is_empty() {
        return Ok(None);
    }

    let literal = control.as_bytes();
    let overlap = buf.len().min(literal.len());
    if buf[..overlap] == literal[..overlap] {
        if buf.len() < literal.len() {
            return Ok(None);
        }
        buf.drain(..literal.len());
        return Ok(Some(Frame::Control(control)));
    }

    let Some(total) = Envelope::frame_len(buf).map_err(FrameError::Desync)? else {
        return Ok(None);
    };
    if buf.len() < total {
        return Ok(None);
    }

    let decoded = Envelope::decode(&buf[..total]);
    buf.drain(..total);
    decoded.map(|e| Some(Frame::Envelope(e))).map_err(FrameError::Malformed)
}

/// Buffered frame reader over an async byte stream
pub struct FrameReader<R> {
    inner: R,
    control: Control,
    buf: Vec<u8>,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a reader expecting `control` as its literal control message
    pub fn new(inner: R, control: Control) -> Self {
        Self::with_read_size(inner, control, crate::DEFAULT_BUFFER_SIZE)
    }

    /// Create a reader with a custom per-read chunk size
    pub fn with_read_size(inner: R, control: Control, read_size: usize) -> Self {
        Self {
            inner,
            control,
            buf: Vec::new(),
            chunk: vec![0u8; read_size.max(1)],
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on a clean end of stream. Cancel-safe: bytes are
    /// only buffered after a read completes.
    ///
    /// # Errors
    ///
    /// See [`split_frame`]; additionally I/O errors and
    /// [`FrameError::Truncated`] when the stream ends mid-frame.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        loop {
            if let Some(frame) = split_frame(&mut self.buf, self.control)? {
                return Ok(Some(frame));
            }

            let n = self.inner.read(&mut self.chunk).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(FrameError::Truncated(self.buf.len()));
            }
            self.buf.extend_from_slice(&self.chunk[..n]);
        }
    }

    /// Bytes buffered but not yet returned as a frame
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Unwrap the underlying stream
    pub fn into_inner(self) -> R {
        self.inner
    }
}
