//! # GameTunnel Core
//!
//! Core protocol implementation for GameTunnel, a relay tunnel for
//! real-time game traffic.
//!
//! This crate provides:
//! - Envelope encoding and decoding (the tunnel wire format)
//! - Stream reassembly of envelopes and control messages
//! - Candidate relay endpoint model
//! - Lock-free flow statistics
//! - Bounded connection event log
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   UDP   ┌────────────────┐   TCP (envelopes)   ┌─────────────┐   TCP   ┌──────────────┐
//! │   local app   │ ──────> │ LocalIntercept │ ──────────────────> │ RelayServer │ ──────> │ destination  │
//! │               │ <────── │  + TunnelLink  │ <────────────────── │             │ <────── │              │
//! └───────────────┘         └────────────────┘                     └─────────────┘         └──────────────┘
//! ```
//!
//! ## Wire Format
//!
//! ```text
//! ┌──────────────┬─────────────────────┬──────────────┬──────────────────┐
//! │ addr_len u32 │ "host:port" (UTF-8) │ data_len u32 │ payload          │
//! └──────────────┴─────────────────────┴──────────────┴──────────────────┘
//! ```
//!
//! Both length fields are big-endian. The literal control messages
//! `HEARTBEAT` / `HEARTBEAT_ACK` share the stream and bypass the envelope.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod events;
pub mod frame;
pub mod stats;

pub use endpoint::CandidateEndpoint;
pub use envelope::{Destination, Envelope, decode, encode};
pub use error::{EnvelopeError, FrameError};
pub use events::{Event, EventKind, EventLog};
pub use frame::{Control, Frame, FrameReader, KEEPALIVE, KEEPALIVE_ACK};
pub use stats::{FlowStats, FlowStatsSnapshot, format_bytes, format_latency};

/// Size of each envelope length field in bytes
pub const LENGTH_FIELD_SIZE: usize = 4;

/// Minimum size of an encoded envelope (two empty length-prefixed segments)
pub const ENVELOPE_OVERHEAD: usize = 2 * LENGTH_FIELD_SIZE;

/// Largest accepted address segment
pub const MAX_ADDR_LEN: usize = 1024;

/// Largest accepted payload segment (1 MiB)
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

/// Default socket read buffer size (64 KB)
pub const DEFAULT_BUFFER_SIZE: usize = 65536;
