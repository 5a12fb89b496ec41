//! # GameTunnel Relay
//!
//! Relay node of the GameTunnel system. Each accepted client link becomes a
//! session that reads envelopes, forwards the payload to the envelope's
//! destination over a cached outbound connection, and writes the reply back
//! in an envelope carrying the same address.
//!
//! - [`RelayServer`]: accept loop, session ceiling, sweeps, statistics
//! - [`DestinationCache`]: one live outbound connection per destination
//! - [`SessionRegistry`]: live sessions and idle reaping
//!
//! Forwarding within a session is strictly request then bounded wait, so a
//! session has at most one packet in flight.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod error;
pub mod registry;
pub mod server;

pub use cache::{CacheConfig, CachedConnection, DestinationCache};
pub use error::{RelayError, Result};
pub use registry::{SessionId, SessionInfo, SessionRegistry};
pub use server::{RelayServer, RelayServerConfig, RelayStats};
