//! # GameTunnel Client
//!
//! Client side of the GameTunnel relay:
//!
//! - [`EndpointProbe`]: latency probing of candidate relays
//! - [`EndpointSelector`]: lowest-latency selection with catalog-order ties
//! - [`LocalIntercept`]: local UDP socket and return-route table
//! - [`TunnelLink`]: stream connection with a single writer and keepalive
//! - [`TunnelClient`]: orchestration, supervision, and endpoint switching
//!
//! ## Example
//!
//! ```no_run
//! use gametunnel_client::{ClientConfig, TunnelClient};
//! use gametunnel_core::CandidateEndpoint;
//!
//! # async fn example() -> gametunnel_client::Result<()> {
//! let endpoints = vec![
//!     CandidateEndpoint::new("fra-1", "relay-fra.example.com", 8080),
//!     CandidateEndpoint::new("nyc-1", "relay-nyc.example.com", 8080),
//! ];
//! let mut client = TunnelClient::new(ClientConfig::default(), endpoints);
//!
//! let best = client.initialize().await?;
//! println!("Using {} ({:.1}ms)", best.name, best.latency_ms);
//!
//! let local = client.start().await?;
//! println!("Point the game at {local}");
//!
//! client.run(async {
//!     let _ = tokio::signal::ctrl_c().await;
//! }).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod error;
pub mod intercept;
pub mod link;
pub mod probe;
pub mod selection;

pub use client::{ClientConfig, RunExit, TunnelClient};
pub use error::{ClientError, Result};
pub use intercept::{LocalIntercept, Route};
pub use link::{LinkConfig, LinkSender, TunnelLink};
pub use probe::{EndpointProbe, LatencyProbe, ProbeConfig, TcpConnectProbe};
pub use selection::{EndpointSelector, select};
