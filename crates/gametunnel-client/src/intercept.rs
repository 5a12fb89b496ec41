//! Local datagram intercept point.
//!
//! The envelope has a single address field. It names where the relay should
//! send the payload, and the relay echoes it back on the reply, so the
//! client uses it as the routing key for the return trip. [`Route`] keeps
//! the two roles apart:
//!
//! - no configured destination: the wire address is the local sender
//!   itself, and replies are routed straight back to it
//! - configured destination: every sender shares the wire address, so each
//!   forwarded datagram queues its sender as a pending return route
//!
//! A relay session answers its envelopes strictly in order, so pending
//! routes for a destination are consumed first in, first out. The relay
//! drops requests it cannot answer without telling the client; a pending
//! route that stays unanswered for longer than the reply window is
//! discarded before the next reply is matched.

use crate::error::{ClientError, Result};
use dashmap::DashMap;
use gametunnel_core::{Destination, Envelope};
use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;

/// How long a forwarded datagram waits for its reply before its return
/// route is discarded
pub const DEFAULT_REPLY_WINDOW: Duration = Duration::from_secs(10);

/// Unanswered return routes kept per destination
pub const MAX_PENDING_ROUTES: usize = 1024;

/// Routing fields of one forwarded datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Local sender that should receive the reply
    pub return_to: SocketAddr,
    /// Address written into the envelope
    pub destination: Destination,
}

#[derive(Debug, Clone, Copy)]
struct PendingRoute {
    return_to: SocketAddr,
    sent_at: Instant,
}

/// Owns the local UDP socket and the return-route table
#[derive(Debug)]
pub struct LocalIntercept {
    socket: UdpSocket,
    destination: Option<Destination>,
    pending: DashMap<Destination, VecDeque<PendingRoute>>,
    reply_window: Duration,
}

impl LocalIntercept {
    /// Bind the local socket on `host:port` (port 0 for ephemeral)
    ///
    /// # Errors
    ///
    /// [`ClientError::Bind`] if the socket cannot be bound.
    pub async fn bind(host: &str, port: u16, destination: Option<Destination>) -> Result<Self> {
        let socket = UdpSocket::bind((host, port))
            .await
            .map_err(|source| ClientError::Bind {
                addr: format!("{host}:{port}"),
                source,
            })?;

        match &destination {
            Some(dest) => tracing::info!(
                "Local intercept on {} forwarding to {}",
                socket.local_addr()?,
                dest
            ),
            None => tracing::info!("Local intercept on {}", socket.local_addr()?),
        }

        Ok(Self {
            socket,
            destination,
            pending: DashMap::new(),
            reply_window: DEFAULT_REPLY_WINDOW,
        })
    }

    /// Set how long a return route waits for its reply
    #[must_use]
    pub fn with_reply_window(mut self, window: Duration) -> Self {
        self.reply_window = window;
        self
    }

    /// Bound local address
    ///
    /// # Errors
    ///
    /// Socket errors from the OS.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Configured true destination, if any
    #[must_use]
    pub fn destination(&self) -> Option<&Destination> {
        self.destination.as_ref()
    }

    /// Route a datagram from `peer`, queueing its return path when the
    /// wire address does not identify it
    pub fn route_for(&self, peer: SocketAddr) -> Route {
        let Some(destination) = self.destination.clone() else {
            return Route {
                return_to: peer,
                destination: Destination::from(peer),
            };
        };

        let now = Instant::now();
        let mut queue = self.pending.entry(destination.clone()).or_default();
        self.discard_expired(&mut queue, now);
        if queue.len() >= MAX_PENDING_ROUTES {
            queue.pop_front();
            tracing::debug!("Pending routes for {} full, dropped the oldest", destination);
        }
        queue.push_back(PendingRoute {
            return_to: peer,
            sent_at: now,
        });

        Route {
            return_to: peer,
            destination,
        }
    }

    /// Wrap a datagram from `peer` into an envelope
    pub fn wrap(&self, payload: &[u8], peer: SocketAddr) -> Envelope {
        let route = self.route_for(peer);
        Envelope::new(route.destination, payload.to_vec())
    }

    /// Local address a reply carrying `destination` goes back to.
    ///
    /// With a configured destination this consumes the oldest live pending
    /// route for it.
    pub fn resolve(&self, destination: &Destination) -> Option<SocketAddr> {
        if self.destination.is_none() {
            // The wire address is the peer itself
            let ip: IpAddr = destination.host.parse().ok()?;
            return Some(SocketAddr::new(ip, destination.port));
        }

        let mut queue = self.pending.get_mut(destination)?;
        self.discard_expired(&mut queue, Instant::now());
        queue.pop_front().map(|pending| pending.return_to)
    }

    fn discard_expired(&self, queue: &mut VecDeque<PendingRoute>, now: Instant) {
        while queue
            .front()
            .is_some_and(|p| now.duration_since(p.sent_at) > self.reply_window)
        {
            if let Some(expired) = queue.pop_front() {
                tracing::debug!("No reply for {} within the reply window", expired.return_to);
            }
        }
    }

    /// Forget every pending return route.
    ///
    /// Requests in flight on a closed link are never answered.
    pub fn clear_pending(&self) {
        self.pending.clear();
    }

    /// Number of return routes waiting for a reply
    #[must_use]
    pub fn pending_routes(&self) -> usize {
        self.pending.iter().map(|entry| entry.len()).sum()
    }

    /// Receive one datagram
    ///
    /// # Errors
    ///
    /// Socket errors from the OS.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    /// Send a reply envelope's payload to its local peer.
    ///
    /// Returns `false` when no route is known; the payload is dropped.
    ///
    /// # Errors
    ///
    /// Socket errors from the OS.
    pub async fn deliver(&self, envelope: &Envelope) -> io::Result<bool> {
        let Some(peer) = self.resolve(&envelope.destination) else {
            tracing::warn!(
                "Dropping {} byte reply for {}: no return route",
                envelope.payload.len(),
                envelope.destination
            );
            return Ok(false);
        };

        self.socket.send_to(&envelope.payload, peer).await?;
        tracing::debug!("Delivered {} bytes to {}", envelope.payload.len(), peer);
        Ok(true)
    }
}
