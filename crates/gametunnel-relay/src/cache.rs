//! Outbound destination connections.
//!
//! One slot per destination, each behind its own async mutex. Holding the
//! slot serializes connect, eviction, and the request/reply exchange on the
//! cached stream; sessions talking to different destinations never contend.
//!
//! A cached stream is reused only if a non-blocking peek reports it idle.
//! End of stream, a socket error, or unsolicited bytes (a late reply to a
//! timed-out request) all evict it.

use crate::error::{RelayError, Result};
use dashmap::DashMap;
use gametunnel_core::Destination;
use socket2::SockRef;
use std::io;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time;

/// Default outbound connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default wait for a destination reply
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Bound on outbound connects
    pub connect_timeout: Duration,
    /// Bound on the reply wait
    pub reply_timeout: Duration,
    /// Largest reply read in one go
    pub buffer_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            buffer_size: gametunnel_core::DEFAULT_BUFFER_SIZE,
        }
    }
}

type Slot = Arc<Mutex<Option<TcpStream>>>;

/// Exclusive use of one destination's cached connection
pub struct CachedConnection {
    destination: Destination,
    slot: OwnedMutexGuard<Option<TcpStream>>,
}

impl CachedConnection {
    /// Destination this connection goes to
    #[must_use]
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Local address of the outbound stream
    #[must_use]
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.slot.as_ref().and_then(|s| s.local_addr().ok())
    }
}

/// Cache of at most one live outbound connection per destination
#[derive(Debug, Default)]
pub struct DestinationCache {
    slots: DashMap<Destination, Slot>,
    config: CacheConfig,
    connects: AtomicU64,
    evictions: AtomicU64,
}

impl DestinationCache {
    /// Create an empty cache
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            slots: DashMap::new(),
            config,
            connects: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Lock `destination`'s slot, reusing the cached stream if it is still
    /// idle and connecting a new one otherwise.
    ///
    /// # Errors
    ///
    /// [`RelayError::Connect`] or [`RelayError::ConnectTimeout`].
    pub async fn get(&self, destination: &Destination) -> Result<CachedConnection> {
        let slot: Slot = Arc::clone(self.slots.entry(destination.clone()).or_default().value());
        let mut guard = slot.lock_owned().await;

        if guard.as_ref().is_some_and(|stream| !is_reusable(stream)) {
            tracing::debug!("Cached connection to {} is stale", destination);
            self.evict_slot(&mut guard);
        }

        if guard.is_none() {
            *guard = Some(self.connect(destination).await?);
        }

        Ok(CachedConnection {
            destination: destination.clone(),
            slot: guard,
        })
    }

    async fn connect(&self, destination: &Destination) -> Result<TcpStream> {
        let target = destination.to_string();
        let connect = TcpStream::connect((destination.host.as_str(), destination.port));

        let stream = match time::timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(RelayError::Connect {
                    destination: target,
                    source,
                });
            }
            Err(_) => return Err(RelayError::ConnectTimeout(target)),
        };
        stream.set_nodelay(true)?;

        self.connects.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Connected to destination {}", target);
        Ok(stream)
    }

    /// Write `payload` and wait for one reply.
    ///
    /// Returns `Ok(None)` when no reply arrives within the reply timeout.
    /// Write or read failures evict the connection.
    ///
    /// # Errors
    ///
    /// [`RelayError::DestinationClosed`] or I/O errors.
    pub async fn send(
        &self,
        conn: &mut CachedConnection,
        payload: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let outcome = match conn.slot.as_mut() {
            Some(stream) => exchange(stream, payload, &self.config).await,
            None => Err(io::ErrorKind::NotConnected.into()),
        };

        match outcome {
            Ok(Exchange::Reply(reply)) => Ok(Some(reply)),
            Ok(Exchange::Timeout) => {
                tracing::debug!("No reply from {} within timeout", conn.destination);
                Ok(None)
            }
            Ok(Exchange::Closed) => {
                self.evict_slot(&mut conn.slot);
                Err(RelayError::DestinationClosed(conn.destination.to_string()))
            }
            Err(e) => {
                self.evict_slot(&mut conn.slot);
                Err(RelayError::Io(e))
            }
        }
    }

    /// Get a connection, exchange one request/reply, evict on failure
    ///
    /// # Errors
    ///
    /// Connect errors and the errors of [`DestinationCache::send`].
    pub async fn forward(
        &self,
        destination: &Destination,
        payload: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let mut conn = self.get(destination).await?;
        self.send(&mut conn, payload).await
    }

    /// Close the cached connection to `destination`, if any
    pub async fn evict(&self, destination: &Destination) -> bool {
        let Some(slot) = self.slots.get(destination).map(|s| Arc::clone(s.value())) else {
            return false;
        };
        let mut guard = slot.lock().await;
        self.evict_slot(&mut guard)
    }

    fn evict_slot(&self, slot: &mut Option<TcpStream>) -> bool {
        match slot.take() {
            Some(stream) => {
                drop(stream);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Drop slots that hold no connection and are not in use
    pub fn prune(&self) -> usize {
        let before = self.slots.len();
        self.slots
            .retain(|_, slot| slot.try_lock().map_or(true, |guard| guard.is_some()));
        before - self.slots.len()
    }

    /// Close every idle cached connection and forget all slots
    pub fn clear(&self) {
        self.slots.clear();
    }

    /// Number of destinations with a slot
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no destination has a slot
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Outbound connections opened so far
    #[must_use]
    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    /// Cached connections closed as dead so far
    #[must_use]
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

enum Exchange {
    Reply(Vec<u8>),
    Timeout,
    Closed,
}

async fn exchange(
    stream: &mut TcpStream,
    payload: &[u8],
    config: &CacheConfig,
) -> io::Result<Exchange> {
    stream.write_all(payload).await?;

    let mut buf = vec![0u8; config.buffer_size.clamp(1, gametunnel_core::MAX_PAYLOAD_LEN)];
    match time::timeout(config.reply_timeout, stream.read(&mut buf)).await {
        Err(_) => Ok(Exchange::Timeout),
        Ok(Ok(0)) => Ok(Exchange::Closed),
        Ok(Ok(n)) => {
            buf.truncate(n);
            Ok(Exchange::Reply(buf))
        }
        Ok(Err(e)) => Err(e),
    }
}

/// Idle and open: the peek would block
fn is_reusable(stream: &TcpStream) -> bool {
    let mut probe = [MaybeUninit::<u8>::uninit(); 1];
    match SockRef::from(stream).peek(&mut probe) {
        Err(e) => e.kind() == io::ErrorKind::WouldBlock,
        Ok(_) => false,
    }
}
