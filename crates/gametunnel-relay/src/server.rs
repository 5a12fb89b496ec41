//! Relay server: accepts client links and forwards their envelopes.

use crate::cache::{self, CacheConfig, DestinationCache};
use crate::error::{RelayError, Result};
use crate::registry::{CloseSignal, SessionId, SessionInfo, SessionRegistry};
use gametunnel_core::{
    Control, Envelope, EventKind, EventLog, FlowStats, Frame, FrameReader, format_bytes,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Bind host
    pub host: String,
    /// Bind port, 0 for ephemeral
    pub port: u16,
    /// Region label reported at startup
    pub region: Option<String>,
    /// Maximum number of concurrent sessions
    pub max_sessions: usize,
    /// Read buffer size for sessions and destination replies
    pub buffer_size: usize,
    /// Sessions idle for longer are reaped
    pub idle_timeout: Duration,
    /// Interval of the idle sweep
    pub cleanup_interval: Duration,
    /// Interval of the statistics log line
    pub stats_interval: Duration,
    /// Wait for a destination reply
    pub reply_timeout: Duration,
    /// Bound on outbound connects
    pub connect_timeout: Duration,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            region: None,
            max_sessions: 1000,
            buffer_size: gametunnel_core::DEFAULT_BUFFER_SIZE,
            idle_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
            stats_interval: Duration::from_secs(300),
            reply_timeout: cache::DEFAULT_REPLY_TIMEOUT,
            connect_timeout: cache::DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Server-wide statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RelayStats {
    /// Seconds since the server was bound
    pub uptime_secs: u64,
    /// Live sessions
    pub active_sessions: usize,
    /// Sessions accepted since start
    pub total_sessions: u64,
    /// Connections refused at the session ceiling
    pub rejected_sessions: u64,
    /// Payload bytes received from clients
    pub bytes_from_clients: u64,
    /// Payload bytes returned to clients
    pub bytes_to_clients: u64,
    /// Envelopes forwarded to destinations
    pub packets_forwarded: u64,
    /// Replies returned to clients
    pub replies_returned: u64,
    /// Envelopes that got no reply (timeout or failure)
    pub packets_dropped: u64,
    /// Destinations with a cache slot
    pub cached_destinations: usize,
    /// Cached connections evicted as dead
    pub cache_evictions: u64,
}

impl RelayStats {
    /// Bytes relayed in both directions
    #[must_use]
    pub fn bytes_relayed(&self) -> u64 {
        self.bytes_from_clients + self.bytes_to_clients
    }
}

#[derive(Debug, Default)]
struct Counters {
    rejected: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    forwarded: AtomicU64,
    replies: AtomicU64,
    dropped: AtomicU64,
}

struct Shared {
    config: RelayServerConfig,
    registry: SessionRegistry,
    cache: DestinationCache,
    events: Arc<EventLog>,
    counters: Counters,
    started: Instant,
}

impl Shared {
    fn stats(&self) -> RelayStats {
        RelayStats {
            uptime_secs: self.started.elapsed().as_secs(),
            active_sessions: self.registry.len(),
            total_sessions: self.registry.total_registered(),
            rejected_sessions: self.counters.rejected.load(Ordering::Relaxed),
            bytes_from_clients: self.counters.bytes_in.load(Ordering::Relaxed),
            bytes_to_clients: self.counters.bytes_out.load(Ordering::Relaxed),
            packets_forwarded: self.counters.forwarded.load(Ordering::Relaxed),
            replies_returned: self.counters.replies.load(Ordering::Relaxed),
            packets_dropped: self.counters.dropped.load(Ordering::Relaxed),
            cached_destinations: self.cache.len(),
            cache_evictions: self.cache.evictions(),
        }
    }
}

/// GameTunnel relay server
pub struct RelayServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
}

impl RelayServer {
    /// Bind the listener
    ///
    /// # Errors
    ///
    /// [`RelayError::Bind`] if the address cannot be bound.
    pub async fn bind(config: RelayServerConfig) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .map_err(|source| RelayError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let cache = DestinationCache::new(CacheConfig {
            connect_timeout: config.connect_timeout,
            reply_timeout: config.reply_timeout,
            buffer_size: config.buffer_size,
        });
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            listener,
            local_addr,
            shared: Arc::new(Shared {
                config,
                registry: SessionRegistry::new(),
                cache,
                events: Arc::new(EventLog::default()),
                counters: Counters::default(),
                started: Instant::now(),
            }),
            shutdown,
        })
    }

    /// Bound address
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Server configuration
    #[must_use]
    pub fn config(&self) -> &RelayServerConfig {
        &self.shared.config
    }

    /// Accept sessions until [`RelayServer::shutdown`] is called.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok`; accept errors are logged and retried.
    pub async fn run(&self) -> Result<()> {
        let config = &self.shared.config;
        match &config.region {
            Some(region) => tracing::info!(
                "Relay listening on {} (region {}, max {} sessions)",
                self.local_addr,
                region,
                config.max_sessions
            ),
            None => tracing::info!(
                "Relay listening on {} (max {} sessions)",
                self.local_addr,
                config.max_sessions
            ),
        }

        let mut shutdown = self.shutdown.subscribe();
        let cleanup = self.spawn_cleanup_task();
        let reporter = self.spawn_stats_task();

        while !*shutdown.borrow() {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.admit(stream, peer),
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        cleanup.abort();
        reporter.abort();

        let closed = self.shared.registry.close_all();
        self.shared.cache.clear();
        tracing::info!("Relay stopped, closed {} sessions", closed);
        Ok(())
    }

    /// Stop accepting and close every session
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> RelayStats {
        self.shared.stats()
    }

    /// Live sessions
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.shared.registry.snapshot()
    }

    /// Number of live sessions
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Connection event log
    #[must_use]
    pub fn events(&self) -> Arc<EventLog> {
        Arc::clone(&self.shared.events)
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        let shared = &self.shared;
        if let Err(e) = check_capacity(&shared.registry, shared.config.max_sessions) {
            shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
            shared
                .events
                .append_with_detail(EventKind::Rejected, peer.to_string(), e.to_string());
            tracing::warn!("Rejecting {}: {}", peer, e);
            drop(stream);
            return;
        }

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("set_nodelay failed for {}: {}", peer, e);
        }

        let stats = Arc::new(FlowStats::new());
        stats.mark_established();
        let (id, closed) = shared.registry.register(peer, Arc::clone(&stats));

        shared.events.append(EventKind::Connected, id.to_string());
        tracing::info!("Session {} opened ({} active)", id, shared.registry.len());

        tokio::spawn(run_session(Arc::clone(shared), id, stream, stats, closed));
    }

    fn spawn_cleanup_task(&self) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let period = shared.config.cleanup_interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;

                let reaped = shared.registry.evict_idle(shared.config.idle_timeout);
                for id in &reaped {
                    shared.events.append(EventKind::Reaped, id.to_string());
                }
                if !reaped.is_empty() {
                    tracing::info!("Reaped {} idle sessions", reaped.len());
                }

                let pruned = shared.cache.prune();
                if pruned > 0 {
                    tracing::debug!("Pruned {} empty destination slots", pruned);
                }
            }
        })
    }

    fn spawn_stats_task(&self) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let period = shared.config.stats_interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let stats = shared.stats();
                tracing::info!(
                    "Relay stats: uptime {}s, {} active sessions, {} total, {} relayed",
                    stats.uptime_secs,
                    stats.active_sessions,
                    stats.total_sessions,
                    format_bytes(stats.bytes_relayed())
                );
            }
        })
    }
}

fn check_capacity(registry: &SessionRegistry, max_sessions: usize) -> Result<()> {
    if registry.len() >= max_sessions {
        return Err(RelayError::CapacityExceeded(max_sessions));
    }
    Ok(())
}

async fn run_session(
    shared: Arc<Shared>,
    id: SessionId,
    stream: TcpStream,
    stats: Arc<FlowStats>,
    mut closed: CloseSignal,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader =
        FrameReader::with_read_size(read_half, Control::Keepalive, shared.config.buffer_size);

    let reason: String = loop {
        let frame = tokio::select! {
            _ = &mut closed => break "closed by relay".to_string(),
            frame = reader.next_frame() => frame,
        };

        match frame {
            Ok(Some(Frame::Control(_))) => {
                shared.registry.touch(&id);
                tracing::debug!("Keepalive from {}", id);
                if let Err(e) = write_half.write_all(Control::KeepaliveAck.as_bytes()).await {
                    break e.to_string();
                }
            }
            Ok(Some(Frame::Envelope(envelope))) => {
                shared.registry.touch(&id);
                if let Err(e) = relay_envelope(&shared, &stats, &mut write_half, envelope).await {
                    break e.to_string();
                }
            }
            Ok(None) => break "peer closed".to_string(),
            Err(e) if e.is_recoverable() => {
                tracing::warn!("Session {}: dropping malformed envelope: {}", id, e);
            }
            Err(e) => break e.to_string(),
        }
    };

    let _ = write_half.shutdown().await;

    if let Some(info) = shared.registry.remove(&id) {
        shared
            .events
            .append_with_detail(EventKind::Disconnected, id.to_string(), reason.clone());
        tracing::info!(
            "Session {} closed: {} ({} in, {} out)",
            id,
            reason,
            format_bytes(info.stats.bytes_received),
            format_bytes(info.stats.bytes_sent)
        );
    } else {
        tracing::info!("Session {} closed: {}", id, reason);
    }
}

/// Forward one envelope and write back the reply, if any.
///
/// Only a failure to write to the client is returned; destination
/// problems drop the packet.
async fn relay_envelope(
    shared: &Shared,
    stats: &FlowStats,
    write_half: &mut OwnedWriteHalf,
    envelope: Envelope,
) -> std::io::Result<()> {
    let Envelope {
        destination,
        payload,
    } = envelope;

    stats.record_recv(payload.len());
    stats.record_request();
    shared
        .counters
        .bytes_in
        .fetch_add(payload.len() as u64, Ordering::Relaxed);
    shared.counters.forwarded.fetch_add(1, Ordering::Relaxed);

    let started = Instant::now();
    let reply = match shared.cache.forward(&destination, &payload).await {
        Ok(Some(reply)) => reply,
        Ok(None) => {
            shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        Err(e) => {
            tracing::warn!("Forward to {} failed: {}", destination, e);
            shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
    };
    stats.record_latency(started.elapsed());
    stats.record_response();

    stats.record_send(reply.len());
    shared
        .counters
        .bytes_out
        .fetch_add(reply.len() as u64, Ordering::Relaxed);
    shared.counters.replies.fetch_add(1, Ordering::Relaxed);

    let framed = Envelope::new(destination, reply).encode();
    write_half.write_all(&framed).await
}
