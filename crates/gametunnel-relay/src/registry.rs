//! Active session tracking.
//!
//! Each session registers a close handle. Removing the entry drops the
//! handle, which wakes the session task and makes it shut its connection;
//! removal therefore doubles as the close signal.

use dashmap::DashMap;
use gametunnel_core::{FlowStats, FlowStatsSnapshot};
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

static SESSION_SEQ: AtomicU64 = AtomicU64::new(0);

/// Session identifier: peer address, creation time, and a process-wide
/// sequence number
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Allocate a fresh id for a connection from `peer`
    #[must_use]
    pub fn new(peer: SocketAddr) -> Self {
        let seq = SESSION_SEQ.fetch_add(1, Ordering::Relaxed);
        Self(format!(
            "{}:{}:{}",
            peer,
            gametunnel_core::stats::unix_millis(),
            seq
        ))
    }

    /// String form
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Receiver side of a session's close handle. Resolves once the session is
/// removed from the registry.
pub type CloseSignal = oneshot::Receiver<()>;

struct SessionEntry {
    peer: SocketAddr,
    created_at: Instant,
    last_activity: Instant,
    stats: Arc<FlowStats>,
    _close: oneshot::Sender<()>,
}

/// Read-only view of one session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// Session id
    pub id: String,
    /// Client address
    pub peer: SocketAddr,
    /// Time since the session was accepted
    pub age_ms: u64,
    /// Time since the last received frame
    pub idle_ms: u64,
    /// Traffic counters
    pub stats: FlowStatsSnapshot,
}

/// Concurrent map of live sessions
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionEntry>,
    registered: AtomicU64,
}

impl SessionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session for `peer`
    pub fn register(&self, peer: SocketAddr, stats: Arc<FlowStats>) -> (SessionId, CloseSignal) {
        let id = SessionId::new(peer);
        let (close_tx, close_rx) = oneshot::channel();
        let now = Instant::now();

        self.sessions.insert(
            id.clone(),
            SessionEntry {
                peer,
                created_at: now,
                last_activity: now,
                stats,
                _close: close_tx,
            },
        );
        self.registered.fetch_add(1, Ordering::Relaxed);

        (id, close_rx)
    }

    /// Mark activity on a session
    pub fn touch(&self, id: &SessionId) {
        if let Some(mut entry) = self.sessions.get_mut(id) {
            entry.last_activity = Instant::now();
        }
    }

    /// Remove and close a session. Returns its final view, or `None` if it
    /// was already gone.
    pub fn remove(&self, id: &SessionId) -> Option<SessionInfo> {
        let now = Instant::now();
        self.sessions
            .remove(id)
            .map(|(id, entry)| info(&id, &entry, now))
    }

    /// Remove and close every session idle for longer than `threshold`
    pub fn evict_idle(&self, threshold: Duration) -> Vec<SessionId> {
        let now = Instant::now();
        let mut evicted = Vec::new();

        self.sessions.retain(|id, entry| {
            let stale = now.duration_since(entry.last_activity) > threshold;
            if stale {
                evicted.push(id.clone());
            }
            !stale
        });

        evicted
    }

    /// Remove and close every session
    pub fn close_all(&self) -> usize {
        let count = self.sessions.len();
        self.sessions.clear();
        count
    }

    /// Whether a session is registered
    #[must_use]
    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Number of live sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether there are no live sessions
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions registered since start
    #[must_use]
    pub fn total_registered(&self) -> u64 {
        self.registered.load(Ordering::Relaxed)
    }

    /// View of every live session
    #[must_use]
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let now = Instant::now();
        self.sessions
            .iter()
            .map(|entry| info(entry.key(), entry.value(), now))
            .collect()
    }
}

fn info(id: &SessionId, entry: &SessionEntry, now: Instant) -> SessionInfo {
    SessionInfo {
        id: id.to_string(),
        peer: entry.peer,
        age_ms: now.duration_since(entry.created_at).as_millis() as u64,
        idle_ms: now.duration_since(entry.last_activity).as_millis() as u64,
        stats: entry.stats.snapshot(),
    }
}
