//! Flow statistics shared between forwarding loops and the monitoring side.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Per-link / per-session traffic counters.
///
/// All counters are atomics so every loop can record without locking.
/// Counters only grow; a fresh instance is created per link or session.
#[derive(Debug, Default)]
pub struct FlowStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    /// Unix milliseconds, 0 until established
    established_at_ms: AtomicU64,
    latency_total_us: AtomicU64,
    latency_samples: AtomicU64,
    requests: AtomicU64,
    responses: AtomicU64,
}

/// Point-in-time copy of [`FlowStats`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowStatsSnapshot {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total packets sent
    pub packets_sent: u64,
    /// Total packets received
    pub packets_received: u64,
    /// Connection-established time (Unix milliseconds)
    pub connected_at_ms: Option<u64>,
    /// Mean of recorded latency samples, in milliseconds
    pub avg_latency_ms: f64,
    /// Fraction of requests that got no response (0.0-1.0)
    pub packet_loss: f64,
}

impl FlowStats {
    /// Create new empty statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the flow as established now
    pub fn mark_established(&self) {
        self.established_at_ms.store(unix_millis(), Ordering::Relaxed);
    }

    /// Record an outgoing packet
    pub fn record_send(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an incoming packet
    pub fn record_recv(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a round-trip latency sample
    pub fn record_latency(&self, latency: Duration) {
        self.latency_total_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request that expects a response (keepalive or forward)
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a response to an earlier request
    pub fn record_response(&self) {
        self.responses.fetch_add(1, Ordering::Relaxed);
    }

    /// Mean latency in milliseconds, 0.0 without samples
    #[must_use]
    pub fn avg_latency_ms(&self) -> f64 {
        let samples = self.latency_samples.load(Ordering::Relaxed);
        if samples == 0 {
            return 0.0;
        }
        self.latency_total_us.load(Ordering::Relaxed) as f64 / samples as f64 / 1000.0
    }

    /// Unanswered fraction of requests, 0.0 without requests
    #[must_use]
    pub fn packet_loss(&self) -> f64 {
        let requests = self.requests.load(Ordering::Relaxed);
        if requests == 0 {
            return 0.0;
        }
        let responses = self.responses.load(Ordering::Relaxed).min(requests);
        1.0 - responses as f64 / requests as f64
    }

    /// Total bytes in both directions
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed) + self.bytes_received.load(Ordering::Relaxed)
    }

    /// Take a snapshot of the counters
    #[must_use]
    pub fn snapshot(&self) -> FlowStatsSnapshot {
        let established = self.established_at_ms.load(Ordering::Relaxed);
        FlowStatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            connected_at_ms: (established != 0).then_some(established),
            avg_latency_ms: self.avg_latency_ms(),
            packet_loss: self.packet_loss(),
        }
    }
}

/// Current wall-clock time as Unix milliseconds
#[must_use]
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Format bytes in human-readable form
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    let mut value = bytes as f64;
    for unit in UNITS {
        if value < 1024.0 {
            return format!("{value:.2} {unit}");
        }
        value /= 1024.0;
    }
    format!("{value:.2} PB")
}

/// Format a latency in milliseconds in human-readable form
#[must_use]
pub fn format_latency(latency_ms: f64) -> String {
    if !latency_ms.is_finite() {
        "unreachable".to_string()
    } else if latency_ms < 1.0 {
        format!("{:.0}μs", latency_ms * 1000.0)
    } else if latency_ms < 1000.0 {
        format!("{latency_ms:.1}ms")
    } else {
        format!("{:.2}s", latency_ms / 1000.0)
    }
}
