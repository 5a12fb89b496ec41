//! Candidate relay endpoints.

use crate::envelope::Destination;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// A relay node eligible for selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEndpoint {
    /// Display name, unique within a catalog
    pub name: String,
    /// Hostname or IP
    pub host: String,
    /// Relay port
    pub port: u16,
    /// Region label (e.g., "us-east", "eu-west")
    pub region: String,
    /// Location label (e.g., "Frankfurt")
    pub location: String,
    /// Last measured latency in milliseconds, infinite if unreachable or
    /// not yet probed
    #[serde(skip, default = "unmeasured")]
    pub latency_ms: f64,
    /// Time of the last probe
    #[serde(skip)]
    pub last_probe: Option<SystemTime>,
}

fn unmeasured() -> f64 {
    f64::INFINITY
}

impl CandidateEndpoint {
    /// Create a new, unprobed endpoint
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            region: String::new(),
            location: String::new(),
            latency_ms: unmeasured(),
            last_probe: None,
        }
    }

    /// Set region label
    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Set location label
    #[must_use]
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    /// Set a measured latency directly
    #[must_use]
    pub fn with_latency(mut self, latency_ms: f64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Store a probe outcome: `Some(mean)` or `None` for unreachable
    pub fn record_probe(&mut self, latency: Option<Duration>) {
        self.latency_ms = latency.map_or(f64::INFINITY, |d| d.as_secs_f64() * 1000.0);
        self.last_probe = Some(SystemTime::now());
    }

    /// Whether the last probe succeeded
    #[must_use]
    pub fn is_reachable(&self) -> bool {
        self.latency_ms.is_finite()
    }

    /// `host:port` of the relay
    #[must_use]
    pub fn destination(&self) -> Destination {
        Destination::new(self.host.clone(), self.port)
    }

    /// Whether the last probe is older than `threshold` (or missing)
    #[must_use]
    pub fn is_measurement_stale(&self, threshold: Duration) -> bool {
        match self.last_probe.and_then(|t| t.elapsed().ok()) {
            Some(age) => age > threshold,
            None => true,
        }
    }
}
