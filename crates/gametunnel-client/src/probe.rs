//! Endpoint reachability and latency probing.
//!
//! Each attempt opens a TCP connection to the relay and closes it right
//! away; the connect-to-close time is the latency proxy. The reported
//! latency is the mean of the successful attempts.

use async_trait::async_trait;
use gametunnel_core::CandidateEndpoint;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};

/// Default number of attempts per probe
pub const DEFAULT_PROBE_ATTEMPTS: usize = 3;

/// Default per-attempt timeout
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between attempts against the same endpoint
pub const DEFAULT_PROBE_PAUSE: Duration = Duration::from_millis(100);

/// A single latency measurement against `host:port`
#[async_trait]
pub trait LatencyProbe: Send + Sync {
    /// Run one attempt. Returns the measured latency, or `None` on failure.
    async fn attempt(&self, host: &str, port: u16, timeout: Duration) -> Option<Duration>;
}

/// Connect-and-close TCP probe
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnectProbe;

#[async_trait]
impl LatencyProbe for TcpConnectProbe {
    async fn attempt(&self, host: &str, port: u16, timeout: Duration) -> Option<Duration> {
        let start = Instant::now();

        match time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => {
                drop(stream);
                Some(start.elapsed())
            }
            Ok(Err(e)) => {
                tracing::debug!("Probe to {}:{} failed: {}", host, port, e);
                None
            }
            Err(_) => {
                tracing::debug!("Probe to {}:{} timed out", host, port);
                None
            }
        }
    }
}

/// Probe configuration
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Attempts per endpoint
    pub attempts: usize,
    /// Timeout for each attempt
    pub timeout: Duration,
    /// Pause between attempts
    pub pause: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_PROBE_ATTEMPTS,
            timeout: DEFAULT_PROBE_TIMEOUT,
            pause: DEFAULT_PROBE_PAUSE,
        }
    }
}

/// Measures candidate endpoints and records the outcome on them
#[derive(Clone)]
pub struct EndpointProbe {
    probe: Arc<dyn LatencyProbe>,
    config: ProbeConfig,
}

impl EndpointProbe {
    /// Create a TCP connect probe
    #[must_use]
    pub fn new(config: ProbeConfig) -> Self {
        Self::with_probe(Arc::new(TcpConnectProbe), config)
    }

    /// Create a probe backed by a custom measurement
    pub fn with_probe(probe: Arc<dyn LatencyProbe>, config: ProbeConfig) -> Self {
        Self { probe, config }
    }

    /// Probe configuration
    #[must_use]
    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// The underlying single-attempt measurement
    #[must_use]
    pub fn latency_probe(&self) -> Arc<dyn LatencyProbe> {
        Arc::clone(&self.probe)
    }

    /// Mean latency over the configured attempts, `None` if all failed
    pub async fn measure(&self, host: &str, port: u16) -> Option<Duration> {
        let mut total = Duration::ZERO;
        let mut successes = 0u32;

        for attempt in 0..self.config.attempts {
            if attempt > 0 {
                time::sleep(self.config.pause).await;
            }
            if let Some(latency) = self.probe.attempt(host, port, self.config.timeout).await {
                total += latency;
                successes += 1;
            }
        }

        (successes > 0).then(|| total / successes)
    }

    /// Probe one candidate and update its latency and probe time in place
    pub async fn probe(&self, candidate: &mut CandidateEndpoint) -> Option<Duration> {
        let latency = self.measure(&candidate.host, candidate.port).await;
        candidate.record_probe(latency);
        log_outcome(candidate);
        latency
    }

    /// Probe every candidate concurrently.
    ///
    /// Returns the number of reachable candidates.
    pub async fn probe_all(&self, candidates: &mut [CandidateEndpoint]) -> usize {
        let mut tasks = JoinSet::new();

        for (index, candidate) in candidates.iter().enumerate() {
            let prober = self.clone();
            let host = candidate.host.clone();
            let port = candidate.port;
            tasks.spawn(async move { (index, prober.measure(&host, port).await) });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, latency)) => {
                    let candidate = &mut candidates[index];
                    candidate.record_probe(latency);
                    log_outcome(candidate);
                }
                Err(e) => tracing::error!("Probe task failed: {}", e),
            }
        }

        candidates.iter().filter(|c| c.is_reachable()).count()
    }
}

impl Default for EndpointProbe {
    fn default() -> Self {
        Self::new(ProbeConfig::default())
    }
}

fn log_outcome(candidate: &CandidateEndpoint) {
    if candidate.is_reachable() {
        tracing::info!("Endpoint {}: {:.1}ms", candidate.name, candidate.latency_ms);
    } else {
        tracing::warn!("Endpoint {}: unreachable", candidate.name);
    }
}
