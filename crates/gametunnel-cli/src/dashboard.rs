//! Terminal dashboard: periodic probe table of the relay catalog.

use console::{Term, style};
use gametunnel_client::EndpointProbe;
use gametunnel_client::selection::rank;
use gametunnel_core::{CandidateEndpoint, EventKind, EventLog, format_latency};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::Duration;

/// Status of one endpoint in a snapshot
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    /// Endpoint name
    pub name: String,
    /// `host:port`
    pub address: String,
    /// Region label
    pub region: String,
    /// Location label
    pub location: String,
    /// Whether the last probe succeeded
    pub reachable: bool,
    /// Last latency, absent if unreachable
    pub latency_ms: Option<f64>,
    /// Mean over the retained successful samples
    pub avg_latency_ms: Option<f64>,
    /// Fraction of retained samples that failed
    pub failure_rate: f64,
    /// Retained samples
    pub samples: usize,
}

/// Point-in-time view of the catalog
#[derive(Debug, Clone, Serialize)]
pub struct DashboardSnapshot {
    /// Unix milliseconds
    pub timestamp_ms: u64,
    /// Probe rounds so far
    pub rounds: u64,
    /// Lowest-latency reachable endpoint
    pub best: Option<String>,
    /// Per-endpoint status, catalog order
    pub endpoints: Vec<EndpointStatus>,
}

/// Probe state and latency history for the dashboard
pub struct Dashboard {
    endpoints: Vec<CandidateEndpoint>,
    probe: EndpointProbe,
    history: HashMap<String, VecDeque<f64>>,
    history_size: usize,
    rounds: u64,
    events: EventLog,
}

impl Dashboard {
    /// Create a dashboard over a catalog
    #[must_use]
    pub fn new(endpoints: Vec<CandidateEndpoint>, probe: EndpointProbe, history_size: usize) -> Self {
        Self {
            endpoints,
            probe,
            history: HashMap::new(),
            history_size: history_size.max(1),
            rounds: 0,
            events: EventLog::default(),
        }
    }

    /// Probe every endpoint once and record the samples.
    ///
    /// Returns the number of reachable endpoints.
    pub async fn refresh(&mut self) -> usize {
        let was_reachable: HashMap<String, bool> = self
            .endpoints
            .iter()
            .map(|e| (e.name.clone(), e.is_reachable()))
            .collect();

        let reachable = self.probe.probe_all(&mut self.endpoints).await;
        self.rounds += 1;

        for endpoint in &self.endpoints {
            let samples = self.history.entry(endpoint.name.clone()).or_default();
            if samples.len() == self.history_size {
                samples.pop_front();
            }
            samples.push_back(endpoint.latency_ms);

            let before = was_reachable.get(&endpoint.name).copied().unwrap_or(false);
            if before && !endpoint.is_reachable() {
                self.events.append(EventKind::Unreachable, endpoint.name.clone());
            } else if !before && endpoint.is_reachable() && self.rounds > 1 {
                self.events.append(EventKind::Connected, endpoint.name.clone());
            }
        }

        reachable
    }

    /// Current status of every endpoint
    #[must_use]
    pub fn snapshot(&self) -> DashboardSnapshot {
        let endpoints = self
            .endpoints
            .iter()
            .map(|endpoint| {
                let samples = self.history.get(&endpoint.name);
                let total = samples.map_or(0, VecDeque::len);
                let finite: Vec<f64> = samples
                    .into_iter()
                    .flatten()
                    .copied()
                    .filter(|ms| ms.is_finite())
                    .collect();

                EndpointStatus {
                    name: endpoint.name.clone(),
                    address: endpoint.destination().to_string(),
                    region: endpoint.region.clone(),
                    location: endpoint.location.clone(),
                    reachable: endpoint.is_reachable(),
                    latency_ms: endpoint.is_reachable().then_some(endpoint.latency_ms),
                    avg_latency_ms: (!finite.is_empty())
                        .then(|| finite.iter().sum::<f64>() / finite.len() as f64),
                    failure_rate: if total == 0 {
                        0.0
                    } else {
                        (total - finite.len()) as f64 / total as f64
                    },
                    samples: total,
                }
            })
            .collect();

        DashboardSnapshot {
            timestamp_ms: gametunnel_core::stats::unix_millis(),
            rounds: self.rounds,
            best: rank(&self.endpoints).first().map(|e| e.name.clone()),
            endpoints,
        }
    }

    /// Render the status table
    #[must_use]
    pub fn render(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = String::new();

        out.push_str(&format!(
            "{}  round {}\n\n",
            style("GameTunnel relay status").bold(),
            snapshot.rounds
        ));
        out.push_str(&format!(
            "  {:<16} {:<26} {:<12} {:<12} {:>12} {:>12} {:>6}\n",
            "NAME", "ADDRESS", "REGION", "LOCATION", "LATENCY", "AVERAGE", "LOSS"
        ));

        for status in &snapshot.endpoints {
            let marker = if snapshot.best.as_deref() == Some(status.name.as_str()) {
                style("*").green().bold().to_string()
            } else {
                " ".to_string()
            };
            let latency = format_latency(status.latency_ms.unwrap_or(f64::INFINITY));
            let latency = if status.reachable {
                style(latency).green().to_string()
            } else {
                style(latency).red().to_string()
            };

            out.push_str(&format!(
                "{} {:<16} {:<26} {:<12} {:<12} {:>12} {:>12} {:>5.0}%\n",
                marker,
                status.name,
                status.address,
                status.region,
                status.location,
                latency,
                format_latency(status.avg_latency_ms.unwrap_or(f64::INFINITY)),
                status.failure_rate * 100.0
            ));
        }

        let recent = self.events.recent(5);
        if !recent.is_empty() {
            out.push_str(&format!("\n{}\n", style("Recent changes").bold()));
            for event in recent {
                let label = match event.kind {
                    EventKind::Unreachable => style("down").red(),
                    _ => style("up").green(),
                };
                out.push_str(&format!("  {} {}\n", label, event.subject));
            }
        }

        out
    }

    /// Probe rounds so far
    #[must_use]
    pub fn rounds(&self) -> u64 {
        self.rounds
    }
}

/// Refresh and redraw every `interval` until `shutdown` completes
///
/// # Errors
///
/// Returns an error if the terminal cannot be written.
pub async fn run<F>(dashboard: &mut Dashboard, interval: Duration, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let term = Term::stdout();

    loop {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}")?);
        spinner.set_message("Probing relay endpoints...");
        spinner.enable_steady_tick(Duration::from_millis(100));

        let reachable = tokio::select! {
            () = &mut shutdown => {
                spinner.finish_and_clear();
                return Ok(());
            }
            reachable = dashboard.refresh() => reachable,
        };
        spinner.finish_and_clear();

        term.clear_screen()?;
        term.write_str(&dashboard.render())?;
        term.write_line(&format!(
            "\n{} reachable. Refreshing every {}s, Ctrl+C to quit.",
            reachable,
            interval.as_secs()
        ))?;

        tokio::select! {
            () = &mut shutdown => return Ok(()),
            () = tokio::time::sleep(interval) => {}
        }
    }
}
