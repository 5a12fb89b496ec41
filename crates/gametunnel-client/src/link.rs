//! Stream connection to the selected relay endpoint.
//!
//! The TCP stream is split on connect. The write half belongs to a single
//! writer task that drains a bounded queue, so frames from the forwarding
//! and keepalive loops never interleave. The read half is handed out once as
//! a [`FrameReader`].

use crate::error::{ClientError, Result};
use crate::probe::LatencyProbe;
use gametunnel_core::{CandidateEndpoint, Control, Envelope, FlowStats, FrameReader};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

/// Default connect timeout for the link
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default depth of the outbound queue
pub const DEFAULT_QUEUE_DEPTH: usize = 1024;

/// How long a closing link may spend flushing queued frames
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Link configuration
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Bound on the TCP connect
    pub connect_timeout: Duration,
    /// Outbound queue depth
    pub queue_depth: usize,
    /// Per-read chunk size of the frame reader
    pub read_size: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            read_size: gametunnel_core::DEFAULT_BUFFER_SIZE,
        }
    }
}

enum Outbound {
    Data(Vec<u8>),
    Control(Control),
}

/// Cloneable handle that queues frames for the link's writer
#[derive(Clone)]
pub struct LinkSender {
    tx: mpsc::Sender<Outbound>,
}

impl LinkSender {
    /// Queue pre-encoded envelope bytes
    ///
    /// # Errors
    ///
    /// [`ClientError::LinkClosed`] once the writer has stopped.
    pub async fn send(&self, bytes: Vec<u8>) -> Result<()> {
        self.tx
            .send(Outbound::Data(bytes))
            .await
            .map_err(|_| ClientError::LinkClosed)
    }

    /// Encode and queue an envelope
    ///
    /// # Errors
    ///
    /// [`ClientError::LinkClosed`] once the writer has stopped.
    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<()> {
        self.send(envelope.encode()).await
    }

    /// Queue a literal control message
    ///
    /// # Errors
    ///
    /// [`ClientError::LinkClosed`] once the writer has stopped.
    pub async fn send_control(&self, control: Control) -> Result<()> {
        self.tx
            .send(Outbound::Control(control))
            .await
            .map_err(|_| ClientError::LinkClosed)
    }

    /// Whether the writer has stopped
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One live stream connection to a relay endpoint
pub struct TunnelLink {
    endpoint: CandidateEndpoint,
    peer: SocketAddr,
    sender: LinkSender,
    reader: Option<FrameReader<OwnedReadHalf>>,
    writer: JoinHandle<()>,
    stats: Arc<FlowStats>,
}

impl TunnelLink {
    /// Connect to `endpoint` within `config.connect_timeout`
    ///
    /// # Errors
    ///
    /// [`ClientError::ConnectTimeout`] or [`ClientError::Connect`].
    pub async fn connect(endpoint: &CandidateEndpoint, config: &LinkConfig) -> Result<Self> {
        let target = endpoint.destination().to_string();
        let connect = TcpStream::connect((endpoint.host.as_str(), endpoint.port));

        let stream = match time::timeout(config.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ClientError::Connect {
                    endpoint: target,
                    source,
                });
            }
            Err(_) => return Err(ClientError::ConnectTimeout(target)),
        };
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;

        let (read_half, write_half) = stream.into_split();
        let stats = Arc::new(FlowStats::new());
        stats.mark_established();

        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let writer = tokio::spawn(write_loop(write_half, rx, Arc::clone(&stats)));

        tracing::info!("Tunnel link established to {} ({})", endpoint.name, peer);

        Ok(Self {
            endpoint: endpoint.clone(),
            peer,
            sender: LinkSender { tx },
            reader: Some(FrameReader::with_read_size(
                read_half,
                Control::KeepaliveAck,
                config.read_size,
            )),
            writer,
            stats,
        })
    }

    /// Endpoint this link is connected to
    #[must_use]
    pub fn endpoint(&self) -> &CandidateEndpoint {
        &self.endpoint
    }

    /// Resolved address of the relay
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// New handle to the outbound queue
    #[must_use]
    pub fn sender(&self) -> LinkSender {
        self.sender.clone()
    }

    /// Take the frame reader. Only the first call returns it.
    pub fn take_reader(&mut self) -> Option<FrameReader<OwnedReadHalf>> {
        self.reader.take()
    }

    /// Traffic counters of this link
    #[must_use]
    pub fn stats(&self) -> Arc<FlowStats> {
        Arc::clone(&self.stats)
    }

    /// Close the connection.
    ///
    /// Frames still queued get a short grace period to flush; anything
    /// queued through senders that outlive the link is discarded.
    pub async fn close(self) {
        let TunnelLink {
            endpoint,
            sender,
            reader,
            mut writer,
            ..
        } = self;
        drop(sender);
        drop(reader);

        if time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
            writer.abort();
            let _ = writer.await;
        }
        tracing::info!("Tunnel link to {} closed", endpoint.name);
    }

    /// Close this link, then connect to `endpoint`
    ///
    /// # Errors
    ///
    /// Connect errors for the new endpoint. The old link is closed either way.
    pub async fn switch_endpoint(
        self,
        endpoint: &CandidateEndpoint,
        config: &LinkConfig,
    ) -> Result<TunnelLink> {
        tracing::info!(
            "Switching tunnel link from {} to {}",
            self.endpoint.name,
            endpoint.name
        );
        self.close().await;
        TunnelLink::connect(endpoint, config).await
    }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Outbound>,
    stats: Arc<FlowStats>,
) {
    while let Some(outbound) = rx.recv().await {
        let result = match &outbound {
            Outbound::Data(bytes) => write_half.write_all(bytes).await,
            Outbound::Control(control) => write_half.write_all(control.as_bytes()).await,
        };

        match result {
            Ok(()) => {
                if let Outbound::Data(bytes) = outbound {
                    stats.record_send(bytes.len());
                }
            }
            Err(e) => {
                tracing::warn!("Tunnel write failed: {}", e);
                break;
            }
        }
    }

    let _ = write_half.shutdown().await;
}

/// Latency refresh performed alongside each keepalive
#[derive(Clone)]
pub struct LatencyCheck {
    /// Measurement used for the refresh
    pub probe: Arc<dyn LatencyProbe>,
    /// Relay host
    pub host: String,
    /// Relay port
    pub port: u16,
    /// Per-measurement timeout
    pub timeout: Duration,
}

/// Send `HEARTBEAT` every `interval` until the link closes.
///
/// Each keepalive counts as a request in `stats`; the reader counts the
/// acknowledgments. The first keepalive goes out one interval after start.
///
/// # Errors
///
/// Returns only when the link has closed.
pub async fn keepalive(
    sender: LinkSender,
    stats: Arc<FlowStats>,
    interval: Duration,
    latency: Option<LatencyCheck>,
) -> ClientError {
    let period = interval.max(Duration::from_millis(1));
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        stats.record_request();
        if let Err(e) = sender.send_control(Control::Keepalive).await {
            return e;
        }
        tracing::debug!("Keepalive sent");

        if let Some(check) = &latency {
            match check.probe.attempt(&check.host, check.port, check.timeout).await {
                Some(rtt) => stats.record_latency(rtt),
                None => tracing::debug!("Latency check to {}:{} failed", check.host, check.port),
            }
        }
    }
}
