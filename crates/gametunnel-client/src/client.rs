//! Tunnel client orchestration.
//!
//! Probes the catalog, selects an endpoint, and runs three loops over the
//! local intercept and the tunnel link:
//!
//! - local to tunnel: wrap each datagram and queue it on the link
//! - tunnel to local: read frames, count acks, deliver replies
//! - keepalive: periodic `HEARTBEAT` plus a latency refresh
//!
//! The first loop to exit ends the link. [`TunnelClient::run`] then
//! re-probes and re-selects until a link is back or the retries run out.

use crate::error::{ClientError, Result};
use crate::intercept::{self, LocalIntercept};
use crate::link::{self, LatencyCheck, LinkConfig, LinkSender, TunnelLink};
use crate::probe::{EndpointProbe, ProbeConfig};
use crate::selection::EndpointSelector;
use gametunnel_core::{
    CandidateEndpoint, Destination, EventKind, EventLog, FlowStats, FlowStatsSnapshot, Frame,
    FrameReader,
};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::task::JoinSet;
use tokio::time;

/// Default keepalive interval
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Default reconnect attempts after link loss
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Default pause between reconnect attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Local bind host
    pub bind_host: String,
    /// Local UDP port, 0 for ephemeral
    pub local_port: u16,
    /// True destination; `None` sends the local peer address on the wire
    pub destination: Option<Destination>,
    /// Endpoint probing
    pub probe: ProbeConfig,
    /// Keepalive interval
    pub keepalive_interval: Duration,
    /// Link connect timeout
    pub connect_timeout: Duration,
    /// Reconnect attempts after link loss
    pub retry_attempts: u32,
    /// Pause between reconnect attempts
    pub retry_delay: Duration,
    /// Datagram and stream read buffer size
    pub buffer_size: usize,
    /// Outbound queue depth
    pub queue_depth: usize,
    /// How long a forwarded datagram waits for its reply before its return
    /// route is discarded
    pub reply_window: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            local_port: 0,
            destination: None,
            probe: ProbeConfig::default(),
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            connect_timeout: link::DEFAULT_CONNECT_TIMEOUT,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            buffer_size: gametunnel_core::DEFAULT_BUFFER_SIZE,
            queue_depth: link::DEFAULT_QUEUE_DEPTH,
            reply_window: intercept::DEFAULT_REPLY_WINDOW,
        }
    }
}

impl ClientConfig {
    fn link_config(&self) -> LinkConfig {
        LinkConfig {
            connect_timeout: self.connect_timeout,
            queue_depth: self.queue_depth,
            read_size: self.buffer_size,
        }
    }
}

/// How [`TunnelClient::run`] ended
#[derive(Debug)]
pub enum RunExit {
    /// The shutdown future completed
    Shutdown,
    /// The link was lost and no endpoint could be reached again
    Exhausted {
        /// Reconnect attempts made
        attempts: u32,
        /// Error of the last attempt
        last_error: ClientError,
    },
}

/// Why a forwarding loop stopped
#[derive(Debug)]
enum LoopExit {
    /// Link failed or closed
    Link(ClientError),
    /// Local socket failed
    Local(io::Error),
}

struct ActiveLink {
    link: TunnelLink,
    loops: JoinSet<LoopExit>,
}

/// Tunnel client: endpoint selection plus the forwarding loops
pub struct TunnelClient {
    config: ClientConfig,
    selector: EndpointSelector,
    probe: EndpointProbe,
    pinned: Option<String>,
    intercept: Option<Arc<LocalIntercept>>,
    active: Option<ActiveLink>,
    events: Arc<EventLog>,
}

impl TunnelClient {
    /// Create a client over a catalog of candidate endpoints
    #[must_use]
    pub fn new(config: ClientConfig, endpoints: Vec<CandidateEndpoint>) -> Self {
        let probe = EndpointProbe::new(config.probe.clone());
        Self {
            config,
            selector: EndpointSelector::new(endpoints),
            probe,
            pinned: None,
            intercept: None,
            active: None,
            events: Arc::new(EventLog::default()),
        }
    }

    /// Replace the endpoint probe
    #[must_use]
    pub fn with_probe(mut self, probe: EndpointProbe) -> Self {
        self.probe = probe;
        self
    }

    /// Share an existing event log
    #[must_use]
    pub fn with_events(mut self, events: Arc<EventLog>) -> Self {
        self.events = events;
        self
    }

    /// Probe every candidate and return the best one.
    ///
    /// # Errors
    ///
    /// [`ClientError::NoneAvailable`] if nothing is reachable and no
    /// endpoint is pinned.
    pub async fn initialize(&mut self) -> Result<CandidateEndpoint> {
        tracing::info!("Probing {} relay endpoints", self.selector.len());
        let reachable = self.probe.probe_all(self.selector.endpoints_mut()).await;
        tracing::info!("{} of {} endpoints reachable", reachable, self.selector.len());

        for endpoint in self.selector.endpoints() {
            if !endpoint.is_reachable() {
                self.events.append(EventKind::Unreachable, endpoint.name.clone());
            }
        }

        self.choose()
    }

    /// Always use the named endpoint instead of the lowest-latency one
    ///
    /// # Errors
    ///
    /// [`ClientError::UnknownEndpoint`] if the name is not in the catalog.
    pub fn pin_endpoint(&mut self, name: &str) -> Result<()> {
        self.selector.find_by_name(name)?;
        self.pinned = Some(name.to_string());
        Ok(())
    }

    /// Add a candidate to the catalog, replacing one with the same name
    pub fn add_endpoint(&mut self, endpoint: CandidateEndpoint) {
        self.selector.add_endpoint(endpoint);
    }

    fn choose(&self) -> Result<CandidateEndpoint> {
        if let Some(name) = &self.pinned {
            return self.selector.find_by_name(name).cloned();
        }
        self.selector.select_best().cloned()
    }

    /// Bind the local intercept and connect to the chosen endpoint.
    ///
    /// Returns the local address applications should send to.
    ///
    /// # Errors
    ///
    /// Bind, selection, or connect errors.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        let intercept = match &self.intercept {
            Some(intercept) => Arc::clone(intercept),
            None => {
                let intercept = Arc::new(
                    LocalIntercept::bind(
                        &self.config.bind_host,
                        self.config.local_port,
                        self.config.destination.clone(),
                    )
                    .await?
                    .with_reply_window(self.config.reply_window),
                );
                self.intercept = Some(Arc::clone(&intercept));
                intercept
            }
        };

        if self.active.is_none() {
            let endpoint = self.choose()?;
            let link = TunnelLink::connect(&endpoint, &self.config.link_config()).await?;
            self.activate(link);
        }

        Ok(intercept.local_addr()?)
    }

    fn activate(&mut self, mut link: TunnelLink) {
        let Some(intercept) = self.intercept.clone() else {
            return;
        };
        let Some(reader) = link.take_reader() else {
            return;
        };

        // Requests sent on an earlier link are never answered
        intercept.clear_pending();

        let stats = link.stats();
        let endpoint = link.endpoint().clone();
        let latency = LatencyCheck {
            probe: self.probe.latency_probe(),
            host: endpoint.host.clone(),
            port: endpoint.port,
            timeout: self.config.probe.timeout,
        };

        let mut loops = JoinSet::new();
        loops.spawn(forward_local(
            Arc::clone(&intercept),
            link.sender(),
            self.config.buffer_size,
        ));
        loops.spawn(forward_tunnel(reader, intercept, Arc::clone(&stats)));
        let sender = link.sender();
        let interval = self.config.keepalive_interval;
        loops.spawn(async move {
            LoopExit::Link(link::keepalive(sender, stats, interval, Some(latency)).await)
        });

        self.events.append_with_detail(
            EventKind::Connected,
            endpoint.name.clone(),
            format!("{}", link.peer_addr()),
        );
        self.active = Some(ActiveLink { link, loops });
    }

    async fn deactivate(&mut self) -> Option<TunnelLink> {
        let mut active = self.active.take()?;
        active.loops.shutdown().await;
        Some(active.link)
    }

    /// Move the tunnel to the named endpoint.
    ///
    /// The current link and its loops are torn down before the new
    /// connection is opened. On connect failure the client is left without
    /// a link.
    ///
    /// # Errors
    ///
    /// [`ClientError::UnknownEndpoint`], [`ClientError::NotStarted`], or
    /// connect errors.
    pub async fn switch_endpoint(&mut self, name: &str) -> Result<()> {
        let target = self.selector.find_by_name(name)?.clone();
        if self.intercept.is_none() {
            return Err(ClientError::NotStarted);
        }

        let config = self.config.link_config();
        let link = match self.deactivate().await {
            Some(old) => {
                let from = old.endpoint().name.clone();
                let link = old.switch_endpoint(&target, &config).await?;
                self.events.append_with_detail(
                    EventKind::Switched,
                    target.name.clone(),
                    format!("from {from}"),
                );
                link
            }
            None => TunnelLink::connect(&target, &config).await?,
        };

        self.pinned = Some(target.name.clone());
        self.activate(link);
        Ok(())
    }

    /// Run until `shutdown` completes, reconnecting after link loss.
    ///
    /// Losing the link for good is not an error: it ends the run with
    /// [`RunExit::Exhausted`] once the reconnect attempts are used up.
    ///
    /// # Errors
    ///
    /// Startup errors or failure of the local socket.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<RunExit>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        if self.active.is_none() {
            self.start().await?;
        }

        loop {
            let exit = match self.active.as_mut() {
                Some(active) => tokio::select! {
                    () = &mut shutdown => None,
                    joined = active.loops.join_next() => Some(joined),
                },
                None => Some(None),
            };

            let reason = match exit {
                None => {
                    self.stop().await;
                    return Ok(RunExit::Shutdown);
                }
                Some(Some(Ok(reason))) => Some(reason),
                Some(Some(Err(e))) => {
                    tracing::error!("Forwarding task failed: {}", e);
                    None
                }
                Some(None) => None,
            };

            if let Some(LoopExit::Local(e)) = reason {
                tracing::error!("Local socket failed: {}", e);
                self.stop().await;
                return Err(ClientError::Io(e));
            }

            if let Some(old) = self.deactivate().await {
                let name = old.endpoint().name.clone();
                old.close().await;
                match reason {
                    Some(LoopExit::Link(e)) => {
                        tracing::warn!("Tunnel link to {} lost: {}", name, e);
                        self.events
                            .append_with_detail(EventKind::Disconnected, name, e.to_string());
                    }
                    _ => self.events.append(EventKind::Disconnected, name),
                }
            }

            let reconnected = tokio::select! {
                () = &mut shutdown => None,
                result = self.reconnect() => Some(result),
            };
            match reconnected {
                Some(Ok(())) => {}
                Some(Err(last_error)) => {
                    return Ok(RunExit::Exhausted {
                        attempts: self.config.retry_attempts.max(1),
                        last_error,
                    });
                }
                None => {
                    self.stop().await;
                    return Ok(RunExit::Shutdown);
                }
            }
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        let attempts = self.config.retry_attempts.max(1);
        let mut last_error = ClientError::NoneAvailable;

        for attempt in 1..=attempts {
            tracing::info!("Reconnecting (attempt {}/{})", attempt, attempts);

            let connected = match self.initialize().await {
                Ok(endpoint) => TunnelLink::connect(&endpoint, &self.config.link_config()).await,
                Err(e) => Err(e),
            };

            match connected {
                Ok(link) => {
                    self.activate(link);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!("Reconnect attempt {} failed: {}", attempt, e);
                    last_error = e;
                }
            }

            if attempt < attempts {
                time::sleep(self.config.retry_delay).await;
            }
        }

        tracing::error!("Giving up after {} reconnect attempts", attempts);
        Err(last_error)
    }

    /// Tear down the loops and close the link
    pub async fn stop(&mut self) {
        if let Some(link) = self.deactivate().await {
            let name = link.endpoint().name.clone();
            link.close().await;
            self.events.append(EventKind::Disconnected, name);
        }
    }

    /// Stats of the current link
    #[must_use]
    pub fn stats(&self) -> Option<FlowStatsSnapshot> {
        self.active.as_ref().map(|a| a.link.stats().snapshot())
    }

    /// Endpoint of the current link
    #[must_use]
    pub fn current_endpoint(&self) -> Option<&CandidateEndpoint> {
        self.active.as_ref().map(|a| a.link.endpoint())
    }

    /// Candidate catalog with the latest probe results
    #[must_use]
    pub fn endpoints(&self) -> &[CandidateEndpoint] {
        self.selector.endpoints()
    }

    /// Connection event log
    #[must_use]
    pub fn events(&self) -> Arc<EventLog> {
        Arc::clone(&self.events)
    }

    /// Local intercept address once started
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.intercept.as_ref().and_then(|i| i.local_addr().ok())
    }

    /// Whether a link is active
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.active.is_some()
    }
}

async fn forward_local(
    intercept: Arc<LocalIntercept>,
    sender: LinkSender,
    buffer_size: usize,
) -> LoopExit {
    let mut buf = vec![0u8; buffer_size.clamp(1, gametunnel_core::MAX_PAYLOAD_LEN)];

    loop {
        let (n, peer) = match intercept.recv(&mut buf).await {
            Ok(received) => received,
            Err(e) => return LoopExit::Local(e),
        };

        let envelope = intercept.wrap(&buf[..n], peer);
        tracing::debug!("{} bytes from {} -> {}", n, peer, envelope.destination);

        if let Err(e) = sender.send_envelope(&envelope).await {
            return LoopExit::Link(e);
        }
    }
}

async fn forward_tunnel(
    mut reader: FrameReader<OwnedReadHalf>,
    intercept: Arc<LocalIntercept>,
    stats: Arc<FlowStats>,
) -> LoopExit {
    loop {
        match reader.next_frame().await {
            Ok(Some(Frame::Control(_))) => {
                stats.record_response();
                tracing::debug!("Keepalive acknowledged");
            }
            Ok(Some(Frame::Envelope(envelope))) => {
                stats.record_recv(envelope.payload.len());
                if let Err(e) = intercept.deliver(&envelope).await {
                    tracing::warn!("Failed to deliver reply: {}", e);
                }
            }
            Ok(None) => return LoopExit::Link(ClientError::LinkClosed),
            Err(e) if e.is_recoverable() => {
                tracing::warn!("Dropping malformed envelope from relay: {}", e);
            }
            Err(e) => return LoopExit::Link(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gametunnel_core::{Control, Envelope};
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, UdpSocket};

    fn fast_config() -> ClientConfig {
        ClientConfig {
            probe: ProbeConfig {
                attempts: 1,
                timeout: Duration::from_secs(1),
                pause: Duration::ZERO,
            },
            retry_attempts: 1,
            retry_delay: Duration::from_millis(10),
            ..ClientConfig::default()
        }
    }

    async fn relay_listener(name: &str) -> (TcpListener, CandidateEndpoint) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, CandidateEndpoint::new(name, "127.0.0.1", port))
    }

    #[tokio::test]
    async fn test_initialize_none_reachable() {
        let endpoint = {
            let (_listener, endpoint) = relay_listener("gone").await;
            endpoint
        };
        let mut client = TunnelClient::new(fast_config(), vec![endpoint]);

        assert!(matches!(
            client.initialize().await,
            Err(ClientError::NoneAvailable)
        ));
        assert_eq!(client.events().snapshot()[0].kind, EventKind::Unreachable);
    }

    #[tokio::test]
    async fn test_start_forwards_and_delivers() {
        let (listener, endpoint) = relay_listener("local").await;
        let mut client = TunnelClient::new(fast_config(), vec![endpoint]);
        client.initialize().await.unwrap();

        let local = client.start().await.unwrap();
        let (mut relay, _) = listener.accept().await.unwrap();
        assert!(client.is_connected());

        let app = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        app.send_to(b"ping", local).await.unwrap();

        let mut reader = FrameReader::new(&mut relay, Control::Keepalive);
        let envelope = match reader.next_frame().await.unwrap() {
            Some(Frame::Envelope(envelope)) => envelope,
            other => panic!("unexpected frame: {other:?}"),
        };
        assert_eq!(envelope.payload, b"ping");
        assert_eq!(
            envelope.destination,
            Destination::from(app.local_addr().unwrap())
        );

        let reply = Envelope::new(envelope.destination, b"pong".to_vec());
        relay.write_all(&reply.encode()).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, _) = app.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");

        client.stop().await;
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_switch_endpoint() {
        let (first_listener, first) = relay_listener("first").await;
        let (second_listener, second) = relay_listener("second").await;
        let mut client = TunnelClient::new(fast_config(), vec![first, second]);

        assert!(matches!(
            client.switch_endpoint("second").await,
            Err(ClientError::NotStarted)
        ));

        client.pin_endpoint("first").unwrap();
        client.start().await.unwrap();
        let _first_conn = first_listener.accept().await.unwrap();
        assert_eq!(client.current_endpoint().unwrap().name, "first");

        client.switch_endpoint("second").await.unwrap();
        let _second_conn = second_listener.accept().await.unwrap();
        assert_eq!(client.current_endpoint().unwrap().name, "second");

        assert!(
            client
                .events()
                .snapshot()
                .iter()
                .any(|e| e.kind == EventKind::Switched && e.subject == "second")
        );
        assert!(matches!(
            client.switch_endpoint("nowhere").await,
            Err(ClientError::UnknownEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (listener, endpoint) = relay_listener("local").await;
        let mut client = TunnelClient::new(fast_config(), vec![endpoint]);
        client.initialize().await.unwrap();
        client.start().await.unwrap();
        let _conn = listener.accept().await.unwrap();

        let exit = client.run(async {}).await.unwrap();
        assert!(matches!(exit, RunExit::Shutdown));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_run_gives_up_when_relay_disappears() {
        let (listener, endpoint) = relay_listener("local").await;
        let mut client = TunnelClient::new(fast_config(), vec![endpoint]);
        client.initialize().await.unwrap();
        client.start().await.unwrap();

        let (conn, _) = listener.accept().await.unwrap();
        drop(conn);
        drop(listener);

        let exit = client.run(std::future::pending()).await.unwrap();
        assert!(matches!(
            exit,
            RunExit::Exhausted {
                attempts: 1,
                last_error: ClientError::NoneAvailable,
            }
        ));
        assert!(!client.is_connected());
        assert!(
            client
                .events()
                .snapshot()
                .iter()
                .any(|e| e.kind == EventKind::Disconnected)
        );
    }
}
