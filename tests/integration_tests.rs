//! End-to-end tests: application socket, tunnel client, relay, destination

use async_trait::async_trait;
use gametunnel_client::{
    ClientConfig, ClientError, EndpointProbe, LatencyProbe, TcpConnectProbe, TunnelClient,
};
use gametunnel_core::{Destination, Envelope, EventKind, KEEPALIVE, KEEPALIVE_ACK};
use gametunnel_integration_tests::{
    client_config, delayed_echo_destination, relay_config, reply_destination, serve_replies,
    start_relay, wait_until,
};
use gametunnel_relay::RelayServerConfig;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// Send `payload` from a fresh application socket and wait for one reply
async fn round_trip(app: &UdpSocket, local: SocketAddr, payload: &[u8]) -> Vec<u8> {
    app.send_to(payload, local).await.unwrap();
    let mut buf = [0u8; 2048];
    let (n, from) = timeout(WAIT, app.recv_from(&mut buf))
        .await
        .expect("no reply through the tunnel")
        .unwrap();
    assert_eq!(from, local);
    buf[..n].to_vec()
}

/// TCP connect probe that reports selected ports as unreachable
#[derive(Default)]
struct GatedProbe {
    down: Mutex<HashSet<u16>>,
}

impl GatedProbe {
    fn set_down(&self, port: u16, down: bool) {
        let mut ports = self.down.lock().unwrap();
        if down {
            ports.insert(port);
        } else {
            ports.remove(&port);
        }
    }
}

#[async_trait]
impl LatencyProbe for GatedProbe {
    async fn attempt(&self, host: &str, port: u16, timeout: Duration) -> Option<Duration> {
        if self.down.lock().unwrap().contains(&port) {
            return None;
        }
        TcpConnectProbe.attempt(host, port, timeout).await
    }
}

#[tokio::test]
async fn test_datagram_round_trip_through_relay() {
    let destination = reply_destination(b"pong").await;
    let relay = start_relay(relay_config()).await;

    let config = ClientConfig {
        destination: Some(destination),
        ..client_config()
    };
    let mut client = TunnelClient::new(config, vec![relay.endpoint("local")]);
    let chosen = client.initialize().await.unwrap();
    assert_eq!(chosen.name, "local");
    let local = client.start().await.unwrap();

    let app = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    assert_eq!(round_trip(&app, local, b"ping").await, b"pong");
    assert_eq!(round_trip(&app, local, b"ping again").await, b"pong");

    let stats = client.stats().unwrap();
    assert_eq!(stats.packets_sent, 2);
    assert_eq!(stats.packets_received, 2);
    assert!(stats.connected_at_ms.is_some());

    let relay_stats = relay.server.stats();
    assert_eq!(relay_stats.packets_forwarded, 2);
    assert_eq!(relay_stats.replies_returned, 2);
    assert_eq!(relay_stats.cached_destinations, 1);

    client.stop().await;
    relay.stop().await;
}

#[tokio::test]
async fn test_replies_reach_the_sending_application() {
    let destination = reply_destination(b"pong").await;
    let relay = start_relay(relay_config()).await;

    let config = ClientConfig {
        destination: Some(destination),
        ..client_config()
    };
    let mut client = TunnelClient::new(config, vec![relay.endpoint("local")]);
    client.initialize().await.unwrap();
    let local = client.start().await.unwrap();

    let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    assert_eq!(round_trip(&first, local, b"one").await, b"pong");
    assert_eq!(round_trip(&second, local, b"two").await, b"pong");

    client.stop().await;
    relay.stop().await;
}

#[tokio::test]
async fn test_overlapping_flows_keep_their_return_routes() {
    let destination = delayed_echo_destination(Duration::from_millis(300)).await;
    let relay = start_relay(relay_config()).await;

    let config = ClientConfig {
        destination: Some(destination),
        ..client_config()
    };
    let mut client = TunnelClient::new(config, vec![relay.endpoint("local")]);
    client.initialize().await.unwrap();
    let local = client.start().await.unwrap();

    let first = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let second = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let third = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

    first.send_to(b"one", local).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    second.send_to(b"two", local).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    third.send_to(b"three", local).await.unwrap();
    first.send_to(b"four", local).await.unwrap();

    async fn collect(app: Arc<UdpSocket>, count: usize) -> Vec<Vec<u8>> {
        let mut buf = [0u8; 64];
        let mut replies = Vec::new();
        for _ in 0..count {
            let (n, _) = timeout(WAIT, app.recv_from(&mut buf))
                .await
                .expect("reply went to another application")
                .unwrap();
            replies.push(buf[..n].to_vec());
        }
        replies
    }

    let (first_replies, second_replies, third_replies) = tokio::join!(
        collect(Arc::clone(&first), 2),
        collect(Arc::clone(&second), 1),
        collect(Arc::clone(&third), 1),
    );
    assert_eq!(first_replies, vec![b"one".to_vec(), b"four".to_vec()]);
    assert_eq!(second_replies, vec![b"two".to_vec()]);
    assert_eq!(third_replies, vec![b"three".to_vec()]);

    client.stop().await;
    relay.stop().await;
}

#[tokio::test]
async fn test_unconfigured_destination_routes_by_sender_address() {
    // Without a configured destination the wire address is the sender's
    // own address, so put a TCP responder on the application's port.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    serve_replies(listener, b"echoed");
    let app = UdpSocket::bind(("127.0.0.1", port)).await.unwrap();

    let relay = start_relay(relay_config()).await;
    let mut client = TunnelClient::new(client_config(), vec![relay.endpoint("local")]);
    client.initialize().await.unwrap();
    let local = client.start().await.unwrap();

    assert_eq!(round_trip(&app, local, b"hello").await, b"echoed");

    client.stop().await;
    relay.stop().await;
}

#[tokio::test]
async fn test_unreachable_destination_is_dropped_silently() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let destination = Destination::from(closed.local_addr().unwrap());
    drop(closed);

    let relay = start_relay(relay_config()).await;
    let config = ClientConfig {
        destination: Some(destination),
        ..client_config()
    };
    let mut client = TunnelClient::new(config, vec![relay.endpoint("local")]);
    client.initialize().await.unwrap();
    let local = client.start().await.unwrap();

    let app = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    app.send_to(b"lost", local).await.unwrap();

    let server = Arc::clone(&relay.server);
    assert!(wait_until(WAIT, || async { server.stats().packets_dropped == 1 }).await);

    let mut buf = [0u8; 64];
    let reply = timeout(Duration::from_millis(200), app.recv_from(&mut buf)).await;
    assert!(reply.is_err());
    assert!(client.is_connected());
    assert!(wait_until(WAIT, || async { server.session_count() == 1 }).await);

    client.stop().await;
    relay.stop().await;
}

#[tokio::test]
async fn test_session_ceiling_rejects_extra_clients() {
    let relay = start_relay(RelayServerConfig {
        max_sessions: 1,
        ..relay_config()
    })
    .await;
    let addr = relay.server.local_addr();

    let mut first = TcpStream::connect(addr).await.unwrap();
    let server = Arc::clone(&relay.server);
    assert!(wait_until(WAIT, || async { server.session_count() == 1 }).await);

    let mut second = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 16];
    let read = timeout(WAIT, second.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    assert_eq!(relay.server.session_count(), 1);
    assert_eq!(relay.server.stats().rejected_sessions, 1);
    assert!(
        relay
            .server
            .events()
            .snapshot()
            .iter()
            .any(|e| e.kind == EventKind::Rejected)
    );

    // The admitted session still works
    first.write_all(KEEPALIVE).await.unwrap();
    let mut ack = vec![0u8; KEEPALIVE_ACK.len()];
    timeout(WAIT, first.read_exact(&mut ack)).await.unwrap().unwrap();
    assert_eq!(ack, KEEPALIVE_ACK);

    relay.stop().await;
}

#[tokio::test]
async fn test_raw_envelope_exchange() {
    let destination = reply_destination(b"world").await;
    let relay = start_relay(relay_config()).await;

    let mut stream = TcpStream::connect(relay.server.local_addr()).await.unwrap();
    let request = Envelope::new(destination.clone(), b"hello".to_vec());
    stream.write_all(&request.encode()).await.unwrap();

    let expected = Envelope::new(destination, b"world".to_vec()).encode();
    let mut reply = vec![0u8; expected.len()];
    timeout(WAIT, stream.read_exact(&mut reply)).await.unwrap().unwrap();
    assert_eq!(reply, expected);

    relay.stop().await;
}

#[tokio::test]
async fn test_keepalive_measures_the_link() {
    let relay = start_relay(relay_config()).await;
    let config = ClientConfig {
        keepalive_interval: Duration::from_millis(100),
        ..client_config()
    };
    let mut client = TunnelClient::new(config, vec![relay.endpoint("local")]);
    client.initialize().await.unwrap();
    client.start().await.unwrap();

    let measured = wait_until(WAIT, || {
        let stats = client.stats();
        async move {
            stats.is_some_and(|s| s.avg_latency_ms > 0.0 && s.packet_loss < 1.0)
        }
    })
    .await;
    assert!(measured);

    client.stop().await;
    relay.stop().await;
}

#[tokio::test]
async fn test_switch_endpoint_moves_the_session() {
    let destination = reply_destination(b"pong").await;
    let relay_a = start_relay(relay_config()).await;
    let relay_b = start_relay(relay_config()).await;

    let config = ClientConfig {
        destination: Some(destination),
        ..client_config()
    };
    let mut client = TunnelClient::new(
        config,
        vec![relay_a.endpoint("relay-a"), relay_b.endpoint("relay-b")],
    );
    client.pin_endpoint("relay-a").unwrap();
    client.initialize().await.unwrap();
    let local = client.start().await.unwrap();
    assert_eq!(client.current_endpoint().unwrap().name, "relay-a");

    let app = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    assert_eq!(round_trip(&app, local, b"ping").await, b"pong");

    client.switch_endpoint("relay-b").await.unwrap();
    assert_eq!(client.current_endpoint().unwrap().name, "relay-b");
    assert_eq!(client.local_addr(), Some(local));

    assert_eq!(round_trip(&app, local, b"ping").await, b"pong");
    assert_eq!(relay_b.server.stats().packets_forwarded, 1);

    let server_a = Arc::clone(&relay_a.server);
    assert!(wait_until(WAIT, || async { server_a.session_count() == 0 }).await);
    assert!(
        client
            .events()
            .snapshot()
            .iter()
            .any(|e| e.kind == EventKind::Switched && e.subject == "relay-b")
    );

    client.stop().await;
    relay_a.stop().await;
    relay_b.stop().await;
}

#[tokio::test]
async fn test_switch_before_start_is_rejected() {
    let relay = start_relay(relay_config()).await;
    let mut client = TunnelClient::new(client_config(), vec![relay.endpoint("local")]);

    let result = client.switch_endpoint("local").await;
    assert!(matches!(result, Err(ClientError::NotStarted)));

    let result = client.switch_endpoint("missing").await;
    assert!(matches!(result, Err(ClientError::UnknownEndpoint(_))));

    relay.stop().await;
}

#[tokio::test]
async fn test_reconnects_to_fallback_after_relay_loss() {
    let destination = reply_destination(b"pong").await;
    let relay_a = start_relay(relay_config()).await;
    let relay_b = start_relay(relay_config()).await;
    let port_a = relay_a.server.local_addr().port();
    let port_b = relay_b.server.local_addr().port();

    let gate = Arc::new(GatedProbe::default());
    gate.set_down(port_b, true);
    let probe = EndpointProbe::with_probe(gate.clone(), client_config().probe);

    let config = ClientConfig {
        destination: Some(destination),
        ..client_config()
    };
    let mut client = TunnelClient::new(
        config,
        vec![relay_a.endpoint("relay-a"), relay_b.endpoint("relay-b")],
    )
    .with_probe(probe);
    assert_eq!(client.initialize().await.unwrap().name, "relay-a");
    let local = client.start().await.unwrap();
    let events = client.events();

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let runner = tokio::spawn(async move {
        let result = client
            .run(async {
                let _ = stop_rx.await;
            })
            .await;
        (client, result)
    });

    gate.set_down(port_b, false);
    gate.set_down(port_a, true);
    relay_a.stop().await;

    let server_b = Arc::clone(&relay_b.server);
    assert!(wait_until(WAIT, || async { server_b.session_count() >= 1 }).await);

    let app = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    assert_eq!(round_trip(&app, local, b"ping").await, b"pong");

    stop_tx.send(()).unwrap();
    let (client, result) = timeout(WAIT, runner).await.unwrap().unwrap();
    result.unwrap();
    assert!(!client.is_connected());

    let kinds: Vec<EventKind> = events.snapshot().iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&EventKind::Disconnected));
    assert!(kinds.contains(&EventKind::Unreachable));

    relay_b.stop().await;
}
