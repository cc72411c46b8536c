//! End-to-end tests for port-relay
//!
//! Exercises the full data path over loopback sockets:
//! - TCP round-trip, byte accounting, and half-close propagation
//! - UDP session lifecycle and idle reaping
//! - Manager lifecycle invariants (start conflict, atomic both-protocol start)
//! - Telemetry sampling and slow-subscriber eviction
//!
//! # Usage
//!
//! ```bash
//! cargo test --test relay_e2e -- --nocapture
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::{sleep, timeout};

use port_relay::config::{Protocol, RelayRule};
use port_relay::error::StartError;
use port_relay::geo::NoGeo;
use port_relay::hub::{Broadcaster, TelemetryHub, TOPIC_CONNECTIONS, TOPIC_TRAFFIC};
use port_relay::relay::{ForwardTimeouts, RelayManager};
use port_relay::store::{AccessAction, MemoryStore};

// ============================================================================
// Helpers
// ============================================================================

/// Reserve a loopback port that is currently free for TCP
fn free_tcp_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Reserve a loopback port that is currently free for both TCP and UDP
fn free_port_both() -> u16 {
    for _ in 0..32 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        if std::net::UdpSocket::bind(("127.0.0.1", port)).is_ok() {
            return port;
        }
    }
    panic!("no port free on both protocols");
}

/// TCP echo server: copies input back and mirrors EOF on write-close
async fn spawn_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
                let _ = write.shutdown().await;
            });
        }
    });
    addr
}

/// TCP target that waits for client EOF, then replies "WORLD" and closes
async fn spawn_tcp_world() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut received = Vec::new();
                let _ = stream.read_to_end(&mut received).await;
                assert_eq!(received, b"HELLO");
                let _ = stream.write_all(b"WORLD").await;
                let _ = stream.shutdown().await;
            });
        }
    });
    addr
}

/// UDP target that answers the first datagram of each sender with "x"
async fn spawn_udp_once_responder() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut seen: Vec<SocketAddr> = Vec::new();
        let mut buf = [0u8; 2048];
        while let Ok((_, from)) = socket.recv_from(&mut buf).await {
            if !seen.contains(&from) {
                seen.push(from);
                let _ = socket.send_to(b"x", from).await;
            }
        }
    });
    addr
}

/// Connect with retries while the relay's accept loop spins up
async fn connect_retry(addr: &str) -> TcpStream {
    for _ in 0..40 {
        if let Ok(stream) = TcpStream::connect(addr).await {
            return stream;
        }
        sleep(Duration::from_millis(25)).await;
    }
    panic!("could not connect to {addr}");
}

/// Poll until `check` passes or the deadline lapses
async fn wait_for<F: FnMut() -> bool>(mut check: F, what: &str) {
    for _ in 0..100 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

fn test_rule(id: &str, src_port: u16, dst: SocketAddr, protocol: Protocol) -> RelayRule {
    RelayRule {
        id: id.into(),
        name: id.into(),
        src: format!("127.0.0.1:{src_port}"),
        dst: dst.to_string(),
        protocol,
        enabled: true,
    }
}

fn test_manager(store: Arc<MemoryStore>) -> RelayManager {
    RelayManager::new(store, Arc::new(NoGeo), Arc::new(TelemetryHub::new()))
}

/// Short timeouts so UDP reaping scenarios finish quickly
fn fast_timeouts() -> ForwardTimeouts {
    ForwardTimeouts {
        dial: Duration::from_secs(5),
        udp_target_read: Duration::from_secs(1),
        udp_listen_read: Duration::from_millis(100),
    }
}

// ============================================================================
// TCP data path
// ============================================================================

#[tokio::test]
async fn tcp_echo_round_trip() {
    let echo = spawn_tcp_echo().await;
    let store = Arc::new(MemoryStore::new());
    let manager = test_manager(store.clone());

    let rule = test_rule("s1", free_tcp_port(), echo, Protocol::Tcp);
    manager.start(&rule).await.unwrap();

    let mut client = connect_retry(&rule.src).await;
    client.write_all(b"ABCDE").await.unwrap();

    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"ABCDE");

    client.shutdown().await.unwrap();
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
    drop(client);

    wait_for(|| !manager.history(&rule.id).is_empty(), "flow in history").await;

    let history = manager.history(&rule.id);
    assert_eq!(history.len(), 1);
    let flow = &history[0];
    assert_eq!(flow.bytes_in, 5);
    assert_eq!(flow.bytes_out, 5);
    assert!(!flow.active);
    assert_eq!(flow.protocol.as_str(), "tcp");
    assert!(flow.ended_at.is_some());
    assert_eq!(flow.client_ip, "127.0.0.1");

    // Rule totals match the flow
    let status = manager.status(&rule.id);
    assert!(status.running);
    assert_eq!(status.connections, 0);
    assert_eq!(status.bytes_in, 5);
    assert_eq!(status.bytes_out, 5);

    // Connect and disconnect were persisted, plus one stat record
    let logs = store.access_logs();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].action, AccessAction::Connect);
    assert_eq!(logs[1].action, AccessAction::Disconnect);
    assert_eq!(logs[1].bytes_in, 5);
    assert_eq!(logs[1].bytes_out, 5);

    let stats = store.stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].connections, 1);

    manager.stop(&rule.id);
}

#[tokio::test]
async fn tcp_half_close_propagates() {
    let target = spawn_tcp_world().await;
    let store = Arc::new(MemoryStore::new());
    let manager = test_manager(store);

    let rule = test_rule("s2", free_tcp_port(), target, Protocol::Tcp);
    manager.start(&rule).await.unwrap();

    let mut client = connect_retry(&rule.src).await;
    client.write_all(b"HELLO").await.unwrap();
    // Close only the write side; the reply must still come through
    client.shutdown().await.unwrap();

    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"WORLD");

    wait_for(|| !manager.history(&rule.id).is_empty(), "flow in history").await;
    let flow = &manager.history(&rule.id)[0];
    assert_eq!(flow.bytes_in, 5);
    assert_eq!(flow.bytes_out, 5);

    manager.stop(&rule.id);
}

#[tokio::test]
async fn tcp_dial_failure_leaves_no_trace() {
    // A port with nothing listening
    let dead = free_tcp_port();
    let store = Arc::new(MemoryStore::new());
    let manager = test_manager(store.clone());

    let rule = test_rule(
        "dial-fail",
        free_tcp_port(),
        format!("127.0.0.1:{dead}").parse().unwrap(),
        Protocol::Tcp,
    );
    manager.start(&rule).await.unwrap();

    let mut client = connect_retry(&rule.src).await;
    // The relay closes our connection once its dial fails
    let mut buf = Vec::new();
    let _ = timeout(Duration::from_secs(5), client.read_to_end(&mut buf)).await;

    sleep(Duration::from_millis(100)).await;
    assert!(manager.history(&rule.id).is_empty());
    assert_eq!(manager.status(&rule.id).connections, 0);
    assert!(store.access_logs().is_empty());

    manager.stop(&rule.id);
}

#[tokio::test]
async fn tcp_listener_survives_flow_errors() {
    let echo = spawn_tcp_echo().await;
    let manager = test_manager(Arc::new(MemoryStore::new()));

    let rule = test_rule("survive", free_tcp_port(), echo, Protocol::Tcp);
    manager.start(&rule).await.unwrap();

    // First connection aborts abruptly
    let client = connect_retry(&rule.src).await;
    drop(client);

    // A later connection still works
    let mut client = connect_retry(&rule.src).await;
    client.write_all(b"ok").await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"ok");

    manager.stop(&rule.id);
}

// ============================================================================
// UDP data path
// ============================================================================

#[tokio::test]
async fn udp_session_lifecycle() {
    let target = spawn_udp_once_responder().await;
    let store = Arc::new(MemoryStore::new());
    let manager = RelayManager::with_timeouts(
        store.clone(),
        Arc::new(NoGeo),
        Arc::new(TelemetryHub::new()),
        fast_timeouts(),
    );

    let port = free_port_both();
    let rule = test_rule("s3", port, target, Protocol::Udp);
    manager.start(&rule).await.unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(&rule.src).await.unwrap();
    client.send(b"a").await.unwrap();
    client.send(b"b").await.unwrap();

    // The target's single reply reaches the client through the relay
    let mut buf = [0u8; 16];
    let len = timeout(Duration::from_secs(5), client.recv(&mut buf))
        .await
        .expect("reply before deadline")
        .unwrap();
    assert_eq!(&buf[..len], b"x");

    // One active flow with both datagrams accounted
    wait_for(
        || {
            manager
                .connections(&rule.id)
                .first()
                .is_some_and(|f| f.bytes_in == 2 && f.bytes_out == 1)
        },
        "active UDP flow with accounted bytes",
    )
    .await;

    // Target falls silent: the session is reaped after the read deadline
    wait_for(|| !manager.history(&rule.id).is_empty(), "reaped session").await;

    let flow = &manager.history(&rule.id)[0];
    assert!(!flow.active);
    assert_eq!(flow.bytes_in, 2);
    assert_eq!(flow.bytes_out, 1);
    assert_eq!(flow.protocol.as_str(), "udp");
    assert!(manager.connections(&rule.id).is_empty());

    let logs = store.access_logs();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[1].action, AccessAction::Disconnect);

    manager.stop(&rule.id);
}

#[tokio::test]
async fn udp_sessions_are_per_client() {
    let target = spawn_udp_once_responder().await;
    let manager = RelayManager::with_timeouts(
        Arc::new(MemoryStore::new()),
        Arc::new(NoGeo),
        Arc::new(TelemetryHub::new()),
        fast_timeouts(),
    );

    let rule = test_rule("multi", free_port_both(), target, Protocol::Udp);
    manager.start(&rule).await.unwrap();

    let client_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client_a.send_to(b"aa", &rule.src).await.unwrap();
    client_b.send_to(b"b", &rule.src).await.unwrap();

    wait_for(
        || manager.connections(&rule.id).len() == 2,
        "two UDP sessions",
    )
    .await;

    let total_in: u64 = manager
        .connections(&rule.id)
        .iter()
        .map(|f| f.bytes_in)
        .sum();
    assert_eq!(total_in, 3);

    manager.stop(&rule.id);
}

// ============================================================================
// Manager lifecycle
// ============================================================================

#[tokio::test]
async fn start_conflict_rejected() {
    let echo = spawn_tcp_echo().await;
    let manager = test_manager(Arc::new(MemoryStore::new()));

    let rule = test_rule("s4", free_tcp_port(), echo, Protocol::Tcp);
    manager.start(&rule).await.unwrap();

    let err = manager.start(&rule).await.unwrap_err();
    assert!(matches!(err, StartError::AlreadyRunning { .. }));

    // The first instance still forwards
    let mut client = connect_retry(&rule.src).await;
    client.write_all(b"hi").await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"hi");

    manager.stop(&rule.id);
}

#[tokio::test]
async fn both_protocol_start_is_atomic() {
    let manager = test_manager(Arc::new(MemoryStore::new()));

    // Pre-bind the UDP side of the port so the second half of the start fails
    let port = free_port_both();
    let _udp_guard = UdpSocket::bind(("127.0.0.1", port)).await.unwrap();

    let rule = test_rule(
        "s5",
        port,
        "127.0.0.1:1".parse().unwrap(),
        Protocol::Both,
    );
    let err = manager.start(&rule).await.unwrap_err();
    assert!(matches!(err, StartError::Bind { proto: "udp", .. }));
    assert!(!manager.is_running(&rule.id));

    // The TCP listener bound during the failed start must be gone
    wait_for(
        || std::net::TcpStream::connect(("127.0.0.1", port)).is_err(),
        "tcp listener released",
    )
    .await;
}

#[tokio::test]
async fn stop_releases_listener_and_allows_rebind() {
    let echo = spawn_tcp_echo().await;
    let manager = test_manager(Arc::new(MemoryStore::new()));

    let rule = test_rule("rebind", free_tcp_port(), echo, Protocol::Tcp);
    manager.start(&rule).await.unwrap();
    let _ = connect_retry(&rule.src).await;

    manager.stop(&rule.id);

    // Once the accept task observes the signal the port can be bound again
    wait_for(
        || std::net::TcpListener::bind(&rule.src).is_ok(),
        "listener released after stop",
    )
    .await;

    manager.start(&rule).await.unwrap();
    assert!(manager.is_running(&rule.id));
    manager.stop(&rule.id);
}

#[tokio::test]
async fn stop_cancels_inflight_flows() {
    let echo = spawn_tcp_echo().await;
    let manager = test_manager(Arc::new(MemoryStore::new()));

    let rule = test_rule("cancel", free_tcp_port(), echo, Protocol::Tcp);
    manager.start(&rule).await.unwrap();

    let mut client = connect_retry(&rule.src).await;
    client.write_all(b"held").await.unwrap();
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).await.unwrap();

    manager.stop(&rule.id);

    // The relay-side sockets close; the client observes end-of-stream or reset
    let mut rest = Vec::new();
    let read = timeout(Duration::from_secs(5), client.read_to_end(&mut rest)).await;
    assert!(read.is_ok(), "client was not released by stop");
}

// ============================================================================
// Telemetry
// ============================================================================

#[tokio::test]
async fn sampler_publishes_traffic_and_connections() {
    let echo = spawn_tcp_echo().await;
    let hub = Arc::new(TelemetryHub::new());
    let manager = RelayManager::new(Arc::new(MemoryStore::new()), Arc::new(NoGeo), hub.clone());

    let mut sub = hub.attach();
    let rule = test_rule("sampled", free_tcp_port(), echo, Protocol::Tcp);
    sub.subscribe([TOPIC_TRAFFIC, TOPIC_CONNECTIONS], rule.id.clone());

    manager.start(&rule).await.unwrap();

    let mut client = connect_retry(&rule.src).await;
    client.write_all(b"ABCDE").await.unwrap();
    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).await.unwrap();
    client.shutdown().await.unwrap();
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();

    // Within a few ticks both topics carry the finished flow
    let mut saw_traffic = false;
    let mut saw_history = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while (!saw_traffic || !saw_history) && tokio::time::Instant::now() < deadline {
        let Ok(Some(event)) = timeout(Duration::from_secs(2), sub.recv()).await else {
            break;
        };
        assert_eq!(event.relay_id, rule.id);
        match event.topic.as_str() {
            TOPIC_TRAFFIC => {
                if event.payload["bytes_in"] == 5 && event.payload["bytes_out"] == 5 {
                    saw_traffic = true;
                }
            }
            TOPIC_CONNECTIONS => {
                let connections = event.payload["connections"].as_array().unwrap();
                if connections
                    .iter()
                    .any(|c| c["active"] == false && c["bytes_in"] == 5)
                {
                    saw_history = true;
                }
            }
            other => panic!("unexpected topic {other}"),
        }
    }
    assert!(saw_traffic, "no traffic sample with final totals");
    assert!(saw_history, "no connections sample with the finished flow");

    manager.stop(&rule.id);
}

#[tokio::test]
async fn slow_subscriber_evicted_healthy_unaffected() {
    let hub = TelemetryHub::new();

    let mut slow = hub.attach();
    slow.subscribe([TOPIC_TRAFFIC], "");
    let mut healthy = hub.attach();
    healthy.subscribe([TOPIC_TRAFFIC], "");

    // 258 samples: the slow inbox (256) fills, and the publish after that
    // evicts it. The healthy subscriber drains in step and sees every
    // sample in order.
    for seq in 0..258u64 {
        hub.broadcast_to_relay("r1", TOPIC_TRAFFIC, json!({ "seq": seq }));
        let event = healthy.recv().await.unwrap();
        assert_eq!(event.payload["seq"], seq);
    }

    assert_eq!(hub.subscriber_count(), 1);
    assert_eq!(hub.evicted_count(), 1);

    // The evicted subscriber drains its backlog, then hits end-of-stream
    let mut drained = 0u64;
    while slow.recv().await.is_some() {
        drained += 1;
    }
    assert_eq!(drained, 256);
}
