//! UDP forwarding
//!
//! UDP has no connections; the forwarder synthesizes per-client sessions.
//! Each session holds a dialed socket to the target and a response-reader
//! task whose read deadline bounds the session's life: 30 seconds of
//! target-side silence reaps it. Datagrams arriving while a session's dial
//! is still in progress may be dropped; there is no pending queue.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info};

use super::flow::{Flow, FlowProtocol};
use super::instance::RelayInstance;

/// Maximum UDP datagram size
const MAX_DATAGRAM: usize = 65535;

/// One client's synthesized session
struct UdpSession {
    client_addr: SocketAddr,
    target: UdpSocket,
    flow: Arc<Flow>,
    last_seen: Mutex<Instant>,
}

type SessionMap = Arc<Mutex<HashMap<String, Arc<UdpSession>>>>;

/// Run the receive loop for a bound datagram socket
///
/// The read carries a short deadline so the loop observes the stop signal
/// even when no traffic arrives. On stop, every session's response reader
/// drains and finalizes its flow.
pub(crate) fn spawn_udp_listener(
    instance: Arc<RelayInstance>,
    socket: Arc<UdpSocket>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown = instance.subscribe_shutdown();
        let sessions: SessionMap = Arc::new(Mutex::new(HashMap::new()));
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let read_deadline = instance.timeouts().udp_listen_read;

        info!(
            rule = %instance.rule().id,
            src = %instance.rule().src,
            "UDP listener started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                received = timeout(read_deadline, socket.recv_from(&mut buf)) => {
                    let (len, client_addr) = match received {
                        Ok(Ok(pair)) => pair,
                        Ok(Err(e)) => {
                            if instance.is_stopping() {
                                break;
                            }
                            debug!(rule = %instance.rule().id, "UDP read error: {}", e);
                            continue;
                        }
                        // Deadline lapsed with no traffic; re-check the stop signal
                        Err(_) => continue,
                    };

                    handle_datagram(
                        &instance,
                        &socket,
                        &sessions,
                        client_addr,
                        &buf[..len],
                    )
                    .await;
                }
            }
        }

        info!(rule = %instance.rule().id, "UDP listener stopped");
    })
}

/// Route one datagram into its session, creating the session on first sight
async fn handle_datagram(
    instance: &Arc<RelayInstance>,
    listen: &Arc<UdpSocket>,
    sessions: &SessionMap,
    client_addr: SocketAddr,
    payload: &[u8],
) {
    let key = client_addr.to_string();

    let session = {
        let existing = sessions.lock().get(&key).cloned();
        match existing {
            Some(session) => session,
            None => {
                match open_session(instance, listen, sessions, client_addr).await {
                    Some(session) => session,
                    // Dial failed; this datagram is dropped
                    None => return,
                }
            }
        }
    };

    match session.target.send(payload).await {
        Ok(sent) => {
            session.flow.record_in(sent as u64);
            *session.last_seen.lock() = Instant::now();
        }
        Err(e) => debug!(
            rule = %instance.rule().id,
            flow = %session.flow.id(),
            "UDP forward error: {}", e
        ),
    }
}

/// Dial the target, register the flow, and spawn the response reader
///
/// The dial happens outside the session-map lock; the single receive loop is
/// the only creator, so no duplicate session can be inserted meanwhile.
async fn open_session(
    instance: &Arc<RelayInstance>,
    listen: &Arc<UdpSocket>,
    sessions: &SessionMap,
    client_addr: SocketAddr,
) -> Option<Arc<UdpSession>> {
    let target = match dial_udp_target(&instance.rule().dst).await {
        Ok(socket) => socket,
        Err(e) => {
            debug!(
                rule = %instance.rule().id,
                client = %client_addr,
                "UDP dial failed: {}", e
            );
            return None;
        }
    };

    let client_ip = client_addr.ip().to_string();
    let flow = instance.open_flow(&client_ip, FlowProtocol::Udp);
    instance.persist_connect(&client_ip).await;

    let session = Arc::new(UdpSession {
        client_addr,
        target,
        flow,
        last_seen: Mutex::new(Instant::now()),
    });
    sessions
        .lock()
        .insert(client_addr.to_string(), Arc::clone(&session));

    tokio::spawn(run_response_reader(
        Arc::clone(instance),
        Arc::clone(listen),
        Arc::clone(sessions),
        Arc::clone(&session),
    ));

    Some(session)
}

/// Dial a fresh datagram socket connected to the target
async fn dial_udp_target(dst: &str) -> io::Result<UdpSocket> {
    let target = tokio::net::lookup_host(dst)
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "target did not resolve"))?;

    let bind_addr: SocketAddr = if target.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(target).await?;
    Ok(socket)
}

/// Per-session reader: target responses back to the client
///
/// The read deadline is the session liveness bound. On timeout, read error,
/// or stop signal the session is removed and its flow finalized.
async fn run_response_reader(
    instance: Arc<RelayInstance>,
    listen: Arc<UdpSocket>,
    sessions: SessionMap,
    session: Arc<UdpSession>,
) {
    let mut shutdown = instance.subscribe_shutdown();
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let deadline = instance.timeouts().udp_target_read;

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            received = timeout(deadline, session.target.recv(&mut buf)) => {
                match received {
                    Ok(Ok(len)) => {
                        match listen.send_to(&buf[..len], session.client_addr).await {
                            Ok(sent) => session.flow.record_out(sent as u64),
                            Err(e) => {
                                debug!(flow = %session.flow.id(), "UDP reply error: {}", e);
                                break;
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        debug!(flow = %session.flow.id(), "UDP target read error: {}", e);
                        break;
                    }
                    // Idle session: no target traffic within the deadline
                    Err(_) => break,
                }
            }
        }
    }

    sessions.lock().remove(&session.client_addr.to_string());
    debug!(
        flow = %session.flow.id(),
        idle_secs = session.last_seen.lock().elapsed().as_secs(),
        "UDP session reaped"
    );
    instance.finalize_flow(&session.flow).await;
}
