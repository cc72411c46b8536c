//! TCP forwarding
//!
//! One accept loop per rule; two copier tasks per accepted connection. Each
//! copier half-closes its destination when its source reaches end-of-stream,
//! so EOF propagates in one direction while the other drains.

use std::sync::Arc;

use tokio::io::{copy, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::accounting::{CountingWriter, Direction};
use super::flow::FlowProtocol;
use super::instance::RelayInstance;
use crate::error::ForwardError;

/// Run the accept loop for a bound listener
///
/// Exits when the instance signals stop; the listener closes when the task
/// returns. Transient accept errors (fd exhaustion, aborted handshakes) do
/// not terminate the loop.
pub(crate) fn spawn_tcp_listener(
    instance: Arc<RelayInstance>,
    listener: TcpListener,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown = instance.subscribe_shutdown();
        info!(
            rule = %instance.rule().id,
            src = %instance.rule().src,
            "TCP listener started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((client, peer)) => {
                        let instance = Arc::clone(&instance);
                        tokio::spawn(async move {
                            handle_connection(instance, client, peer.ip().to_string()).await;
                        });
                    }
                    Err(e) => {
                        if instance.is_stopping() {
                            break;
                        }
                        debug!(rule = %instance.rule().id, "Accept error: {}", e);
                    }
                },
            }
        }

        info!(rule = %instance.rule().id, "TCP listener stopped");
    })
}

/// Proxy one accepted connection
async fn handle_connection(instance: Arc<RelayInstance>, client: TcpStream, client_ip: String) {
    let target = match dial_target(&instance).await {
        Ok(stream) => stream,
        Err(e) => {
            // No flow is recorded: the connection never carried bytes
            warn!(
                rule = %instance.rule().id,
                client = %client_ip,
                "Dial failed: {}", e
            );
            return;
        }
    };

    let flow = instance.open_flow(&client_ip, FlowProtocol::Tcp);
    instance.persist_connect(&client_ip).await;

    let (client_read, client_write) = client.into_split();
    let (target_read, target_write) = target.into_split();

    let inbound = copy_half(
        client_read,
        CountingWriter::new(target_write, Arc::clone(&flow), Direction::Inbound),
    );
    let outbound = copy_half(
        target_read,
        CountingWriter::new(client_write, Arc::clone(&flow), Direction::Outbound),
    );

    let mut shutdown = instance.subscribe_shutdown();
    tokio::select! {
        _ = shutdown.recv() => {
            // Dropping the copiers closes both sockets mid-transfer
            debug!(rule = %instance.rule().id, flow = %flow.id(), "Copy cancelled by stop");
        }
        (res_in, res_out) = async { tokio::join!(inbound, outbound) } => {
            if let Err(e) = res_in {
                debug!(flow = %flow.id(), "Inbound copy ended: {}", e);
            }
            if let Err(e) = res_out {
                debug!(flow = %flow.id(), "Outbound copy ended: {}", e);
            }
        }
    }

    instance.finalize_flow(&flow).await;
}

/// Dial the rule's target with the configured connect timeout
async fn dial_target(instance: &RelayInstance) -> Result<TcpStream, ForwardError> {
    let dst = &instance.rule().dst;
    let dial = instance.timeouts().dial;
    match timeout(dial, TcpStream::connect(dst)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ForwardError::dial(dst, e)),
        Err(_) => Err(ForwardError::dial_timeout(dst, dial.as_secs())),
    }
}

/// Copy one direction, then half-close the destination's write side
///
/// The shutdown travels through the counting wrapper to the underlying
/// stream half, sending FIN without touching the opposite direction.
async fn copy_half<R, W>(mut src: R, mut dst: CountingWriter<W>) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = copy(&mut src, &mut dst).await;
    let _ = dst.shutdown().await;
    result
}
