//! Forward tunnels: local listener, remote connect.

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::target::TunnelTarget;
use crate::bus::Subscription;
use crate::error::{Error, Result};
use crate::ssh::HandleController;

/// Pause before retrying after a transient accept failure.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Binds `127.0.0.1:local_port` and forwards each accepted connection to
/// `remote_host:remote_port` over a direct-tcpip channel.
///
/// Sends on `ready_tx` once the listener is bound; exits cleanly when the
/// stop subscription fires, with an error on a non-transient accept failure.
pub(crate) async fn run_forward_listener(
    controller: HandleController,
    mut stop: Subscription,
    target: TunnelTarget,
    ready_tx: mpsc::Sender<()>,
) -> Result<()> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, target.local_port))
        .await
        .map_err(|e| Error::Bind(e.to_string()))?;

    debug!(tunnel = %target, "forward listener bound");
    let _ = ready_tx.send(()).await;

    loop {
        tokio::select! {
            _ = stop.recv() => {
                debug!(tunnel = %target, "stopping tunnel on stop-tunnels signal");
                return Ok(());
            }

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let controller = controller.clone();
                    let remote_host = target.remote_host.clone();
                    let remote_port = target.remote_port;
                    tokio::spawn(async move {
                        forward_connection(controller, stream, peer, &remote_host, remote_port)
                            .await;
                    });
                }
                Err(e) if is_transient(&e) => {
                    debug!(tunnel = %target, "transient accept error: {e}");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
                Err(e) => return Err(Error::Accept(e.to_string())),
            },
        }
    }
}

/// Bridges one accepted local connection to the remote endpoint.
async fn forward_connection(
    controller: HandleController,
    mut stream: TcpStream,
    peer: std::net::SocketAddr,
    remote_host: &str,
    remote_port: u16,
) {
    let channel = match controller
        .open_direct_tcpip(
            remote_host,
            remote_port as u32,
            &peer.ip().to_string(),
            peer.port() as u32,
        )
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            warn!("connect to {remote_host}:{remote_port} failed: {e}");
            return;
        }
    };

    let mut remote = channel.into_stream();
    if let Err(e) = tokio::io::copy_bidirectional(&mut stream, &mut remote).await {
        debug!("error while copying tunnel data: {e}");
    }
}

pub(crate) fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_classified() {
        assert!(is_transient(&std::io::Error::from(
            std::io::ErrorKind::ConnectionAborted
        )));
        assert!(is_transient(&std::io::Error::from(
            std::io::ErrorKind::Interrupted
        )));
        assert!(!is_transient(&std::io::Error::from(
            std::io::ErrorKind::PermissionDenied
        )));
    }
}
