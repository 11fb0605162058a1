//! Single-owner task for the SSH connection handle.
//!
//! Exactly one task owns the `russh` [`Handle`]; everything else talks to it
//! through a cloneable [`HandleController`] over an mpsc channel. This keeps
//! the handle out of `Arc<Mutex<_>>`, avoids holding locks across awaits and
//! serializes protocol-level operations such as keepalive requests.

use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::handler::ClientHandler;
use crate::error::{Error, Result};

/// Commands understood by the handle owner task.
pub(crate) enum HandleCommand {
    /// Open a session channel (exec / shell / subsystem).
    OpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },
    /// Open a direct-tcpip channel to `host:port`.
    OpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },
    /// Ask the peer to listen on `address:port` (reverse tunnels). Replies
    /// with the port actually bound.
    TcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<u32, russh::Error>>,
    },
    /// Cancel a previously requested remote listener.
    CancelTcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<(), russh::Error>>,
    },
    /// Send one keepalive global request with `want_reply = true`.
    Keepalive {
        reply_tx: oneshot::Sender<Result<(), Error>>,
    },
    /// Close the SSH connection. The reply fires once the transport is down.
    Disconnect { reply_tx: oneshot::Sender<()> },
}

/// Cloneable command channel to the handle owner task.
#[derive(Clone)]
pub(crate) struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
}

impl HandleController {
    pub(crate) async fn open_session(&self) -> Result<Channel<Msg>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::OpenSession { reply_tx })
            .await
            .map_err(|_| Error::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| Error::Disconnected)?
            .map_err(|e| Error::Channel(e.to_string()))
    }

    pub(crate) async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::OpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| Error::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| Error::Disconnected)?
            .map_err(|e| Error::Channel(e.to_string()))
    }

    /// Returns the remotely bound port, which may differ when 0 was asked.
    pub(crate) async fn tcpip_forward(&self, address: &str, port: u32) -> Result<u32> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::TcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| Error::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| Error::Disconnected)?
            .map_err(|e| Error::Connection(e.to_string()))
    }

    pub(crate) async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::CancelTcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| Error::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| Error::Disconnected)?
            .map_err(|e| Error::Connection(e.to_string()))
    }

    pub(crate) async fn keepalive(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::Keepalive { reply_tx })
            .await
            .map_err(|_| Error::Disconnected)?;
        reply_rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Closes the SSH connection and waits until the transport is down.
    pub(crate) async fn disconnect(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(HandleCommand::Disconnect { reply_tx })
            .await
            .is_err()
        {
            return;
        }
        let _ = reply_rx.await;
    }

    pub(crate) fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Upper bound on a single keepalive round-trip before it counts as failed.
const KEEPALIVE_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Consumes the handle and spawns its owner task, returning the controller.
pub(crate) fn spawn_handle_owner(
    handle: Handle<ClientHandler>,
    label: String,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);

    tokio::spawn(async move {
        let mut handle = handle;
        debug!(session = %label, "handle owner task started");

        let mut disconnect_reply: Option<oneshot::Sender<()>> = None;

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                HandleCommand::OpenSession { reply_tx } => {
                    let result = handle.channel_open_session().await;
                    if reply_tx.send(result).is_err() {
                        warn!(session = %label, "caller dropped before receiving session channel");
                    }
                }

                HandleCommand::OpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                } => {
                    let result = handle
                        .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                        .await;
                    if reply_tx.send(result).is_err() {
                        warn!(session = %label, "caller dropped before receiving direct-tcpip channel");
                    }
                }

                HandleCommand::TcpipForward {
                    address,
                    port,
                    reply_tx,
                } => {
                    let result = handle.tcpip_forward(&address, port).await;
                    match result {
                        Ok(bound_port) => {
                            if reply_tx.send(Ok(bound_port)).is_err() {
                                // The caller vanished after the peer bound the
                                // port; cancel so no ghost listener remains.
                                warn!(
                                    session = %label,
                                    address, bound_port,
                                    "caller dropped after tcpip-forward, cancelling"
                                );
                                let _ = handle.cancel_tcpip_forward(&address, bound_port).await;
                            }
                        }
                        Err(e) => {
                            let _ = reply_tx.send(Err(e));
                        }
                    }
                }

                HandleCommand::CancelTcpipForward {
                    address,
                    port,
                    reply_tx,
                } => {
                    let result = handle.cancel_tcpip_forward(&address, port).await;
                    let _ = reply_tx.send(result);
                }

                HandleCommand::Keepalive { reply_tx } => {
                    let result = match tokio::time::timeout(
                        KEEPALIVE_REPLY_TIMEOUT,
                        handle.send_keepalive(true),
                    )
                    .await
                    {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(Error::Protocol(e.to_string())),
                        Err(_) => Err(Error::Timeout("keepalive reply".into())),
                    };
                    let _ = reply_tx.send(result);
                }

                HandleCommand::Disconnect { reply_tx } => {
                    disconnect_reply = Some(reply_tx);
                    break;
                }
            }
        }

        drain_pending(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "session closed", "en")
            .await;
        if let Some(reply_tx) = disconnect_reply {
            let _ = reply_tx.send(());
        }
        info!(session = %label, "ssh connection closed");
    });

    HandleController { cmd_tx }
}

/// Fails every queued command once the owner task is shutting down.
fn drain_pending(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();
    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::OpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::OpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::TcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::CancelTcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Keepalive { reply_tx } => {
                let _ = reply_tx.send(Err(Error::Disconnected));
            }
            HandleCommand::Disconnect { reply_tx } => {
                let _ = reply_tx.send(());
            }
        }
    }
}
