//! Reverse tunnels: remote listener, local connect.
//!
//! A reverse tunnel asks the SSH peer to listen on `remote_host:remote_port`
//! (`tcpip-forward`). Accepted connections come back as `forwarded-tcpip`
//! channels, delivered to the client handler, which looks the binding up in
//! the supervisor's [`ReverseRegistry`] and bridges to the local port.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use parking_lot::RwLock;
use russh::client::Msg;
use russh::Channel;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::target::TunnelTarget;
use crate::bus::Subscription;
use crate::error::Result;
use crate::ssh::HandleController;

/// Remote bindings of one supervisor: `(address, port)` → local port.
#[derive(Default)]
pub(crate) struct ReverseRegistry {
    bindings: RwLock<HashMap<(String, u16), u16>>,
}

impl ReverseRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, address: &str, port: u16, local_port: u16) {
        self.bindings
            .write()
            .insert((address.to_string(), port), local_port);
    }

    pub(crate) fn unregister(&self, address: &str, port: u16) {
        self.bindings.write().remove(&(address.to_string(), port));
    }

    pub(crate) fn lookup(&self, address: &str, port: u16) -> Option<u16> {
        self.bindings
            .read()
            .get(&(address.to_string(), port))
            .copied()
    }
}

/// Requests the remote bind and keeps it alive until the stop subscription
/// fires. A peer refusing the bind is fatal to the listener.
pub(crate) async fn run_reverse_listener(
    controller: HandleController,
    registry: std::sync::Arc<ReverseRegistry>,
    mut stop: Subscription,
    target: TunnelTarget,
    ready_tx: mpsc::Sender<()>,
) -> Result<()> {
    let bound_port = controller
        .tcpip_forward(&target.remote_host, target.remote_port as u32)
        .await? as u16;

    registry.register(&target.remote_host, bound_port, target.local_port);
    debug!(tunnel = %target, bound_port, "reverse listener established");
    let _ = ready_tx.send(()).await;

    let _ = stop.recv().await;
    debug!(tunnel = %target, "stopping reverse tunnel on stop-tunnels signal");

    registry.unregister(&target.remote_host, bound_port);
    // Best effort: the connection may already be gone during teardown.
    let _ = controller
        .cancel_tcpip_forward(&target.remote_host, bound_port as u32)
        .await;
    Ok(())
}

/// Bridges one forwarded-tcpip channel to the locally registered port.
pub(crate) async fn handle_forwarded_connection(channel: Channel<Msg>, local_port: u16) {
    let mut local = match TcpStream::connect((Ipv4Addr::LOCALHOST, local_port)).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("connect to local 127.0.0.1:{local_port} failed: {e}");
            return;
        }
    };

    let mut remote = channel.into_stream();
    if let Err(e) = tokio::io::copy_bidirectional(&mut local, &mut remote).await {
        debug!("error while copying reverse tunnel data: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_round_trip() {
        let registry = ReverseRegistry::new();
        registry.register("127.0.0.1", 9000, 3000);
        assert_eq!(registry.lookup("127.0.0.1", 9000), Some(3000));
        assert_eq!(registry.lookup("127.0.0.1", 9001), None);

        registry.unregister("127.0.0.1", 9000);
        assert_eq!(registry.lookup("127.0.0.1", 9000), None);
    }
}
