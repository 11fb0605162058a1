//! russh client handler.
//!
//! Verifies the server's host key against the endpoint's pinned fingerprint
//! and dispatches `forwarded-tcpip` channels (reverse tunnels) to the
//! supervisor's reverse registry.

use std::sync::Arc;

use russh::client::{self, Msg};
use russh::keys::PublicKey;
use russh::Channel;
use tracing::warn;

use super::fingerprint;
use crate::error::Error;
use crate::tunnel::remote::{handle_forwarded_connection, ReverseRegistry};

pub(crate) struct ClientHandler {
    expected_fingerprint: Option<String>,
    accept_unknown_host_key: bool,
    reverse: Arc<ReverseRegistry>,
}

impl ClientHandler {
    pub(crate) fn new(
        expected_fingerprint: Option<String>,
        accept_unknown_host_key: bool,
        reverse: Arc<ReverseRegistry>,
    ) -> Self {
        Self {
            expected_fingerprint,
            accept_unknown_host_key,
            reverse,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        fingerprint::verify_host_key(
            self.expected_fingerprint.as_deref(),
            self.accept_unknown_host_key,
            server_public_key,
        )?;
        Ok(true)
    }

    /// Called when the peer opens a channel for a connection it accepted on
    /// a remotely bound (reverse) listener.
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let Some(local_port) = self.reverse.lookup(connected_address, connected_port as u16)
        else {
            warn!(
                "dropping forwarded connection for unregistered {}:{} (from {}:{})",
                connected_address, connected_port, originator_address, originator_port
            );
            return Ok(());
        };

        // Cannot block the SSH event loop here; bridge in a task.
        tokio::spawn(handle_forwarded_connection(channel, local_port));
        Ok(())
    }
}
