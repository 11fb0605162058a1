//! Tunnel target descriptors.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::freeport;

/// One forward or reverse port mapping.
///
/// Forward (`reverse == false`): a local listener on
/// `127.0.0.1:local_port` forwards accepted connections to
/// `remote_host:remote_port` through the SSH connection.
///
/// Reverse (`reverse == true`): the SSH peer listens on
/// `remote_host:remote_port` and accepted connections are forwarded back to
/// `127.0.0.1:local_port`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelTarget {
    /// Network to use; empty defaults to `"tcp"`.
    #[serde(default)]
    pub network: String,
    /// Remote host to connect to (forward) or bind on (reverse).
    #[serde(default)]
    pub remote_host: String,
    /// Remote port; for reverse targets 0 defaults to `local_port`.
    #[serde(default)]
    pub remote_port: u16,
    /// Local port; 0 means allocate one from the free-port service.
    #[serde(default)]
    pub local_port: u16,
    /// Reverse direction flag.
    #[serde(default)]
    pub reverse: bool,
}

impl TunnelTarget {
    /// Applies defaulting rules. Idempotent; fails only when free-port
    /// allocation fails.
    pub fn normalize(&mut self) -> Result<()> {
        if self.local_port == 0 {
            self.local_port = freeport::next_free_port()?;
        } else {
            freeport::register_port(self.local_port);
        }
        if self.network.is_empty() {
            self.network = "tcp".into();
        }
        if self.reverse {
            self.remote_host = "127.0.0.1".into();
            if self.remote_port == 0 {
                self.remote_port = self.local_port;
            }
        }
        Ok(())
    }
}

impl fmt::Display for TunnelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.reverse {
            write!(
                f,
                "{net}://localhost:{lp} -> {net}://{rh}:{rp}",
                net = self.network,
                lp = self.local_port,
                rh = self.remote_host,
                rp = self.remote_port
            )
        } else {
            write!(
                f,
                "{net}://{rh}:{rp} -> {net}://localhost:{lp}",
                net = self.network,
                lp = self.local_port,
                rh = self.remote_host,
                rp = self.remote_port
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_fills_defaults() {
        let mut target = TunnelTarget {
            remote_host: "db.internal".into(),
            remote_port: 5432,
            ..Default::default()
        };
        target.normalize().unwrap();
        assert_eq!(target.network, "tcp");
        assert_ne!(target.local_port, 0);
    }

    #[test]
    fn normalize_is_idempotent() {
        let mut target = TunnelTarget {
            network: "tcp".into(),
            remote_host: "db.internal".into(),
            remote_port: 5432,
            local_port: 15432,
            ..Default::default()
        };
        target.normalize().unwrap();
        let first = target.clone();
        target.normalize().unwrap();
        assert_eq!(format!("{target:?}"), format!("{first:?}"));
    }

    #[test]
    fn reverse_targets_default_remote_side() {
        let mut target = TunnelTarget {
            remote_host: "ignored.example".into(),
            local_port: 9090,
            reverse: true,
            ..Default::default()
        };
        target.normalize().unwrap();
        assert_eq!(target.remote_host, "127.0.0.1");
        assert_eq!(target.remote_port, 9090);

        let mut target = TunnelTarget {
            local_port: 9091,
            remote_port: 8080,
            reverse: true,
            ..Default::default()
        };
        target.normalize().unwrap();
        assert_eq!(target.remote_port, 8080);
    }

    #[test]
    fn display_shows_direction() {
        let mut forward = TunnelTarget {
            remote_host: "db".into(),
            remote_port: 5432,
            local_port: 15432,
            ..Default::default()
        };
        forward.normalize().unwrap();
        assert_eq!(forward.to_string(), "tcp://localhost:15432 -> tcp://db:5432");

        let mut reverse = TunnelTarget {
            local_port: 9090,
            reverse: true,
            ..Default::default()
        };
        reverse.normalize().unwrap();
        assert_eq!(
            reverse.to_string(),
            "tcp://127.0.0.1:9090 -> tcp://localhost:9090"
        );
    }
}
