//! SSH endpoint descriptor.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Everything needed to open one SSH connection.
///
/// Call [`SshEndpoint::check_and_fill`] to apply defaulting before use; the
/// supervisor does this on construction. The descriptor is immutable once a
/// connection has been started from it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshEndpoint {
    /// Host, either `host` or `host:port`. `:22` is appended when no port is
    /// present.
    pub host: String,

    /// User to authenticate as. Empty defaults to the process user, then
    /// `"root"`.
    #[serde(default)]
    pub user: String,

    /// Optional password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Optional path to a private key file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<PathBuf>,

    /// Optional passphrase for the private key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,

    /// Expected host-key fingerprint: MD5 hex-colon (47 chars), SHA-1
    /// hex-colon (59 chars) or base64 SHA-256 (43 chars). The format is
    /// selected by length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key_fingerprint: Option<String>,

    /// Path to an SSH agent socket. Defaults from `$SSH_AUTH_SOCK` unless
    /// agent use is disabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_sock: Option<PathBuf>,

    /// Disables SSH agent use entirely.
    #[serde(default)]
    pub no_ssh_agent: bool,

    /// Accept any host key when no fingerprint is configured. This is
    /// insecure and therefore an explicit opt-in; without it a missing
    /// fingerprint fails verification with the server's MD5 fingerprint in
    /// the error message.
    #[serde(default)]
    pub accept_unknown_host_key: bool,
}

impl SshEndpoint {
    /// Applies defaulting rules and validates the endpoint.
    pub fn check_and_fill(&mut self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Connection("you must set a host".into()));
        }
        if self.user.is_empty() {
            self.user = whoami::username();
        }
        if self.user.is_empty() {
            self.user = "root".into();
        }
        if !has_port(&self.host) {
            self.host.push_str(":22");
        }
        if self.no_ssh_agent {
            self.auth_sock = None;
        } else if self.auth_sock.is_none() {
            if let Ok(sock) = std::env::var("SSH_AUTH_SOCK") {
                if !sock.is_empty() {
                    self.auth_sock = Some(PathBuf::from(sock));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for SshEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.user.is_empty() {
            write!(f, "ssh://{}", self.host)
        } else {
            write!(f, "ssh://{}@{}", self.user, self.host)
        }
    }
}

fn has_port(host: &str) -> bool {
    match host.rsplit_once(':') {
        Some((_, port)) => port.parse::<u16>().is_ok(),
        None => false,
    }
}

/// Splits `addr` into host and port, defaulting the port when absent.
pub(crate) fn split_host_port(addr: &str, default_port: u16) -> Result<(String, u16)> {
    match addr.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|e| Error::Address(addr.into(), e.to_string()))?;
            if host.is_empty() {
                return Err(Error::Address(addr.into(), "empty host".into()));
            }
            Ok((host.to_string(), port))
        }
        None if addr.is_empty() => Err(Error::Address(addr.into(), "empty host".into())),
        None => Ok((addr.to_string(), default_port)),
    }
}
