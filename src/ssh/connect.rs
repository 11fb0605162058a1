//! SSH connection establishment and authentication.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, AuthResult, Handle};
use russh::keys::{load_secret_key, Algorithm, PrivateKeyWithHashAlg};
use tracing::{debug, info};

use super::handle_owner::{spawn_handle_owner, HandleController};
use super::handler::ClientHandler;
use crate::endpoint::SshEndpoint;
use crate::error::{Error, Result};
use crate::tunnel::remote::ReverseRegistry;

/// TCP dial timeout for the SSH transport.
const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Connects and authenticates against `endpoint`, returning the controller
/// for the spawned handle owner task. The endpoint must already be filled
/// via [`SshEndpoint::check_and_fill`].
pub(crate) async fn connect(
    endpoint: &SshEndpoint,
    reverse: Arc<ReverseRegistry>,
) -> Result<HandleController> {
    debug!(target_host = %endpoint, "starting ssh client");

    let config = client::Config {
        inactivity_timeout: None,
        ..Default::default()
    };

    let handler = ClientHandler::new(
        endpoint.host_key_fingerprint.clone(),
        endpoint.accept_unknown_host_key,
        reverse,
    );

    let mut handle = tokio::time::timeout(
        DIAL_TIMEOUT,
        client::connect(Arc::new(config), endpoint.host.as_str(), handler),
    )
    .await
    .map_err(|_| Error::Timeout(format!("connection to {} timed out", endpoint.host)))?
    .map_err(|e| match e {
        Error::HostKey(_) => e,
        other => Error::Connection(other.to_string()),
    })?;

    authenticate(&mut handle, endpoint).await?;

    info!(target_host = %endpoint, "ssh connection established");
    Ok(spawn_handle_owner(handle, endpoint.to_string()))
}

/// Tries the configured auth methods in order: agent, password, private key.
async fn authenticate(handle: &mut Handle<ClientHandler>, endpoint: &SshEndpoint) -> Result<()> {
    let mut last_error: Option<Error> = None;

    if let Some(sock) = &endpoint.auth_sock {
        match try_agent_auth(handle, &endpoint.user, sock).await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => {
                debug!("agent authentication unavailable: {e}");
                last_error = Some(e);
            }
        }
    }

    if let Some(password) = &endpoint.password {
        let result = handle
            .authenticate_password(endpoint.user.as_str(), password.as_str())
            .await
            .map_err(|e| Error::Auth(e.to_string()))?;
        if result.success() {
            return Ok(());
        }
        last_error = Some(Error::Auth("password rejected by server".into()));
    }

    if let Some(key_path) = &endpoint.private_key {
        let result = try_key_auth(
            handle,
            &endpoint.user,
            key_path,
            endpoint.passphrase.as_deref(),
        )
        .await?;
        if result.success() {
            return Ok(());
        }
        last_error = Some(Error::Auth("private key rejected by server".into()));
    }

    Err(last_error.unwrap_or_else(|| Error::Auth("no authentication method available".into())))
}

async fn try_key_auth(
    handle: &mut Handle<ClientHandler>,
    user: &str,
    key_path: &Path,
    passphrase: Option<&str>,
) -> Result<AuthResult> {
    let key_path = expand_tilde(key_path);
    let key = load_secret_key(&key_path, passphrase).map_err(|e| Error::Key(e.to_string()))?;

    let hash_alg = if matches!(key.algorithm(), Algorithm::Rsa { .. }) {
        handle
            .best_supported_rsa_hash()
            .await
            .map_err(|e| Error::Auth(e.to_string()))?
            .flatten()
    } else {
        None
    };

    handle
        .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
        .await
        .map_err(|e| Error::Auth(e.to_string()))
}

/// Authenticates with every identity the agent offers until one succeeds.
#[cfg(unix)]
async fn try_agent_auth(
    handle: &mut Handle<ClientHandler>,
    user: &str,
    sock: &Path,
) -> Result<bool> {
    use russh::keys::agent::client::AgentClient;

    let stream = tokio::net::UnixStream::connect(sock)
        .await
        .map_err(|e| Error::Auth(format!("ssh agent connect: {e}")))?;
    let mut agent = AgentClient::connect(stream);

    let identities = agent
        .request_identities()
        .await
        .map_err(|e| Error::Auth(format!("ssh agent identities: {e}")))?;

    for identity in identities {
        let hash_alg = if matches!(identity.algorithm(), Algorithm::Rsa { .. }) {
            handle
                .best_supported_rsa_hash()
                .await
                .map_err(|e| Error::Auth(e.to_string()))?
                .flatten()
        } else {
            None
        };

        match handle
            .authenticate_publickey_with(user, identity, hash_alg, &mut agent)
            .await
        {
            Ok(result) if result.success() => return Ok(true),
            Ok(_) => continue,
            Err(e) => {
                debug!("agent identity rejected: {e}");
                continue;
            }
        }
    }

    Ok(false)
}

#[cfg(not(unix))]
async fn try_agent_auth(
    _handle: &mut Handle<ClientHandler>,
    _user: &str,
    _sock: &Path,
) -> Result<bool> {
    Ok(false)
}

/// `russh::keys` does not expand `~`; do it here so key paths from configs
/// work as users expect.
fn expand_tilde(path: &Path) -> std::path::PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}
