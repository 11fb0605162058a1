//! Name resolution through the SSH connection.
//!
//! The default factory reads the peer's `/etc/resolv.conf`, exposes each of
//! its nameservers locally through a forward tunnel to port 53, and returns
//! a resolver that queries those local ports. The SOCKS5 frontend uses it so
//! domain names resolve the way they would on the SSH peer.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use hickory_resolver::config::{
    LookupIpStrategy, NameServerConfig, Protocol, ResolverConfig, ResolverOpts,
};
use hickory_resolver::TokioAsyncResolver;
use tracing::debug;

use crate::command::Commander;
use crate::error::{Error, Result};
use crate::supervisor::{ResolverFactory, Supervisor};
use crate::tunnel::TunnelTarget;

/// Per-server query timeout, matching the short budget a proxy lookup gets.
const DNS_TIMEOUT: Duration = Duration::from_millis(100);

/// Resolves names to addresses. Implementations prefer IPv4 and return
/// `Ok(None)` when records exist but none is IPv4.
#[async_trait]
pub trait NameResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<Option<IpAddr>>;
}

/// Parsed view of a `resolv.conf` file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvConf {
    /// Nameserver addresses in file order.
    pub servers: Vec<String>,
}

/// Extracts the `nameserver` entries from `resolv.conf` contents.
pub fn parse_resolv(content: &[u8]) -> ResolvConf {
    let mut servers = Vec::new();
    for line in String::from_utf8_lossy(content).lines() {
        let line = line.trim();
        if line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let mut fields = line.split_whitespace();
        if fields.next() == Some("nameserver") {
            if let Some(server) = fields.next() {
                servers.push(server.to_string());
            }
        }
    }
    ResolvConf { servers }
}

/// DNS-client resolver querying a fixed server list in order.
pub struct SimpleResolver {
    inner: TokioAsyncResolver,
}

impl SimpleResolver {
    /// Builds a resolver for `servers` (each `ip` or `ip:port`, port
    /// defaulting to 53). An empty list yields `None`: no custom resolver,
    /// let the OS decide.
    pub fn from_server_list(servers: &[String]) -> Result<Option<Self>> {
        if servers.is_empty() {
            return Ok(None);
        }

        let mut config = ResolverConfig::new();
        for server in servers {
            let addr = parse_server_addr(server)?;
            config.add_name_server(NameServerConfig::new(addr, Protocol::Tcp));
        }

        let mut opts = ResolverOpts::default();
        opts.timeout = DNS_TIMEOUT;
        opts.attempts = 1;
        opts.ip_strategy = LookupIpStrategy::Ipv4thenIpv6;

        Ok(Some(Self {
            inner: TokioAsyncResolver::tokio(config, opts),
        }))
    }
}

#[async_trait]
impl NameResolver for SimpleResolver {
    async fn resolve(&self, name: &str) -> Result<Option<IpAddr>> {
        let lookup = self
            .inner
            .lookup_ip(name)
            .await
            .map_err(|e| Error::Resolve(e.to_string()))?;
        Ok(lookup.iter().find(|ip| ip.is_ipv4()))
    }
}

fn parse_server_addr(server: &str) -> Result<SocketAddr> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }
    server
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, 53))
        .map_err(|e| Error::Resolve(format!("bad nameserver address {server:?}: {e}")))
}

/// Reads the peer's `resolv.conf` over a one-shot session.
pub async fn resolv_conf_from_ssh(supervisor: &Supervisor) -> Result<ResolvConf> {
    let (stdout, _stderr) = Commander::new(supervisor).run("cat /etc/resolv.conf").await?;
    Ok(parse_resolv(&stdout))
}

/// The default resolver factory: tunnel each remote nameserver's port 53 to
/// a local port and resolve against those.
pub(crate) fn ssh_resolver_factory() -> ResolverFactory {
    fn factory(supervisor: &Supervisor) -> BoxFuture<'_, Result<Option<Arc<dyn NameResolver>>>> {
        resolver_from_ssh(supervisor).boxed()
    }
    Arc::new(factory)
}

async fn resolver_from_ssh(supervisor: &Supervisor) -> Result<Option<Arc<dyn NameResolver>>> {
    let conf = resolv_conf_from_ssh(supervisor).await?;

    let mut local_servers = Vec::with_capacity(conf.servers.len());
    for server in &conf.servers {
        let mut target = TunnelTarget {
            remote_host: server.clone(),
            remote_port: 53,
            ..Default::default()
        };
        target.normalize()?;
        let local_port = target.local_port;
        // The listener runs until StopTunnels; the handle is intentionally
        // detached.
        let _ = supervisor.spawn_tunnel_listener(target).await?;
        debug!(server, local_port, "dns server tunneled");
        local_servers.push(format!("127.0.0.1:{local_port}"));
    }

    Ok(SimpleResolver::from_server_list(&local_servers)?
        .map(|resolver| Arc::new(resolver) as Arc<dyn NameResolver>))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_resolv_extracts_servers() {
        let conf = parse_resolv(
            b"# generated by dhcp\n\
              ; vendor comment\n\
              domain example.internal\n\
              nameserver 10.0.0.2\n\
              nameserver 10.0.0.3\n\
              options ndots:1\n",
        );
        assert_eq!(conf.servers, vec!["10.0.0.2", "10.0.0.3"]);
    }

    #[test]
    fn parse_resolv_with_no_servers() {
        let conf = parse_resolv(b"domain example.internal\n");
        assert!(conf.servers.is_empty());
    }

    #[test]
    fn empty_server_list_means_no_custom_resolver() {
        assert!(SimpleResolver::from_server_list(&[]).unwrap().is_none());
    }

    #[test]
    fn server_list_builds_a_resolver() {
        let servers = vec!["127.0.0.1:5353".to_string(), "10.0.0.2".to_string()];
        assert!(SimpleResolver::from_server_list(&servers).unwrap().is_some());
    }

    #[test]
    fn bad_server_addresses_are_rejected() {
        let servers = vec!["not-an-ip".to_string()];
        assert!(SimpleResolver::from_server_list(&servers).is_err());
    }

    mod e2e {
        use super::super::*;
        use crate::testutil::{TestServer, TestServerConfig};

        #[tokio::test]
        async fn resolv_conf_is_read_over_ssh() {
            let mut config = TestServerConfig::default();
            config.exec_replies.insert(
                "cat /etc/resolv.conf".to_string(),
                b"nameserver 10.0.0.2\nnameserver 10.0.0.3\n".to_vec(),
            );
            let server = TestServer::spawn(config).await;
            let supervisor = Supervisor::connect(server.endpoint()).await.unwrap();

            let conf = resolv_conf_from_ssh(&supervisor).await.unwrap();
            assert_eq!(conf.servers, vec!["10.0.0.2", "10.0.0.3"]);

            supervisor.close().await;
            server.stop();
        }

        #[tokio::test]
        async fn factory_tunnels_each_nameserver() {
            let mut config = TestServerConfig::default();
            config.exec_replies.insert(
                "cat /etc/resolv.conf".to_string(),
                b"nameserver 10.0.0.2\n".to_vec(),
            );
            let server = TestServer::spawn(config).await;
            let supervisor = Supervisor::connect(server.endpoint()).await.unwrap();

            let resolver = supervisor.name_resolver().await.unwrap();
            assert!(resolver.is_some());

            // Cached: a second call yields the same instance.
            let again = supervisor.name_resolver().await.unwrap();
            assert!(Arc::ptr_eq(
                resolver.as_ref().unwrap(),
                again.as_ref().unwrap()
            ));

            supervisor.close().await;
            server.stop();
        }

        #[tokio::test]
        async fn empty_resolv_conf_means_no_custom_resolver() {
            let mut config = TestServerConfig::default();
            config
                .exec_replies
                .insert("cat /etc/resolv.conf".to_string(), Vec::new());
            let server = TestServer::spawn(config).await;
            let supervisor = Supervisor::connect(server.endpoint()).await.unwrap();

            assert!(supervisor.name_resolver().await.unwrap().is_none());

            supervisor.close().await;
            server.stop();
        }
    }
}
