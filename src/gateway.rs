//! Gateway chains: composing SSH hops into one logical tunnel.
//!
//! Each hop connects through a local forward port exposed by its
//! predecessor, so a chain of forward tunnels becomes a chain of SSH hops.
//! Only direct-tcpip is used; no ProxyJump support is assumed of any hop.

use std::sync::Arc;

use tracing::{debug, error};

use crate::bus::Signal;
use crate::endpoint::{split_host_port, SshEndpoint};
use crate::error::Result;
use crate::freeport;
use crate::supervisor::Supervisor;
use crate::tunnel::TunnelTarget;

/// Pre-computed wiring for one hop of a chain.
#[derive(Debug, Clone, Default)]
struct HopWiring {
    /// Where this hop's SSH connection goes: the real host for hop 0, the
    /// previous hop's local forward port otherwise.
    src_ssh_uri: String,
    /// Local port this hop's forward tunnel listens on.
    local_port: u16,
    /// Next hop's address, forwarded to by this hop's tunnel. Empty for the
    /// last hop, which forwards to the final target instead.
    remote_host: String,
    remote_port: u16,
}

/// An ordered chain of SSH hops. Hop 0 is the entry point reachable from
/// the local host; the last hop is adjacent to the final target.
pub struct Gateways {
    hops: Vec<SshEndpoint>,
    boxes: Vec<Arc<Supervisor>>,
}

impl Gateways {
    pub fn new(hops: Vec<SshEndpoint>) -> Self {
        Self {
            hops,
            boxes: Vec::new(),
        }
    }

    /// Brings the chain up and returns the rewritten target address.
    ///
    /// With no hops, `to_host` comes back unchanged and nothing is
    /// allocated. Otherwise every hop gets a supervisor and a forward
    /// tunnel, each waited to readiness before the next hop connects
    /// through it; the returned `127.0.0.1:port` addresses `to_host` as
    /// seen from the last hop.
    pub async fn run_gateways(&mut self, to_host: &str) -> Result<String> {
        if self.hops.is_empty() {
            return Ok(to_host.to_string());
        }

        let count = self.hops.len();
        let mut wiring = vec![HopWiring::default(); count];
        for i in 0..count {
            wiring[i].local_port = freeport::next_free_port()?;
            wiring[i].src_ssh_uri = if i == 0 {
                self.hops[i].host.clone()
            } else {
                format!("127.0.0.1:{}", wiring[i - 1].local_port)
            };
            if i + 1 < count {
                let (host, port) = split_host_port(&self.hops[i + 1].host, 22)?;
                wiring[i].remote_host = host;
                wiring[i].remote_port = port;
            }
        }

        for (i, hop) in self.hops.iter().enumerate() {
            let mut endpoint = hop.clone();
            endpoint.host = wiring[i].src_ssh_uri.clone();

            let supervisor = Arc::new(Supervisor::connect(endpoint).await?);
            let mut ready = supervisor.bus().subscribe(Signal::StartTunnels);

            let (remote_host, remote_port) = if i == count - 1 {
                split_host_port(to_host, 22)?
            } else {
                (wiring[i].remote_host.clone(), wiring[i].remote_port)
            };
            let mut target = TunnelTarget {
                remote_host,
                remote_port,
                local_port: wiring[i].local_port,
                ..Default::default()
            };
            target.normalize()?;
            debug!(hop = i, tunnel = %target, "starting gateway tunnel");

            let tunnel_supervisor = supervisor.clone();
            tokio::spawn(async move {
                if let Err(e) = tunnel_supervisor.start_tunnels(vec![target]).await {
                    error!("could not start tunnel for gateways: {e}");
                }
            });
            let _ = ready.recv().await;

            self.boxes.push(supervisor);
        }

        Ok(format!(
            "127.0.0.1:{}",
            wiring[count - 1].local_port
        ))
    }

    /// Supervisors of the running chain, outermost first.
    pub fn supervisors(&self) -> &[Arc<Supervisor>] {
        &self.boxes
    }

    /// Closes the chain, innermost hop first, so each hop's downstream is
    /// gone before the hop itself terminates.
    pub async fn close(&mut self) {
        for supervisor in self.boxes.iter().rev() {
            supervisor.close().await;
        }
        self.boxes.clear();
    }
}

/// An SSH connection reached through a gateway chain.
///
/// Runs the chain, rewrites the endpoint's host to the chain's local
/// endpoint and connects the final supervisor through it.
pub struct SshThroughGateways {
    gateways: Option<Gateways>,
    supervisor: Arc<Supervisor>,
}

impl SshThroughGateways {
    pub async fn connect(
        endpoint: SshEndpoint,
        gateway_hops: Vec<SshEndpoint>,
    ) -> Result<Self> {
        let mut endpoint = endpoint;
        let mut gateways = None;

        if !gateway_hops.is_empty() {
            let mut chain = Gateways::new(gateway_hops);
            endpoint.host = chain.run_gateways(&endpoint.host).await?;
            gateways = Some(chain);
        }

        let supervisor = Arc::new(Supervisor::connect(endpoint).await?);
        Ok(Self {
            gateways,
            supervisor,
        })
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Closes the in-chain connection first, then the chain itself.
    pub async fn close(&mut self) {
        self.supervisor.close().await;
        if let Some(gateways) = &mut self.gateways {
            gateways.close().await;
        }
    }
}
