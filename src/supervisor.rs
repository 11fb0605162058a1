//! Connection supervisor.
//!
//! Owns one live SSH connection plus the lifecycle bus that coordinates its
//! dependents. Runs a keepalive loop and a shutdown watcher; exposes channel
//! dialing, the tunnel manager and the SOCKS5 frontend.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::net::TcpListener;
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::{LifecycleBus, Signal};
use crate::endpoint::{split_host_port, SshEndpoint};
use crate::error::{Error, Result};
use crate::resolver::{self, NameResolver};
use crate::socks::{BoxedConn, DialFn, Socks5Config, Socks5Server};
use crate::ssh::{self, HandleController, TunnelStream};
use crate::tunnel::{self, ReverseRegistry, TunnelTarget};

/// Interval between keepalive requests on the SSH connection.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(2);

/// Builds the name resolver a supervisor hands to its SOCKS frontend.
/// `None` means "no custom resolver, let the OS decide".
pub type ResolverFactory = Arc<
    dyn for<'a> Fn(&'a Supervisor) -> BoxFuture<'a, Result<Option<Arc<dyn NameResolver>>>>
        + Send
        + Sync,
>;

/// One authenticated SSH connection and everything riding on it.
///
/// Construction connects and authenticates; [`Supervisor::close`] tears
/// everything down in order and only returns once the connection is closed
/// and every listener has observed the shutdown signal.
pub struct Supervisor {
    endpoint: SshEndpoint,
    controller: HandleController,
    bus: Arc<LifecycleBus>,
    reverse: Arc<ReverseRegistry>,
    resolver_factory: ResolverFactory,
    cached_resolver: OnceCell<Option<Arc<dyn NameResolver>>>,
    shutdown_done: watch::Receiver<bool>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Connects to `endpoint` and spawns the keepalive loop and shutdown
    /// watcher. Construction failures are fatal; runtime transport failures
    /// surface through the bus instead.
    pub async fn connect(endpoint: SshEndpoint) -> Result<Self> {
        let mut endpoint = endpoint;
        endpoint.check_and_fill()?;

        let bus = Arc::new(LifecycleBus::new());
        let reverse = Arc::new(ReverseRegistry::new());
        let controller = ssh::connect(&endpoint, reverse.clone()).await?;

        let (done_tx, done_rx) = watch::channel(false);
        tokio::spawn(keepalive_loop(
            controller.clone(),
            bus.clone(),
            bus.subscribe(Signal::StopSsh),
        ));
        tokio::spawn(shutdown_watcher(
            controller.clone(),
            bus.clone(),
            bus.subscribe(Signal::StopSsh),
            done_tx,
        ));

        Ok(Self {
            endpoint,
            controller,
            bus,
            reverse,
            resolver_factory: resolver::ssh_resolver_factory(),
            cached_resolver: OnceCell::new(),
            shutdown_done: done_rx,
        })
    }

    /// The endpoint this supervisor was built from (after defaulting).
    pub fn endpoint(&self) -> &SshEndpoint {
        &self.endpoint
    }

    /// The lifecycle bus coordinating this supervisor's workers.
    pub fn bus(&self) -> &Arc<LifecycleBus> {
        &self.bus
    }

    /// Whether the SSH connection is still being serviced.
    pub fn is_connected(&self) -> bool {
        self.controller.is_connected()
    }

    pub(crate) fn controller(&self) -> &HandleController {
        &self.controller
    }

    /// Opens a direct-tcpip channel to `addr` (`host:port`) and returns it
    /// as a byte stream.
    pub async fn dial(&self, network: &str, addr: &str) -> Result<TunnelStream> {
        dial_via(&self.controller, network, addr).await
    }

    /// The dial bound to this connection, in the form the SOCKS5 frontend
    /// consumes.
    pub fn dial_fn(&self) -> DialFn {
        let controller = self.controller.clone();
        Arc::new(move |network: String, addr: String| {
            let controller = controller.clone();
            async move {
                let stream = dial_via(&controller, &network, &addr).await?;
                Ok(Box::new(stream) as BoxedConn)
            }
            .boxed()
        })
    }

    /// Replaces the resolver factory. Must be called before the first
    /// [`Supervisor::start_socks`] (the resolver is cached on first use).
    pub fn set_resolver_factory(&mut self, factory: ResolverFactory) {
        self.resolver_factory = factory;
    }

    /// Returns the cached name resolver, constructing it on first call.
    pub async fn name_resolver(&self) -> Result<Option<Arc<dyn NameResolver>>> {
        self.cached_resolver
            .get_or_try_init(|| (self.resolver_factory)(self))
            .await
            .map(|resolver| resolver.clone())
    }

    /// Starts every tunnel target and blocks until all listeners return.
    ///
    /// Each listener is waited to readiness in order; a bind or remote-bind
    /// failure aborts immediately. Once all are ready,
    /// [`Signal::StartTunnels`] is emitted.
    pub async fn start_tunnels(&self, targets: Vec<TunnelTarget>) -> Result<()> {
        tunnel::start_tunnels(&self.controller, &self.reverse, &self.bus, targets).await
    }

    /// Spawns a single tunnel listener and returns once it is ready. Used
    /// by the resolver factory for its DNS tunnels.
    pub(crate) async fn spawn_tunnel_listener(
        &self,
        target: TunnelTarget,
    ) -> Result<JoinHandle<Result<()>>> {
        tunnel::spawn_listener(&self.controller, &self.reverse, &self.bus, target).await
    }

    /// Runs a SOCKS5 proxy on `127.0.0.1:port` whose egress rides this SSH
    /// connection. Blocks until [`Signal::StopSocks`] fires or the listener
    /// fails.
    pub async fn start_socks(&self, port: u16, network: &str) -> Result<()> {
        let network = if network.is_empty() { "tcp" } else { network };
        if !network.starts_with("tcp") {
            return Err(Error::Address(
                format!("127.0.0.1:{port}"),
                format!("unsupported network {network:?}"),
            ));
        }

        let resolver = self.name_resolver().await?;
        let server = Socks5Server::new(Socks5Config {
            dial: self.dial_fn(),
            resolver,
        });

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .await
            .map_err(|e| Error::Bind(e.to_string()))?;
        debug!(target_host = %self.endpoint, port, "listening socks5 server");

        let mut stop = self.bus.subscribe(Signal::StopSocks);
        tokio::select! {
            _ = stop.recv() => {
                debug!(target_host = %self.endpoint, "stopping socks on stop-socks signal");
                Ok(())
            }
            result = server.serve(listener) => result,
        }
    }

    /// Closes every tunnel listener.
    pub async fn stop_tunnels(&self) {
        self.bus.emit(Signal::StopTunnels).await;
    }

    /// Closes the SOCKS listener.
    pub async fn stop_socks(&self) {
        self.bus.emit(Signal::StopSocks).await;
    }

    /// Tears the supervisor down: emits [`Signal::StopSsh`] and waits until
    /// the shutdown watcher has closed everything and the SSH connection is
    /// gone. Idempotent.
    pub async fn close(&self) {
        let mut done = self.shutdown_done.clone();
        if *done.borrow() {
            return;
        }
        self.bus.emit(Signal::StopSsh).await;
        let _ = done.wait_for(|finished| *finished).await;
    }
}

/// Opens a direct-tcpip channel through `controller` for `addr`.
async fn dial_via(
    controller: &HandleController,
    network: &str,
    addr: &str,
) -> Result<TunnelStream> {
    if !network.starts_with("tcp") {
        return Err(Error::Address(
            addr.to_string(),
            format!("unsupported network {network:?}"),
        ));
    }
    let (host, port) = split_host_port(addr, 0)?;
    if port == 0 {
        return Err(Error::Address(addr.to_string(), "missing port".into()));
    }
    let channel = controller
        .open_direct_tcpip(&host, port as u32, "127.0.0.1", 0)
        .await?;
    Ok(channel.into_stream())
}

/// Sends a keepalive request every two seconds. A failed request means the
/// transport is gone: dependents are told to stop and the loop exits. The
/// loop also exits cleanly on [`Signal::StopSsh`].
async fn keepalive_loop(
    controller: HandleController,
    bus: Arc<LifecycleBus>,
    mut stop: crate::bus::Subscription,
) {
    let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick of a tokio interval fires immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = controller.keepalive().await {
                    warn!("stopping socks and tunnels because ssh interrupted: {e}");
                    bus.emit(Signal::StopSocks).await;
                    bus.emit(Signal::StopTunnels).await;
                    return;
                }
            }
            _ = stop.recv() => return,
        }
    }
}

/// Waits for [`Signal::StopSsh`], then cascades: stop the SOCKS frontend,
/// stop the tunnels, close the SSH connection, announce [`Signal::ClosedSsh`].
async fn shutdown_watcher(
    controller: HandleController,
    bus: Arc<LifecycleBus>,
    mut stop: crate::bus::Subscription,
    done_tx: watch::Sender<bool>,
) {
    if stop.recv().await.is_some() {
        debug!("stopping ssh client on stop-ssh signal");
        bus.emit(Signal::StopSocks).await;
        bus.emit(Signal::StopTunnels).await;
        controller.disconnect().await;
        bus.emit(Signal::ClosedSsh).await;
    }
    let _ = done_tx.send(true);
}
