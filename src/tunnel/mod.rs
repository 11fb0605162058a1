//! Tunnel manager: listener lifecycle for forward and reverse mappings.

pub(crate) mod local;
pub(crate) mod remote;
mod target;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::bus::{LifecycleBus, Signal};
use crate::error::{Error, Result};
use crate::ssh::HandleController;

pub use target::TunnelTarget;
pub(crate) use remote::ReverseRegistry;

/// Spawns one listener for `target` (already normalized) and waits until it
/// is bound and accepting, or fails. The returned handle resolves when the
/// listener exits.
pub(crate) async fn spawn_listener(
    controller: &HandleController,
    registry: &Arc<ReverseRegistry>,
    bus: &Arc<LifecycleBus>,
    target: TunnelTarget,
) -> Result<JoinHandle<Result<()>>> {
    let (ready_tx, mut ready_rx) = mpsc::channel::<()>(1);
    let stop = bus.subscribe(Signal::StopTunnels);

    let mut handle = if target.reverse {
        tokio::spawn(remote::run_reverse_listener(
            controller.clone(),
            registry.clone(),
            stop,
            target,
            ready_tx,
        ))
    } else {
        tokio::spawn(local::run_forward_listener(
            controller.clone(),
            stop,
            target,
            ready_tx,
        ))
    };

    tokio::select! {
        joined = &mut handle => match joined {
            Ok(Ok(())) => Err(Error::Bind("listener exited before becoming ready".into())),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(Error::Channel(format!("listener task failed: {e}"))),
        },
        _ = ready_rx.recv() => Ok(handle),
    }
}

/// Starts every target in order, each waited to readiness before the next.
///
/// After all listeners are bound, [`Signal::StartTunnels`] is emitted (the
/// gateway chainer depends on this ordering) and the call blocks until every
/// listener has returned. Errors after readiness only end the affected
/// listener and are logged.
pub(crate) async fn start_tunnels(
    controller: &HandleController,
    registry: &Arc<ReverseRegistry>,
    bus: &Arc<LifecycleBus>,
    targets: Vec<TunnelTarget>,
) -> Result<()> {
    let mut listeners = Vec::with_capacity(targets.len());
    for mut target in targets {
        target.normalize()?;
        debug!(tunnel = %target, "starting tunnel");
        listeners.push(spawn_listener(controller, registry, bus, target).await?);
    }

    bus.emit(Signal::StartTunnels).await;

    for listener in listeners {
        match listener.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("tunnel listener ended: {e}"),
            Err(e) => debug!("tunnel listener task failed: {e}"),
        }
    }
    Ok(())
}
