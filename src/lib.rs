//! sshspan — a programmable SSH tunneling toolkit.
//!
//! Turns an authenticated SSH connection into a reusable substrate for:
//!
//! - bidirectional TCP port forwarding ([`Supervisor::start_tunnels`]),
//! - a SOCKS5 proxy whose egress rides the connection
//!   ([`Supervisor::start_socks`]),
//! - multi-hop gateway chains stitching several hops into one logical
//!   tunnel ([`Gateways`]),
//! - remote command execution, one-shot ([`Commander`]) or over a
//!   persistent prompt-synchronized session ([`CommandSession`]).
//!
//! ```no_run
//! use sshspan::{Supervisor, SshEndpoint, TunnelTarget};
//!
//! # async fn example() -> sshspan::Result<()> {
//! let supervisor = Supervisor::connect(SshEndpoint {
//!     host: "bastion.example.com".into(),
//!     user: "deploy".into(),
//!     private_key: Some("~/.ssh/id_ed25519".into()),
//!     ..Default::default()
//! })
//! .await?;
//!
//! supervisor
//!     .start_tunnels(vec![TunnelTarget {
//!         remote_host: "db.internal".into(),
//!         remote_port: 5432,
//!         local_port: 15432,
//!         ..Default::default()
//!     }])
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod command;
pub mod endpoint;
pub mod error;
pub mod freeport;
pub mod gateway;
pub mod resolver;
pub mod socks;
pub mod ssh;
pub mod supervisor;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testutil;

pub use bus::{LifecycleBus, Signal, Subscription};
pub use command::{CommandSession, CommandSessionBuilder, Commander};
pub use endpoint::SshEndpoint;
pub use error::{Error, Result};
pub use gateway::{Gateways, SshThroughGateways};
pub use resolver::{parse_resolv, NameResolver, ResolvConf, SimpleResolver};
pub use socks::{BoxedConn, DialFn, Socks5Config, Socks5Server};
pub use ssh::TunnelStream;
pub use supervisor::{ResolverFactory, Supervisor};
pub use tunnel::TunnelTarget;
