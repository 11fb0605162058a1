//! SSH transport layer: connection, authentication, host-key verification
//! and the single-owner handle task.

pub mod fingerprint;

mod connect;
mod handle_owner;
mod handler;

pub(crate) use connect::connect;
pub(crate) use handle_owner::HandleController;

/// Stream view of a direct-tcpip SSH channel, as returned by
/// [`crate::Supervisor::dial`]. Implements `AsyncRead` + `AsyncWrite`.
pub type TunnelStream = russh::ChannelStream<russh::client::Msg>;
