//! Proxy-session manager, local proxy listeners and tunnel-side dispatch.
//!
//! The [`SocksManager`] is a single-owner actor holding every proxy instance,
//! every proxied session and every data channel. All other components talk
//! to it through request/response messages, so the maps it owns need no
//! locking and every socket it owns is closed exactly once.
//!
//! ## Components
//!
//! - **Manager**: registration, sequence allocation, session lifecycle and
//!   channel handout ([`manager`])
//! - **Listener**: per-node local accept loop feeding new sessions into the
//!   manager ([`listener`])
//! - **Forwarders**: byte pumps between local sockets and the tunnel
//! - **Dispatcher**: routes inbound tunnel payloads to session channels by
//!   sequence number ([`dispatch`])

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dispatch;
pub mod error;
mod forward;
pub mod handle;
pub mod lease;
pub mod listener;
pub mod manager;
mod record;

#[cfg(test)]
mod testing;

pub use dispatch::SocksDispatcher;
pub use error::{ErrorKind, SocksError};
pub use handle::{HandleKind, SocketHandle};
pub use lease::ChannelLease;
pub use listener::{start_proxy, ProxyContext};
pub use manager::{ManagerConfig, ProxyStatus, SocksManager, UdpStartInfo};
pub use record::Credentials;
pub use tunnel_topology::NodeId;

/// Sequence number identifying one proxied session end to end
pub type Seq = u64;
