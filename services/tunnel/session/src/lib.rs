//! Tunnel link and keepalive loops for the tunnel admin.
//!
//! The admin talks to the whole agent mesh over one multiplexed TCP
//! connection. This crate owns that connection's read and write sides and
//! the periodic heartbeat sent to every known node.
//!
//! ## Features
//!
//! - **Link**: frame writer task fed by a bounded queue, frame reader over
//!   the read half ([`link`])
//! - **Keepalive**: `Keep` heartbeats to every node along its current route
//!   ([`keepalive`])
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tokio::net::TcpListener;
//! use tunnel_session::{run_keepalive, LinkConfig, TunnelLink};
//! use tunnel_topology::SharedTopology;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let listener = TcpListener::bind("0.0.0.0:9000").await?;
//! let (stream, _) = listener.accept().await?;
//! let mut link = TunnelLink::spawn(stream, LinkConfig::default());
//!
//! let topology = SharedTopology::default();
//! let sender = link.sender.clone();
//! tokio::spawn(async move {
//!     run_keepalive(&topology, &sender, Duration::from_secs(10)).await
//! });
//!
//! while let Some(frame) = link.reader.next_frame().await? {
//!     println!("{:?} from {}", frame.header.message_type, frame.header.sender);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod keepalive;
pub mod link;

pub use keepalive::{build_keep_frame, run_keepalive, send_heartbeats, DEFAULT_HEARTBEAT_INTERVAL};
pub use link::{FrameReader, LinkConfig, LinkSender, LinkStats, TunnelLink};
