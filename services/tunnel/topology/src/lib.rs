//! Node registry, UUID assignment and hop-path route computation for the tunnel admin.
//!
//! Every agent reachable through the tunnel is known locally by a small
//! numeric index. This crate maps those indices to the canonical UUIDs used
//! on the wire and computes the route string (the ordered hop UUIDs) that
//! frames must carry to reach each node.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod link_state;
pub mod resolver;

pub use error::TopologyError;
pub use link_state::*;
pub use resolver::{Resolved, SharedTopology, Topology};
