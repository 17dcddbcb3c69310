//! Topology error types.

use thiserror::Error;

/// Topology lookup and update errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// No node with this index is known
    #[error("unknown node {0}")]
    UnknownNode(u64),

    /// A node with this UUID is already registered
    #[error("duplicate node uuid {0}")]
    DuplicateUuid(String),

    /// The node is known but no path from the admin reaches it
    #[error("node {0} is unreachable")]
    Unreachable(u64),
}
