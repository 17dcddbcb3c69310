//! Link-state topology database and shortest path computation.

use serde::Serialize;
use std::collections::HashMap;

/// Local index of a node
pub type NodeId = u64;

/// Cost assigned to a parent/child link when none is given
pub const DEFAULT_LINK_COST: u32 = 1;

/// Information about a node in the topology
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Local node index
    pub node_id: NodeId,
    /// Canonical UUID used on the wire
    pub uuid: String,
    /// Node this one joined through (`None` when directly attached to the admin)
    pub parent: Option<NodeId>,
    /// Cost of the direct link to the admin, if any
    pub admin_link: Option<u32>,
    /// Direct neighbors of this node
    pub neighbors: HashMap<NodeId, LinkInfo>,
}

/// Information about a link between two nodes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    /// Cost of this link
    pub cost: u32,
}

/// Computed route information
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComputedRoute {
    /// Destination node
    pub dst_node: NodeId,
    /// Nodes traversed from the admin, ending with the destination
    pub path: Vec<NodeId>,
    /// Total cost to reach destination
    pub total_cost: u32,
}

/// Link-state topology database
#[derive(Debug, Default)]
pub struct TopologyDatabase {
    /// Information about all known nodes
    nodes: HashMap<NodeId, NodeInfo>,
    /// Reverse index from UUID to node index
    uuid_index: HashMap<String, NodeId>,
    /// Computed routes from the admin to all reachable nodes
    routes: HashMap<NodeId, ComputedRoute>,
    /// Next node index to hand out
    next_index: NodeId,
    /// Bumped on every structural change
    epoch: u64,
}

// Include implementation
mod database;
