//! TopologyDatabase implementation methods.

use super::{ComputedRoute, LinkInfo, NodeId, NodeInfo, TopologyDatabase, DEFAULT_LINK_COST};
use crate::TopologyError;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use tracing::{debug, info};
use uuid::Uuid;

impl TopologyDatabase {
    /// Create an empty topology database
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new node with a freshly generated UUID
    pub fn add_node(&mut self, parent: Option<NodeId>) -> Result<(NodeId, String), TopologyError> {
        let uuid = Uuid::new_v4().simple().to_string();
        let node_id = self.add_node_with_uuid(uuid.clone(), parent)?;
        Ok((node_id, uuid))
    }

    /// Register a new node under a known UUID
    ///
    /// A node without a parent is attached directly to the admin. Otherwise
    /// the parent must already be known and a link of default cost is added
    /// between the two.
    pub fn add_node_with_uuid(
        &mut self,
        uuid: String,
        parent: Option<NodeId>,
    ) -> Result<NodeId, TopologyError> {
        if self.uuid_index.contains_key(&uuid) {
            return Err(TopologyError::DuplicateUuid(uuid));
        }
        if let Some(parent) = parent {
            if !self.nodes.contains_key(&parent) {
                return Err(TopologyError::UnknownNode(parent));
            }
        }

        let node_id = self.next_index;
        self.next_index += 1;

        let node_info = NodeInfo {
            node_id,
            uuid: uuid.clone(),
            parent,
            admin_link: parent.is_none().then_some(DEFAULT_LINK_COST),
            neighbors: HashMap::new(),
        };
        self.nodes.insert(node_id, node_info);
        self.uuid_index.insert(uuid.clone(), node_id);

        if let Some(parent) = parent {
            self.link(parent, node_id, DEFAULT_LINK_COST);
        }

        info!("Registered node {} ({}) under {:?}", node_id, uuid, parent);
        self.compute_routes();
        Ok(node_id)
    }

    /// Add or update a link between two known nodes
    pub fn add_link(&mut self, a: NodeId, b: NodeId, cost: u32) -> Result<(), TopologyError> {
        for node in [a, b] {
            if !self.nodes.contains_key(&node) {
                return Err(TopologyError::UnknownNode(node));
            }
        }
        self.link(a, b, cost);
        self.compute_routes();
        Ok(())
    }

    fn link(&mut self, a: NodeId, b: NodeId, cost: u32) {
        for (from, to) in [(a, b), (b, a)] {
            if let Some(node) = self.nodes.get_mut(&from) {
                node.neighbors.insert(to, LinkInfo { cost });
            }
        }
    }

    /// Remove a node and every link touching it
    pub fn remove_node(&mut self, node_id: NodeId) -> Result<NodeInfo, TopologyError> {
        let removed = self
            .nodes
            .remove(&node_id)
            .ok_or(TopologyError::UnknownNode(node_id))?;
        self.uuid_index.remove(&removed.uuid);

        for neighbor in removed.neighbors.keys() {
            if let Some(node) = self.nodes.get_mut(neighbor) {
                node.neighbors.remove(&node_id);
            }
        }

        info!("Removed node {} ({})", node_id, removed.uuid);
        self.compute_routes();
        Ok(removed)
    }

    /// Compute shortest paths from the admin using Dijkstra's algorithm
    fn compute_routes(&mut self) {
        self.routes.clear();
        self.epoch = self.epoch.wrapping_add(1);

        let mut distances: HashMap<NodeId, u32> = HashMap::new();
        let mut previous: HashMap<NodeId, NodeId> = HashMap::new();
        let mut frontier: BinaryHeap<Reverse<(u32, NodeId)>> = BinaryHeap::new();

        // The admin is not a node; its direct links seed the frontier
        for (&node_id, node_info) in &self.nodes {
            if let Some(cost) = node_info.admin_link {
                distances.insert(node_id, cost);
                frontier.push(Reverse((cost, node_id)));
            }
        }

        while let Some(Reverse((current_dist, current_node))) = frontier.pop() {
            if current_dist > distances.get(&current_node).copied().unwrap_or(u32::MAX) {
                continue;
            }

            if let Some(node_info) = self.nodes.get(&current_node) {
                for (&neighbor_id, link_info) in &node_info.neighbors {
                    let new_dist = current_dist.saturating_add(link_info.cost);
                    let existing_dist = distances.get(&neighbor_id).copied().unwrap_or(u32::MAX);

                    if new_dist < existing_dist {
                        distances.insert(neighbor_id, new_dist);
                        previous.insert(neighbor_id, current_node);
                        frontier.push(Reverse((new_dist, neighbor_id)));
                    }
                }
            }
        }

        for (&dst_node, &total_cost) in &distances {
            // Walk back to a node with no predecessor: that one hangs off the admin
            let mut path = vec![dst_node];
            let mut cursor = dst_node;
            while let Some(&prev_node) = previous.get(&cursor) {
                path.push(prev_node);
                cursor = prev_node;
            }
            path.reverse();

            self.routes.insert(
                dst_node,
                ComputedRoute {
                    dst_node,
                    path,
                    total_cost,
                },
            );
        }

        debug!(
            "Computed {} routes over {} nodes (epoch {})",
            self.routes.len(),
            self.nodes.len(),
            self.epoch
        );
    }

    /// Canonical UUID of a node
    pub fn uuid_of(&self, node_id: NodeId) -> Option<&str> {
        self.nodes.get(&node_id).map(|node| node.uuid.as_str())
    }

    /// Route string for a destination: the intermediate hop UUIDs joined by ':'
    ///
    /// The destination itself is not part of the route; a node attached
    /// directly to the admin has an empty route.
    pub fn route_string(&self, dst_node: NodeId) -> Result<String, TopologyError> {
        if !self.nodes.contains_key(&dst_node) {
            return Err(TopologyError::UnknownNode(dst_node));
        }
        let route = self
            .routes
            .get(&dst_node)
            .ok_or(TopologyError::Unreachable(dst_node))?;

        let hops: Vec<&str> = route.path[..route.path.len() - 1]
            .iter()
            .filter_map(|hop| self.uuid_of(*hop))
            .collect();
        Ok(hops.join(":"))
    }

    /// Get all known nodes
    pub fn get_nodes(&self) -> &HashMap<NodeId, NodeInfo> {
        &self.nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> (TopologyDatabase, NodeId, NodeId, NodeId) {
        let mut db = TopologyDatabase::new();
        let a = db.add_node_with_uuid("aaaa".into(), None).unwrap();
        let b = db.add_node_with_uuid("bbbb".into(), Some(a)).unwrap();
        let c = db.add_node_with_uuid("cccc".into(), Some(b)).unwrap();
        (db, a, b, c)
    }

    #[test]
    fn test_indices_are_sequential() {
        let (_, a, b, c) = chain();
        assert_eq!((a, b, c), (0, 1, 2));
    }

    #[test]
    fn test_route_strings_follow_parent_chain() {
        let (db, a, b, c) = chain();
        assert_eq!(db.route_string(a).unwrap(), "");
        assert_eq!(db.route_string(b).unwrap(), "aaaa");
        assert_eq!(db.route_string(c).unwrap(), "aaaa:bbbb");
    }

    #[test]
    fn test_shorter_link_wins() {
        let (mut db, a, _b, c) = chain();
        let d = db.add_node_with_uuid("dddd".into(), Some(a)).unwrap();
        db.add_link(d, c, 1).unwrap();

        // a -> d -> c costs 3 as well; make the detour strictly cheaper
        db.add_link(a, d, 0).unwrap();
        assert_eq!(db.route_string(c).unwrap(), "aaaa:dddd");
    }

    #[test]
    fn test_unknown_and_duplicate_nodes() {
        let (mut db, ..) = chain();
        assert_eq!(db.route_string(42), Err(TopologyError::UnknownNode(42)));
        assert_eq!(
            db.add_node_with_uuid("aaaa".into(), None),
            Err(TopologyError::DuplicateUuid("aaaa".into()))
        );
        assert_eq!(
            db.add_node_with_uuid("eeee".into(), Some(99)),
            Err(TopologyError::UnknownNode(99))
        );
    }

    #[test]
    fn test_removing_a_hop_makes_children_unreachable() {
        let (mut db, a, b, c) = chain();
        db.remove_node(b).unwrap();
        assert_eq!(db.route_string(c), Err(TopologyError::Unreachable(c)));
        assert_eq!(db.route_string(a).unwrap(), "");
        assert_eq!(db.get_nodes().len(), 2);
    }

    #[test]
    fn test_generated_uuids_are_distinct() {
        let mut db = TopologyDatabase::new();
        let (_, first) = db.add_node(None).unwrap();
        let (_, second) = db.add_node(None).unwrap();
        assert_ne!(first, second);
        assert_eq!(first.len(), 32);
    }
}
