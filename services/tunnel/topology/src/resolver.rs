//! Resolution seam used by the keepalive loop and the proxy components.

use crate::{NodeId, TopologyDatabase, TopologyError};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Where a node lives on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    /// Canonical UUID of the node (frame accepter)
    pub uuid: String,
    /// Hop path to the node
    pub route: String,
}

/// Resolves node indices to their wire identity and route
#[async_trait]
pub trait Topology: Send + Sync {
    /// Resolve one node
    async fn resolve(&self, node: NodeId) -> Result<Resolved, TopologyError>;

    /// Indices of every known node
    async fn nodes(&self) -> Vec<NodeId>;
}

/// Topology database shared between tasks
#[derive(Debug, Clone, Default)]
pub struct SharedTopology {
    db: Arc<RwLock<TopologyDatabase>>,
}

impl SharedTopology {
    /// Wrap an existing database
    pub fn new(db: TopologyDatabase) -> Self {
        Self {
            db: Arc::new(RwLock::new(db)),
        }
    }

    /// Read access to the database
    pub async fn read(&self) -> RwLockReadGuard<'_, TopologyDatabase> {
        self.db.read().await
    }

    /// Write access to the database
    pub async fn write(&self) -> RwLockWriteGuard<'_, TopologyDatabase> {
        self.db.write().await
    }
}

#[async_trait]
impl Topology for SharedTopology {
    async fn resolve(&self, node: NodeId) -> Result<Resolved, TopologyError> {
        let db = self.db.read().await;
        let uuid = db
            .uuid_of(node)
            .ok_or(TopologyError::UnknownNode(node))?
            .to_string();
        let route = db.route_string(node)?;
        Ok(Resolved { uuid, route })
    }

    async fn nodes(&self) -> Vec<NodeId> {
        let db = self.db.read().await;
        let mut nodes: Vec<NodeId> = db.get_nodes().keys().copied().collect();
        nodes.sort_unstable();
        nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_through_shared_handle() {
        let topology = SharedTopology::default();
        let (first, first_uuid) = topology.write().await.add_node(None).unwrap();
        let (second, second_uuid) = topology.write().await.add_node(Some(first)).unwrap();

        let resolved = topology.resolve(second).await.unwrap();
        assert_eq!(resolved.uuid, second_uuid);
        assert_eq!(resolved.route, first_uuid);

        assert_eq!(topology.nodes().await, vec![first, second]);
        assert_eq!(
            topology.resolve(7).await,
            Err(TopologyError::UnknownNode(7))
        );
    }
}
