use std::sync::Arc;

use serde::Serialize;

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::raft::node::{Node, NodeStatus};
use crate::raft::state::{NodeId, Role};

/// Status of every member, as reported to operators.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    pub members: usize,
    pub leader: Option<NodeId>,
    pub nodes: Vec<NodeStatus>,
}

/// Static membership of a cluster.
///
/// Nodes keep a weak reference to the cluster after `start`, used only to
/// find their peers. The member list never changes, so reading it needs no
/// lock; each node guards its own state.
#[derive(Debug)]
pub struct Cluster {
    nodes: Vec<Arc<Node>>,
}

impl Cluster {
    pub fn new(nodes: Vec<Arc<Node>>) -> Arc<Self> {
        Arc::new(Self { nodes })
    }

    /// Build a cluster of `count` nodes with ids `0..count`.
    pub fn with_nodes(count: usize, config: RaftConfig) -> Arc<Self> {
        let nodes = (0..count as u64)
            .map(|id| Node::new(id, config.clone()))
            .collect();
        Self::new(nodes)
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: NodeId) -> Option<&Arc<Node>> {
        self.nodes.iter().find(|node| node.id() == id)
    }

    /// Every member except `requesting_id`. An unknown id gets all members.
    pub fn get_remote_followers(&self, requesting_id: NodeId) -> Vec<Arc<Node>> {
        self.nodes
            .iter()
            .filter(|node| node.id() != requesting_id)
            .cloned()
            .collect()
    }

    pub async fn start_all(self: &Arc<Self>) {
        for node in &self.nodes {
            node.start(self).await;
        }
        tracing::info!(members = self.nodes.len(), "Cluster started");
    }

    pub async fn stop_all(&self) {
        for node in &self.nodes {
            node.stop().await;
        }
        tracing::info!(members = self.nodes.len(), "Cluster stopped");
    }

    /// The member currently in the leader role.
    ///
    /// # Errors
    ///
    /// Returns `RaftError::NoLeader` if no member is leader.
    pub async fn find_leader(&self) -> Result<Arc<Node>> {
        for node in &self.nodes {
            if node.is_leader().await {
                return Ok(node.clone());
            }
        }
        Err(RaftError::NoLeader)
    }

    /// Stop the current leader and return it.
    pub async fn stop_leader(&self) -> Result<Arc<Node>> {
        let leader = self.find_leader().await?;
        leader.stop().await;
        tracing::info!(node_id = leader.id(), "Leader stopped");
        Ok(leader)
    }

    /// Check that the cluster has exactly one leader backed by a majority of
    /// followers. This is a diagnostic; the protocol never calls it.
    ///
    /// # Errors
    ///
    /// `MultipleLeaders`, `NoLeader` or `SplitBrain`, checked in that order.
    pub async fn check_invariant(&self) -> Result<()> {
        let mut leaders = 0;
        let mut followers = 0;
        let mut candidates = 0;

        for node in &self.nodes {
            match node.role().await {
                Role::Follower => followers += 1,
                Role::Candidate => candidates += 1,
                Role::Leader => leaders += 1,
            }
        }

        let members = self.nodes.len();
        let result = if leaders > 1 {
            Err(RaftError::MultipleLeaders(leaders))
        } else if leaders == 0 {
            Err(RaftError::NoLeader)
        } else if followers < members.div_ceil(2) {
            Err(RaftError::SplitBrain { followers, members })
        } else {
            Ok(())
        };

        if let Err(e) = &result {
            tracing::debug!(leaders, followers, candidates, members, error = %e, "Cluster invariant violated");
        }
        result
    }

    pub async fn status(&self) -> ClusterStatus {
        let mut nodes = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            nodes.push(node.snapshot().await);
        }
        let leader = nodes
            .iter()
            .find(|status| status.role == Role::Leader)
            .map(|status| status.id);

        ClusterStatus {
            members: nodes.len(),
            leader,
            nodes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(nodes: &[Arc<Node>]) -> Vec<NodeId> {
        let mut ids: Vec<_> = nodes.iter().map(|n| n.id()).collect();
        ids.sort_unstable();
        ids
    }

    #[test]
    fn test_get_remote_followers_excludes_requester() {
        let cluster = Cluster::with_nodes(5, RaftConfig::default());
        assert_eq!(ids(&cluster.get_remote_followers(2)), vec![0, 1, 3, 4]);
        // Membership itself is untouched
        assert_eq!(cluster.len(), 5);
    }

    #[test]
    fn test_get_remote_followers_unknown_id_returns_all() {
        let cluster = Cluster::with_nodes(3, RaftConfig::default());
        assert_eq!(ids(&cluster.get_remote_followers(42)), vec![0, 1, 2]);
    }

    #[test]
    fn test_get_node_by_id() {
        let cluster = Cluster::with_nodes(3, RaftConfig::default());
        assert_eq!(cluster.get(1).map(|n| n.id()), Some(1));
        assert!(cluster.get(7).is_none());
        assert!(!cluster.is_empty());
    }

    #[tokio::test]
    async fn test_fresh_cluster_has_no_leader() {
        let cluster = Cluster::with_nodes(3, RaftConfig::default());
        assert_eq!(cluster.find_leader().await.unwrap_err(), RaftError::NoLeader);
        assert_eq!(cluster.check_invariant().await, Err(RaftError::NoLeader));
        assert!(matches!(cluster.stop_leader().await, Err(RaftError::NoLeader)));

        let status = cluster.status().await;
        assert_eq!(status.members, 3);
        assert_eq!(status.leader, None);
        assert!(status.nodes.iter().all(|n| n.stopped && n.role == Role::Follower));
    }
}
