//! Membership oracle client.
//!
//! The real oracle (Helix in production) owns leader election and
//! failure detection for every `(store_version, partition)` pair and
//! pushes role assignments to replicas; consensus itself is entirely
//! external and is not reimplemented here. This crate defines the
//! narrow interface the ingestion core depends on to learn its role
//! and react to role changes, plus a deterministic in-memory
//! implementation used by tests and single-node deployments.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info};

use venice_common::config::ClusterConfig;
use venice_common::error::Result;
use venice_common::types::{ClusterStatus, NodeId, NodeInfo, NodeStatus, PartitionId, ReplicaRole, Timestamp};

/// What the ingestion core needs from the external membership oracle:
/// the current role for a partition, and a way to react when the
/// oracle reassigns it.
#[async_trait]
pub trait MembershipOracle: Send + Sync {
    /// Current role for `(store_version, partition)`. Defaults replicas
    /// to `Follower` until the oracle assigns otherwise.
    async fn role_for(&self, store_version: &str, partition: PartitionId) -> Result<ReplicaRole>;

    /// A channel that yields a new value every time the oracle changes
    /// this partition's role assignment. The Partition Ingestor's state
    /// machine watches this to trigger FOLLOWER/LEADER transitions.
    fn watch_role(&self, store_version: &str, partition: PartitionId) -> watch::Receiver<ReplicaRole>;

    /// Snapshot of node liveness as last reported by the oracle.
    async fn cluster_status(&self) -> Result<ClusterStatus>;

    async fn shutdown(&self) -> Result<()>;
}

/// Deterministic in-memory membership oracle. Holds one `watch` channel
/// per `(store_version, partition)` and lets a test or a single-node
/// deployment drive role assignment directly with `assign_role`,
/// instead of running real leader-election consensus.
pub struct StaticMembershipOracle {
    cluster: ClusterConfig,
    roles: DashMap<(String, PartitionId), watch::Sender<ReplicaRole>>,
    nodes: DashMap<NodeId, NodeInfo>,
    running: Arc<RwLock<bool>>,
}

impl StaticMembershipOracle {
    pub fn new(cluster: &ClusterConfig) -> Self {
        info!(cluster = %cluster.name, "starting static membership oracle");
        let nodes = DashMap::new();
        nodes.insert(
            cluster.node_id,
            NodeInfo {
                id: cluster.node_id,
                address: "127.0.0.1:0".to_string(),
                status: NodeStatus::Online,
                last_heartbeat: 0,
                metadata: Default::default(),
            },
        );
        Self {
            cluster: cluster.clone(),
            roles: DashMap::new(),
            nodes,
            running: Arc::new(RwLock::new(true)),
        }
    }

    fn sender(&self, store_version: &str, partition: PartitionId) -> watch::Sender<ReplicaRole> {
        self.roles
            .entry((store_version.to_string(), partition))
            .or_insert_with(|| watch::channel(ReplicaRole::Follower).0)
            .clone()
    }

    /// Assign a role, as the real oracle would when it promotes or
    /// demotes a replica. Idempotent: assigning the current role is a
    /// no-op and does not wake watchers.
    pub fn assign_role(&self, store_version: &str, partition: PartitionId, role: ReplicaRole) {
        debug!(store_version, partition, ?role, "assigning replica role");
        let sender = self.sender(store_version, partition);
        sender.send_if_modified(|current| {
            if *current == role {
                false
            } else {
                *current = role;
                true
            }
        });
    }

    pub fn set_node_status(&self, node_id: NodeId, status: NodeStatus) {
        if let Some(mut node) = self.nodes.get_mut(&node_id) {
            node.status = status;
        }
    }

    pub fn heartbeat(&self, node_id: NodeId, address: &str, at: Timestamp) {
        self.nodes
            .entry(node_id)
            .and_modify(|n| n.last_heartbeat = at)
            .or_insert_with(|| NodeInfo {
                id: node_id,
                address: address.to_string(),
                status: NodeStatus::Online,
                last_heartbeat: at,
                metadata: Default::default(),
            });
    }
}

#[async_trait]
impl MembershipOracle for StaticMembershipOracle {
    async fn role_for(&self, store_version: &str, partition: PartitionId) -> Result<ReplicaRole> {
        Ok(*self.sender(store_version, partition).borrow())
    }

    fn watch_role(&self, store_version: &str, partition: PartitionId) -> watch::Receiver<ReplicaRole> {
        self.sender(store_version, partition).subscribe()
    }

    async fn cluster_status(&self) -> Result<ClusterStatus> {
        let nodes: Vec<NodeInfo> = self.nodes.iter().map(|e| e.value().clone()).collect();
        let healthy_nodes = nodes.iter().filter(|n| n.status == NodeStatus::Online).count();
        Ok(ClusterStatus {
            name: self.cluster.name.clone(),
            healthy_nodes,
            total_partitions: self.roles.len() as u32,
            nodes,
        })
    }

    async fn shutdown(&self) -> Result<()> {
        info!("shutting down static membership oracle");
        *self.running.write() = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oracle() -> StaticMembershipOracle {
        StaticMembershipOracle::new(&ClusterConfig {
            name: "test-cluster".to_string(),
            node_id: 1,
        })
    }

    #[tokio::test]
    async fn defaults_to_follower() {
        let o = oracle();
        assert_eq!(o.role_for("store_v1", 0).await.unwrap(), ReplicaRole::Follower);
    }

    #[tokio::test]
    async fn assign_role_updates_current_value() {
        let o = oracle();
        o.assign_role("store_v1", 0, ReplicaRole::Leader);
        assert_eq!(o.role_for("store_v1", 0).await.unwrap(), ReplicaRole::Leader);
    }

    #[tokio::test]
    async fn watchers_observe_role_changes() {
        let o = oracle();
        let mut rx = o.watch_role("store_v1", 0);
        assert_eq!(*rx.borrow(), ReplicaRole::Follower);
        o.assign_role("store_v1", 0, ReplicaRole::Leader);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ReplicaRole::Leader);
    }

    #[tokio::test]
    async fn reassigning_same_role_does_not_notify_watchers() {
        let o = oracle();
        let mut rx = o.watch_role("store_v1", 0);
        o.assign_role("store_v1", 0, ReplicaRole::Follower);
        assert!(rx.has_changed().unwrap() == false);
    }

    #[tokio::test]
    async fn cluster_status_reflects_node_health() {
        let o = oracle();
        assert_eq!(o.cluster_status().await.unwrap().healthy_nodes, 1);
        o.set_node_status(1, NodeStatus::Offline);
        assert_eq!(o.cluster_status().await.unwrap().healthy_nodes, 0);
    }

    #[tokio::test]
    async fn partitions_have_independent_roles() {
        let o = oracle();
        o.assign_role("store_v1", 0, ReplicaRole::Leader);
        assert_eq!(o.role_for("store_v1", 1).await.unwrap(), ReplicaRole::Follower);
    }
}
