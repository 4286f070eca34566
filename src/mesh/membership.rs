//! Keeps the hash ring in step with cluster membership.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::info;

use super::Cluster;
use crate::sharding::ConsistentHashRing;
use crate::tasks::PeriodicTask;

/// Make the ring's node set equal `live_nodes`.
///
/// Only the difference is applied, so keys owned by nodes present on both
/// sides never move. Returns the `(added, removed)` node ids.
pub fn reconcile_ring(ring: &mut ConsistentHashRing, live_nodes: &[String]) -> (Vec<String>, Vec<String>) {
    let live: HashSet<&str> = live_nodes.iter().map(String::as_str).collect();

    let removed: Vec<String> = ring
        .get_node_list()
        .into_iter()
        .filter(|node| !live.contains(node.as_str()))
        .collect();
    for node in &removed {
        ring.remove_node(node);
    }

    let mut added = Vec::new();
    for node in live_nodes {
        if !ring.contains_node(node) {
            ring.add_node(node);
            added.push(node.clone());
        }
    }

    (added, removed)
}

/// Periodically reconcile `ring` against the cluster's live nodes.
pub fn spawn_membership_sync(
    cluster: Arc<Cluster>,
    ring: Arc<RwLock<ConsistentHashRing>>,
    period: Duration,
) -> PeriodicTask {
    PeriodicTask::spawn("ring-membership", period, move || {
        let cluster = Arc::clone(&cluster);
        let ring = Arc::clone(&ring);
        async move {
            let live = cluster.live_nodes().await;
            let (added, removed) = reconcile_ring(&mut ring.write(), &live);
            if !added.is_empty() || !removed.is_empty() {
                info!(?added, ?removed, nodes = live.len(), "Hash ring membership changed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::ClusterConfig;

    fn nodes(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_reconcile_adds_and_removes() {
        let mut ring = ConsistentHashRing::new(50);
        ring.add_node("a");
        ring.add_node("b");

        let (added, removed) = reconcile_ring(&mut ring, &nodes(&["b", "c"]));

        assert_eq!(added, nodes(&["c"]));
        assert_eq!(removed, nodes(&["a"]));
        assert_eq!(ring.get_node_list(), nodes(&["b", "c"]));
        assert_eq!(ring.get_ring_size(), 100);
    }

    #[test]
    fn test_reconcile_is_noop_when_unchanged() {
        let mut ring = ConsistentHashRing::new(50);
        reconcile_ring(&mut ring, &nodes(&["a", "b"]));
        let owner = ring.get_node("key").map(str::to_string);

        let (added, removed) = reconcile_ring(&mut ring, &nodes(&["b", "a"]));

        assert!(added.is_empty());
        assert!(removed.is_empty());
        assert_eq!(ring.get_node("key").map(str::to_string), owner);
    }

    #[test]
    fn test_reconcile_to_empty() {
        let mut ring = ConsistentHashRing::new(10);
        ring.add_node("a");

        let (_, removed) = reconcile_ring(&mut ring, &[]);

        assert_eq!(removed, nodes(&["a"]));
        assert_eq!(ring.get_node("key"), None);
    }

    #[tokio::test]
    async fn test_sync_task_adds_self() {
        let addr: std::net::SocketAddr = ([127, 0, 0, 1], 27960).into();
        let cluster = Arc::new(
            Cluster::start(ClusterConfig {
                node_id: "sync-node".to_string(),
                listen_addr: addr,
                advertise_addr: addr,
                cluster_id: "test-cluster".to_string(),
                gossip_interval: Duration::from_millis(50),
                ..Default::default()
            })
            .await
            .unwrap(),
        );
        let ring = Arc::new(RwLock::new(ConsistentHashRing::new(10)));

        let task = spawn_membership_sync(Arc::clone(&cluster), Arc::clone(&ring), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.shutdown().await;

        assert_eq!(ring.read().get_node_list(), nodes(&["sync-node"]));
        cluster.shutdown().await.unwrap();
    }
}
