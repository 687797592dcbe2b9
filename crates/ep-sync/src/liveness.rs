use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ep_storage::{now_secs, NodeStore};
use ep_types::{Liveness, NodeId, PlaneError};
use tokio::sync::Mutex;

use crate::notify::{NodeScope, Notifier, Severity};

/// Id of the connection whose state was last persisted for a node.
type Epoch = Arc<Mutex<Option<u64>>>;

/// Persists node connect/disconnect transitions and raises the operator
/// "recovered" notification.
///
/// Writes for one node are serialized through its epoch, and a disconnect
/// is only persisted for the connection that wrote the last connect.
pub struct LivenessMonitor<S, N> {
    store: Arc<S>,
    notifier: Arc<N>,
    cooldown: Duration,
    epochs: Mutex<HashMap<NodeId, Epoch>>,
    last_recovery: Mutex<HashMap<NodeId, Instant>>,
}

impl<S: NodeStore, N: Notifier> LivenessMonitor<S, N> {
    pub fn new(store: Arc<S>, notifier: Arc<N>, cooldown: Duration) -> Self {
        LivenessMonitor {
            store,
            notifier,
            cooldown,
            epochs: Mutex::new(HashMap::new()),
            last_recovery: Mutex::new(HashMap::new()),
        }
    }

    async fn epoch(&self, node_id: NodeId) -> Epoch {
        self.epochs.lock().await.entry(node_id).or_default().clone()
    }

    /// Record connection `conn_id` as the node's live one. Returns the state
    /// the node was in before.
    pub async fn on_connect(&self, node_id: NodeId, conn_id: u64) -> Result<Liveness, PlaneError> {
        let epoch = self.epoch(node_id).await;
        let mut current = epoch.lock().await;
        let before = self.store.set_node_active(node_id, true, now_secs()).await?;
        *current = Some(conn_id);
        drop(current);
        let previous = Liveness::from(before.is_active);
        if previous != Liveness::Inactive {
            tracing::debug!(node_id, ?previous, "node connected");
            return Ok(previous);
        }

        let due = {
            let mut last = self.last_recovery.lock().await;
            let now = Instant::now();
            match last.get(&node_id) {
                Some(at) if now.duration_since(*at) < self.cooldown => false,
                _ => {
                    last.insert(node_id, now);
                    true
                }
            }
        };
        tracing::info!(node_id, name = %before.name, notified = due, "node recovered");
        if due {
            let scope = NodeScope { role: before.role, cluster_id: before.cluster_id, node_id };
            self.notifier
                .notify(
                    scope,
                    Severity::Info,
                    format!("node {} recovered", before.name),
                    format!("{} node {} ({node_id}) reconnected to the control plane", before.role, before.name),
                )
                .await;
        }
        Ok(previous)
    }

    /// Record that connection `conn_id` is gone. Nothing is written when a
    /// newer connection has connected since; returns whether the node was
    /// marked inactive.
    pub async fn on_disconnect(&self, node_id: NodeId, conn_id: u64) -> Result<bool, PlaneError> {
        let epoch = self.epoch(node_id).await;
        let mut current = epoch.lock().await;
        if *current != Some(conn_id) {
            tracing::debug!(node_id, conn_id, live = ?*current, "stale disconnect ignored");
            return Ok(false);
        }
        self.store.set_node_active(node_id, false, now_secs()).await?;
        *current = None;
        tracing::info!(node_id, conn_id, "node marked inactive");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::MemNotifier;
    use ep_storage::MemStore;
    use ep_types::{NodeRecord, NodeRole};

    async fn monitor(cooldown: Duration) -> (Arc<MemStore>, Arc<MemNotifier>, LivenessMonitor<MemStore, MemNotifier>) {
        let store = Arc::new(MemStore::new());
        store
            .put_node(NodeRecord {
                id: 1,
                role: NodeRole::Edge,
                cluster_id: 2,
                name: "edge-1".into(),
                is_active: None,
                status_updated_at: 0,
            })
            .await
            .unwrap();
        let notifier = Arc::new(MemNotifier::new());
        let monitor = LivenessMonitor::new(store.clone(), notifier.clone(), cooldown);
        (store, notifier, monitor)
    }

    #[tokio::test]
    async fn first_connection_is_silent() {
        let (store, notifier, monitor) = monitor(Duration::from_secs(300)).await;
        assert_eq!(monitor.on_connect(1, 1).await.unwrap(), Liveness::Unknown);
        assert_eq!(store.get_node(1).await.unwrap().unwrap().is_active, Some(true));
        assert!(notifier.sent().await.is_empty());
    }

    #[tokio::test]
    async fn recovery_notifies_once_per_cooldown() {
        let (store, notifier, monitor) = monitor(Duration::from_secs(300)).await;
        monitor.on_connect(1, 1).await.unwrap();
        for conn_id in 1..6 {
            assert!(monitor.on_disconnect(1, conn_id).await.unwrap());
            assert_eq!(store.get_node(1).await.unwrap().unwrap().is_active, Some(false));
            assert_eq!(monitor.on_connect(1, conn_id + 1).await.unwrap(), Liveness::Inactive);
        }
        let sent = notifier.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].scope, NodeScope { role: NodeRole::Edge, cluster_id: 2, node_id: 1 });
        assert_eq!(sent[0].subject, "node edge-1 recovered");
    }

    #[tokio::test]
    async fn reconnect_while_active_is_silent() {
        let (_, notifier, monitor) = monitor(Duration::ZERO).await;
        monitor.on_connect(1, 1).await.unwrap();
        assert_eq!(monitor.on_connect(1, 2).await.unwrap(), Liveness::Active);
        assert!(notifier.sent().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_node_is_not_found() {
        let (_, _, monitor) = monitor(Duration::ZERO).await;
        assert!(matches!(monitor.on_connect(99, 1).await, Err(PlaneError::NotFound(_))));
    }

    #[tokio::test]
    async fn disconnect_of_replaced_connection_is_ignored() {
        let (store, notifier, monitor) = monitor(Duration::ZERO).await;
        monitor.on_connect(1, 1).await.unwrap();
        monitor.on_connect(1, 2).await.unwrap();
        assert!(!monitor.on_disconnect(1, 1).await.unwrap());
        assert_eq!(store.get_node(1).await.unwrap().unwrap().is_active, Some(true));

        assert!(monitor.on_disconnect(1, 2).await.unwrap());
        assert!(!monitor.on_disconnect(1, 2).await.unwrap(), "already recorded");
        assert_eq!(store.get_node(1).await.unwrap().unwrap().is_active, Some(false));
        assert!(notifier.sent().await.is_empty());
    }
}
