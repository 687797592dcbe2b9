use std::collections::HashMap;
use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use ep_types::NodeId;
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;

use crate::message::Frame;

/// Live connection state for one node.
pub struct NodeConnection {
    /// Distinguishes successive connections of the same node.
    pub conn_id: u64,
    pub queue: mpsc::Sender<Frame>,
    pub send_task: AbortHandle,
}

/// Node id to live connection. At most one connection per node; a newer
/// connection replaces the older one.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<HashMap<NodeId, NodeConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `conn`, returning the connection it replaced.
    pub async fn insert(&self, node_id: NodeId, conn: NodeConnection) -> Option<NodeConnection> {
        self.inner.lock().await.insert(node_id, conn)
    }

    pub async fn sender(&self, node_id: NodeId) -> Option<mpsc::Sender<Frame>> {
        self.inner.lock().await.get(&node_id).map(|c| c.queue.clone())
    }

    /// Remove the node's entry only if it still belongs to `conn_id`.
    pub async fn remove_if(&self, node_id: NodeId, conn_id: u64) -> Option<NodeConnection> {
        let mut inner = self.inner.lock().await;
        match inner.get(&node_id) {
            Some(c) if c.conn_id == conn_id => inner.remove(&node_id),
            _ => None,
        }
    }

    pub async fn is_connected(&self, node_id: NodeId) -> bool {
        self.inner.lock().await.contains_key(&node_id)
    }

    /// Connected node ids, sorted.
    pub async fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.inner.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

}

struct PendingRequest {
    node_id: NodeId,
    created_at: Instant,
    slot: mpsc::Sender<Frame>,
}

/// Request id to the waiter for its reply.
///
/// Guarded by a plain mutex: every critical section is a map operation, and
/// [`PendingGuard`] must be able to remove its entry from `Drop`.
#[derive(Default)]
pub struct PendingRequestRegistry {
    inner: StdMutex<HashMap<i64, PendingRequest>>,
}

/// Outcome of routing an inbound reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivered {
    Yes,
    NoWaiter,
    SlotFull,
    /// The request was addressed to a different node.
    WrongNode,
}

impl PendingRequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<i64, PendingRequest>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a waiter and return the receiving end of its single slot.
    /// The entry lives until the returned guard is dropped or it is swept.
    pub fn register(&self, request_id: i64, node_id: NodeId) -> (PendingGuard<'_>, mpsc::Receiver<Frame>) {
        let (slot, rx) = mpsc::channel(1);
        self.map()
            .insert(request_id, PendingRequest { node_id, created_at: Instant::now(), slot });
        (PendingGuard { registry: self, request_id }, rx)
    }

    pub fn remove(&self, request_id: i64) -> bool {
        self.map().remove(&request_id).is_some()
    }

    /// Hand a reply from `from` to its waiter without blocking. The entry is
    /// left for the waiter to remove.
    pub fn deliver(&self, from: NodeId, frame: Frame) -> Delivered {
        let inner = self.map();
        let Some(req) = inner.get(&frame.request_id) else {
            return Delivered::NoWaiter;
        };
        if req.node_id != from {
            return Delivered::WrongNode;
        }
        match req.slot.try_send(frame) {
            Ok(()) => Delivered::Yes,
            Err(mpsc::error::TrySendError::Full(_)) => Delivered::SlotFull,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivered::NoWaiter,
        }
    }

    /// Drop entries older than `max_age`. Their waiters observe a closed
    /// slot. Returns `(request_id, node_id)` of each removed entry.
    pub fn sweep(&self, max_age: Duration) -> Vec<(i64, NodeId)> {
        let mut inner = self.map();
        let now = Instant::now();
        let expired: Vec<(i64, NodeId)> = inner
            .iter()
            .filter(|(_, r)| now.duration_since(r.created_at) >= max_age)
            .map(|(id, r)| (*id, r.node_id))
            .collect();
        for (id, _) in &expired {
            inner.remove(id);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes its pending request when dropped, including when the waiting
/// future is cancelled.
pub struct PendingGuard<'a> {
    registry: &'a PendingRequestRegistry,
    request_id: i64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.registry.remove(self.request_id);
    }
}
