use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;

use ep_types::{
    ChangeTask, ClusterId, EntityDraft, EntityId, EntityKind, NodeId, NodeRecord, NodeRole,
    PlaneError, SyncEntity, TaskId, TaskKey, Version,
};

use crate::now_secs;
use crate::traits::{NodeStore, TaskStore, VersionStore};
use crate::types::TaskFilter;

struct MemInner {
    counters: HashMap<String, i64>,
    entities: BTreeMap<(EntityKind, EntityId), SyncEntity>,
    /// (kind, version) → id, the delta-sync scan order.
    versions: BTreeMap<(EntityKind, Version), EntityId>,
    tasks: BTreeMap<TaskId, ChangeTask>,
    task_keys: HashMap<TaskKey, TaskId>,
    next_task_id: TaskId,
    nodes: BTreeMap<NodeId, NodeRecord>,
}

impl MemInner {
    fn bump(&mut self, counter: &str, delta: i64) -> i64 {
        let value = self.counters.entry(counter.to_string()).or_insert(0);
        *value += delta;
        *value
    }

    fn task_mut(&mut self, id: TaskId) -> Result<&mut ChangeTask, PlaneError> {
        self.tasks
            .get_mut(&id)
            .ok_or_else(|| PlaneError::NotFound(format!("task {id}")))
    }
}

/// In-memory implementation of every storage trait behind one `RwLock`.
///
/// Intended for tests and `--memory` runs; not persisted across restarts.
#[derive(Clone)]
pub struct MemStore {
    inner: Arc<RwLock<MemInner>>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore {
            inner: Arc::new(RwLock::new(MemInner {
                counters: HashMap::new(),
                entities: BTreeMap::new(),
                versions: BTreeMap::new(),
                tasks: BTreeMap::new(),
                task_keys: HashMap::new(),
                next_task_id: 1,
                nodes: BTreeMap::new(),
            })),
        }
    }

    /// Number of stored task rows, including done ones.
    pub async fn task_count(&self) -> usize {
        self.inner.read().await.tasks.len()
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionStore for MemStore {
    async fn increment(&self, counter: &str, delta: i64) -> Result<i64, PlaneError> {
        Ok(self.inner.write().await.bump(counter, delta))
    }

    async fn commit_entity(&self, draft: EntityDraft) -> Result<SyncEntity, PlaneError> {
        let mut g = self.inner.write().await;
        let kind = draft.kind;

        let previous = if draft.id == 0 {
            None
        } else {
            let found = g
                .entities
                .get(&(kind, draft.id))
                .cloned()
                .ok_or_else(|| PlaneError::NotFound(format!("{kind:?} {}", draft.id)))?;
            Some(found)
        };

        let id = if draft.id == 0 { g.bump(kind.id_counter(), 1) } else { draft.id };
        let version = g.bump(kind.version_counter(), 1);

        if let Some(prev) = previous {
            g.versions.remove(&(kind, prev.version));
        }
        let entity = SyncEntity {
            kind,
            id,
            version,
            is_deleted: draft.is_deleted,
            payload: draft.payload,
            updated_at: now_secs(),
        };
        g.versions.insert((kind, version), id);
        g.entities.insert((kind, id), entity.clone());
        Ok(entity)
    }

    async fn get_entity(&self, kind: EntityKind, id: EntityId) -> Result<Option<SyncEntity>, PlaneError> {
        Ok(self.inner.read().await.entities.get(&(kind, id)).cloned())
    }

    async fn list_after_version(
        &self,
        kind: EntityKind,
        since: Version,
        limit: usize,
    ) -> Result<Vec<SyncEntity>, PlaneError> {
        let g = self.inner.read().await;
        let start = since.saturating_add(1);
        Ok(g.versions
            .range((kind, start)..=(kind, Version::MAX))
            .take(limit)
            .filter_map(|(_, id)| g.entities.get(&(kind, *id)).cloned())
            .collect())
    }
}

impl TaskStore for MemStore {
    async fn upsert_task(&self, key: TaskKey, now: i64) -> Result<TaskId, PlaneError> {
        let mut g = self.inner.write().await;
        if let Some(&id) = g.task_keys.get(&key) {
            let task = g.task_mut(id)?;
            task.updated_at = now;
            task.is_done = false;
            task.is_ok = false;
            task.error.clear();
            task.is_notified = false;
            task.revision += 1;
            return Ok(id);
        }

        let id = g.next_task_id;
        g.next_task_id += 1;
        g.tasks.insert(
            id,
            ChangeTask {
                id,
                key,
                updated_at: now,
                is_done: false,
                is_ok: false,
                error: String::new(),
                count_fails: 0,
                is_notified: false,
                revision: 1,
            },
        );
        g.task_keys.insert(key, id);
        Ok(id)
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<ChangeTask>, PlaneError> {
        Ok(self.inner.read().await.tasks.get(&id).cloned())
    }

    async fn list_tasks(&self, role: NodeRole, filter: TaskFilter) -> Result<Vec<ChangeTask>, PlaneError> {
        let g = self.inner.read().await;
        Ok(g.tasks
            .values()
            .filter(|t| t.key.role == role && filter.matches(t))
            .cloned()
            .collect())
    }

    async fn mark_task_done(&self, id: TaskId, now: i64) -> Result<(), PlaneError> {
        let mut g = self.inner.write().await;
        let task = g.task_mut(id)?;
        task.is_done = true;
        task.is_ok = true;
        task.error.clear();
        task.updated_at = now;
        Ok(())
    }

    async fn mark_task_done_if(&self, id: TaskId, revision: u64, now: i64) -> Result<bool, PlaneError> {
        let mut g = self.inner.write().await;
        let task = g.task_mut(id)?;
        if task.revision != revision {
            return Ok(false);
        }
        task.is_done = true;
        task.is_ok = true;
        task.error.clear();
        task.updated_at = now;
        Ok(true)
    }

    async fn mark_task_failed(&self, id: TaskId, error: String, now: i64) -> Result<ChangeTask, PlaneError> {
        let mut g = self.inner.write().await;
        let task = g.task_mut(id)?;
        task.is_done = true;
        task.is_ok = false;
        task.error = error;
        task.count_fails += 1;
        task.updated_at = now;
        Ok(task.clone())
    }

    async fn mark_tasks_notified(&self, ids: Vec<TaskId>) -> Result<(), PlaneError> {
        let mut g = self.inner.write().await;
        for id in ids {
            if let Some(task) = g.tasks.get_mut(&id) {
                task.is_notified = true;
            }
        }
        Ok(())
    }

    async fn delete_task(&self, id: TaskId) -> Result<bool, PlaneError> {
        let mut g = self.inner.write().await;
        match g.tasks.remove(&id) {
            Some(task) => {
                g.task_keys.remove(&task.key);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn purge_tasks(&self, done_before: i64) -> Result<usize, PlaneError> {
        let mut g = self.inner.write().await;
        let expired: Vec<ChangeTask> = g
            .tasks
            .values()
            .filter(|t| t.is_done && t.is_ok && t.updated_at < done_before)
            .cloned()
            .collect();
        for task in &expired {
            g.tasks.remove(&task.id);
            g.task_keys.remove(&task.key);
        }
        Ok(expired.len())
    }
}

impl NodeStore for MemStore {
    async fn put_node(&self, node: NodeRecord) -> Result<(), PlaneError> {
        self.inner.write().await.nodes.insert(node.id, node);
        Ok(())
    }

    async fn get_node(&self, id: NodeId) -> Result<Option<NodeRecord>, PlaneError> {
        Ok(self.inner.read().await.nodes.get(&id).cloned())
    }

    async fn list_nodes(
        &self,
        role: NodeRole,
        cluster_id: Option<ClusterId>,
    ) -> Result<Vec<NodeRecord>, PlaneError> {
        let g = self.inner.read().await;
        Ok(g.nodes
            .values()
            .filter(|n| n.role == role && cluster_id.map_or(true, |c| n.cluster_id == c))
            .cloned()
            .collect())
    }

    async fn set_node_active(&self, id: NodeId, active: bool, now: i64) -> Result<NodeRecord, PlaneError> {
        let mut g = self.inner.write().await;
        let node = g
            .nodes
            .get_mut(&id)
            .ok_or_else(|| PlaneError::NotFound(format!("node {id}")))?;
        let before = node.clone();
        node.is_active = Some(active);
        node.status_updated_at = now;
        Ok(before)
    }
}
