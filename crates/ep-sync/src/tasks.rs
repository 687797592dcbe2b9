use std::collections::BTreeMap;
use std::sync::Arc;

use ep_storage::{now_secs, TaskFilter, TaskStore};
use ep_types::{ChangeTask, NodeId, NodeRole, PlaneError, TaskId, TaskKey};

/// Deduplicated record of "this scope needs its configuration re-applied".
///
/// Wraps the storage primitives with the no-op rule, the failure
/// quarantine and node ownership checks.
pub struct ChangeTaskStore<S> {
    store: Arc<S>,
    max_failures: u32,
}

impl<S: TaskStore> ChangeTaskStore<S> {
    pub fn new(store: Arc<S>, max_failures: u32) -> Self {
        ChangeTaskStore { store, max_failures }
    }

    /// Insert or reset the task for `key`. Returns `None` without writing
    /// when the key addresses nothing.
    pub async fn upsert(&self, key: TaskKey) -> Result<Option<TaskId>, PlaneError> {
        if key.is_noop() {
            return Ok(None);
        }
        let id = self.store.upsert_task(key, now_secs()).await?;
        tracing::debug!(
            task_id = id,
            role = %key.role,
            cluster_id = key.cluster_id,
            scope = key.scope.kind_str(),
            scope_id = key.scope.id(),
            task_type = key.task_type.as_str(),
            "change task upserted"
        );
        Ok(Some(id))
    }

    /// Open tasks plus retryable failures, oldest first.
    pub async fn list_pending(&self, role: NodeRole) -> Result<Vec<ChangeTask>, PlaneError> {
        self.store
            .list_tasks(role, TaskFilter::Pending { max_failures: self.max_failures })
            .await
    }

    pub async fn list_all(&self, role: NodeRole) -> Result<Vec<ChangeTask>, PlaneError> {
        self.store.list_tasks(role, TaskFilter::All).await
    }

    pub async fn get(&self, id: TaskId) -> Result<Option<ChangeTask>, PlaneError> {
        self.store.get_task(id).await
    }

    /// Pending tasks addressed to one node.
    pub async fn list_for_node(&self, role: NodeRole, node_id: NodeId) -> Result<Vec<ChangeTask>, PlaneError> {
        Ok(self
            .list_pending(role)
            .await?
            .into_iter()
            .filter(|t| t.key.scope.node_id() == Some(node_id))
            .collect())
    }

    /// Nodes holding pending, not yet notified tasks, with those task ids.
    pub async fn nodes_to_notify(&self, role: NodeRole) -> Result<BTreeMap<NodeId, Vec<TaskId>>, PlaneError> {
        let mut out: BTreeMap<NodeId, Vec<TaskId>> = BTreeMap::new();
        for task in self.list_pending(role).await? {
            if task.is_notified {
                continue;
            }
            if let Some(node_id) = task.key.scope.node_id() {
                out.entry(node_id).or_default().push(task.id);
            }
        }
        Ok(out)
    }

    pub async fn mark_notified(&self, ids: Vec<TaskId>) -> Result<(), PlaneError> {
        self.store.mark_tasks_notified(ids).await
    }

    pub async fn mark_done(&self, id: TaskId) -> Result<(), PlaneError> {
        self.store.mark_task_done(id, now_secs()).await
    }

    /// Mark `task` done unless it was upserted again since it was read.
    /// Returns false when a newer change is still waiting.
    pub async fn mark_done_if_unchanged(&self, task: &ChangeTask) -> Result<bool, PlaneError> {
        self.store.mark_task_done_if(task.id, task.revision, now_secs()).await
    }

    pub async fn mark_failed(&self, id: TaskId, error: impl Into<String>) -> Result<ChangeTask, PlaneError> {
        let task = self.store.mark_task_failed(id, error.into(), now_secs()).await?;
        if task.count_fails == self.max_failures {
            tracing::warn!(
                task_id = id,
                count_fails = task.count_fails,
                error = %task.error,
                "change task quarantined until next upsert"
            );
        }
        Ok(task)
    }

    /// Apply a node's completion report. A node may only resolve tasks that
    /// are addressed to it.
    pub async fn report(
        &self,
        node_id: NodeId,
        task_id: TaskId,
        is_ok: bool,
        error: &str,
    ) -> Result<(), PlaneError> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| PlaneError::NotFound(format!("task {task_id}")))?;
        if task.key.scope.node_id() != Some(node_id) {
            return Err(PlaneError::InvalidArgument(format!(
                "task {task_id} is not addressed to node {node_id}"
            )));
        }
        if is_ok {
            self.mark_done(task_id).await
        } else {
            self.mark_failed(task_id, error).await.map(|_| ())
        }
    }

    pub async fn delete(&self, id: TaskId) -> Result<bool, PlaneError> {
        self.store.delete_task(id).await
    }

    pub async fn purge_done_before(&self, before: i64) -> Result<usize, PlaneError> {
        self.store.purge_tasks(before).await
    }
}
