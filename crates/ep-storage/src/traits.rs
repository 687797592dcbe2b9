use std::future::Future;

use ep_types::{
    ChangeTask, ClusterId, EntityDraft, EntityId, EntityKind, NodeId, NodeRecord, NodeRole,
    PlaneError, SyncEntity, TaskId, TaskKey, Version,
};

use crate::types::TaskFilter;

/// Persisted counters and versioned entities.
///
/// Methods use RPITIT (`-> impl Future + Send`) so the sync core can stay
/// generic over the backend without an `async-trait` dependency.
pub trait VersionStore: Send + Sync + 'static {
    /// Atomically add `delta` to the named counter and return the new value.
    /// A counter that does not exist yet starts at 0.
    fn increment(&self, counter: &str, delta: i64)
        -> impl Future<Output = Result<i64, PlaneError>> + Send;

    /// Stamp `draft` with the next version of its kind and write it.
    ///
    /// Allocation and write happen under one lock, so a reader can never
    /// observe version `v + 1` of a kind while `v` is still unwritten.
    /// `draft.id == 0` allocates a new id; any other id must already exist.
    fn commit_entity(&self, draft: EntityDraft)
        -> impl Future<Output = Result<SyncEntity, PlaneError>> + Send;

    fn get_entity(&self, kind: EntityKind, id: EntityId)
        -> impl Future<Output = Result<Option<SyncEntity>, PlaneError>> + Send;

    /// Entities of `kind` with `version > since`, ascending by version, at
    /// most `limit` of them. Soft-deleted entities are included.
    fn list_after_version(&self, kind: EntityKind, since: Version, limit: usize)
        -> impl Future<Output = Result<Vec<SyncEntity>, PlaneError>> + Send;
}

/// Durable, deduplicated change tasks.
pub trait TaskStore: Send + Sync + 'static {
    /// Insert a task for `key`, or reset the existing one to pending.
    ///
    /// Resetting clears `is_done`, `is_ok`, `error` and `is_notified` and
    /// refreshes `updated_at` and bumps `revision`; `count_fails` is kept.
    fn upsert_task(&self, key: TaskKey, now: i64)
        -> impl Future<Output = Result<TaskId, PlaneError>> + Send;

    fn get_task(&self, id: TaskId)
        -> impl Future<Output = Result<Option<ChangeTask>, PlaneError>> + Send;

    /// Tasks for `role` matching `filter`, ascending by id.
    fn list_tasks(&self, role: NodeRole, filter: TaskFilter)
        -> impl Future<Output = Result<Vec<ChangeTask>, PlaneError>> + Send;

    fn mark_task_done(&self, id: TaskId, now: i64)
        -> impl Future<Output = Result<(), PlaneError>> + Send;

    /// Mark the task done only if its `revision` still equals `revision`.
    /// Returns whether the write happened.
    fn mark_task_done_if(&self, id: TaskId, revision: u64, now: i64)
        -> impl Future<Output = Result<bool, PlaneError>> + Send;

    /// Mark the task done-but-failed and bump `count_fails`. Returns the
    /// updated task.
    fn mark_task_failed(&self, id: TaskId, error: String, now: i64)
        -> impl Future<Output = Result<ChangeTask, PlaneError>> + Send;

    /// Unknown ids are ignored.
    fn mark_tasks_notified(&self, ids: Vec<TaskId>)
        -> impl Future<Output = Result<(), PlaneError>> + Send;

    /// Returns whether a task was removed.
    fn delete_task(&self, id: TaskId)
        -> impl Future<Output = Result<bool, PlaneError>> + Send;

    /// Remove successful tasks last updated before `done_before`. Returns the
    /// number removed.
    fn purge_tasks(&self, done_before: i64)
        -> impl Future<Output = Result<usize, PlaneError>> + Send;
}

/// Registered nodes and their persisted liveness.
pub trait NodeStore: Send + Sync + 'static {
    fn put_node(&self, node: NodeRecord)
        -> impl Future<Output = Result<(), PlaneError>> + Send;

    fn get_node(&self, id: NodeId)
        -> impl Future<Output = Result<Option<NodeRecord>, PlaneError>> + Send;

    /// `cluster_id == None` lists every node of the role.
    fn list_nodes(&self, role: NodeRole, cluster_id: Option<ClusterId>)
        -> impl Future<Output = Result<Vec<NodeRecord>, PlaneError>> + Send;

    /// Persist the node's active flag and return the record as it was
    /// before the write. Unknown nodes are `NotFound`.
    fn set_node_active(&self, id: NodeId, active: bool, now: i64)
        -> impl Future<Output = Result<NodeRecord, PlaneError>> + Send;
}

/// Everything the sync core needs from storage.
pub trait SyncStorage: VersionStore + TaskStore + NodeStore {}

impl<T: VersionStore + TaskStore + NodeStore> SyncStorage for T {}
