use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use ep_types::{
    ChangeTask, ClusterId, EntityDraft, EntityId, EntityKind, NodeId, NodeRecord, NodeRole,
    PlaneError, SyncEntity, TaskId, TaskKey, Version,
};

use crate::keys::{
    counter_key, decode_i64, entity_key, entity_kind_end, entity_version_key, node_key,
    task_index_key, task_key,
};
use crate::now_secs;
use crate::traits::{NodeStore, TaskStore, VersionStore};
use crate::types::TaskFilter;

/// Counter backing change-task ids.
const TASK_ID_COUNTER: &str = "CHANGE_TASK_ID";

fn encode<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, PlaneError> {
    bincode::serde::encode_to_vec(val, bincode::config::standard())
        .map_err(|e| PlaneError::Storage(e.to_string()))
}

fn decode<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T, PlaneError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| PlaneError::Storage(e.to_string()))
}

fn fjall_err(e: fjall::Error) -> PlaneError {
    PlaneError::Storage(e.to_string())
}

async fn blocking<T, F>(f: F) -> Result<T, PlaneError>
where
    F: FnOnce() -> Result<T, PlaneError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PlaneError::Storage(e.to_string()))?
}

// ---------------------------------------------------------------------------
// FjallStore: shared handle wrapping all keyspaces
// ---------------------------------------------------------------------------

/// Shared storage handle.
///
/// All keyspaces live in a single fjall `Database` so that cross-keyspace
/// write batches are atomic. Every read-modify-write path takes
/// `write_lock` first; this is the database-level lock that makes counter
/// increments and task upserts atomic for the single process that owns the
/// database directory.
pub struct FjallStore {
    pub db: fjall::Database,
    /// `name_utf8` → `value_be(8)`
    pub counters: fjall::Keyspace,
    /// `kind(1) ++ id(8)` → bincode(SyncEntity)
    pub entities: fjall::Keyspace,
    /// `kind(1) ++ version(8)` → `id(8)`
    pub entity_versions: fjall::Keyspace,
    /// `task_id(8)` → bincode(ChangeTask)
    pub tasks: fjall::Keyspace,
    /// encoded `TaskKey` → `task_id(8)`
    pub task_keys: fjall::Keyspace,
    /// `node_id(8)` → bincode(NodeRecord)
    pub nodes: fjall::Keyspace,
    write_lock: Mutex<()>,
}

impl FjallStore {
    /// Open (or create) a `FjallStore` at `path`.
    pub fn open(path: &Path) -> Result<Arc<Self>, PlaneError> {
        let db = fjall::Database::builder(path).open().map_err(fjall_err)?;
        let counters =
            db.keyspace("counters", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let entities =
            db.keyspace("entities", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let entity_versions = db
            .keyspace("entity_versions", fjall::KeyspaceCreateOptions::default)
            .map_err(fjall_err)?;
        let tasks =
            db.keyspace("tasks", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let task_keys =
            db.keyspace("task_keys", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let nodes =
            db.keyspace("nodes", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        Ok(Arc::new(FjallStore {
            db,
            counters,
            entities,
            entity_versions,
            tasks,
            task_keys,
            nodes,
            write_lock: Mutex::new(()),
        }))
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, PlaneError> {
        self.write_lock
            .lock()
            .map_err(|_| PlaneError::Storage("write lock poisoned".into()))
    }

    fn counter(&self, name: &str) -> Result<i64, PlaneError> {
        match self.counters.get(counter_key(name)).map_err(fjall_err)? {
            Some(b) => decode_i64(&b)
                .ok_or_else(|| PlaneError::Storage(format!("malformed counter '{name}'"))),
            None => Ok(0),
        }
    }

    fn entity(&self, kind: EntityKind, id: EntityId) -> Result<Option<SyncEntity>, PlaneError> {
        match self.entities.get(entity_key(kind, id)).map_err(fjall_err)? {
            Some(b) => Ok(Some(decode::<SyncEntity>(&b)?)),
            None => Ok(None),
        }
    }

    fn task(&self, id: TaskId) -> Result<Option<ChangeTask>, PlaneError> {
        match self.tasks.get(task_key(id)).map_err(fjall_err)? {
            Some(b) => Ok(Some(decode::<ChangeTask>(&b)?)),
            None => Ok(None),
        }
    }

    fn existing_task(&self, id: TaskId) -> Result<ChangeTask, PlaneError> {
        self.task(id)?.ok_or_else(|| PlaneError::NotFound(format!("task {id}")))
    }

    fn node(&self, id: NodeId) -> Result<Option<NodeRecord>, PlaneError> {
        match self.nodes.get(node_key(id)).map_err(fjall_err)? {
            Some(b) => Ok(Some(decode::<NodeRecord>(&b)?)),
            None => Ok(None),
        }
    }

    fn all_tasks(&self) -> Result<Vec<ChangeTask>, PlaneError> {
        let start = task_key(0).to_vec();
        let end = task_key(TaskId::MAX).to_vec();
        self.tasks
            .range(start..=end)
            .map(|g| g.into_inner().map_err(fjall_err).and_then(|(_, v)| decode::<ChangeTask>(&v)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// FjallBackend
// ---------------------------------------------------------------------------

/// Every storage trait backed by fjall.
///
/// All blocking I/O is wrapped in `tokio::task::spawn_blocking`.
#[derive(Clone)]
pub struct FjallBackend(pub Arc<FjallStore>);

impl FjallBackend {
    pub fn open(path: &Path) -> Result<Self, PlaneError> {
        Ok(FjallBackend(FjallStore::open(path)?))
    }
}

impl VersionStore for FjallBackend {
    async fn increment(&self, counter: &str, delta: i64) -> Result<i64, PlaneError> {
        let store = self.0.clone();
        let counter = counter.to_string();
        blocking(move || {
            let _guard = store.lock()?;
            let value = store.counter(&counter)? + delta;
            store
                .counters
                .insert(counter_key(&counter), value.to_be_bytes().to_vec())
                .map_err(fjall_err)?;
            Ok(value)
        })
        .await
    }

    async fn commit_entity(&self, draft: EntityDraft) -> Result<SyncEntity, PlaneError> {
        let store = self.0.clone();
        blocking(move || {
            let _guard = store.lock()?;
            let kind = draft.kind;

            let previous = if draft.id == 0 {
                None
            } else {
                let found = store
                    .entity(kind, draft.id)?
                    .ok_or_else(|| PlaneError::NotFound(format!("{kind:?} {}", draft.id)))?;
                Some(found)
            };

            let mut batch = store.db.batch();
            let id = if draft.id == 0 {
                let id = store.counter(kind.id_counter())? + 1;
                batch.insert(&store.counters, counter_key(kind.id_counter()), id.to_be_bytes().to_vec());
                id
            } else {
                draft.id
            };
            let version = store.counter(kind.version_counter())? + 1;
            batch.insert(
                &store.counters,
                counter_key(kind.version_counter()),
                version.to_be_bytes().to_vec(),
            );

            if let Some(prev) = previous {
                batch.remove(&store.entity_versions, entity_version_key(kind, prev.version).to_vec());
            }
            let entity = SyncEntity {
                kind,
                id,
                version,
                is_deleted: draft.is_deleted,
                payload: draft.payload,
                updated_at: now_secs(),
            };
            batch.insert(&store.entities, entity_key(kind, id).to_vec(), encode(&entity)?);
            batch.insert(
                &store.entity_versions,
                entity_version_key(kind, version).to_vec(),
                id.to_be_bytes().to_vec(),
            );
            batch.commit().map_err(fjall_err)?;
            Ok(entity)
        })
        .await
    }

    async fn get_entity(&self, kind: EntityKind, id: EntityId) -> Result<Option<SyncEntity>, PlaneError> {
        let store = self.0.clone();
        blocking(move || store.entity(kind, id)).await
    }

    async fn list_after_version(
        &self,
        kind: EntityKind,
        since: Version,
        limit: usize,
    ) -> Result<Vec<SyncEntity>, PlaneError> {
        let store = self.0.clone();
        blocking(move || {
            let start = entity_version_key(kind, since.saturating_add(1)).to_vec();
            let end = entity_kind_end(kind).to_vec();
            let mut out = Vec::new();
            for guard in store.entity_versions.range(start..end).take(limit) {
                let (k, v) = guard.into_inner().map_err(fjall_err)?;
                let version = decode_i64(&k[1..])
                    .ok_or_else(|| PlaneError::Storage("short entity_versions key".into()))?;
                let id = decode_i64(&v)
                    .ok_or_else(|| PlaneError::Storage("short entity_versions value".into()))?;
                // An entity rewritten after this index entry was read shows
                // up again later at its newer version.
                if let Some(entity) = store.entity(kind, id)? {
                    if entity.version == version {
                        out.push(entity);
                    }
                }
            }
            Ok(out)
        })
        .await
    }
}

impl TaskStore for FjallBackend {
    async fn upsert_task(&self, key: TaskKey, now: i64) -> Result<TaskId, PlaneError> {
        let store = self.0.clone();
        blocking(move || {
            let _guard = store.lock()?;
            let index_key = task_index_key(&key);

            if let Some(b) = store.task_keys.get(&index_key).map_err(fjall_err)? {
                let id = decode_i64(&b)
                    .ok_or_else(|| PlaneError::Storage("short task_keys value".into()))?;
                let mut task = store.existing_task(id)?;
                task.updated_at = now;
                task.is_done = false;
                task.is_ok = false;
                task.error.clear();
                task.is_notified = false;
                task.revision += 1;
                store.tasks.insert(task_key(id).to_vec(), encode(&task)?).map_err(fjall_err)?;
                return Ok(id);
            }

            let id = store.counter(TASK_ID_COUNTER)? + 1;
            let task = ChangeTask {
                id,
                key,
                updated_at: now,
                is_done: false,
                is_ok: false,
                error: String::new(),
                count_fails: 0,
                is_notified: false,
                revision: 1,
            };
            let mut batch = store.db.batch();
            batch.insert(&store.counters, counter_key(TASK_ID_COUNTER), id.to_be_bytes().to_vec());
            batch.insert(&store.tasks, task_key(id).to_vec(), encode(&task)?);
            batch.insert(&store.task_keys, index_key, id.to_be_bytes().to_vec());
            batch.commit().map_err(fjall_err)?;
            Ok(id)
        })
        .await
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<ChangeTask>, PlaneError> {
        let store = self.0.clone();
        blocking(move || store.task(id)).await
    }

    async fn list_tasks(&self, role: NodeRole, filter: TaskFilter) -> Result<Vec<ChangeTask>, PlaneError> {
        let store = self.0.clone();
        blocking(move || {
            Ok(store
                .all_tasks()?
                .into_iter()
                .filter(|t| t.key.role == role && filter.matches(t))
                .collect())
        })
        .await
    }

    async fn mark_task_done(&self, id: TaskId, now: i64) -> Result<(), PlaneError> {
        let store = self.0.clone();
        blocking(move || {
            let _guard = store.lock()?;
            let mut task = store.existing_task(id)?;
            task.is_done = true;
            task.is_ok = true;
            task.error.clear();
            task.updated_at = now;
            store.tasks.insert(task_key(id).to_vec(), encode(&task)?).map_err(fjall_err)
        })
        .await
    }

    async fn mark_task_done_if(&self, id: TaskId, revision: u64, now: i64) -> Result<bool, PlaneError> {
        let store = self.0.clone();
        blocking(move || {
            let _guard = store.lock()?;
            let mut task = store.existing_task(id)?;
            if task.revision != revision {
                return Ok(false);
            }
            task.is_done = true;
            task.is_ok = true;
            task.error.clear();
            task.updated_at = now;
            store.tasks.insert(task_key(id).to_vec(), encode(&task)?).map_err(fjall_err)?;
            Ok(true)
        })
        .await
    }

    async fn mark_task_failed(&self, id: TaskId, error: String, now: i64) -> Result<ChangeTask, PlaneError> {
        let store = self.0.clone();
        blocking(move || {
            let _guard = store.lock()?;
            let mut task = store.existing_task(id)?;
            task.is_done = true;
            task.is_ok = false;
            task.error = error;
            task.count_fails += 1;
            task.updated_at = now;
            store.tasks.insert(task_key(id).to_vec(), encode(&task)?).map_err(fjall_err)?;
            Ok(task)
        })
        .await
    }

    async fn mark_tasks_notified(&self, ids: Vec<TaskId>) -> Result<(), PlaneError> {
        let store = self.0.clone();
        blocking(move || {
            let _guard = store.lock()?;
            let mut batch = store.db.batch();
            for id in ids {
                if let Some(mut task) = store.task(id)? {
                    task.is_notified = true;
                    batch.insert(&store.tasks, task_key(id).to_vec(), encode(&task)?);
                }
            }
            batch.commit().map_err(fjall_err)
        })
        .await
    }

    async fn delete_task(&self, id: TaskId) -> Result<bool, PlaneError> {
        let store = self.0.clone();
        blocking(move || {
            let _guard = store.lock()?;
            let Some(task) = store.task(id)? else {
                return Ok(false);
            };
            let mut batch = store.db.batch();
            batch.remove(&store.tasks, task_key(id).to_vec());
            batch.remove(&store.task_keys, task_index_key(&task.key));
            batch.commit().map_err(fjall_err)?;
            Ok(true)
        })
        .await
    }

    async fn purge_tasks(&self, done_before: i64) -> Result<usize, PlaneError> {
        let store = self.0.clone();
        blocking(move || {
            let _guard = store.lock()?;
            let expired: Vec<ChangeTask> = store
                .all_tasks()?
                .into_iter()
                .filter(|t| t.is_done && t.is_ok && t.updated_at < done_before)
                .collect();
            if expired.is_empty() {
                return Ok(0);
            }
            let mut batch = store.db.batch();
            for task in &expired {
                batch.remove(&store.tasks, task_key(task.id).to_vec());
                batch.remove(&store.task_keys, task_index_key(&task.key));
            }
            batch.commit().map_err(fjall_err)?;
            Ok(expired.len())
        })
        .await
    }
}

impl NodeStore for FjallBackend {
    async fn put_node(&self, node: NodeRecord) -> Result<(), PlaneError> {
        let store = self.0.clone();
        blocking(move || {
            let _guard = store.lock()?;
            store.nodes.insert(node_key(node.id).to_vec(), encode(&node)?).map_err(fjall_err)
        })
        .await
    }

    async fn get_node(&self, id: NodeId) -> Result<Option<NodeRecord>, PlaneError> {
        let store = self.0.clone();
        blocking(move || store.node(id)).await
    }

    async fn list_nodes(
        &self,
        role: NodeRole,
        cluster_id: Option<ClusterId>,
    ) -> Result<Vec<NodeRecord>, PlaneError> {
        let store = self.0.clone();
        blocking(move || {
            let start = node_key(0).to_vec();
            let end = node_key(NodeId::MAX).to_vec();
            let nodes: Vec<NodeRecord> = store
                .nodes
                .range(start..=end)
                .map(|g| g.into_inner().map_err(fjall_err).and_then(|(_, v)| decode::<NodeRecord>(&v)))
                .collect::<Result<_, _>>()?;
            Ok(nodes
                .into_iter()
                .filter(|n| n.role == role && cluster_id.map_or(true, |c| n.cluster_id == c))
                .collect())
        })
        .await
    }

    async fn set_node_active(&self, id: NodeId, active: bool, now: i64) -> Result<NodeRecord, PlaneError> {
        let store = self.0.clone();
        blocking(move || {
            let _guard = store.lock()?;
            let before = store
                .node(id)?
                .ok_or_else(|| PlaneError::NotFound(format!("node {id}")))?;
            let mut after = before.clone();
            after.is_active = Some(active);
            after.status_updated_at = now;
            store.nodes.insert(node_key(id).to_vec(), encode(&after)?).map_err(fjall_err)?;
            Ok(before)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
