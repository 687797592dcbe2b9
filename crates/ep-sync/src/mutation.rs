use std::sync::Arc;

use ep_storage::{TaskStore, VersionStore};
use ep_types::{EntityDraft, EntityId, EntityKind, PlaneError, SyncEntity, TaskKey};

use crate::tasks::ChangeTaskStore;
use crate::version::VersionAllocator;

/// Write path for synced configuration: every save or delete consumes a
/// fresh version and leaves change tasks for the affected scopes.
pub struct ConfigWriter<S> {
    versions: Arc<VersionAllocator<S>>,
    tasks: Arc<ChangeTaskStore<S>>,
}

impl<S: VersionStore + TaskStore> ConfigWriter<S> {
    pub fn new(versions: Arc<VersionAllocator<S>>, tasks: Arc<ChangeTaskStore<S>>) -> Self {
        ConfigWriter { versions, tasks }
    }

    /// Create (`id == 0`) or update an entity.
    pub async fn save(
        &self,
        kind: EntityKind,
        id: EntityId,
        payload: Vec<u8>,
        notify: &[TaskKey],
    ) -> Result<SyncEntity, PlaneError> {
        let entity = self
            .versions
            .stamp(EntityDraft { kind, id, payload, is_deleted: false })
            .await?;
        self.enqueue(notify).await?;
        Ok(entity)
    }

    /// Soft delete: the row stays, flagged, under a new version.
    pub async fn delete(&self, kind: EntityKind, id: EntityId, notify: &[TaskKey]) -> Result<SyncEntity, PlaneError> {
        if id <= 0 {
            return Err(PlaneError::InvalidArgument(format!("cannot delete {kind:?} with id {id}")));
        }
        let entity = self
            .versions
            .stamp(EntityDraft { kind, id, payload: Vec::new(), is_deleted: true })
            .await?;
        self.enqueue(notify).await?;
        Ok(entity)
    }

    async fn enqueue(&self, keys: &[TaskKey]) -> Result<(), PlaneError> {
        for key in keys {
            self.tasks.upsert(*key).await?;
        }
        Ok(())
    }
}
