use std::sync::Arc;

use ep_storage::VersionStore;
use ep_types::{EntityDraft, PlaneError, SyncEntity, Version};

/// Hands out strictly increasing versions from persisted, lock-protected
/// counters and stamps entities with them.
///
/// Versions are unique and increasing per counter but not contiguous: a
/// failed write after allocation leaves a hole, which delta-sync consumers
/// never notice because they only compare.
pub struct VersionAllocator<S> {
    store: Arc<S>,
}

impl<S: VersionStore> VersionAllocator<S> {
    pub fn new(store: Arc<S>) -> Self {
        VersionAllocator { store }
    }

    pub async fn next_version(&self, counter: &str) -> Result<Version, PlaneError> {
        if counter.is_empty() {
            return Err(PlaneError::InvalidArgument("counter name must not be empty".into()));
        }
        let version = self.store.increment(counter, 1).await?;
        tracing::trace!(counter, version, "allocated version");
        Ok(version)
    }

    /// Allocate the next version of `draft.kind` and write the entity with
    /// it in one storage step. On error nothing has been written.
    pub async fn stamp(&self, draft: EntityDraft) -> Result<SyncEntity, PlaneError> {
        let kind = draft.kind;
        let entity = self.store.commit_entity(draft).await.inspect_err(|e| {
            tracing::warn!(?kind, error = %e, "version allocation failed, write abandoned");
        })?;
        tracing::debug!(
            ?kind,
            id = entity.id,
            version = entity.version,
            deleted = entity.is_deleted,
            "entity stamped"
        );
        Ok(entity)
    }
}
