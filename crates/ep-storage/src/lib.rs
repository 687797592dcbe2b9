pub mod fjall;
pub mod keys;
pub mod mem;
pub mod traits;
pub mod types;

pub use self::fjall::{FjallBackend, FjallStore};
pub use mem::MemStore;
pub use traits::{NodeStore, SyncStorage, TaskStore, VersionStore};
pub use types::TaskFilter;

use std::time::{SystemTime, UNIX_EPOCH};

/// Unix time in seconds, the resolution stored on tasks and nodes.
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
