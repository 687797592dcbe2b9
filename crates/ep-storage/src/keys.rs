use ep_types::{EntityId, EntityKind, NodeId, TaskId, TaskKey, Version};

// All integer components are non-negative and encoded big-endian, so
// lexicographic byte order equals numeric order.

/// `counters` keyspace: `counter_name_utf8`
pub fn counter_key(name: &str) -> Vec<u8> {
    name.as_bytes().to_vec()
}

/// `entities` keyspace: `kind(1) ++ id(8)`
pub fn entity_key(kind: EntityKind, id: EntityId) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = kind.tag();
    key[1..].copy_from_slice(&id.to_be_bytes());
    key
}

/// `entity_versions` keyspace: `kind(1) ++ version(8)` → `id(8)`
pub fn entity_version_key(kind: EntityKind, version: Version) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = kind.tag();
    key[1..].copy_from_slice(&version.to_be_bytes());
    key
}

/// Exclusive upper bound for every `entity_versions` key of `kind`.
pub fn entity_kind_end(kind: EntityKind) -> [u8; 1] {
    [kind.tag() + 1]
}

/// `tasks` keyspace: `task_id(8)`
pub fn task_key(id: TaskId) -> [u8; 8] {
    id.to_be_bytes()
}

/// `task_keys` keyspace (dedup index):
/// `role(1) ++ cluster(8) ++ scope_tag(1) ++ scope_id(8) ++ task_type_utf8` → `task_id(8)`
pub fn task_index_key(key: &TaskKey) -> Vec<u8> {
    let task_type = key.task_type.as_str();
    let mut buf = Vec::with_capacity(1 + 8 + 1 + 8 + task_type.len());
    buf.push(key.role.tag());
    buf.extend_from_slice(&key.cluster_id.to_be_bytes());
    buf.push(key.scope.tag());
    buf.extend_from_slice(&key.scope.id().to_be_bytes());
    buf.extend_from_slice(task_type.as_bytes());
    buf
}

/// `nodes` keyspace: `node_id(8)`
pub fn node_key(id: NodeId) -> [u8; 8] {
    id.to_be_bytes()
}

pub fn decode_i64(bytes: &[u8]) -> Option<i64> {
    let raw: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
    Some(i64::from_be_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ep_types::{NodeRole, TaskScope, TaskType};

    #[test]
    fn version_keys_sort_by_version() {
        let a = entity_version_key(EntityKind::DnsRecord, 1);
        let b = entity_version_key(EntityKind::DnsRecord, 2);
        let c = entity_version_key(EntityKind::DnsRecord, 1000);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn version_keys_of_different_kinds_dont_interleave() {
        let record_high = entity_version_key(EntityKind::DnsRecord, i64::MAX);
        let key_low = entity_version_key(EntityKind::DnsKey, 0);
        assert!(record_high < key_low);
        assert!(record_high.as_slice() < entity_kind_end(EntityKind::DnsRecord).as_slice());
        assert!(key_low.as_slice() >= entity_kind_end(EntityKind::DnsRecord).as_slice());
    }

    #[test]
    fn task_index_distinguishes_scope_kind() {
        let server = TaskKey {
            role: NodeRole::Edge,
            cluster_id: 1,
            scope: TaskScope::Server(9),
            task_type: TaskType::ConfigChanged,
        };
        let node = TaskKey { scope: TaskScope::Node(9), ..server };
        assert_ne!(task_index_key(&server), task_index_key(&node));
        let same = TaskKey { scope: TaskScope::Server(9), ..node };
        assert_eq!(task_index_key(&server), task_index_key(&same));
    }

    #[test]
    fn decode_round_trips_big_endian() {
        assert_eq!(decode_i64(&task_key(42)), Some(42));
        assert_eq!(decode_i64(&[1, 2]), None);
    }
}
