use std::fmt;
use std::str::FromStr;

pub type NodeId = i64;
pub type ClusterId = i64;
pub type TaskId = i64;
pub type EntityId = i64;
/// Position in a per-kind total order; `0` means "nothing seen yet".
pub type Version = i64;

/// Kind of remote worker a node, cluster or task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum NodeRole {
    Edge,
    Dns,
}

impl NodeRole {
    pub const ALL: [NodeRole; 2] = [NodeRole::Edge, NodeRole::Dns];

    pub fn tag(self) -> u8 {
        match self {
            NodeRole::Edge => 1,
            NodeRole::Dns => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeRole::Edge => "edge",
            NodeRole::Dns => "dns",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Versioned entities
// ---------------------------------------------------------------------------

/// Entity types that participate in delta sync. Each kind owns its own
/// version counter and id counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum EntityKind {
    DnsDomain,
    DnsRecord,
    DnsKey,
    DnsRoute,
    IpItem,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::DnsDomain,
        EntityKind::DnsRecord,
        EntityKind::DnsKey,
        EntityKind::DnsRoute,
        EntityKind::IpItem,
    ];

    /// One-byte prefix used by byte-ordered storage backends.
    pub fn tag(self) -> u8 {
        match self {
            EntityKind::DnsDomain => 1,
            EntityKind::DnsRecord => 2,
            EntityKind::DnsKey => 3,
            EntityKind::DnsRoute => 4,
            EntityKind::IpItem => 5,
        }
    }

    pub fn version_counter(self) -> &'static str {
        match self {
            EntityKind::DnsDomain => "NS_DOMAIN_VERSION",
            EntityKind::DnsRecord => "NS_RECORD_VERSION",
            EntityKind::DnsKey => "NS_KEY_VERSION",
            EntityKind::DnsRoute => "NS_ROUTE_VERSION",
            EntityKind::IpItem => "IP_ITEM_VERSION",
        }
    }

    pub fn id_counter(self) -> &'static str {
        match self {
            EntityKind::DnsDomain => "NS_DOMAIN_ID",
            EntityKind::DnsRecord => "NS_RECORD_ID",
            EntityKind::DnsKey => "NS_KEY_ID",
            EntityKind::DnsRoute => "NS_ROUTE_ID",
            EntityKind::IpItem => "IP_ITEM_ID",
        }
    }
}

/// A stored entity as seen by delta-sync consumers.
///
/// Deleted entities are kept with `is_deleted = true` and a fresh version so
/// that deletions travel through the same delta stream as updates.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SyncEntity {
    pub kind: EntityKind,
    pub id: EntityId,
    pub version: Version,
    pub is_deleted: bool,
    /// Entity-specific fields, JSON encoded by the caller.
    pub payload: Vec<u8>,
    pub updated_at: i64,
}

/// A pending write handed to the version store, which stamps it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDraft {
    pub kind: EntityKind,
    /// `0` creates a new entity with a freshly allocated id.
    pub id: EntityId,
    pub payload: Vec<u8>,
    pub is_deleted: bool,
}

// ---------------------------------------------------------------------------
// Change tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum TaskScope {
    Cluster(ClusterId),
    Server(i64),
    Node(NodeId),
    Domain(i64),
}

impl TaskScope {
    pub fn id(self) -> i64 {
        match self {
            TaskScope::Cluster(id)
            | TaskScope::Server(id)
            | TaskScope::Node(id)
            | TaskScope::Domain(id) => id,
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            TaskScope::Cluster(_) => 1,
            TaskScope::Server(_) => 2,
            TaskScope::Node(_) => 3,
            TaskScope::Domain(_) => 4,
        }
    }

    pub fn kind_str(self) -> &'static str {
        match self {
            TaskScope::Cluster(_) => "cluster",
            TaskScope::Server(_) => "server",
            TaskScope::Node(_) => "node",
            TaskScope::Domain(_) => "domain",
        }
    }

    pub fn from_parts(kind: &str, id: i64) -> Result<Self, PlaneError> {
        match kind {
            "cluster" => Ok(TaskScope::Cluster(id)),
            "server" => Ok(TaskScope::Server(id)),
            "node" => Ok(TaskScope::Node(id)),
            "domain" => Ok(TaskScope::Domain(id)),
            other => Err(PlaneError::InvalidArgument(format!("unknown task scope '{other}'"))),
        }
    }

    pub fn node_id(self) -> Option<NodeId> {
        match self {
            TaskScope::Node(id) => Some(id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum TaskType {
    ConfigChanged,
    IpItemChanged,
    ScriptsChanged,
    NodeVersionChanged,
    DdosProtectionChanged,
    GlobalServerConfigChanged,
    DnsDomainChanged,
    DnsRecordChanged,
    DnsKeyChanged,
    DnsRouteChanged,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::ConfigChanged => "configChanged",
            TaskType::IpItemChanged => "ipItemChanged",
            TaskType::ScriptsChanged => "scriptsChanged",
            TaskType::NodeVersionChanged => "nodeVersionChanged",
            TaskType::DdosProtectionChanged => "ddosProtectionChanged",
            TaskType::GlobalServerConfigChanged => "globalServerConfigChanged",
            TaskType::DnsDomainChanged => "nsDomainChanged",
            TaskType::DnsRecordChanged => "nsRecordChanged",
            TaskType::DnsKeyChanged => "nsKeyChanged",
            TaskType::DnsRouteChanged => "nsRouteChanged",
        }
    }
}

impl FromStr for TaskType {
    type Err = PlaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = match s {
            "configChanged" => TaskType::ConfigChanged,
            "ipItemChanged" => TaskType::IpItemChanged,
            "scriptsChanged" => TaskType::ScriptsChanged,
            "nodeVersionChanged" => TaskType::NodeVersionChanged,
            "ddosProtectionChanged" => TaskType::DdosProtectionChanged,
            "globalServerConfigChanged" => TaskType::GlobalServerConfigChanged,
            "nsDomainChanged" => TaskType::DnsDomainChanged,
            "nsRecordChanged" => TaskType::DnsRecordChanged,
            "nsKeyChanged" => TaskType::DnsKeyChanged,
            "nsRouteChanged" => TaskType::DnsRouteChanged,
            other => {
                return Err(PlaneError::InvalidArgument(format!("unknown task type '{other}'")))
            }
        };
        Ok(t)
    }
}

/// Deduplication key of a change task: at most one row exists per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct TaskKey {
    pub role: NodeRole,
    /// Owning cluster; `0` when the scope is not bound to a cluster.
    pub cluster_id: ClusterId,
    pub scope: TaskScope,
    pub task_type: TaskType,
}

impl TaskKey {
    pub fn cluster(role: NodeRole, cluster_id: ClusterId, task_type: TaskType) -> Self {
        TaskKey { role, cluster_id, scope: TaskScope::Cluster(cluster_id), task_type }
    }

    pub fn node(role: NodeRole, cluster_id: ClusterId, node_id: NodeId, task_type: TaskType) -> Self {
        TaskKey { role, cluster_id, scope: TaskScope::Node(node_id), task_type }
    }

    /// Keys with neither an owning cluster nor a scope id address nothing.
    pub fn is_noop(&self) -> bool {
        self.cluster_id == 0 && self.scope.id() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChangeTask {
    pub id: TaskId,
    pub key: TaskKey,
    pub updated_at: i64,
    pub is_done: bool,
    pub is_ok: bool,
    pub error: String,
    pub count_fails: u32,
    pub is_notified: bool,
    /// Bumped by every upsert, so a reader can tell whether the task was
    /// reset after it listed it.
    pub revision: u64,
}

impl ChangeTask {
    /// Done tasks that failed stay retryable until `max_failures` is reached.
    pub fn is_pending(&self, max_failures: u32) -> bool {
        !self.is_done || (!self.is_ok && self.count_fails < max_failures)
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub role: NodeRole,
    pub cluster_id: ClusterId,
    pub name: String,
    /// `None` until the first connection has been observed.
    pub is_active: Option<bool>,
    pub status_updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Unknown,
    Active,
    Inactive,
}

impl From<Option<bool>> for Liveness {
    fn from(v: Option<bool>) -> Self {
        match v {
            None => Liveness::Unknown,
            Some(true) => Liveness::Active,
            Some(false) => Liveness::Inactive,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PlaneError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("node {0} is not connected")]
    NotConnected(NodeId),
    #[error("outbound queue for node {0} is full")]
    QueueFull(NodeId),
    #[error("request {request_id} to node {node_id} timed out")]
    Timeout { node_id: NodeId, request_id: i64 },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}
