use ep_proto::v1 as pb;
use ep_types::{
    ChangeTask, EntityKind, Liveness, NodeRecord, NodeRole, PlaneError, SyncEntity, TaskKey,
    TaskScope, TaskType,
};
use tonic::Status;

pub fn header(instance_id: &str) -> pb::ResponseHeader {
    pb::ResponseHeader { instance_id: instance_id.to_string() }
}

pub fn proto_role(raw: i32) -> Result<NodeRole, Status> {
    match pb::NodeRole::try_from(raw) {
        Ok(pb::NodeRole::Edge) => Ok(NodeRole::Edge),
        Ok(pb::NodeRole::Dns) => Ok(NodeRole::Dns),
        _ => Err(Status::invalid_argument(format!("node role must be set, got {raw}"))),
    }
}

pub fn role_to_proto(role: NodeRole) -> i32 {
    match role {
        NodeRole::Edge => pb::NodeRole::Edge as i32,
        NodeRole::Dns => pb::NodeRole::Dns as i32,
    }
}

pub fn proto_kind(raw: i32) -> Result<EntityKind, Status> {
    match pb::EntityKind::try_from(raw) {
        Ok(pb::EntityKind::DnsDomain) => Ok(EntityKind::DnsDomain),
        Ok(pb::EntityKind::DnsRecord) => Ok(EntityKind::DnsRecord),
        Ok(pb::EntityKind::DnsKey) => Ok(EntityKind::DnsKey),
        Ok(pb::EntityKind::DnsRoute) => Ok(EntityKind::DnsRoute),
        Ok(pb::EntityKind::IpItem) => Ok(EntityKind::IpItem),
        _ => Err(Status::invalid_argument(format!("entity kind must be set, got {raw}"))),
    }
}

pub fn kind_to_proto(kind: EntityKind) -> i32 {
    let k = match kind {
        EntityKind::DnsDomain => pb::EntityKind::DnsDomain,
        EntityKind::DnsRecord => pb::EntityKind::DnsRecord,
        EntityKind::DnsKey => pb::EntityKind::DnsKey,
        EntityKind::DnsRoute => pb::EntityKind::DnsRoute,
        EntityKind::IpItem => pb::EntityKind::IpItem,
    };
    k as i32
}

pub fn entity_to_proto(e: SyncEntity) -> pb::SyncEntity {
    pb::SyncEntity {
        kind: kind_to_proto(e.kind),
        id: e.id,
        version: e.version,
        is_deleted: e.is_deleted,
        payload: e.payload,
        updated_at: e.updated_at,
    }
}

pub fn proto_task_key(key: pb::TaskKey) -> Result<TaskKey, Status> {
    let role = proto_role(key.role)?;
    let scope = TaskScope::from_parts(&key.scope, key.scope_id).map_err(plane_to_status)?;
    let task_type: TaskType = key.task_type.parse().map_err(plane_to_status)?;
    Ok(TaskKey { role, cluster_id: key.cluster_id, scope, task_type })
}

pub fn task_key_to_proto(key: TaskKey) -> pb::TaskKey {
    pb::TaskKey {
        role: role_to_proto(key.role),
        cluster_id: key.cluster_id,
        scope: key.scope.kind_str().to_string(),
        scope_id: key.scope.id(),
        task_type: key.task_type.as_str().to_string(),
    }
}

pub fn task_to_proto(t: ChangeTask) -> pb::ChangeTask {
    pb::ChangeTask {
        id: t.id,
        key: Some(task_key_to_proto(t.key)),
        updated_at: t.updated_at,
        is_done: t.is_done,
        is_ok: t.is_ok,
        error: t.error,
        count_fails: t.count_fails,
        is_notified: t.is_notified,
    }
}

pub fn node_to_proto(n: NodeRecord, connected: bool) -> pb::Node {
    let liveness = match Liveness::from(n.is_active) {
        Liveness::Unknown => "unknown",
        Liveness::Active => "active",
        Liveness::Inactive => "inactive",
    };
    pb::Node {
        id: n.id,
        role: role_to_proto(n.role),
        cluster_id: n.cluster_id,
        name: n.name,
        liveness: liveness.to_string(),
        status_updated_at: n.status_updated_at,
        connected,
    }
}

pub fn plane_to_status(err: PlaneError) -> Status {
    match &err {
        PlaneError::NotFound(_) => Status::not_found(err.to_string()),
        PlaneError::InvalidArgument(_) => Status::invalid_argument(err.to_string()),
        PlaneError::NotConnected(_) => Status::unavailable(err.to_string()),
        PlaneError::QueueFull(_) => Status::resource_exhausted(err.to_string()),
        PlaneError::Timeout { .. } => Status::deadline_exceeded(err.to_string()),
        PlaneError::Storage(_) | PlaneError::Transport(_) | PlaneError::Protocol(_) => {
            Status::internal(err.to_string())
        }
    }
}
