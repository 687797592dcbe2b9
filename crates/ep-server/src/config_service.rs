use std::sync::Arc;

use ep_proto::v1::{
    config_service_server::ConfigService, DeleteEntityRequest, DeleteEntityResponse,
    GetEntityRequest, GetEntityResponse, SaveEntityRequest, SaveEntityResponse, TaskKey,
};
use ep_storage::{SyncStorage, VersionStore};
use ep_sync::{ControlPlane, Notifier};
use tonic::{Request, Response, Status};

use crate::convert::{entity_to_proto, header, plane_to_status, proto_kind, proto_task_key};

pub struct ConfigServiceImpl<S, N> {
    plane: Arc<ControlPlane<S, N>>,
}

impl<S: SyncStorage, N: Notifier> ConfigServiceImpl<S, N> {
    pub fn new(plane: Arc<ControlPlane<S, N>>) -> Self {
        ConfigServiceImpl { plane }
    }
}

fn notify_keys(keys: Vec<TaskKey>) -> Result<Vec<ep_types::TaskKey>, Status> {
    keys.into_iter().map(proto_task_key).collect()
}

#[tonic::async_trait]
impl<S: SyncStorage, N: Notifier> ConfigService for ConfigServiceImpl<S, N> {
    async fn save_entity(
        &self,
        request: Request<SaveEntityRequest>,
    ) -> Result<Response<SaveEntityResponse>, Status> {
        let req = request.into_inner();
        let kind = proto_kind(req.kind)?;
        if req.id < 0 {
            return Err(Status::invalid_argument("id must not be negative"));
        }
        let notify = notify_keys(req.notify)?;
        let entity = self
            .plane
            .writer()
            .save(kind, req.id, req.payload, &notify)
            .await
            .map_err(plane_to_status)?;
        Ok(Response::new(SaveEntityResponse {
            header: Some(header(self.plane.instance_id())),
            entity: Some(entity_to_proto(entity)),
        }))
    }

    async fn delete_entity(
        &self,
        request: Request<DeleteEntityRequest>,
    ) -> Result<Response<DeleteEntityResponse>, Status> {
        let req = request.into_inner();
        let kind = proto_kind(req.kind)?;
        let notify = notify_keys(req.notify)?;
        let entity = self
            .plane
            .writer()
            .delete(kind, req.id, &notify)
            .await
            .map_err(plane_to_status)?;
        Ok(Response::new(DeleteEntityResponse {
            header: Some(header(self.plane.instance_id())),
            entity: Some(entity_to_proto(entity)),
        }))
    }

    async fn get_entity(
        &self,
        request: Request<GetEntityRequest>,
    ) -> Result<Response<GetEntityResponse>, Status> {
        let req = request.into_inner();
        let kind = proto_kind(req.kind)?;
        let entity = self
            .plane
            .store()
            .get_entity(kind, req.id)
            .await
            .map_err(plane_to_status)?
            .ok_or_else(|| Status::not_found(format!("{kind:?} {} not found", req.id)))?;
        Ok(Response::new(GetEntityResponse {
            header: Some(header(self.plane.instance_id())),
            entity: Some(entity_to_proto(entity)),
        }))
    }
}
