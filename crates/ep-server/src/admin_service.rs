use std::sync::Arc;
use std::time::Duration;

use ep_proto::v1::{
    admin_service_server::AdminService, ChannelStatusRequest, ChannelStatusResponse,
    CreateTaskRequest, CreateTaskResponse, DeleteTaskRequest, DeleteTaskResponse, ListNodesRequest,
    ListNodesResponse, ListTasksRequest, ListTasksResponse, RegisterNodeRequest,
    RegisterNodeResponse, SendNodeCommandRequest, SendNodeCommandResponse,
};
use ep_storage::{NodeStore, SyncStorage};
use ep_sync::{ControlPlane, MessageCode, Notifier};
use ep_types::NodeRecord;
use tonic::{Request, Response, Status};

use crate::convert::{
    header, node_to_proto, plane_to_status, proto_role, proto_task_key, task_to_proto,
};

pub struct AdminServiceImpl<S, N> {
    plane: Arc<ControlPlane<S, N>>,
}

impl<S: SyncStorage, N: Notifier> AdminServiceImpl<S, N> {
    pub fn new(plane: Arc<ControlPlane<S, N>>) -> Self {
        AdminServiceImpl { plane }
    }
}

#[tonic::async_trait]
impl<S: SyncStorage, N: Notifier> AdminService for AdminServiceImpl<S, N> {
    async fn register_node(
        &self,
        request: Request<RegisterNodeRequest>,
    ) -> Result<Response<RegisterNodeResponse>, Status> {
        let req = request.into_inner();
        let record = NodeRecord {
            id: req.id,
            role: proto_role(req.role)?,
            cluster_id: req.cluster_id,
            name: req.name,
            is_active: None,
            status_updated_at: 0,
        };
        let node = self.plane.register_node(record).await.map_err(plane_to_status)?;
        let connected = self.plane.channel().is_connected(node.id).await;
        Ok(Response::new(RegisterNodeResponse {
            header: Some(header(self.plane.instance_id())),
            node: Some(node_to_proto(node, connected)),
        }))
    }

    async fn list_nodes(
        &self,
        request: Request<ListNodesRequest>,
    ) -> Result<Response<ListNodesResponse>, Status> {
        let req = request.into_inner();
        let role = proto_role(req.role)?;
        let cluster = (req.cluster_id != 0).then_some(req.cluster_id);
        let records = self
            .plane
            .store()
            .list_nodes(role, cluster)
            .await
            .map_err(plane_to_status)?;
        let connected = self.plane.channel().connected_nodes().await;
        let nodes = records
            .into_iter()
            .map(|n| {
                let online = connected.binary_search(&n.id).is_ok();
                node_to_proto(n, online)
            })
            .collect();
        Ok(Response::new(ListNodesResponse { header: Some(header(self.plane.instance_id())), nodes }))
    }

    async fn create_task(
        &self,
        request: Request<CreateTaskRequest>,
    ) -> Result<Response<CreateTaskResponse>, Status> {
        let key = request
            .into_inner()
            .key
            .ok_or_else(|| Status::invalid_argument("key is required"))?;
        let key = proto_task_key(key)?;
        let task_id = self.plane.tasks().upsert(key).await.map_err(plane_to_status)?;
        Ok(Response::new(CreateTaskResponse {
            header: Some(header(self.plane.instance_id())),
            task_id: task_id.unwrap_or(0),
        }))
    }

    async fn list_tasks(
        &self,
        request: Request<ListTasksRequest>,
    ) -> Result<Response<ListTasksResponse>, Status> {
        let req = request.into_inner();
        let role = proto_role(req.role)?;
        let tasks = if req.include_done {
            self.plane.tasks().list_all(role).await
        } else {
            self.plane.tasks().list_pending(role).await
        }
        .map_err(plane_to_status)?;
        Ok(Response::new(ListTasksResponse {
            header: Some(header(self.plane.instance_id())),
            tasks: tasks.into_iter().map(task_to_proto).collect(),
        }))
    }

    async fn delete_task(
        &self,
        request: Request<DeleteTaskRequest>,
    ) -> Result<Response<DeleteTaskResponse>, Status> {
        let task_id = request.into_inner().task_id;
        let found = self.plane.tasks().delete(task_id).await.map_err(plane_to_status)?;
        Ok(Response::new(DeleteTaskResponse { header: Some(header(self.plane.instance_id())), found }))
    }

    async fn send_node_command(
        &self,
        request: Request<SendNodeCommandRequest>,
    ) -> Result<Response<SendNodeCommandResponse>, Status> {
        let req = request.into_inner();
        let code = MessageCode::parse(&req.code).map_err(|e| Status::invalid_argument(e.to_string()))?;
        let timeout = (req.timeout_secs > 0).then(|| Duration::from_secs(u64::from(req.timeout_secs)));
        let reply = self
            .plane
            .channel()
            .send_command(req.node_id, code, req.payload, timeout)
            .await
            .map_err(plane_to_status)?;
        Ok(Response::new(SendNodeCommandResponse {
            header: Some(header(self.plane.instance_id())),
            code: reply.code,
            payload: reply.payload,
        }))
    }

    async fn channel_status(
        &self,
        _request: Request<ChannelStatusRequest>,
    ) -> Result<Response<ChannelStatusResponse>, Status> {
        let channel = self.plane.channel();
        Ok(Response::new(ChannelStatusResponse {
            header: Some(header(self.plane.instance_id())),
            connected_node_ids: channel.connected_nodes().await,
            pending_requests: channel.pending_requests() as u64,
        }))
    }
}
