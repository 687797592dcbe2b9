use std::sync::Arc;

use ep_proto::v1::{
    node_service_server::NodeService, ListEntitiesAfterVersionRequest,
    ListEntitiesAfterVersionResponse, ListNodeTasksRequest, ListNodeTasksResponse, NodeFrame,
    ReportTaskDoneRequest, ReportTaskDoneResponse,
};
use ep_storage::{NodeStore, SyncStorage};
use ep_sync::{ControlPlane, Frame, FrameSink, FrameSource, Notifier};
use ep_types::{NodeId, NodeRecord, PlaneError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use crate::convert::{entity_to_proto, header, plane_to_status, proto_kind, task_to_proto};

/// Metadata entry carrying the caller's node id, set by the authenticating
/// proxy in front of the node listener.
pub const NODE_ID_HEADER: &str = "x-edge-node-id";

pub struct NodeServiceImpl<S, N> {
    plane: Arc<ControlPlane<S, N>>,
}

impl<S: SyncStorage, N: Notifier> NodeServiceImpl<S, N> {
    pub fn new(plane: Arc<ControlPlane<S, N>>) -> Self {
        NodeServiceImpl { plane }
    }

    async fn registered(&self, node_id: NodeId) -> Result<NodeRecord, Status> {
        self.plane
            .store()
            .get_node(node_id)
            .await
            .map_err(plane_to_status)?
            .ok_or_else(|| Status::not_found(format!("node {node_id} is not registered")))
    }
}

fn node_id_from<T>(request: &Request<T>) -> Result<NodeId, Status> {
    let raw = request
        .metadata()
        .get(NODE_ID_HEADER)
        .ok_or_else(|| Status::unauthenticated(format!("missing {NODE_ID_HEADER}")))?;
    raw.to_str()
        .ok()
        .and_then(|s| s.trim().parse::<NodeId>().ok())
        .filter(|id| *id > 0)
        .ok_or_else(|| Status::unauthenticated(format!("malformed {NODE_ID_HEADER}")))
}

/// Server half of the channel: frames go out on the response stream.
struct GrpcSink(mpsc::Sender<Result<NodeFrame, Status>>);

impl FrameSink for GrpcSink {
    async fn send(&mut self, frame: Frame) -> Result<(), PlaneError> {
        let frame = NodeFrame { request_id: frame.request_id, code: frame.code, payload: frame.payload };
        self.0
            .send(Ok(frame))
            .await
            .map_err(|_| PlaneError::Transport("response stream closed".into()))
    }
}

struct GrpcSource(Streaming<NodeFrame>);

impl FrameSource for GrpcSource {
    async fn recv(&mut self) -> Option<Result<Frame, PlaneError>> {
        match self.0.message().await {
            Ok(Some(f)) => Some(Ok(Frame { request_id: f.request_id, code: f.code, payload: f.payload })),
            Ok(None) => None,
            Err(status) => Some(Err(PlaneError::Transport(status.message().to_string()))),
        }
    }
}

#[tonic::async_trait]
impl<S: SyncStorage, N: Notifier> NodeService for NodeServiceImpl<S, N> {
    type OpenChannelStream = ReceiverStream<Result<NodeFrame, Status>>;

    async fn open_channel(
        &self,
        request: Request<Streaming<NodeFrame>>,
    ) -> Result<Response<Self::OpenChannelStream>, Status> {
        let node_id = node_id_from(&request)?;
        let node = self.registered(node_id).await?;
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(self.plane.config().channel.queue_capacity.max(1));

        let plane = self.plane.clone();
        tokio::spawn(async move {
            if let Err(e) = plane.channel().serve(node.id, GrpcSink(tx), GrpcSource(inbound)).await {
                tracing::warn!(node_id = node.id, error = %e, "node channel refused");
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn list_node_tasks(
        &self,
        request: Request<ListNodeTasksRequest>,
    ) -> Result<Response<ListNodeTasksResponse>, Status> {
        let node_id = node_id_from(&request)?;
        let node = self.registered(node_id).await?;
        let tasks = self
            .plane
            .tasks()
            .list_for_node(node.role, node.id)
            .await
            .map_err(plane_to_status)?;
        Ok(Response::new(ListNodeTasksResponse {
            header: Some(header(self.plane.instance_id())),
            tasks: tasks.into_iter().map(task_to_proto).collect(),
        }))
    }

    async fn report_task_done(
        &self,
        request: Request<ReportTaskDoneRequest>,
    ) -> Result<Response<ReportTaskDoneResponse>, Status> {
        let node_id = node_id_from(&request)?;
        let node = self.registered(node_id).await?;
        let req = request.into_inner();
        self.plane
            .tasks()
            .report(node.id, req.task_id, req.is_ok, &req.error)
            .await
            .map_err(plane_to_status)?;
        Ok(Response::new(ReportTaskDoneResponse { header: Some(header(self.plane.instance_id())) }))
    }

    async fn list_entities_after_version(
        &self,
        request: Request<ListEntitiesAfterVersionRequest>,
    ) -> Result<Response<ListEntitiesAfterVersionResponse>, Status> {
        node_id_from(&request)?;
        let req = request.into_inner();
        let kind = proto_kind(req.kind)?;
        let entities = self
            .plane
            .delta()
            .list_after_version(kind, req.since_version, req.page_size)
            .await
            .map_err(plane_to_status)?;
        Ok(Response::new(ListEntitiesAfterVersionResponse {
            header: Some(header(self.plane.instance_id())),
            entities: entities.into_iter().map(entity_to_proto).collect(),
        }))
    }
}
