use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ep_proto::v1::{
    admin_service_client::AdminServiceClient, config_service_client::ConfigServiceClient,
    node_service_client::NodeServiceClient, ChannelStatusRequest, EntityKind,
    ListEntitiesAfterVersionRequest, ListNodeTasksRequest, NodeFrame, NodeRole,
    RegisterNodeRequest, ReportTaskDoneRequest, SaveEntityRequest, SendNodeCommandRequest,
    TaskKey,
};
use ep_storage::MemStore;
use ep_sync::{ControlPlane, MemNotifier, PlaneConfig, Supervisor};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic::{Code, Request, Streaming};

struct TestPlane {
    api: SocketAddr,
    nodes: SocketAddr,
    supervisor: Supervisor,
}

async fn start_plane() -> TestPlane {
    let mut config = PlaneConfig::default();
    config.sync.nudge_interval = Duration::from_millis(20);
    config.sync.expand_interval = Duration::from_millis(20);
    let (plane, events) =
        ControlPlane::new(Arc::new(MemStore::new()), Arc::new(MemNotifier::new()), config, "api-test".into());
    let supervisor = plane.start(events);

    let api_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let node_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let api = api_listener.local_addr().unwrap();
    let nodes = node_listener.local_addr().unwrap();
    tokio::spawn(ep_server::serve_api_with_listener(api_listener, plane.clone()));
    tokio::spawn(ep_server::serve_nodes_with_listener(node_listener, plane));
    TestPlane { api, nodes, supervisor }
}

fn as_node<T>(node_id: i64, msg: T) -> Request<T> {
    let mut req = Request::new(msg);
    req.metadata_mut()
        .insert(ep_server::NODE_ID_HEADER, node_id.to_string().parse().unwrap());
    req
}

struct FakeNode {
    outbound: mpsc::Sender<NodeFrame>,
    inbound: Streaming<NodeFrame>,
}

impl FakeNode {
    async fn connect(client: &mut NodeServiceClient<Channel>, node_id: i64) -> Result<Self, tonic::Status> {
        let (outbound, rx) = mpsc::channel(16);
        let inbound = client.open_channel(as_node(node_id, ReceiverStream::new(rx))).await?.into_inner();
        Ok(FakeNode { outbound, inbound })
    }

    /// Next frame with `code`, skipping anything else.
    async fn expect(&mut self, code: &str) -> NodeFrame {
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                let frame = self.inbound.message().await.unwrap().unwrap();
                if frame.code == code {
                    return frame;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {code} frame"))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn node_receives_nudges_commands_and_deltas() {
    let plane = start_plane().await;
    let mut admin = AdminServiceClient::connect(format!("http://{}", plane.api)).await.unwrap();
    let mut config = ConfigServiceClient::connect(format!("http://{}", plane.api)).await.unwrap();
    let mut node_client = NodeServiceClient::connect(format!("http://{}", plane.nodes)).await.unwrap();

    admin
        .register_node(RegisterNodeRequest { id: 1, role: NodeRole::Edge as i32, cluster_id: 1, name: "edge-1".into() })
        .await
        .unwrap();

    let mut node = FakeNode::connect(&mut node_client, 1).await.unwrap();
    let hello = node.expect("connectedAPINode").await;
    let hello: serde_json::Value = serde_json::from_slice(&hello.payload).unwrap();
    assert_eq!(hello["instanceId"], "api-test");
    assert_eq!(hello["nodeId"], 1);

    // A configuration write fans out to the node and wakes it up.
    let saved = config
        .save_entity(SaveEntityRequest {
            kind: EntityKind::IpItem as i32,
            id: 0,
            payload: br#"{"ip":"203.0.113.9"}"#.to_vec(),
            notify: vec![TaskKey {
                role: NodeRole::Edge as i32,
                cluster_id: 1,
                scope: "cluster".into(),
                scope_id: 1,
                task_type: "ipItemChanged".into(),
            }],
        })
        .await
        .unwrap()
        .into_inner()
        .entity
        .unwrap();
    node.expect("newNodeTask").await;

    let tasks = node_client
        .list_node_tasks(as_node(1, ListNodeTasksRequest {}))
        .await
        .unwrap()
        .into_inner()
        .tasks;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].key.as_ref().unwrap().task_type, "ipItemChanged");

    let delta = node_client
        .list_entities_after_version(as_node(
            1,
            ListEntitiesAfterVersionRequest { kind: EntityKind::IpItem as i32, since_version: 0, page_size: 0 },
        ))
        .await
        .unwrap()
        .into_inner()
        .entities;
    assert_eq!(delta, vec![saved]);

    node_client
        .report_task_done(as_node(1, ReportTaskDoneRequest { task_id: tasks[0].id, is_ok: true, error: String::new() }))
        .await
        .unwrap();
    let tasks = node_client.list_node_tasks(as_node(1, ListNodeTasksRequest {})).await.unwrap().into_inner().tasks;
    assert!(tasks.is_empty());

    // Synchronous command over the same channel.
    let mut admin2 = admin.clone();
    let call = tokio::spawn(async move {
        admin2
            .send_node_command(SendNodeCommandRequest {
                node_id: 1,
                code: "purgeCache".into(),
                payload: b"/static/*".to_vec(),
                timeout_secs: 5,
            })
            .await
    });
    let cmd = node.expect("purgeCache").await;
    assert!(cmd.request_id > 0);
    assert_eq!(cmd.payload, b"/static/*");
    node.outbound
        .send(NodeFrame { request_id: cmd.request_id, code: cmd.code, payload: b"purged 3".to_vec() })
        .await
        .unwrap();
    let reply = call.await.unwrap().unwrap().into_inner();
    assert_eq!(reply.payload, b"purged 3");

    let status = admin.channel_status(ChannelStatusRequest {}).await.unwrap().into_inner();
    assert_eq!(status.connected_node_ids, vec![1]);
    assert_eq!(status.pending_requests, 0);

    drop(node);
    plane.supervisor.shutdown().await;
}

#[tokio::test]
async fn channel_errors_surface_as_status_codes() {
    let plane = start_plane().await;
    let mut admin = AdminServiceClient::connect(format!("http://{}", plane.api)).await.unwrap();
    let mut node_client = NodeServiceClient::connect(format!("http://{}", plane.nodes)).await.unwrap();

    let err = admin
        .send_node_command(SendNodeCommandRequest { node_id: 2, code: "purgeCache".into(), payload: vec![], timeout_secs: 1 })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);

    let err = admin
        .send_node_command(SendNodeCommandRequest { node_id: 2, code: "rebootNode".into(), payload: vec![], timeout_secs: 1 })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let (_tx, rx) = mpsc::channel::<NodeFrame>(1);
    let err = node_client.open_channel(Request::new(ReceiverStream::new(rx))).await.unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);

    let err = FakeNode::connect(&mut node_client, 9).await.err().unwrap();
    assert_eq!(err.code(), Code::NotFound);

    let err = node_client
        .list_entities_after_version(as_node(
            1,
            ListEntitiesAfterVersionRequest { kind: EntityKind::DnsKey as i32, since_version: -1, page_size: 10 },
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    plane.supervisor.shutdown().await;
}
