mod admin_service;
mod config_service;
mod convert;
mod node_service;

use std::net::SocketAddr;
use std::sync::Arc;

use ep_proto::v1::{
    admin_service_server::AdminServiceServer, config_service_server::ConfigServiceServer,
    node_service_server::NodeServiceServer,
};
use ep_storage::SyncStorage;
use ep_sync::{ControlPlane, Notifier};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::server::Router;
use tonic_reflection::server::Builder as ReflectionBuilder;

pub use admin_service::AdminServiceImpl;
pub use config_service::ConfigServiceImpl;
pub use convert::plane_to_status;
pub use node_service::{NodeServiceImpl, NODE_ID_HEADER};

fn api_router<S: SyncStorage, N: Notifier>(plane: Arc<ControlPlane<S, N>>) -> anyhow::Result<Router> {
    let reflection = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(ep_proto::FILE_DESCRIPTOR_SET)
        .build_v1()?;
    Ok(tonic::transport::Server::builder()
        .add_service(ConfigServiceServer::new(ConfigServiceImpl::new(plane.clone())))
        .add_service(AdminServiceServer::new(AdminServiceImpl::new(plane)))
        .add_service(reflection))
}

fn node_router<S: SyncStorage, N: Notifier>(plane: Arc<ControlPlane<S, N>>) -> anyhow::Result<Router> {
    let reflection = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(ep_proto::FILE_DESCRIPTOR_SET)
        .build_v1()?;
    Ok(tonic::transport::Server::builder()
        .add_service(NodeServiceServer::new(NodeServiceImpl::new(plane)))
        .add_service(reflection))
}

/// Operator-facing listener: configuration writes and administration.
pub async fn serve_api<S: SyncStorage, N: Notifier>(
    addr: SocketAddr,
    plane: Arc<ControlPlane<S, N>>,
) -> anyhow::Result<()> {
    tracing::info!(%addr, "api gRPC server starting");
    api_router(plane)?.serve(addr).await.map_err(Into::into)
}

/// Node-facing listener: command channels, task reports and delta sync.
pub async fn serve_nodes<S: SyncStorage, N: Notifier>(
    addr: SocketAddr,
    plane: Arc<ControlPlane<S, N>>,
) -> anyhow::Result<()> {
    tracing::info!(%addr, "node gRPC server starting");
    node_router(plane)?.serve(addr).await.map_err(Into::into)
}

pub async fn serve_api_with_listener<S: SyncStorage, N: Notifier>(
    listener: TcpListener,
    plane: Arc<ControlPlane<S, N>>,
) -> anyhow::Result<()> {
    api_router(plane)?
        .serve_with_incoming(TcpListenerStream::new(listener))
        .await
        .map_err(Into::into)
}

pub async fn serve_nodes_with_listener<S: SyncStorage, N: Notifier>(
    listener: TcpListener,
    plane: Arc<ControlPlane<S, N>>,
) -> anyhow::Result<()> {
    node_router(plane)?
        .serve_with_incoming(TcpListenerStream::new(listener))
        .await
        .map_err(Into::into)
}
