use std::sync::Arc;

use tokio::sync::mpsc;

use ep_storage::SyncStorage;
use ep_types::{NodeId, NodeRecord, PlaneError};

pub mod background;
pub mod channel;
pub mod config;
pub mod delta;
pub mod liveness;
pub mod message;
pub mod mutation;
pub mod notify;
pub mod registry;
pub mod supervisor;
pub mod tasks;
pub mod transport;
pub mod version;

pub use channel::{CommandChannel, Delivery};
pub use config::{ChannelConfig, LivenessConfig, PlaneConfig, SyncConfig};
pub use delta::DeltaSync;
pub use liveness::LivenessMonitor;
pub use message::{ConnectedPayload, Frame, MessageCode, NodeEvent, TaskDonePayload};
pub use mutation::ConfigWriter;
pub use notify::{LogNotifier, MemNotifier, NodeScope, Notifier, Severity};
pub use supervisor::Supervisor;
pub use tasks::ChangeTaskStore;
pub use transport::{FrameSink, FrameSource};
pub use version::VersionAllocator;

// ---------------------------------------------------------------------------
// ControlPlane: the sync core wired over one storage backend
// ---------------------------------------------------------------------------

pub struct ControlPlane<S, N> {
    store: Arc<S>,
    config: PlaneConfig,
    tasks: Arc<ChangeTaskStore<S>>,
    delta: DeltaSync<S>,
    writer: ConfigWriter<S>,
    channel: Arc<CommandChannel<S, N>>,
}

impl<S: SyncStorage, N: Notifier> ControlPlane<S, N> {
    /// Build the core. The returned receiver carries unsolicited node events
    /// and must be handed to [`start`](Self::start).
    pub fn new(
        store: Arc<S>,
        notifier: Arc<N>,
        config: PlaneConfig,
        instance_id: String,
    ) -> (Arc<Self>, mpsc::Receiver<(NodeId, NodeEvent)>) {
        let versions = Arc::new(VersionAllocator::new(store.clone()));
        let tasks = Arc::new(ChangeTaskStore::new(store.clone(), config.sync.max_task_failures));
        let delta = DeltaSync::new(store.clone(), config.sync.max_page_size);
        let writer = ConfigWriter::new(versions.clone(), tasks.clone());
        let liveness = LivenessMonitor::new(store.clone(), notifier, config.liveness.recovery_notify_cooldown);
        let (channel, events) = CommandChannel::new(config.channel.clone(), instance_id, liveness);
        let plane = ControlPlane {
            store,
            config,
            tasks,
            delta,
            writer,
            channel: Arc::new(channel),
        };
        (Arc::new(plane), events)
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &PlaneConfig {
        &self.config
    }

    pub fn instance_id(&self) -> &str {
        self.channel.instance_id()
    }

    pub fn tasks(&self) -> &ChangeTaskStore<S> {
        &self.tasks
    }

    pub fn delta(&self) -> &DeltaSync<S> {
        &self.delta
    }

    pub fn writer(&self) -> &ConfigWriter<S> {
        &self.writer
    }

    pub fn channel(&self) -> &Arc<CommandChannel<S, N>> {
        &self.channel
    }

    /// Create or rename a node. Persisted liveness is kept across
    /// re-registration.
    pub async fn register_node(&self, mut node: NodeRecord) -> Result<NodeRecord, PlaneError> {
        if node.id <= 0 {
            return Err(PlaneError::InvalidArgument(format!("node id must be positive, got {}", node.id)));
        }
        if node.name.trim().is_empty() {
            return Err(PlaneError::InvalidArgument("node name must not be empty".into()));
        }
        if let Some(existing) = self.store.get_node(node.id).await? {
            node.is_active = existing.is_active;
            node.status_updated_at = existing.status_updated_at;
        }
        self.store.put_node(node.clone()).await?;
        tracing::info!(node_id = node.id, role = %node.role, cluster_id = node.cluster_id, name = %node.name, "node registered");
        Ok(node)
    }

    /// Start the background tasks under a fresh [`Supervisor`].
    pub fn start(&self, events: mpsc::Receiver<(NodeId, NodeEvent)>) -> Supervisor {
        let mut sup = Supervisor::new();
        let sync = &self.config.sync;

        let (tasks, channel) = (self.tasks.clone(), self.channel.clone());
        sup.spawn("resync-nudger", move |cancel| {
            background::run_periodic("resync-nudger", sync_interval(sync.nudge_interval), cancel, move || {
                let (tasks, channel) = (tasks.clone(), channel.clone());
                async move {
                    if let Err(e) = background::nudge_once(&tasks, &channel).await {
                        tracing::warn!(error = %e, "resync scan failed");
                    }
                }
            })
        });

        let (tasks, store) = (self.tasks.clone(), self.store.clone());
        sup.spawn("task-expander", move |cancel| {
            background::run_periodic("task-expander", sync_interval(sync.expand_interval), cancel, move || {
                let (tasks, store) = (tasks.clone(), store.clone());
                async move {
                    if let Err(e) = background::expand_once(&tasks, &store).await {
                        tracing::warn!(error = %e, "task expansion failed");
                    }
                }
            })
        });

        let channel = self.channel.clone();
        let sweep_every = sync_interval(channel.sweep_interval());
        sup.spawn("pending-sweeper", move |cancel| {
            background::run_periodic("pending-sweeper", sweep_every, cancel, move || {
                let channel = channel.clone();
                async move {
                    channel.sweep_pending().await;
                }
            })
        });

        let tasks = self.tasks.clone();
        let retention = sync.task_retention;
        sup.spawn("task-cleanup", move |cancel| {
            background::run_periodic("task-cleanup", sync_interval(sync.cleanup_interval), cancel, move || {
                let tasks = tasks.clone();
                async move {
                    if let Err(e) = background::cleanup_once(&tasks, retention).await {
                        tracing::warn!(error = %e, "task cleanup failed");
                    }
                }
            })
        });

        let tasks = self.tasks.clone();
        sup.spawn("node-events", move |cancel| background::run_event_dispatcher(tasks, events, cancel));

        sup
    }
}

/// `tokio::time::interval` panics on a zero period.
fn sync_interval(d: std::time::Duration) -> std::time::Duration {
    d.max(std::time::Duration::from_millis(10))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use ep_storage::{MemStore, NodeStore};
    use ep_types::{EntityKind, NodeRole, TaskKey, TaskType};

    use crate::transport::{pair, FrameSink, FrameSource};

    fn fast_config() -> PlaneConfig {
        let mut config = PlaneConfig::default();
        config.sync.nudge_interval = Duration::from_millis(20);
        config.sync.expand_interval = Duration::from_millis(20);
        config
    }

    fn edge(id: NodeId, name: &str) -> NodeRecord {
        NodeRecord { id, role: NodeRole::Edge, cluster_id: 1, name: name.into(), is_active: None, status_updated_at: 0 }
    }

    #[tokio::test]
    async fn register_node_validates_and_keeps_liveness() {
        let (plane, _events) = ControlPlane::new(Arc::new(MemStore::new()), Arc::new(MemNotifier::new()), PlaneConfig::default(), "i".into());
        assert!(matches!(plane.register_node(edge(0, "x")).await, Err(PlaneError::InvalidArgument(_))));
        assert!(matches!(plane.register_node(edge(1, " ")).await, Err(PlaneError::InvalidArgument(_))));

        plane.register_node(edge(1, "edge-a")).await.unwrap();
        plane.store().set_node_active(1, true, 5).await.unwrap();
        let renamed = plane.register_node(edge(1, "edge-b")).await.unwrap();
        assert_eq!(renamed.is_active, Some(true));
        assert_eq!(plane.store().get_node(1).await.unwrap().unwrap().name, "edge-b");
    }

    #[tokio::test]
    async fn mutation_reaches_a_connected_node_end_to_end() {
        let (plane, events) =
            ControlPlane::new(Arc::new(MemStore::new()), Arc::new(MemNotifier::new()), fast_config(), "api-7".into());
        plane.register_node(edge(1, "edge-a")).await.unwrap();
        let sup = plane.start(events);

        let (server, mut node) = pair(16);
        let p = plane.clone();
        tokio::spawn(async move { p.channel().serve(1, server.sink, server.source).await });
        let hello = node.source.recv().await.unwrap().unwrap();
        let hello: ConnectedPayload = serde_json::from_slice(&hello.payload).unwrap();
        assert_eq!(hello.instance_id, "api-7");

        let record = plane
            .writer()
            .save(EntityKind::DnsRecord, 0, br#"{"name":"www"}"#.to_vec(), &[TaskKey::cluster(NodeRole::Edge, 1, TaskType::ConfigChanged)])
            .await
            .unwrap();

        // Expander fans the cluster task out, nudger pushes to the node.
        let nudge = tokio::time::timeout(Duration::from_secs(2), node.source.recv()).await.unwrap().unwrap().unwrap();
        assert_eq!(nudge.code, MessageCode::NewNodeTask.as_str());

        let mine = plane.tasks().list_for_node(NodeRole::Edge, 1).await.unwrap();
        assert_eq!(mine.len(), 1);
        let page = plane.delta().list_after_version(EntityKind::DnsRecord, 0, 100).await.unwrap();
        assert_eq!(page, vec![record]);

        let report = serde_json::to_vec(&TaskDonePayload { task_id: mine[0].id, is_ok: true, error: String::new() }).unwrap();
        node.sink.send(Frame::event(MessageCode::TaskDone, report)).await.unwrap();
        for _ in 0..200 {
            if plane.tasks().list_for_node(NodeRole::Edge, 1).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(plane.tasks().list_for_node(NodeRole::Edge, 1).await.unwrap().is_empty());

        tokio::time::timeout(Duration::from_secs(2), sup.shutdown()).await.unwrap();
    }
}
