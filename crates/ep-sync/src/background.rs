//! Periodic scanners and the node event consumer, each run as a named task
//! under the [`Supervisor`](crate::Supervisor).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ep_storage::{now_secs, NodeStore, TaskStore};
use ep_types::{ChangeTask, NodeId, NodeRole, PlaneError, TaskKey, TaskScope};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::channel::{CommandChannel, Delivery};
use crate::message::NodeEvent;
use crate::notify::Notifier;
use crate::tasks::ChangeTaskStore;

/// Run `tick` every `every` until cancelled. A slow tick delays the next
/// one instead of bunching them up.
pub async fn run_periodic<F, Fut>(name: &'static str, every: Duration, cancel: CancellationToken, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tracing::info!(task = name, interval_ms = every.as_millis() as u64, "periodic task started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(task = name, "periodic task shutting down");
                break;
            }
            _ = ticker.tick() => tick().await,
        }
    }
}

/// Push a "new task" notification to every connected node that has
/// pending tasks it has not been told about. Returns the nodes nudged.
pub async fn nudge_once<S, N>(
    tasks: &ChangeTaskStore<S>,
    channel: &CommandChannel<S, N>,
) -> Result<Vec<NodeId>, PlaneError>
where
    S: TaskStore + NodeStore,
    N: Notifier,
{
    let mut nudged = Vec::new();
    for role in NodeRole::ALL {
        for (node_id, ids) in tasks.nodes_to_notify(role).await? {
            match channel.nudge(node_id).await {
                Delivery::Queued => {
                    tasks.mark_notified(ids).await?;
                    nudged.push(node_id);
                }
                // Retried next scan; the node also pulls on its own timer.
                Delivery::NotConnected => {}
                Delivery::QueueFull => tracing::debug!(node_id, "outbound queue full, skipping nudge"),
            }
        }
    }
    if !nudged.is_empty() {
        tracing::debug!(nodes = nudged.len(), "resync nudges queued");
    }
    Ok(nudged)
}

/// Expand every pending cluster, server or domain task into one task per
/// node of the owning cluster, then resolve the source task. Returns the
/// number of source tasks handled.
pub async fn expand_once<S: TaskStore + NodeStore>(
    tasks: &ChangeTaskStore<S>,
    nodes: &S,
) -> Result<usize, PlaneError> {
    let mut handled = 0;
    for role in NodeRole::ALL {
        for task in tasks.list_pending(role).await? {
            if matches!(task.key.scope, TaskScope::Node(_)) {
                continue;
            }
            handled += 1;
            expand_task(tasks, nodes, &task).await?;
        }
    }
    Ok(handled)
}

/// Fan one non-node task out to its cluster's nodes. The source is only
/// resolved if nobody upserted it while the fan-out ran; otherwise it stays
/// pending for the next pass.
async fn expand_task<S: TaskStore + NodeStore>(
    tasks: &ChangeTaskStore<S>,
    nodes: &S,
    task: &ChangeTask,
) -> Result<(), PlaneError> {
    let role = task.key.role;
    if task.key.cluster_id == 0 {
        tasks.mark_failed(task.id, "task has no owning cluster").await?;
        return Ok(());
    }
    let members = nodes.list_nodes(role, Some(task.key.cluster_id)).await?;
    for node in &members {
        tasks
            .upsert(TaskKey::node(role, task.key.cluster_id, node.id, task.key.task_type))
            .await?;
    }
    if !tasks.mark_done_if_unchanged(task).await? {
        tracing::debug!(task_id = task.id, "change task upserted during expansion, keeping it pending");
        return Ok(());
    }
    tracing::debug!(
        task_id = task.id,
        %role,
        cluster_id = task.key.cluster_id,
        nodes = members.len(),
        task_type = task.key.task_type.as_str(),
        "expanded change task"
    );
    Ok(())
}

/// Purge successful tasks older than `retention`.
pub async fn cleanup_once<S: TaskStore>(tasks: &ChangeTaskStore<S>, retention: Duration) -> Result<usize, PlaneError> {
    let cutoff = now_secs().saturating_sub(retention.as_secs() as i64);
    let purged = tasks.purge_done_before(cutoff).await?;
    if purged > 0 {
        tracing::info!(purged, cutoff, "purged finished change tasks");
    }
    Ok(purged)
}

/// Consume unsolicited node events until cancelled or the channel closes.
pub async fn run_event_dispatcher<S: TaskStore>(
    tasks: Arc<ChangeTaskStore<S>>,
    mut events: mpsc::Receiver<(NodeId, NodeEvent)>,
    cancel: CancellationToken,
) {
    loop {
        let (node_id, event) = tokio::select! {
            _ = cancel.cancelled() => break,
            next = events.recv() => match next {
                Some(next) => next,
                None => break,
            },
        };
        match event {
            NodeEvent::TaskDone { task_id, is_ok, error } => {
                if let Err(e) = tasks.report(node_id, task_id, is_ok, &error).await {
                    tracing::warn!(node_id, task_id, error = %e, "rejected task report");
                }
            }
            NodeEvent::Heartbeat => tracing::trace!(node_id, "heartbeat"),
        }
    }
    tracing::info!("node event dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;
    use crate::liveness::LivenessMonitor;
    use crate::message::MessageCode;
    use crate::notify::MemNotifier;
    use crate::transport::{pair, FrameSource};
    use ep_storage::MemStore;
    use ep_types::{NodeRecord, TaskType};

    fn node(id: NodeId, role: NodeRole, cluster_id: i64) -> NodeRecord {
        NodeRecord { id, role, cluster_id, name: format!("n{id}"), is_active: None, status_updated_at: 0 }
    }

    async fn setup() -> (Arc<MemStore>, Arc<ChangeTaskStore<MemStore>>) {
        let store = Arc::new(MemStore::new());
        for n in [node(1, NodeRole::Edge, 1), node(2, NodeRole::Edge, 1), node(3, NodeRole::Edge, 2), node(4, NodeRole::Dns, 1)] {
            store.put_node(n).await.unwrap();
        }
        let tasks = Arc::new(ChangeTaskStore::new(store.clone(), 10));
        (store, tasks)
    }

    #[tokio::test]
    async fn cluster_task_expands_to_its_nodes() {
        let (store, tasks) = setup().await;
        let source = tasks.upsert(TaskKey::cluster(NodeRole::Edge, 1, TaskType::ScriptsChanged)).await.unwrap().unwrap();
        let orphan = tasks
            .upsert(TaskKey { role: NodeRole::Edge, cluster_id: 0, scope: TaskScope::Server(77), task_type: TaskType::ConfigChanged })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(expand_once(&tasks, &store).await.unwrap(), 2);

        let pending = tasks.list_pending(NodeRole::Edge).await.unwrap();
        let expanded: Vec<_> = pending.iter().filter(|t| t.key.scope.node_id().is_some()).collect();
        let mut targets: Vec<_> = expanded.iter().filter_map(|t| t.key.scope.node_id()).collect();
        targets.sort_unstable();
        assert_eq!(targets, vec![1, 2]);
        assert!(expanded.iter().all(|t| t.key.task_type == TaskType::ScriptsChanged));

        assert!(tasks.get(source).await.unwrap().unwrap().is_ok);
        let orphan = tasks.get(orphan).await.unwrap().unwrap();
        assert!(orphan.is_done && !orphan.is_ok);
        assert_eq!(orphan.error, "task has no owning cluster");

        // Node-scoped tasks are left alone on the next pass; the orphan is
        // retried and fails again.
        assert_eq!(expand_once(&tasks, &store).await.unwrap(), 1);
        assert!(tasks.list_pending(NodeRole::Dns).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upsert_during_expansion_keeps_source_pending() {
        let (store, tasks) = setup().await;
        let key = TaskKey::cluster(NodeRole::Edge, 1, TaskType::IpItemChanged);
        let source = tasks.upsert(key).await.unwrap().unwrap();
        let listed = tasks.get(source).await.unwrap().unwrap();

        // A new mutation lands after the scanner read the task.
        tasks.upsert(key).await.unwrap();
        expand_task(&tasks, &store, &listed).await.unwrap();

        let still = tasks.get(source).await.unwrap().unwrap();
        assert!(!still.is_done, "the newer change must not be swallowed");
        assert_eq!(tasks.list_for_node(NodeRole::Edge, 1).await.unwrap().len(), 1);

        // The next pass sees the current revision and resolves it.
        assert_eq!(expand_once(&tasks, &store).await.unwrap(), 1);
        assert!(tasks.get(source).await.unwrap().unwrap().is_ok);
        assert_eq!(expand_once(&tasks, &store).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cleanup_keeps_recent_and_failed_tasks() {
        let (_, tasks) = setup().await;
        let ok = tasks.upsert(TaskKey::node(NodeRole::Edge, 1, 1, TaskType::ConfigChanged)).await.unwrap().unwrap();
        let failed = tasks.upsert(TaskKey::node(NodeRole::Edge, 1, 2, TaskType::ConfigChanged)).await.unwrap().unwrap();
        tasks.mark_done(ok).await.unwrap();
        tasks.mark_failed(failed, "boom").await.unwrap();

        assert_eq!(cleanup_once(&tasks, Duration::from_secs(3600)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(cleanup_once(&tasks, Duration::ZERO).await.unwrap(), 1);
        assert!(tasks.get(ok).await.unwrap().is_none());
        assert!(tasks.get(failed).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn nudger_only_marks_delivered_nudges() {
        let (store, tasks) = setup().await;
        let liveness = LivenessMonitor::new(store.clone(), Arc::new(MemNotifier::new()), Duration::from_secs(300));
        let (channel, _events) = CommandChannel::new(ChannelConfig::default(), "api".into(), liveness);
        let channel = Arc::new(channel);

        let (server, mut peer) = pair(16);
        let ch = channel.clone();
        tokio::spawn(async move { ch.serve(1, server.sink, server.source).await });
        assert_eq!(peer.source.recv().await.unwrap().unwrap().code, "connectedAPINode");
        for _ in 0..200 {
            if channel.is_connected(1).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let online = tasks.upsert(TaskKey::node(NodeRole::Edge, 1, 1, TaskType::ConfigChanged)).await.unwrap().unwrap();
        let offline = tasks.upsert(TaskKey::node(NodeRole::Edge, 1, 2, TaskType::ConfigChanged)).await.unwrap().unwrap();

        assert_eq!(nudge_once(&tasks, &channel).await.unwrap(), vec![1]);
        let frame = peer.source.recv().await.unwrap().unwrap();
        assert_eq!(frame.code, MessageCode::NewNodeTask.as_str());
        assert_eq!(frame.request_id, 0);

        assert!(tasks.get(online).await.unwrap().unwrap().is_notified);
        assert!(!tasks.get(offline).await.unwrap().unwrap().is_notified);

        // Already told; nothing new to push.
        assert!(nudge_once(&tasks, &channel).await.unwrap().is_empty());

        // A fresh mutation re-arms the nudge.
        tasks.upsert(TaskKey::node(NodeRole::Edge, 1, 1, TaskType::ConfigChanged)).await.unwrap();
        assert_eq!(nudge_once(&tasks, &channel).await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn dispatcher_applies_reports_and_rejects_foreign_tasks() {
        let (_, tasks) = setup().await;
        let mine = tasks.upsert(TaskKey::node(NodeRole::Edge, 1, 1, TaskType::ConfigChanged)).await.unwrap().unwrap();
        let theirs = tasks.upsert(TaskKey::node(NodeRole::Edge, 1, 2, TaskType::ConfigChanged)).await.unwrap().unwrap();

        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_event_dispatcher(tasks.clone(), rx, cancel.clone()));

        tx.send((1, NodeEvent::TaskDone { task_id: mine, is_ok: false, error: "nginx -t failed".into() })).await.unwrap();
        tx.send((1, NodeEvent::TaskDone { task_id: theirs, is_ok: true, error: String::new() })).await.unwrap();
        tx.send((1, NodeEvent::Heartbeat)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        let mine = tasks.get(mine).await.unwrap().unwrap();
        assert_eq!((mine.is_done, mine.is_ok, mine.count_fails), (true, false, 1));
        assert!(!tasks.get(theirs).await.unwrap().unwrap().is_done);
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn periodic_loop_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let count = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let c = count.clone();
        let handle = tokio::spawn(run_periodic("test", Duration::from_millis(5), cancel.clone(), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }));
        tokio::time::sleep(Duration::from_millis(40)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(count.load(std::sync::atomic::Ordering::SeqCst) >= 2);
    }
}
