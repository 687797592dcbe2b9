use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use ep_storage::NodeStore;
use ep_types::{NodeId, PlaneError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::config::ChannelConfig;
use crate::liveness::LivenessMonitor;
use crate::message::{ConnectedPayload, Frame, MessageCode, NodeEvent};
use crate::notify::Notifier;
use crate::registry::{ConnectionRegistry, Delivered, NodeConnection, PendingRequestRegistry};
use crate::transport::{FrameSink, FrameSource};

/// Result of a best-effort, non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    NotConnected,
    QueueFull,
}

/// One long-lived connection per node, multiplexing pushed notifications,
/// correlated request/response commands and unsolicited node events.
///
/// Each connection owns a bounded outbound queue drained by a dedicated send
/// task; the caller of [`serve`](Self::serve) runs the receive loop. No lock
/// is held across I/O or timer waits.
pub struct CommandChannel<S, N> {
    config: ChannelConfig,
    instance_id: String,
    connections: ConnectionRegistry,
    pending: PendingRequestRegistry,
    liveness: LivenessMonitor<S, N>,
    events: mpsc::Sender<(NodeId, NodeEvent)>,
    next_request_id: AtomicI64,
    next_conn_id: AtomicU64,
}

impl<S: NodeStore, N: Notifier> CommandChannel<S, N> {
    /// Returns the channel and the stream of unsolicited node events.
    pub fn new(
        config: ChannelConfig,
        instance_id: String,
        liveness: LivenessMonitor<S, N>,
    ) -> (Self, mpsc::Receiver<(NodeId, NodeEvent)>) {
        let (events, events_rx) = mpsc::channel(config.event_buffer.max(1));
        let channel = CommandChannel {
            config,
            instance_id,
            connections: ConnectionRegistry::new(),
            pending: PendingRequestRegistry::new(),
            liveness,
            events,
            next_request_id: AtomicI64::new(1),
            next_conn_id: AtomicU64::new(1),
        };
        (channel, events_rx)
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Run one node connection until the peer goes away.
    ///
    /// Returns an error only when the connection is refused (unknown node
    /// or the liveness write failed). A read error is a normal disconnect.
    pub async fn serve<K, R>(&self, node_id: NodeId, sink: K, mut source: R) -> Result<(), PlaneError>
    where
        K: FrameSink,
        R: FrameSource,
    {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (queue, outbound) = mpsc::channel(self.config.queue_capacity.max(1));

        let hello = serde_json::to_vec(&ConnectedPayload { instance_id: self.instance_id.clone(), node_id })
            .map_err(|e| PlaneError::Protocol(e.to_string()))?;
        queue
            .try_send(Frame::event(MessageCode::ConnectedApiNode, hello))
            .map_err(|_| PlaneError::QueueFull(node_id))?;

        // Liveness first: a refused connection must not displace a live one.
        if let Err(e) = self.liveness.on_connect(node_id, conn_id).await {
            tracing::warn!(node_id, error = %e, "refusing node connection");
            return Err(e);
        }

        let send_task = tokio::spawn(send_loop(
            node_id,
            sink,
            outbound,
            self.config.send_attempts.max(1),
            self.config.send_retry_delay,
        ));
        let conn = NodeConnection { conn_id, queue, send_task: send_task.abort_handle() };
        if let Some(old) = self.connections.insert(node_id, conn).await {
            old.send_task.abort();
            tracing::info!(node_id, old_conn = old.conn_id, conn_id, "node connection replaced");
        }
        tracing::info!(node_id, conn_id, "node connected");

        let reason = loop {
            match source.recv().await {
                Some(Ok(frame)) => self.dispatch(node_id, frame).await,
                Some(Err(e)) => break Some(e),
                None => break None,
            }
        };

        match self.connections.remove_if(node_id, conn_id).await {
            Some(conn) => {
                conn.send_task.abort();
                match reason {
                    Some(e) => tracing::info!(node_id, conn_id, error = %e, "node connection lost"),
                    None => tracing::info!(node_id, conn_id, "node connection closed"),
                }
                if let Err(e) = self.liveness.on_disconnect(node_id, conn_id).await {
                    tracing::warn!(node_id, error = %e, "failed to record node disconnect");
                }
            }
            None => tracing::debug!(node_id, conn_id, "superseded connection closed"),
        }
        Ok(())
    }

    async fn dispatch(&self, node_id: NodeId, frame: Frame) {
        if frame.request_id > 0 {
            let request_id = frame.request_id;
            match self.pending.deliver(node_id, frame) {
                Delivered::Yes => tracing::trace!(node_id, request_id, "reply delivered"),
                Delivered::NoWaiter => tracing::debug!(node_id, request_id, "dropping reply with no waiter"),
                Delivered::SlotFull => tracing::warn!(node_id, request_id, "dropping duplicate reply"),
                Delivered::WrongNode => tracing::warn!(node_id, request_id, "dropping reply for another node's request"),
            }
            return;
        }
        if frame.request_id < 0 {
            tracing::warn!(node_id, request_id = frame.request_id, code = %frame.code, "dropping frame with negative request id");
            return;
        }
        match NodeEvent::decode(&frame) {
            Ok(event) => {
                if let Err(e) = self.events.try_send((node_id, event)) {
                    tracing::warn!(node_id, code = %frame.code, error = %e, "dropping node event");
                }
            }
            Err(e) => tracing::warn!(node_id, error = %e, "dropping malformed frame"),
        }
    }

    /// Send a command and wait for the node's reply.
    ///
    /// Fails immediately when the node is not connected or its queue is
    /// full. On timeout the waiter is removed and a late reply is dropped.
    pub async fn send_command(
        &self,
        node_id: NodeId,
        code: MessageCode,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Frame, PlaneError> {
        if !code.is_command() {
            return Err(PlaneError::InvalidArgument(format!("{code} is not a node command")));
        }
        let queue = self
            .connections
            .sender(node_id)
            .await
            .ok_or(PlaneError::NotConnected(node_id))?;

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (_registered, mut slot) = self.pending.register(request_id, node_id);
        let frame = Frame { request_id, code: code.as_str().to_string(), payload };
        if let Err(e) = queue.try_send(frame) {
            return Err(match e {
                TrySendError::Full(_) => PlaneError::QueueFull(node_id),
                TrySendError::Closed(_) => PlaneError::NotConnected(node_id),
            });
        }

        let wait = timeout.unwrap_or(self.config.command_timeout);
        match tokio::time::timeout(wait, slot.recv()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(PlaneError::Transport(format!("request {request_id} was swept before a reply arrived"))),
            Err(_) => {
                tracing::warn!(node_id, request_id, %code, timeout_ms = wait.as_millis() as u64, "node command timed out");
                Err(PlaneError::Timeout { node_id, request_id })
            }
        }
    }

    /// Fire-and-forget push. Never blocks.
    pub async fn notify(&self, node_id: NodeId, code: MessageCode, payload: Vec<u8>) -> Delivery {
        let Some(queue) = self.connections.sender(node_id).await else {
            return Delivery::NotConnected;
        };
        match queue.try_send(Frame::event(code, payload)) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::QueueFull,
            Err(TrySendError::Closed(_)) => Delivery::NotConnected,
        }
    }

    /// Tell a node it has new tasks to pull.
    pub async fn nudge(&self, node_id: NodeId) -> Delivery {
        self.notify(node_id, MessageCode::NewNodeTask, Vec::new()).await
    }

    /// Force-remove pending requests older than the configured ceiling.
    pub async fn sweep_pending(&self) -> usize {
        let swept = self.pending.sweep(self.config.pending_ttl);
        for (request_id, node_id) in &swept {
            tracing::warn!(node_id, request_id, "swept abandoned pending request");
        }
        swept.len()
    }

    pub fn sweep_interval(&self) -> Duration {
        self.config.sweep_interval
    }

    pub async fn is_connected(&self, node_id: NodeId) -> bool {
        self.connections.is_connected(node_id).await
    }

    pub async fn connected_nodes(&self) -> Vec<NodeId> {
        self.connections.node_ids().await
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }
}

async fn send_loop<K: FrameSink>(
    node_id: NodeId,
    mut sink: K,
    mut outbound: mpsc::Receiver<Frame>,
    attempts: u32,
    retry_delay: Duration,
) {
    while let Some(frame) = outbound.recv().await {
        let mut attempt = 1;
        loop {
            match sink.send(frame.clone()).await {
                Ok(()) => break,
                Err(e) if attempt < attempts => {
                    tracing::debug!(node_id, attempt, error = %e, "frame write failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(retry_delay).await;
                }
                Err(e) => {
                    tracing::warn!(
                        node_id,
                        request_id = frame.request_id,
                        code = %frame.code,
                        attempts,
                        error = %e,
                        "dropping frame after repeated write failures"
                    );
                    break;
                }
            }
        }
    }
}
