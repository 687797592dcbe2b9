use std::future::Future;

use ep_types::PlaneError;
use tokio::sync::mpsc;

use crate::message::Frame;

/// Write half of an authenticated, ordered node connection.
pub trait FrameSink: Send + 'static {
    fn send(&mut self, frame: Frame) -> impl Future<Output = Result<(), PlaneError>> + Send;
}

/// Read half of a node connection. `None` means the peer closed cleanly.
pub trait FrameSource: Send + 'static {
    fn recv(&mut self) -> impl Future<Output = Option<Result<Frame, PlaneError>>> + Send;
}

/// In-process connection made of two channels, used by tests and local
/// tooling. `pair` returns the server side and the node side.
pub struct MemSink(mpsc::Sender<Frame>);
pub struct MemSource(mpsc::Receiver<Frame>);

impl FrameSink for MemSink {
    async fn send(&mut self, frame: Frame) -> Result<(), PlaneError> {
        self.0
            .send(frame)
            .await
            .map_err(|_| PlaneError::Transport("peer closed".into()))
    }
}

impl FrameSource for MemSource {
    async fn recv(&mut self) -> Option<Result<Frame, PlaneError>> {
        self.0.recv().await.map(Ok)
    }
}

pub struct MemPeer {
    pub sink: MemSink,
    pub source: MemSource,
}

pub fn pair(buffer: usize) -> (MemPeer, MemPeer) {
    let (to_node, from_server) = mpsc::channel(buffer);
    let (to_server, from_node) = mpsc::channel(buffer);
    (
        MemPeer { sink: MemSink(to_node), source: MemSource(from_node) },
        MemPeer { sink: MemSink(to_server), source: MemSource(from_server) },
    )
}
