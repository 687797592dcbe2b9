use std::fmt;
use std::future::Future;
use std::sync::Arc;

use ep_types::{ClusterId, NodeId, NodeRole};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        })
    }
}

/// What an operator notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeScope {
    pub role: NodeRole,
    pub cluster_id: ClusterId,
    pub node_id: NodeId,
}

/// Operator-facing alert sink.
pub trait Notifier: Send + Sync + 'static {
    fn notify(
        &self,
        scope: NodeScope,
        severity: Severity,
        subject: String,
        body: String,
    ) -> impl Future<Output = ()> + Send;
}

/// Writes notifications to the log. Used when no external sink is wired.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    async fn notify(&self, scope: NodeScope, severity: Severity, subject: String, body: String) {
        tracing::info!(
            role = %scope.role,
            cluster_id = scope.cluster_id,
            node_id = scope.node_id,
            %severity,
            %subject,
            %body,
            "operator notification"
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub scope: NodeScope,
    pub severity: Severity,
    pub subject: String,
    pub body: String,
}

/// Keeps every notification in memory.
#[derive(Debug, Clone, Default)]
pub struct MemNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
}

impl MemNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.lock().await.clone()
    }
}

impl Notifier for MemNotifier {
    async fn notify(&self, scope: NodeScope, severity: Severity, subject: String, body: String) {
        self.sent.lock().await.push(Notification { scope, severity, subject, body });
    }
}
