use std::future::Future;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Owns the named background tasks of a control-plane process.
///
/// Every task receives a child of one shared [`CancellationToken`];
/// [`shutdown`](Self::shutdown) cancels it and joins everything.
pub struct Supervisor {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    names: Vec<&'static str>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Supervisor { cancel: CancellationToken::new(), tasks: JoinSet::new(), names: Vec::new() }
    }

    pub fn spawn<F, Fut>(&mut self, name: &'static str, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let fut = task(self.cancel.child_token());
        tracing::info!(task = name, "starting background task");
        self.names.push(name);
        self.tasks.spawn(async move {
            fut.await;
            tracing::debug!(task = name, "background task exited");
        });
    }

    pub fn names(&self) -> &[&'static str] {
        &self.names
    }

    pub async fn shutdown(mut self) {
        tracing::info!(tasks = self.names.len(), "stopping background tasks");
        self.cancel.cancel();
        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                if e.is_panic() {
                    tracing::error!(error = %e, "background task panicked");
                }
            }
        }
    }
}
