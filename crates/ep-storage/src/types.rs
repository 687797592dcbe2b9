/// Selection applied by [`crate::TaskStore::list_tasks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskFilter {
    /// Tasks not yet done, plus failed tasks with fewer than `max_failures`
    /// recorded failures.
    Pending { max_failures: u32 },
    All,
}

impl TaskFilter {
    pub fn matches(&self, task: &ep_types::ChangeTask) -> bool {
        match *self {
            TaskFilter::Pending { max_failures } => task.is_pending(max_failures),
            TaskFilter::All => true,
        }
    }
}
