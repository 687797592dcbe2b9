use std::time::Duration;

/// Tuning for [`crate::CommandChannel`].
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Capacity of each node's outbound frame queue.
    pub queue_capacity: usize,
    /// Write attempts per outbound frame before it is dropped.
    pub send_attempts: u32,
    pub send_retry_delay: Duration,
    /// Wait applied by `send_command` when the caller passes no timeout.
    pub command_timeout: Duration,
    /// Pending requests older than this are force-removed by the sweeper.
    pub pending_ttl: Duration,
    pub sweep_interval: Duration,
    /// Capacity of the queue carrying unsolicited node events to the
    /// dispatcher.
    pub event_buffer: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            send_attempts: 3,
            send_retry_delay: Duration::from_millis(200),
            command_timeout: Duration::from_secs(10),
            pending_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            event_buffer: 1024,
        }
    }
}

/// Tuning for change tasks, delta sync and the periodic scanners.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Server-side ceiling on a delta-sync page.
    pub max_page_size: usize,
    /// Failed tasks with this many failures stop being retried until the
    /// next upsert.
    pub max_task_failures: u32,
    pub nudge_interval: Duration,
    pub expand_interval: Duration,
    pub cleanup_interval: Duration,
    /// Successful tasks older than this are purged.
    pub task_retention: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_page_size: 2000,
            max_task_failures: 10,
            nudge_interval: Duration::from_secs(3),
            expand_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(3600),
            task_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// Minimum gap between two "recovered" notifications for one node.
    pub recovery_notify_cooldown: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self { recovery_notify_cooldown: Duration::from_secs(300) }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlaneConfig {
    pub channel: ChannelConfig,
    pub sync: SyncConfig,
    pub liveness: LivenessConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let config = PlaneConfig::default();
        assert_eq!(config.channel.send_attempts, 3);
        assert_eq!(config.channel.command_timeout, Duration::from_secs(10));
        assert_eq!(config.channel.pending_ttl, Duration::from_secs(3600));
        assert_eq!(config.sync.max_page_size, 2000);
    }
}
