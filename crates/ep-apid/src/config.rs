use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use ep_sync::{ChannelConfig, LivenessConfig, PlaneConfig, SyncConfig};

#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Fjall,
    Memory,
}

#[derive(Debug, Deserialize)]
pub struct StorageSection {
    pub backend: Backend,
    pub data_dir: String,
}

#[derive(Debug, Deserialize)]
pub struct ChannelSection {
    queue_capacity: usize,
    send_attempts: u32,
    send_retry_delay_ms: u64,
    command_timeout_secs: u64,
    pending_ttl_secs: u64,
    sweep_interval_secs: u64,
    event_buffer: usize,
}

#[derive(Debug, Deserialize)]
pub struct SyncSection {
    max_page_size: usize,
    max_task_failures: u32,
    nudge_interval_secs: u64,
    expand_interval_secs: u64,
    cleanup_interval_secs: u64,
    task_retention_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct LivenessSection {
    recovery_notify_cooldown_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct ObservabilitySection {
    pub log_level: String,
    pub log_format: String,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub storage: StorageSection,
    pub channel: ChannelSection,
    pub sync: SyncSection,
    pub liveness: LivenessSection,
    pub observability: ObservabilitySection,
}

impl Config {
    /// Embedded defaults, then the optional file, then `EDGEPLANE_*`
    /// environment variables (`__` separates sections).
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        Self::figment(path)
            .merge(Env::prefixed("EDGEPLANE_").split("__"))
            .extract()
            .context("failed to load configuration")
    }

    fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::new().merge(Toml::string(include_str!("../../../config/default.toml")));
        if let Some(path) = path {
            figment = figment.merge(Toml::file_exact(path));
        }
        figment
    }

    pub fn plane(&self) -> PlaneConfig {
        let c = &self.channel;
        let s = &self.sync;
        PlaneConfig {
            channel: ChannelConfig {
                queue_capacity: c.queue_capacity,
                send_attempts: c.send_attempts,
                send_retry_delay: Duration::from_millis(c.send_retry_delay_ms),
                command_timeout: Duration::from_secs(c.command_timeout_secs),
                pending_ttl: Duration::from_secs(c.pending_ttl_secs),
                sweep_interval: Duration::from_secs(c.sweep_interval_secs),
                event_buffer: c.event_buffer,
            },
            sync: SyncConfig {
                max_page_size: s.max_page_size,
                max_task_failures: s.max_task_failures,
                nudge_interval: Duration::from_secs(s.nudge_interval_secs),
                expand_interval: Duration::from_secs(s.expand_interval_secs),
                cleanup_interval: Duration::from_secs(s.cleanup_interval_secs),
                task_retention: Duration::from_secs(s.task_retention_secs),
            },
            liveness: LivenessConfig {
                recovery_notify_cooldown: Duration::from_secs(self.liveness.recovery_notify_cooldown_secs),
            },
        }
    }
}
