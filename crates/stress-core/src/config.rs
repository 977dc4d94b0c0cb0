use crate::client::FaultPlan;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default maximum wire size of a single batch (1 MiB).
pub const DEFAULT_MAX_BATCH_BYTES: usize = 1_048_576;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub target: TargetConfig,
    pub publish: PublishConfig,
    pub worker: WorkerConfig,
    #[serde(default)]
    pub run: RunConfig,
    /// Scripted failures for the in-memory client (mock mode only)
    #[serde(default)]
    pub mock: FaultPlan,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the orchestrator relies on.
    pub fn validate(&self) -> anyhow::Result<()> {
        let p = &self.publish;
        if p.concurrent_sends == 0 {
            bail!("publish.concurrent_sends must be at least 1");
        }
        if p.batch_fill_size == 0 {
            bail!("publish.batch_fill_size must be at least 1");
        }
        if p.min_bytes > p.regular_max_bytes {
            bail!(
                "publish.min_bytes ({}) must not exceed publish.regular_max_bytes ({})",
                p.min_bytes,
                p.regular_max_bytes
            );
        }
        if !(0.0..=1.0).contains(&p.large_message_factor) {
            bail!(
                "publish.large_message_factor must be within [0, 1] (got {})",
                p.large_message_factor
            );
        }
        if self.target.send_timeout_ms == 0 {
            bail!("target.send_timeout_ms must be non-zero");
        }
        if self.target.max_batch_bytes == 0 {
            bail!("target.max_batch_bytes must be non-zero");
        }
        url::Url::parse(&self.target.endpoint)
            .with_context(|| format!("Invalid target.endpoint: {}", self.target.endpoint))?;
        if self.target.entity.trim().is_empty() {
            bail!("target.entity must not be empty");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Base URL of the broker endpoint
    pub endpoint: String,
    /// Entity (hub/topic) that receives the batches
    pub entity: String,
    /// Per-attempt send timeout in milliseconds
    pub send_timeout_ms: u64,
    /// Maximum wire size of one batch
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,
    /// Optional bearer token sent with every request
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl TargetConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

fn default_max_batch_bytes() -> usize {
    DEFAULT_MAX_BATCH_BYTES
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Number of concurrent send loops sharing one client
    pub concurrent_sends: usize,
    /// Optional pause after every send, per loop
    #[serde(default)]
    pub publishing_delay_ms: Option<u64>,
    /// Messages attempted per batch (not a guarantee of occupancy)
    pub batch_fill_size: usize,
    /// Smallest generated body
    pub min_bytes: usize,
    /// Exclusive upper bound for regular bodies
    pub regular_max_bytes: usize,
    /// Probability that a body targets the maximum batch item size
    #[serde(default)]
    pub large_message_factor: f64,
    /// Base seed for the per-loop random sources
    #[serde(default)]
    pub seed: u64,
    /// Respawn background loops after a foreground send timeout drained them
    #[serde(default)]
    pub rearm_background_after_timeout: bool,
}

impl PublishConfig {
    pub fn publishing_delay(&self) -> Option<Duration> {
        self.publishing_delay_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Publisher identifier stamped on messages and result files
    pub id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    /// Optional global duration cap in milliseconds
    #[serde(default)]
    pub duration_ms: Option<u64>,
    /// Pause before recreating the client after a fault
    #[serde(default)]
    pub restart_backoff_ms: u64,
}
