use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_BUCKET_COUNT: usize = 64;
const DEFAULT_MEMORY_BUDGET_BYTES: u64 = 1024 * 1024 * 1024;
const DEFAULT_QOS_0_MEMORY_HARD_LIMIT_DIVISOR: i64 = 4;
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 300;

fn default_bucket_count() -> usize {
    DEFAULT_BUCKET_COUNT
}

fn default_memory_budget_bytes() -> u64 {
    DEFAULT_MEMORY_BUDGET_BYTES
}

fn default_qos0_divisor() -> i64 {
    DEFAULT_QOS_0_MEMORY_HARD_LIMIT_DIVISOR
}

fn default_cleanup_interval_secs() -> u64 {
    DEFAULT_CLEANUP_INTERVAL_SECS
}

/// Strategy applied when a QoS 1/2 queue has reached its configured capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuedMessagesStrategy {
    /// Drop the incoming message.
    Discard,
    /// Drop the oldest queued message that is not in flight; if every queued
    /// message is in flight, fall back to dropping the incoming one.
    DiscardOldest,
}

/// Configuration for the client queue persistence.
#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Number of shards. Fixed at startup; every queue id hashes into one.
    #[serde(default = "default_bucket_count")]
    pub bucket_count: usize,
    /// Memory budget the QoS 0 hard limit is derived from.
    #[serde(default = "default_memory_budget_bytes")]
    pub memory_budget_bytes: u64,
    /// Divisor applied to the memory budget for the QoS 0 hard limit.
    /// Values below 1 fall back to the default of 4.
    #[serde(default = "default_qos0_divisor")]
    pub qos0_memory_hard_limit_divisor: i64,
    /// Interval between background expiry sweeps.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            bucket_count: DEFAULT_BUCKET_COUNT,
            memory_budget_bytes: DEFAULT_MEMORY_BUDGET_BYTES,
            qos0_memory_hard_limit_divisor: DEFAULT_QOS_0_MEMORY_HARD_LIMIT_DIVISOR,
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
        }
    }
}

impl PersistenceConfig {
    /// Load configuration from a path resolved via `PHOTON_CONFIG` or
    /// defaults to `config/photon.toml`.
    pub fn load_from_env() -> Result<Self> {
        let path = env::var("PHOTON_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/photon.toml"));
        Self::load(path)
    }

    /// Load configuration from a specific file (TOML or JSON based on extension).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("unable to read config {}", path_ref.display()))?;
        let cfg: Self = if path_ref.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&data)
                .with_context(|| format!("invalid JSON config {}", path_ref.display()))?
        } else {
            toml::from_str(&data)
                .with_context(|| format!("invalid TOML config {}", path_ref.display()))?
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bucket_count == 0 {
            bail!("bucket_count must be at least 1");
        }
        if self.memory_budget_bytes == 0 {
            bail!("memory_budget_bytes must be positive");
        }
        if self.cleanup_interval_secs == 0 {
            bail!("cleanup_interval_secs must be positive");
        }
        Ok(())
    }

    /// Hard limit for in-memory QoS 0 message bytes. A misconfigured divisor
    /// below 1 falls back to a quarter of the memory budget.
    pub fn qos0_memory_limit(&self) -> u64 {
        if self.qos0_memory_hard_limit_divisor < 1 {
            self.memory_budget_bytes / DEFAULT_QOS_0_MEMORY_HARD_LIMIT_DIVISOR as u64
        } else {
            self.memory_budget_bytes / self.qos0_memory_hard_limit_divisor as u64
        }
    }
}
