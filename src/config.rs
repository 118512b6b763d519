use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{Result, WardenError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    /// Interval between poll cycles while any task is running.
    pub poll_interval_secs: u64,
    /// Hard lifetime cap for a task, measured from queueing (pending) or
    /// start (running) time.
    pub task_ttl_secs: u64,
    /// A running task with no progress for this long is force-cancelled.
    pub stale_timeout_secs: u64,
    /// Tasks younger than this are exempt from the stale check.
    pub min_runtime_before_stale_secs: u64,
    /// Idle signals arriving sooner than this after start are ignored.
    pub min_idle_secs: u64,
    /// Message-count stability detection only engages after this much runtime.
    pub min_stability_secs: u64,
    /// Consecutive polls with an unchanged message count needed to treat a
    /// session as a completion candidate.
    pub stable_polls_required: u32,
    /// How long settled tasks stay retrievable before eviction.
    pub retention_secs: u64,
    pub concurrency: ConcurrencyConfig,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 2,
            task_ttl_secs: 30 * 60,
            stale_timeout_secs: 180,
            min_runtime_before_stale_secs: 30,
            min_idle_secs: 5,
            min_stability_secs: 10,
            stable_polls_required: 3,
            retention_secs: 5 * 60,
            concurrency: ConcurrencyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Limit applied to keys without an explicit entry. `None` leaves such
    /// keys unbounded.
    pub default_limit: Option<usize>,
    /// Per-key concurrency limits (key = "provider/model" or agent name).
    pub limits: HashMap<String, usize>,
}

impl ConcurrencyConfig {
    pub fn limit_for(&self, key: &str) -> Option<usize> {
        self.limits.get(key).copied().or(self.default_limit)
    }
}

impl WardenConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = fs::read_to_string(path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.poll_interval_secs == 0 {
            errors.push("poll_interval_secs must be greater than 0");
        }
        if self.task_ttl_secs == 0 {
            errors.push("task_ttl_secs must be greater than 0");
        }
        if self.stale_timeout_secs == 0 {
            errors.push("stale_timeout_secs must be greater than 0");
        }
        if self.stable_polls_required == 0 {
            errors.push("stable_polls_required must be greater than 0");
        }
        if self.retention_secs == 0 {
            errors.push("retention_secs must be greater than 0");
        }
        if self.concurrency.default_limit == Some(0) {
            errors.push("concurrency.default_limit must be greater than 0 when set");
        }
        if self.concurrency.limits.values().any(|&limit| limit == 0) {
            errors.push("concurrency.limits entries must be greater than 0");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(WardenError::Config(errors.join("; ")))
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}
