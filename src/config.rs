//! JSON configuration for a memory → disk buffer chain.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::segment::{validate_segment_size, DEFAULT_SEGMENT_SIZE};
use crate::store::{RejectPolicy, SpillPolicy};
use crate::{Error, Result};

pub const DEFAULT_MEMORY_MAX_BYTES: u64 = 64 * 1024 * 1024;
pub const DEFAULT_BATCH_BUDGET_MS: u64 = 1000;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;

/// What a drain cycle does with received records when the sink fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Roll every pending record back to the head of its partition.
    #[default]
    Redeliver,
    /// Commit the pending records anyway so a poison batch cannot stall the partition.
    Discard,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryTierConfig {
    pub name: String,
    pub max_bytes: u64,
    pub max_queue_bytes: Option<u64>,
}

impl Default for MemoryTierConfig {
    fn default() -> Self {
        Self {
            name: "memory".to_string(),
            max_bytes: DEFAULT_MEMORY_MAX_BYTES,
            max_queue_bytes: None,
        }
    }
}

impl MemoryTierConfig {
    pub fn reject_policy(&self) -> RejectPolicy {
        RejectPolicy {
            max_bytes: self.max_bytes,
            max_queue_bytes: self.max_queue_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskTierConfig {
    pub name: String,
    pub dir: PathBuf,
    pub max_disk_usage_percent: f64,
    pub max_bytes: Option<u64>,
    pub segment_size_bytes: u64,
    pub disk_scan_interval_ms: u64,
}

impl Default for DiskTierConfig {
    fn default() -> Self {
        let spill = SpillPolicy::default();
        Self {
            name: "disk".to_string(),
            dir: PathBuf::from("buffer"),
            max_disk_usage_percent: spill.max_disk_usage_percent,
            max_bytes: spill.max_bytes,
            segment_size_bytes: DEFAULT_SEGMENT_SIZE as u64,
            disk_scan_interval_ms: spill.scan_interval.as_millis() as u64,
        }
    }
}

impl DiskTierConfig {
    pub fn spill_policy(&self) -> SpillPolicy {
        SpillPolicy {
            max_disk_usage_percent: self.max_disk_usage_percent,
            max_bytes: self.max_bytes,
            scan_interval: Duration::from_millis(self.disk_scan_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainConfig {
    /// Wall-clock budget for one drain cycle.
    pub batch_budget_ms: u64,
    /// Longest single wait for the next record.
    pub poll_timeout_ms: u64,
    pub failure_policy: FailurePolicy,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            batch_budget_ms: DEFAULT_BATCH_BUDGET_MS,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl DrainConfig {
    pub fn batch_budget(&self) -> Duration {
        Duration::from_millis(self.batch_budget_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub memory: MemoryTierConfig,
    /// Durable overflow tier; a memory-only chain when absent.
    pub disk: Option<DiskTierConfig>,
    pub drain: DrainConfig,
}

impl BufferConfig {
    /// Reads and validates a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("reading {}: {err}", path.display())))?;
        let config: BufferConfig = serde_json::from_str(&text)
            .map_err(|err| Error::Config(format!("parsing {}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.memory.max_bytes == 0 {
            return Err(Error::Config("memory.max_bytes must be positive".into()));
        }
        if self.memory.max_queue_bytes == Some(0) {
            return Err(Error::Config("memory.max_queue_bytes must be positive".into()));
        }
        if self.drain.batch_budget_ms == 0 || self.drain.poll_timeout_ms == 0 {
            return Err(Error::Config("drain budgets must be positive".into()));
        }
        if let Some(disk) = &self.disk {
            if disk.name == self.memory.name {
                return Err(Error::Config(format!("tier name '{}' used twice", disk.name)));
            }
            if !(1.0..=100.0).contains(&disk.max_disk_usage_percent) {
                return Err(Error::Config(format!(
                    "disk.max_disk_usage_percent {} outside 1..=100",
                    disk.max_disk_usage_percent
                )));
            }
            if disk.max_bytes == Some(0) {
                return Err(Error::Config("disk.max_bytes must be positive".into()));
            }
            validate_segment_size(disk.segment_size_bytes)
                .map_err(|err| Error::Config(format!("disk.segment_size_bytes: {err}")))?;
        }
        Ok(())
    }
}
