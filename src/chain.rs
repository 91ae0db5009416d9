//! Ordered tiers with store-and-forward overflow.

use std::collections::HashSet;
use std::sync::Arc;

use crate::config::BufferConfig;
use crate::core::{Clock, SystemClock};
use crate::metrics::{MetricsBridge, StatsRegistry};
use crate::throttle::ThrottledLog;
use crate::tier::{QueueDescriptor, Tier};
use crate::{Error, Result};

/// Tiers in overflow order: a batch goes to the first tier that takes it.
pub struct TierChain {
    tiers: Vec<Arc<Tier>>,
    stats: Arc<StatsRegistry>,
    metrics: MetricsBridge,
    throttle: ThrottledLog,
}

impl TierChain {
    /// `stats` must be the registry the tiers were built with so overflow
    /// and drain counters land in the same place.
    pub fn new(tiers: Vec<Arc<Tier>>, stats: Arc<StatsRegistry>) -> Result<Self> {
        if tiers.is_empty() {
            return Err(Error::Config("a tier chain needs at least one tier".into()));
        }
        let mut names = HashSet::new();
        for tier in &tiers {
            if !names.insert(tier.name().to_string()) {
                return Err(Error::Config(format!("tier name '{}' used twice", tier.name())));
            }
        }
        let metrics = MetricsBridge::new(Arc::clone(&stats));
        for tier in &tiers {
            metrics.register_tier(Arc::clone(tier));
        }
        Ok(Self {
            tiers,
            stats,
            metrics,
            throttle: ThrottledLog::default(),
        })
    }

    /// Builds the memory tier and, when configured, the disk tier behind it.
    pub fn from_config(config: &BufferConfig) -> Result<Self> {
        Self::from_config_with_clock(config, Arc::new(SystemClock))
    }

    pub fn from_config_with_clock(config: &BufferConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let stats = Arc::new(StatsRegistry::new());
        let memory = Tier::memory(
            config.memory.name.clone(),
            0,
            config.memory.reject_policy(),
            Arc::clone(&stats),
        )
        .with_clock(Arc::clone(&clock))
        .with_drain_config(config.drain);
        let mut tiers = vec![Arc::new(memory)];
        if let Some(disk) = &config.disk {
            let tier = Tier::disk(
                disk.name.clone(),
                1,
                &disk.dir,
                disk.spill_policy(),
                disk.segment_size_bytes,
                Arc::clone(&stats),
            )?
            .with_clock(clock)
            .with_drain_config(config.drain);
            tiers.push(Arc::new(tier));
        }
        Self::new(tiers, stats)
    }

    pub fn tiers(&self) -> &[Arc<Tier>] {
        &self.tiers
    }

    pub fn tier(&self, name: &str) -> Option<&Arc<Tier>> {
        self.tiers.iter().find(|tier| tier.name() == name)
    }

    pub fn stats(&self) -> &Arc<StatsRegistry> {
        &self.stats
    }

    pub fn metrics(&self) -> &MetricsBridge {
        &self.metrics
    }

    pub fn start(&self) -> Result<()> {
        for tier in &self.tiers {
            tier.start()?;
        }
        Ok(())
    }

    pub fn register_queue(&self, descriptor: &QueueDescriptor) -> Result<()> {
        for tier in &self.tiers {
            tier.register_queue(descriptor)?;
        }
        Ok(())
    }

    /// Offers the batch to each tier in turn. Returns the index of the tier
    /// that stored it. Every hop past a full tier counts toward the queue's
    /// `queued_full`; the last tier's `CapacityExceeded` goes to the caller.
    pub fn send_points<S: AsRef<str>>(
        &self,
        queue: &str,
        worker: &str,
        points: &[S],
    ) -> Result<usize> {
        let last = self.tiers.len() - 1;
        for (idx, tier) in self.tiers.iter().enumerate() {
            match tier.accept(queue, worker, points) {
                Ok(()) => {
                    if idx > 0 {
                        self.stats.get(queue).queued_full.add(idx as u64);
                    }
                    return Ok(idx);
                }
                Err(err) if err.is_capacity_exceeded() && idx < last => {
                    self.throttle.info(&format!("overflow.{}.{}", tier.name(), queue), || {
                        format!(
                            "tier '{}' full for queue '{}', forwarding to '{}'",
                            tier.name(),
                            queue,
                            self.tiers[idx + 1].name()
                        )
                    });
                }
                Err(err) => return Err(err),
            }
        }
        Err(Error::InvalidState("tier chain is empty"))
    }

    /// True only when every tier reports full.
    pub fn is_full(&self, queue: Option<&str>) -> bool {
        self.tiers.iter().all(|tier| tier.is_full(queue))
    }

    /// Stops every tier, head first. Errors are logged by each tier.
    pub fn stop(&self) {
        for tier in &self.tiers {
            tier.stop();
        }
    }
}
