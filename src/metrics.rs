//! Per-queue counters and the gauge view over tier internals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use hdrhistogram::Histogram;

use crate::tier::Tier;

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters kept per logical queue, shared by every tier of a chain.
#[derive(Debug, Default)]
pub struct QueueStats {
    /// Batches a full tier handed to the next tier.
    pub queued_full: Counter,
    /// Records committed after a successful sink call.
    pub delivered: Counter,
    pub delivered_points: Counter,
    /// Drain cycles that ended in `DeliveryFailure`.
    pub delivery_failed: Counter,
    /// Drain cycles cut short by admission control.
    pub rate_limited: Counter,
    pub session_faults: Counter,
}

#[derive(Debug, Default)]
pub struct StatsRegistry {
    queues: RwLock<HashMap<String, Arc<QueueStats>>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stats for `queue`, creating them on first use.
    pub fn get(&self, queue: &str) -> Arc<QueueStats> {
        if let Ok(queues) = self.queues.read() {
            if let Some(stats) = queues.get(queue) {
                return Arc::clone(stats);
            }
        }
        match self.queues.write() {
            Ok(mut queues) => Arc::clone(queues.entry(queue.to_string()).or_default()),
            // A poisoned registry still hands out counters; they just go unreported.
            Err(_) => Arc::new(QueueStats::default()),
        }
    }

    pub fn queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .queues
            .read()
            .map(|queues| queues.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

const QUEUE_TIME_MAX_MS: u64 = 7 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QueueTimeSummary {
    pub count: u64,
    pub p50_ms: u64,
    pub p99_ms: u64,
    pub max_ms: u64,
}

/// Distribution of how long records waited between accept and commit.
pub struct QueueTimes {
    // None only if hdrhistogram rejects the bounds, in which case nothing is recorded.
    histogram: Mutex<Option<Histogram<u64>>>,
}

impl QueueTimes {
    pub fn new() -> Self {
        Self {
            histogram: Mutex::new(Histogram::new_with_bounds(1, QUEUE_TIME_MAX_MS, 3).ok()),
        }
    }

    pub fn record(&self, queue_time_ms: u64) {
        if let Ok(mut guard) = self.histogram.lock() {
            if let Some(histogram) = guard.as_mut() {
                let _ = histogram.record(queue_time_ms.clamp(1, QUEUE_TIME_MAX_MS));
            }
        }
    }

    pub fn summary(&self) -> QueueTimeSummary {
        let Ok(guard) = self.histogram.lock() else {
            return QueueTimeSummary::default();
        };
        match guard.as_ref() {
            Some(histogram) if !histogram.is_empty() => QueueTimeSummary {
                count: histogram.len(),
                p50_ms: histogram.value_at_quantile(0.50),
                p99_ms: histogram.value_at_quantile(0.99),
                max_ms: histogram.max(),
            },
            _ => QueueTimeSummary::default(),
        }
    }
}

impl Default for QueueTimes {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
}

impl MetricSample {
    fn new(name: String, value: impl Into<f64>) -> Self {
        Self {
            name,
            value: value.into(),
        }
    }
}

/// Flattens tier and queue state into named gauges.
///
/// Names follow `buffer.{tier}.{queue}.{gauge}` for per-queue tier gauges,
/// `buffer.{tier}.diskUsage` for durable tiers, and `queue.{queue}.{counter}`
/// for chain-wide queue counters.
pub struct MetricsBridge {
    tiers: RwLock<Vec<Arc<Tier>>>,
    stats: Arc<StatsRegistry>,
}

impl MetricsBridge {
    pub fn new(stats: Arc<StatsRegistry>) -> Self {
        Self {
            tiers: RwLock::new(Vec::new()),
            stats,
        }
    }

    pub fn register_tier(&self, tier: Arc<Tier>) {
        if let Ok(mut tiers) = self.tiers.write() {
            if !tiers.iter().any(|t| t.name() == tier.name()) {
                tiers.push(tier);
            }
        }
    }

    /// Samples every gauge and counter, sorted by name.
    pub fn snapshot(&self) -> Vec<MetricSample> {
        let mut samples = Vec::new();
        let tiers: Vec<Arc<Tier>> = self
            .tiers
            .read()
            .map(|tiers| tiers.clone())
            .unwrap_or_default();
        for tier in &tiers {
            let prefix = format!("buffer.{}", tier.name());
            for queue in tier.queue_names() {
                let usage = tier.usage(&queue);
                let base = format!("{prefix}.{queue}");
                let times = tier.queue_time(&queue);
                let gauges = [
                    ("size", usage.bytes as f64),
                    ("usage", usage.usage_percent()),
                    ("points", usage.points as f64),
                    ("queue-time.count", times.count as f64),
                    ("queue-time.p50", times.p50_ms as f64),
                    ("queue-time.p99", times.p99_ms as f64),
                    ("queue-time.max", times.max_ms as f64),
                ];
                for (name, value) in gauges {
                    samples.push(MetricSample::new(format!("{base}.{name}"), value));
                }
            }
            if let Some(disk) = tier.disk_usage() {
                let gauges = [
                    ("diskUsage", disk.fs_used_percent),
                    ("diskUsageMax", disk.max_fs_percent),
                    ("diskBytes", disk.used_bytes as f64),
                ];
                for (name, value) in gauges {
                    samples.push(MetricSample::new(format!("{prefix}.{name}"), value));
                }
            }
        }
        for queue in self.stats.queues() {
            let stats = self.stats.get(&queue);
            let base = format!("queue.{queue}");
            let counters = [
                ("queuedFull", &stats.queued_full),
                ("delivered", &stats.delivered),
                ("deliveredPoints", &stats.delivered_points),
                ("deliveryFailed", &stats.delivery_failed),
                ("rateLimited", &stats.rate_limited),
                ("sessionFaults", &stats.session_faults),
            ];
            for (name, counter) in counters {
                samples.push(MetricSample::new(format!("{base}.{name}"), counter.get() as f64));
            }
        }
        samples.sort_by(|a, b| a.name.cmp(&b.name));
        samples
    }

    /// Looks up one sample by exact name.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.snapshot()
            .into_iter()
            .find(|sample| sample.name == name)
            .map(|sample| sample.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_shares_stats_per_queue() {
        let registry = StatsRegistry::new();
        registry.get("points").queued_full.inc();
        registry.get("points").queued_full.add(2);
        assert_eq!(registry.get("points").queued_full.get(), 3);
        assert_eq!(registry.get("spans").queued_full.get(), 0);
        assert_eq!(registry.queues(), vec!["points".to_string(), "spans".to_string()]);
    }

    #[test]
    fn queue_time_summary() {
        let times = QueueTimes::new();
        assert_eq!(times.summary(), QueueTimeSummary::default());
        for ms in [10, 20, 30, 40, 1000] {
            times.record(ms);
        }
        let summary = times.summary();
        assert_eq!(summary.count, 5);
        assert!(summary.p50_ms >= 29 && summary.p50_ms <= 31, "p50 {}", summary.p50_ms);
        assert!(summary.max_ms >= 999 && summary.max_ms <= 1001, "max {}", summary.max_ms);
    }

    #[test]
    fn zero_queue_time_is_recorded() {
        let times = QueueTimes::new();
        times.record(0);
        assert_eq!(times.summary().count, 1);
    }
}
