//! One capacity-bounded buffering stage: a store plus its session pool.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use crate::config::DrainConfig;
use crate::consume::{self, AdmissionControl, BatchSink, DrainReport};
use crate::core::{Clock, SystemClock};
use crate::metrics::{QueueTimeSummary, QueueTimes, StatsRegistry};
use crate::session::SessionPool;
use crate::store::{
    CapacityPolicy, DiskStore, DiskUsage, MemoryStore, PartitionedQueueStore, QueueUsage, Record,
    RejectPolicy, SpillPolicy, TruncatedQueue,
};
use crate::throttle::ThrottledLog;
use crate::{Error, Result};

/// Queues whose names carry this prefix survive an administrative truncate.
pub const ACTIVE_QUEUE_PREFIX: &str = "active";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierKind {
    Volatile,
    Durable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TierState {
    Created = 0,
    Started = 1,
    Running = 2,
    Stopped = 3,
}

impl TierState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TierState::Created,
            1 => TierState::Started,
            2 => TierState::Running,
            _ => TierState::Stopped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDescriptor {
    pub name: String,
    pub partition_count: usize,
}

impl QueueDescriptor {
    pub fn new(name: impl Into<String>, partition_count: usize) -> Self {
        Self {
            name: name.into(),
            partition_count,
        }
    }
}

struct QueueEntry {
    descriptor: QueueDescriptor,
    times: QueueTimes,
}

pub struct Tier {
    name: String,
    priority: u32,
    policy: CapacityPolicy,
    store: Arc<dyn PartitionedQueueStore>,
    sessions: SessionPool,
    queues: RwLock<HashMap<String, Arc<QueueEntry>>>,
    stats: Arc<StatsRegistry>,
    clock: Arc<dyn Clock>,
    drain: DrainConfig,
    state: AtomicU8,
    throttle: ThrottledLog,
}

impl Tier {
    pub fn new(
        name: impl Into<String>,
        priority: u32,
        policy: CapacityPolicy,
        store: Arc<dyn PartitionedQueueStore>,
        stats: Arc<StatsRegistry>,
    ) -> Self {
        let name = name.into();
        Self {
            sessions: SessionPool::new(name.clone(), Arc::clone(&store), Arc::clone(&stats)),
            name,
            priority,
            policy,
            store,
            queues: RwLock::new(HashMap::new()),
            stats,
            clock: Arc::new(SystemClock),
            drain: DrainConfig::default(),
            state: AtomicU8::new(TierState::Created as u8),
            throttle: ThrottledLog::default(),
        }
    }

    /// A volatile tier over an in-memory store.
    pub fn memory(
        name: impl Into<String>,
        priority: u32,
        policy: RejectPolicy,
        stats: Arc<StatsRegistry>,
    ) -> Self {
        let name = name.into();
        let store = Arc::new(MemoryStore::new(name.clone(), policy.clone()));
        Self::new(name, priority, CapacityPolicy::Reject(policy), store, stats)
    }

    /// A durable tier over segment logs under `dir`.
    pub fn disk(
        name: impl Into<String>,
        priority: u32,
        dir: impl AsRef<Path>,
        policy: SpillPolicy,
        segment_size: u64,
        stats: Arc<StatsRegistry>,
    ) -> Result<Self> {
        let name = name.into();
        let store = DiskStore::new(name.clone(), dir.as_ref(), policy.clone(), segment_size)?;
        let store = Arc::new(store);
        Ok(Self::new(name, priority, CapacityPolicy::Spill(policy), store, stats))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_drain_config(mut self, drain: DrainConfig) -> Self {
        self.drain = drain;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Informational ordering hint; lower is consulted first by convention.
    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn kind(&self) -> TierKind {
        match self.policy {
            CapacityPolicy::Reject(_) => TierKind::Volatile,
            CapacityPolicy::Spill(_) => TierKind::Durable,
        }
    }

    pub fn policy(&self) -> &CapacityPolicy {
        &self.policy
    }

    pub fn state(&self) -> TierState {
        TierState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn store(&self) -> &Arc<dyn PartitionedQueueStore> {
        &self.store
    }

    pub fn sessions(&self) -> &SessionPool {
        &self.sessions
    }

    pub fn stats(&self) -> &Arc<StatsRegistry> {
        &self.stats
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn drain_config(&self) -> &DrainConfig {
        &self.drain
    }

    pub(crate) fn throttle(&self) -> &ThrottledLog {
        &self.throttle
    }

    /// Bootstraps the store (replaying any persisted backlog) and opens the
    /// tier for traffic. Starting a running tier is a no-op.
    pub fn start(&self) -> Result<()> {
        match self.state() {
            TierState::Running => return Ok(()),
            TierState::Stopped => return Err(Error::closed(&self.name)),
            TierState::Started | TierState::Created => {}
        }
        if self
            .state
            .compare_exchange(
                TierState::Created as u8,
                TierState::Started as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return match self.state() {
                TierState::Stopped => Err(Error::closed(&self.name)),
                _ => Ok(()),
            };
        }
        if let Err(err) = self.store.open() {
            log::error!("tier '{}' failed to open its store: {}", self.name, err);
            self.state.store(TierState::Created as u8, Ordering::Release);
            return Err(err);
        }
        for queue in self.store.queues() {
            let usage = self.store.usage(&queue);
            if usage.records > 0 {
                log::info!(
                    "tier '{}' holds {} records ({} points) for queue '{}'",
                    self.name,
                    usage.records,
                    usage.points,
                    queue
                );
            }
        }
        // A concurrent stop() wins over the transition to running.
        let _ = self.state.compare_exchange(
            TierState::Started as u8,
            TierState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.ensure_running()
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        match self.state() {
            TierState::Running => Ok(()),
            TierState::Stopped => Err(Error::closed(&self.name)),
            TierState::Created | TierState::Started => Err(Error::InvalidState("tier not started")),
        }
    }

    /// Creates one partition per descriptor slot and sets up the queue's metrics.
    pub fn register_queue(&self, descriptor: &QueueDescriptor) -> Result<()> {
        self.ensure_running()?;
        if descriptor.partition_count == 0 {
            return Err(Error::Config(format!(
                "queue '{}' needs at least one partition",
                descriptor.name
            )));
        }
        if let Some(existing) = self.entry(&descriptor.name) {
            if existing.descriptor.partition_count != descriptor.partition_count {
                return Err(Error::InvalidState("partition count is fixed once registered"));
            }
            return Ok(());
        }
        for partition in 0..descriptor.partition_count {
            self.store.create_partition(&descriptor.name, partition)?;
        }
        self.stats.get(&descriptor.name);
        let mut queues = self
            .queues
            .write()
            .map_err(|_| Error::InvalidState("queue registry lock poisoned"))?;
        queues.entry(descriptor.name.clone()).or_insert_with(|| {
            Arc::new(QueueEntry {
                descriptor: descriptor.clone(),
                times: QueueTimes::new(),
            })
        });
        log::debug!(
            "tier '{}' registered queue '{}' with {} partitions",
            self.name,
            descriptor.name,
            descriptor.partition_count
        );
        Ok(())
    }

    fn entry(&self, queue: &str) -> Option<Arc<QueueEntry>> {
        self.queues.read().ok().and_then(|queues| queues.get(queue).cloned())
    }

    pub fn descriptor(&self, queue: &str) -> Option<QueueDescriptor> {
        self.entry(queue).map(|entry| entry.descriptor.clone())
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .queues
            .read()
            .map(|queues| queues.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Stores `points` as one record on the worker's producer partition.
    pub fn accept<S: AsRef<str>>(&self, queue: &str, worker: &str, points: &[S]) -> Result<()> {
        self.ensure_running()?;
        let entry = self.entry(queue).ok_or_else(|| Error::UnknownQueue(queue.to_string()))?;
        if self.kind() == TierKind::Durable && self.store.is_disk_full() {
            self.throttle.warn(&format!("disk-full.{}", self.name), || {
                format!("tier '{}' disk is full, rejecting writes", self.name)
            });
            return Err(Error::capacity(&self.name, queue));
        }
        let record = Arc::new(Record::from_points(points, self.clock.now_ms()));
        let partitions = entry.descriptor.partition_count;
        let result = self.sessions.with_producer(queue, worker, partitions, |producer| {
            producer.send(Arc::clone(&record))
        });
        if let Err(err) = &result {
            if err.is_capacity_exceeded() {
                self.throttle.warn(&format!("full.{}.{}", self.name, queue), || {
                    format!("tier '{}' is full for queue '{}'", self.name, queue)
                });
            }
        }
        result
    }

    /// Runs one drain cycle against `queue`'s `partition`.
    pub fn drain_batch(
        &self,
        queue: &str,
        partition: usize,
        worker: &str,
        max_batch_size: usize,
        admission: &dyn AdmissionControl,
        sink: &mut dyn BatchSink,
    ) -> Result<DrainReport> {
        consume::drain_cycle(self, queue, partition, worker, max_batch_size, admission, sink)
    }

    /// Fullness for one queue, or for the tier as a whole when `queue` is `None`.
    pub fn is_full(&self, queue: Option<&str>) -> bool {
        self.store.is_full(queue)
    }

    pub fn usage(&self, queue: &str) -> QueueUsage {
        self.store.usage(queue)
    }

    pub fn disk_usage(&self) -> Option<DiskUsage> {
        self.store.disk_usage()
    }

    pub fn queue_time(&self, queue: &str) -> QueueTimeSummary {
        self.entry(queue)
            .map(|entry| entry.times.summary())
            .unwrap_or_default()
    }

    pub(crate) fn record_queue_time(&self, queue: &str, queue_time_ms: u64) {
        if let Some(entry) = self.entry(queue) {
            entry.times.record(queue_time_ms);
        }
    }

    /// Purges the backlog of every queue not marked active. Durable tiers only.
    pub fn truncate(&self) -> Result<Vec<TruncatedQueue>> {
        self.ensure_running()?;
        if self.kind() != TierKind::Durable {
            return Err(Error::InvalidState("truncate is only supported on durable tiers"));
        }
        let purged = self
            .store
            .truncate(&|queue: &str| !queue.starts_with(ACTIVE_QUEUE_PREFIX))?;
        for queue in &purged {
            log::info!(
                "tier '{}' truncated queue '{}': {} records, {} points discarded",
                self.name,
                queue.queue,
                queue.records,
                queue.points
            );
        }
        Ok(purged)
    }

    /// Stops the tier for good. Sessions and the store are closed best effort;
    /// failures are logged, never returned.
    pub fn stop(&self) {
        let previous = self.state.swap(TierState::Stopped as u8, Ordering::AcqRel);
        if TierState::from_u8(previous) == TierState::Stopped {
            return;
        }
        self.sessions.close_all();
        if let Err(err) = self.store.close() {
            log::warn!("tier '{}' store close failed: {}", self.name, err);
        }
        log::info!("tier '{}' stopped", self.name);
    }
}

impl Drop for Tier {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;
    use tempfile::tempdir;

    fn memory_tier(max_bytes: u64) -> Tier {
        let stats = Arc::new(StatsRegistry::new());
        let tier = Tier::memory("memory", 0, RejectPolicy::new(max_bytes), stats);
        tier.start().expect("start");
        tier.register_queue(&QueueDescriptor::new("points", 2)).expect("register");
        tier
    }

    #[test]
    fn lifecycle_transitions() {
        let stats = Arc::new(StatsRegistry::new());
        let tier = Tier::memory("memory", 0, RejectPolicy::new(1024), stats);
        assert_eq!(tier.state(), TierState::Created);
        assert!(tier.accept("points", "w", &["a"]).is_err());
        tier.start().expect("start");
        assert_eq!(tier.state(), TierState::Running);
        tier.start().expect("restart is a no-op");
        tier.stop();
        assert_eq!(tier.state(), TierState::Stopped);
        assert!(tier.start().expect_err("stopped").is_tier_closed());
        let err = tier.accept("points", "w", &["a"]).expect_err("closed");
        assert!(err.is_tier_closed());
    }

    #[test]
    fn accept_requires_registered_queue() {
        let tier = memory_tier(1024);
        let err = tier.accept("spans", "w", &["a"]).expect_err("unknown");
        assert!(matches!(err, Error::UnknownQueue(_)));
    }

    #[test]
    fn partition_count_is_fixed() {
        let tier = memory_tier(1024);
        tier.register_queue(&QueueDescriptor::new("points", 2)).expect("same count");
        assert!(tier.register_queue(&QueueDescriptor::new("points", 3)).is_err());
        assert_eq!(tier.store().partition_count("points"), 2);
    }

    #[test]
    fn accept_over_budget_is_capacity_exceeded() {
        let tier = memory_tier(8);
        tier.accept("points", "w", &["abcd"]).expect("fits");
        let err = tier.accept("points", "w", &["abcdefgh"]).expect_err("full");
        assert!(err.is_capacity_exceeded());
        assert_eq!(tier.usage("points").records, 1);
    }

    #[test]
    fn accept_stamps_clock_time() {
        let clock = Arc::new(ManualClock::new(5_000));
        let stats = Arc::new(StatsRegistry::new());
        let tier =
            Tier::memory("memory", 0, RejectPolicy::new(1024), stats).with_clock(clock.clone());
        tier.start().expect("start");
        tier.register_queue(&QueueDescriptor::new("points", 1)).expect("register");
        tier.accept("points", "w", &["cpu 1"]).expect("accept");
        let delivery = tier
            .store()
            .receive("points", 0, std::time::Duration::from_millis(10))
            .expect("receive")
            .expect("record");
        assert_eq!(delivery.record.enqueued_ms(), 5_000);
    }

    #[test]
    fn truncate_spares_active_queues() {
        let dir = tempdir().expect("tempdir");
        let tier = Tier::disk(
            "disk",
            1,
            dir.path(),
            SpillPolicy {
                max_disk_usage_percent: 100.0,
                ..SpillPolicy::default()
            },
            4096,
            Arc::new(StatsRegistry::new()),
        )
        .expect("tier");
        tier.start().expect("start");
        tier.register_queue(&QueueDescriptor::new("points", 1)).expect("points");
        tier.register_queue(&QueueDescriptor::new("active-points", 1)).expect("active");
        tier.accept("points", "w", &["a", "b"]).expect("accept");
        tier.accept("active-points", "w", &["c"]).expect("accept");

        let purged = tier.truncate().expect("truncate");
        assert_eq!(purged.len(), 1);
        assert_eq!(purged[0].queue, "points");
        assert_eq!(purged[0].points, 2);
        assert_eq!(tier.usage("points").records, 0);
        assert_eq!(tier.usage("active-points").records, 1);
    }

    #[test]
    fn truncate_rejected_on_volatile_tier() {
        let tier = memory_tier(1024);
        assert!(matches!(tier.truncate(), Err(Error::InvalidState(_))));
    }
}
