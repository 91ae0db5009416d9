//! Partitioned record storage behind each tier.
//!
//! A store holds many logical queues, each split into a fixed number of
//! independent partitions. Records move through three states inside a
//! partition: queued, delivered (handed to a consumer, not yet committed),
//! and committed (removed). Rolled-back deliveries return to the head of
//! their partition in their original order.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::{Error, Result};

pub mod disk;
pub mod memory;
pub mod segment_log;

pub use disk::{DiskStore, SpillPolicy};
pub use memory::{MemoryStore, RejectPolicy};

/// One stored batch of newline-joined point lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    payload: Vec<u8>,
    point_count: u32,
    enqueued_ms: u64,
}

impl Record {
    pub fn new(payload: Vec<u8>, point_count: u32, enqueued_ms: u64) -> Self {
        Self {
            payload,
            point_count,
            enqueued_ms,
        }
    }

    pub fn from_points<S: AsRef<str>>(points: &[S], enqueued_ms: u64) -> Self {
        let mut payload = Vec::with_capacity(points.iter().map(|p| p.as_ref().len() + 1).sum());
        for (idx, point) in points.iter().enumerate() {
            if idx > 0 {
                payload.push(b'\n');
            }
            payload.extend_from_slice(point.as_ref().as_bytes());
        }
        Self::new(payload, points.len() as u32, enqueued_ms)
    }

    /// Splits the payload back into point lines. An empty or non-UTF-8
    /// payload yields no lines.
    pub fn points(&self) -> Vec<String> {
        if self.payload.is_empty() {
            return Vec::new();
        }
        match std::str::from_utf8(&self.payload) {
            Ok(text) => text.split('\n').map(str::to_string).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn point_count(&self) -> u32 {
        self.point_count
    }

    pub fn enqueued_ms(&self) -> u64 {
        self.enqueued_ms
    }

    /// Bytes charged against a store's capacity budget.
    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }
}

/// Identifies one delivery of a record to a consumer.
///
/// `epoch` changes when a partition is truncated, so tags issued before a
/// purge are ignored by later commits and rollbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag {
    pub seq: u64,
    pub epoch: u64,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub record: Arc<Record>,
}

/// Backlog of one queue (all partitions) as seen by the store.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QueueUsage {
    pub records: u64,
    pub points: u64,
    pub bytes: u64,
    pub limit_bytes: Option<u64>,
}

impl QueueUsage {
    /// Percentage of the queue's byte limit in use; 0 when unlimited.
    pub fn usage_percent(&self) -> f64 {
        match self.limit_bytes {
            Some(limit) if limit > 0 => self.bytes as f64 * 100.0 / limit as f64,
            _ => 0.0,
        }
    }

    pub(crate) fn add(&mut self, other: &QueueUsage) {
        self.records += other.records;
        self.points += other.points;
        self.bytes += other.bytes;
    }
}

/// Disk footprint of a durable store.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DiskUsage {
    pub used_bytes: u64,
    pub max_bytes: Option<u64>,
    pub fs_used_percent: f64,
    pub max_fs_percent: f64,
}

/// Outcome of an administrative purge for one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncatedQueue {
    pub queue: String,
    pub records: u64,
    pub points: u64,
}

/// How a store answers an append once its budget is spent.
#[derive(Debug, Clone, PartialEq)]
pub enum CapacityPolicy {
    /// Fail appends once the memory budget is exhausted.
    Reject(RejectPolicy),
    /// Keep appending to disk segments until the disk budget is exhausted.
    Spill(SpillPolicy),
}

pub trait PartitionedQueueStore: Send + Sync {
    /// Bootstraps the store, replaying any persisted partitions.
    fn open(&self) -> Result<()>;

    /// Creates the partition if absent; a no-op otherwise.
    fn create_partition(&self, queue: &str, partition: usize) -> Result<()>;

    fn partition_count(&self, queue: &str) -> usize;

    fn queues(&self) -> Vec<String>;

    /// Appends a record, failing with `CapacityExceeded` when the budget for
    /// this address is spent.
    fn append(&self, queue: &str, partition: usize, record: Arc<Record>) -> Result<()>;

    /// Waits up to `timeout` for the next record. `Ok(None)` on timeout.
    fn receive(&self, queue: &str, partition: usize, timeout: Duration) -> Result<Option<Delivery>>;

    /// Removes delivered records for good.
    fn commit(&self, queue: &str, partition: usize, tags: &[DeliveryTag]) -> Result<()>;

    /// Returns delivered records to the head of the partition.
    fn rollback(&self, queue: &str, partition: usize, tags: &[DeliveryTag]) -> Result<()>;

    /// Capacity predicate for one queue, or for the store when `queue` is `None`.
    fn is_full(&self, queue: Option<&str>) -> bool;

    fn is_disk_full(&self) -> bool {
        false
    }

    fn usage(&self, queue: &str) -> QueueUsage;

    fn disk_usage(&self) -> Option<DiskUsage> {
        None
    }

    /// Discards every undelivered and in-flight record of queues for which
    /// `purge` returns true.
    fn truncate(&self, purge: &dyn Fn(&str) -> bool) -> Result<Vec<TruncatedQueue>>;

    /// Wakes blocked receivers and releases resources. Later calls fail.
    fn close(&self) -> Result<()>;
}

/// A partition's state plus the condition variable receivers park on.
pub(crate) struct Slot<T> {
    state: Mutex<T>,
    ready: Condvar,
}

impl<T> Slot<T> {
    pub(crate) fn new(state: T) -> Self {
        Self {
            state: Mutex::new(state),
            ready: Condvar::new(),
        }
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, T>> {
        self.state
            .lock()
            .map_err(|_| Error::InvalidState("partition lock poisoned"))
    }

    pub(crate) fn notify(&self) {
        self.ready.notify_all();
    }

    /// Repeatedly offers the locked state to `poll` until it yields a value,
    /// the timeout elapses, or `check_open` reports shutdown.
    pub(crate) fn wait_for<R>(
        &self,
        timeout: Duration,
        check_open: impl Fn() -> Result<()>,
        mut poll: impl FnMut(&mut T) -> Result<Option<R>>,
    ) -> Result<Option<R>> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock()?;
        loop {
            check_open()?;
            if let Some(value) = poll(&mut *guard)? {
                return Ok(Some(value));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (next, _) = self
                .ready
                .wait_timeout(guard, deadline - now)
                .map_err(|_| Error::InvalidState("partition lock poisoned"))?;
            guard = next;
        }
    }
}
