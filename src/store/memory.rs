use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::store::{
    Delivery, DeliveryTag, PartitionedQueueStore, QueueUsage, Record, Slot, TruncatedQueue,
};
use crate::{Error, Result};

/// Byte budgets for the volatile store. Appends beyond either budget fail.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectPolicy {
    pub max_bytes: u64,
    pub max_queue_bytes: Option<u64>,
}

impl RejectPolicy {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            max_queue_bytes: None,
        }
    }
}

#[derive(Default)]
struct MemPartition {
    queued: VecDeque<(u64, Arc<Record>)>,
    in_flight: BTreeMap<u64, Arc<Record>>,
    next_seq: u64,
    epoch: u64,
}

#[derive(Default)]
struct Counters {
    records: AtomicU64,
    points: AtomicU64,
    bytes: AtomicU64,
}

impl Counters {
    fn add(&self, record: &Record) {
        self.records.fetch_add(1, Ordering::AcqRel);
        self.points.fetch_add(record.point_count() as u64, Ordering::AcqRel);
    }

    fn remove(&self, record: &Record) {
        self.records.fetch_sub(1, Ordering::AcqRel);
        self.points.fetch_sub(record.point_count() as u64, Ordering::AcqRel);
        self.bytes.fetch_sub(record.size(), Ordering::AcqRel);
    }
}

#[derive(Default)]
struct MemQueue {
    partitions: RwLock<Vec<Arc<Slot<MemPartition>>>>,
    counters: Counters,
}

/// Volatile store: one in-memory deque per partition under a global byte budget.
pub struct MemoryStore {
    name: String,
    policy: RejectPolicy,
    queues: RwLock<HashMap<String, Arc<MemQueue>>>,
    used_bytes: AtomicU64,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>, policy: RejectPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            queues: RwLock::new(HashMap::new()),
            used_bytes: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::closed(&self.name));
        }
        Ok(())
    }

    fn queue(&self, queue: &str) -> Result<Arc<MemQueue>> {
        let queues = self
            .queues
            .read()
            .map_err(|_| Error::InvalidState("queue map lock poisoned"))?;
        queues
            .get(queue)
            .cloned()
            .ok_or_else(|| Error::UnknownQueue(queue.to_string()))
    }

    fn slot(
        &self,
        queue: &str,
        partition: usize,
    ) -> Result<(Arc<MemQueue>, Arc<Slot<MemPartition>>)> {
        let mem_queue = self.queue(queue)?;
        let slot = {
            let partitions = mem_queue
                .partitions
                .read()
                .map_err(|_| Error::InvalidState("partition list lock poisoned"))?;
            partitions.get(partition).cloned()
        };
        match slot {
            Some(slot) => Ok((mem_queue, slot)),
            None => Err(Error::UnknownPartition {
                queue: queue.to_string(),
                partition,
            }),
        }
    }

    /// Claims `size` bytes from a budget counter, failing if it would pass `limit`.
    fn reserve(counter: &AtomicU64, size: u64, limit: u64) -> bool {
        let mut current = counter.load(Ordering::Acquire);
        loop {
            let next = match current.checked_add(size) {
                Some(next) if next <= limit => next,
                _ => return false,
            };
            let swapped =
                counter.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire);
            match swapped {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, mem_queue: &MemQueue, record: &Record) {
        mem_queue.counters.remove(record);
        self.used_bytes.fetch_sub(record.size(), Ordering::AcqRel);
    }
}

impl PartitionedQueueStore for MemoryStore {
    fn open(&self) -> Result<()> {
        self.check_open()
    }

    fn create_partition(&self, queue: &str, partition: usize) -> Result<()> {
        self.check_open()?;
        let mem_queue = {
            let mut queues = self
                .queues
                .write()
                .map_err(|_| Error::InvalidState("queue map lock poisoned"))?;
            Arc::clone(queues.entry(queue.to_string()).or_default())
        };
        let mut partitions = mem_queue
            .partitions
            .write()
            .map_err(|_| Error::InvalidState("partition list lock poisoned"))?;
        while partitions.len() <= partition {
            partitions.push(Arc::new(Slot::new(MemPartition::default())));
        }
        Ok(())
    }

    fn partition_count(&self, queue: &str) -> usize {
        self.queue(queue)
            .ok()
            .and_then(|q| q.partitions.read().ok().map(|p| p.len()))
            .unwrap_or(0)
    }

    fn queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .queues
            .read()
            .map(|queues| queues.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    fn append(&self, queue: &str, partition: usize, record: Arc<Record>) -> Result<()> {
        self.check_open()?;
        let (mem_queue, slot) = self.slot(queue, partition)?;
        let size = record.size();

        if let Some(queue_limit) = self.policy.max_queue_bytes {
            if !Self::reserve(&mem_queue.counters.bytes, size, queue_limit) {
                return Err(Error::capacity(&self.name, queue));
            }
        } else {
            mem_queue.counters.bytes.fetch_add(size, Ordering::AcqRel);
        }
        if !Self::reserve(&self.used_bytes, size, self.policy.max_bytes) {
            mem_queue.counters.bytes.fetch_sub(size, Ordering::AcqRel);
            return Err(Error::capacity(&self.name, queue));
        }

        let mut state = slot.lock()?;
        let seq = state.next_seq;
        state.next_seq += 1;
        mem_queue.counters.add(&record);
        state.queued.push_back((seq, record));
        drop(state);
        slot.notify();
        Ok(())
    }

    fn receive(
        &self,
        queue: &str,
        partition: usize,
        timeout: Duration,
    ) -> Result<Option<Delivery>> {
        self.check_open()?;
        let (_, slot) = self.slot(queue, partition)?;
        slot.wait_for(timeout, || self.check_open(), |state| {
            Ok(state.queued.pop_front().map(|(seq, record)| {
                state.in_flight.insert(seq, Arc::clone(&record));
                Delivery {
                    tag: DeliveryTag {
                        seq,
                        epoch: state.epoch,
                    },
                    record,
                }
            }))
        })
    }

    fn commit(&self, queue: &str, partition: usize, tags: &[DeliveryTag]) -> Result<()> {
        self.check_open()?;
        let (mem_queue, slot) = self.slot(queue, partition)?;
        let mut state = slot.lock()?;
        let epoch = state.epoch;
        for tag in tags.iter().filter(|tag| tag.epoch == epoch) {
            if let Some(record) = state.in_flight.remove(&tag.seq) {
                self.release(&mem_queue, &record);
            }
        }
        Ok(())
    }

    fn rollback(&self, queue: &str, partition: usize, tags: &[DeliveryTag]) -> Result<()> {
        self.check_open()?;
        let (_, slot) = self.slot(queue, partition)?;
        let mut state = slot.lock()?;
        let epoch = state.epoch;
        let returned: Vec<(u64, Arc<Record>)> = tags
            .iter()
            .filter(|tag| tag.epoch == epoch)
            .filter_map(|tag| state.in_flight.remove(&tag.seq).map(|record| (tag.seq, record)))
            .collect();
        if returned.is_empty() {
            return Ok(());
        }
        for entry in returned {
            state.queued.push_front(entry);
        }
        // Redelivery keeps append order.
        state.queued.make_contiguous().sort_by_key(|(seq, _)| *seq);
        drop(state);
        slot.notify();
        Ok(())
    }

    fn is_full(&self, queue: Option<&str>) -> bool {
        if self.used_bytes() >= self.policy.max_bytes {
            return true;
        }
        match (queue, self.policy.max_queue_bytes) {
            (Some(queue), Some(limit)) => self
                .queue(queue)
                .map(|q| q.counters.bytes.load(Ordering::Acquire) >= limit)
                .unwrap_or(false),
            _ => false,
        }
    }

    fn usage(&self, queue: &str) -> QueueUsage {
        let limit_bytes = Some(self.policy.max_queue_bytes.unwrap_or(self.policy.max_bytes));
        match self.queue(queue) {
            Ok(q) => QueueUsage {
                records: q.counters.records.load(Ordering::Acquire),
                points: q.counters.points.load(Ordering::Acquire),
                bytes: q.counters.bytes.load(Ordering::Acquire),
                limit_bytes,
            },
            Err(_) => QueueUsage {
                limit_bytes,
                ..QueueUsage::default()
            },
        }
    }

    fn truncate(&self, purge: &dyn Fn(&str) -> bool) -> Result<Vec<TruncatedQueue>> {
        self.check_open()?;
        let mut purged = Vec::new();
        for name in self.queues().into_iter().filter(|name| purge(name)) {
            let mem_queue = self.queue(&name)?;
            let slots: Vec<_> = mem_queue
                .partitions
                .read()
                .map_err(|_| Error::InvalidState("partition list lock poisoned"))?
                .clone();
            let mut outcome = TruncatedQueue {
                queue: name,
                records: 0,
                points: 0,
            };
            for slot in slots {
                let mut state = slot.lock()?;
                let queued = std::mem::take(&mut state.queued).into_iter().map(|(_, r)| r);
                let in_flight = std::mem::take(&mut state.in_flight).into_values();
                for record in queued.chain(in_flight) {
                    outcome.records += 1;
                    outcome.points += record.point_count() as u64;
                    self.release(&mem_queue, &record);
                }
                state.epoch += 1;
            }
            purged.push(outcome);
        }
        Ok(purged)
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        if let Ok(queues) = self.queues.read() {
            for mem_queue in queues.values() {
                if let Ok(partitions) = mem_queue.partitions.read() {
                    partitions.iter().for_each(|slot| slot.notify());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(max_bytes: u64) -> MemoryStore {
        let store = MemoryStore::new("memory", RejectPolicy::new(max_bytes));
        store.create_partition("points", 0).expect("partition 0");
        store.create_partition("points", 1).expect("partition 1");
        store
    }

    fn record(points: &[&str]) -> Arc<Record> {
        Arc::new(Record::from_points(points, 0))
    }

    #[test]
    fn create_partition_is_idempotent() {
        let store = store(1024);
        store.create_partition("points", 1).expect("again");
        assert_eq!(store.partition_count("points"), 2);
        assert_eq!(store.partition_count("missing"), 0);
    }

    #[test]
    fn rejects_past_global_budget() {
        let store = store(10);
        store.append("points", 0, record(&["abcde"])).expect("first");
        store.append("points", 1, record(&["fghij"])).expect("fills budget");
        assert!(store.is_full(None));
        let err = store.append("points", 0, record(&["k"])).expect_err("over budget");
        assert!(err.is_capacity_exceeded());
        assert_eq!(store.used_bytes(), 10);
    }

    #[test]
    fn per_queue_budget_is_enforced() {
        let store = MemoryStore::new(
            "memory",
            RejectPolicy {
                max_bytes: 100,
                max_queue_bytes: Some(4),
            },
        );
        store.create_partition("a", 0).expect("a");
        store.create_partition("b", 0).expect("b");
        store.append("a", 0, record(&["1234"])).expect("a fits");
        assert!(store.is_full(Some("a")));
        assert!(!store.is_full(Some("b")));
        assert!(store.append("a", 0, record(&["5"])).is_err());
        store.append("b", 0, record(&["1234"])).expect("b fits");
    }

    #[test]
    fn commit_releases_budget() {
        let store = store(5);
        store.append("points", 0, record(&["abcde"])).expect("append");
        let delivery = store
            .receive("points", 0, Duration::from_millis(10))
            .expect("receive")
            .expect("record");
        assert_eq!(store.used_bytes(), 5);
        store.commit("points", 0, &[delivery.tag]).expect("commit");
        assert_eq!(store.used_bytes(), 0);
        assert_eq!(store.usage("points").records, 0);
    }

    #[test]
    fn rollback_restores_order() {
        let store = store(1024);
        for p in ["a", "b", "c"] {
            store.append("points", 0, record(&[p])).expect("append");
        }
        let first = store.receive("points", 0, Duration::ZERO).expect("rx").expect("a");
        let second = store.receive("points", 0, Duration::ZERO).expect("rx").expect("b");
        store
            .rollback("points", 0, &[second.tag, first.tag])
            .expect("rollback");

        let order: Vec<String> = (0..3)
            .map(|_| {
                let d = store.receive("points", 0, Duration::ZERO).expect("rx").expect("record");
                d.record.points().remove(0)
            })
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn truncate_invalidates_outstanding_tags() {
        let store = store(1024);
        store.append("points", 0, record(&["a", "b"])).expect("append");
        store.append("points", 0, record(&["c"])).expect("append");
        let delivery = store.receive("points", 0, Duration::ZERO).expect("rx").expect("record");

        let purged = store.truncate(&|_| true).expect("truncate");
        assert_eq!(purged[0].records, 2);
        assert_eq!(purged[0].points, 3);
        assert_eq!(store.used_bytes(), 0);

        store.rollback("points", 0, &[delivery.tag]).expect("stale rollback");
        assert!(store.receive("points", 0, Duration::ZERO).expect("rx").is_none());
    }

    #[test]
    fn closed_store_rejects_calls() {
        let store = store(1024);
        store.close().expect("close");
        assert!(store.append("points", 0, record(&["a"])).expect_err("closed").is_tier_closed());
        assert!(store.receive("points", 0, Duration::ZERO).is_err());
    }
}
