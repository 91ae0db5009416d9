//! Cached producer and consumer sessions, one per worker key.
//!
//! A session is bound to one partition of one queue. Storage faults raised
//! through a session poison it; the pool evicts poisoned sessions and the
//! next lookup for the same key builds a fresh one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::metrics::StatsRegistry;
use crate::store::{Delivery, DeliveryTag, PartitionedQueueStore, Record};
use crate::{Error, Result};

pub fn producer_key(queue: &str, worker: &str) -> String {
    format!("produce.{queue}.{worker}")
}

pub fn consumer_key(queue: &str, partition: usize, worker: &str) -> String {
    format!("consume.{queue}.{partition}.{worker}")
}

/// Turns storage-level failures into a fault on the session that saw them.
fn classify(key: &str, faulted: &AtomicBool, err: Error) -> Error {
    match err {
        Error::Storage(inner) => {
            faulted.store(true, Ordering::Release);
            Error::session_fault(key, inner)
        }
        other => other,
    }
}

/// Exclusive access to one cached session.
pub struct SessionHandle<S> {
    key: String,
    faulted: Arc<AtomicBool>,
    inner: Mutex<S>,
}

impl<S> SessionHandle<S> {
    fn new(key: String, faulted: Arc<AtomicBool>, inner: S) -> Self {
        Self {
            key,
            faulted,
            inner: Mutex::new(inner),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    /// Marks the session broken; every later use fails with `SessionFault`.
    pub fn invalidate(&self) {
        self.faulted.store(true, Ordering::Release);
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, S>> {
        if self.is_faulted() {
            return Err(Error::session_fault(&self.key, "session invalidated"));
        }
        self.inner
            .lock()
            .map_err(|_| Error::session_fault(&self.key, "session lock poisoned"))
    }
}

pub struct ProducerSession {
    key: String,
    queue: String,
    partition: usize,
    store: Arc<dyn PartitionedQueueStore>,
    faulted: Arc<AtomicBool>,
}

impl ProducerSession {
    pub fn partition(&self) -> usize {
        self.partition
    }

    pub fn send(&mut self, record: Arc<Record>) -> Result<()> {
        if self.faulted.load(Ordering::Acquire) {
            return Err(Error::session_fault(&self.key, "session invalidated"));
        }
        self.store
            .append(&self.queue, self.partition, record)
            .map_err(|err| classify(&self.key, &self.faulted, err))
    }
}

/// A transactional reader over one partition.
///
/// Received records stay pending until acknowledged. `commit` removes the
/// acknowledged ones; `rollback` returns everything still held, acknowledged
/// or not, to the head of the partition.
pub struct ConsumerSession {
    key: String,
    queue: String,
    partition: usize,
    store: Arc<dyn PartitionedQueueStore>,
    faulted: Arc<AtomicBool>,
    pending: Vec<DeliveryTag>,
    acked: Vec<DeliveryTag>,
    receiving: bool,
    closed: bool,
}

impl ConsumerSession {
    fn check(&self) -> Result<()> {
        if self.closed {
            return Err(Error::session_fault(&self.key, "session closed"));
        }
        if self.faulted.load(Ordering::Acquire) {
            return Err(Error::session_fault(&self.key, "session invalidated"));
        }
        Ok(())
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn partition(&self) -> usize {
        self.partition
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn start(&mut self) -> Result<()> {
        self.check()?;
        self.receiving = true;
        Ok(())
    }

    pub fn receive(&mut self, timeout: Duration) -> Result<Option<Delivery>> {
        self.check()?;
        if !self.receiving {
            return Err(Error::InvalidState("consumer session not started"));
        }
        let delivery = self
            .store
            .receive(&self.queue, self.partition, timeout)
            .map_err(|err| classify(&self.key, &self.faulted, err))?;
        if let Some(delivery) = &delivery {
            self.pending.push(delivery.tag);
        }
        Ok(delivery)
    }

    pub fn acknowledge(&mut self, tag: DeliveryTag) {
        if let Some(idx) = self.pending.iter().position(|held| *held == tag) {
            self.pending.remove(idx);
            self.acked.push(tag);
        }
    }

    pub fn commit(&mut self) -> Result<()> {
        self.check()?;
        if self.acked.is_empty() {
            return Ok(());
        }
        self.store
            .commit(&self.queue, self.partition, &self.acked)
            .map_err(|err| classify(&self.key, &self.faulted, err))?;
        self.acked.clear();
        Ok(())
    }

    /// Returns every held record to the partition. Works on a faulted
    /// session so its records are not stranded.
    pub fn rollback(&mut self) -> Result<()> {
        let mut tags = std::mem::take(&mut self.acked);
        tags.append(&mut self.pending);
        if tags.is_empty() {
            return Ok(());
        }
        self.store
            .rollback(&self.queue, self.partition, &tags)
            .map_err(|err| classify(&self.key, &self.faulted, err))
    }

    pub fn stop(&mut self) -> Result<()> {
        self.check()?;
        self.receiving = false;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.receiving = false;
        self.closed = true;
        self.rollback()
    }

    pub fn held(&self) -> usize {
        self.pending.len() + self.acked.len()
    }
}

pub type ProducerHandle = Arc<SessionHandle<ProducerSession>>;
pub type ConsumerHandle = Arc<SessionHandle<ConsumerSession>>;

/// Caches sessions per `(operation, queue, worker)` key over one store.
pub struct SessionPool {
    tier: String,
    store: Arc<dyn PartitionedQueueStore>,
    stats: Arc<StatsRegistry>,
    producers: Mutex<HashMap<String, ProducerHandle>>,
    consumers: Mutex<HashMap<String, ConsumerHandle>>,
    next_partition: Mutex<HashMap<String, usize>>,
}

impl SessionPool {
    pub fn new(
        tier: impl Into<String>,
        store: Arc<dyn PartitionedQueueStore>,
        stats: Arc<StatsRegistry>,
    ) -> Self {
        Self {
            tier: tier.into(),
            store,
            stats,
            producers: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            next_partition: Mutex::new(HashMap::new()),
        }
    }

    fn lock_map<'a, T>(&self, map: &'a Mutex<T>) -> Result<MutexGuard<'a, T>> {
        map.lock().map_err(|_| Error::InvalidState("session pool lock poisoned"))
    }

    /// Producers on the same queue are spread over its partitions in
    /// creation order.
    fn assign_partition(&self, queue: &str, partition_count: usize) -> Result<usize> {
        if partition_count == 0 {
            return Err(Error::UnknownQueue(queue.to_string()));
        }
        let mut next = self.lock_map(&self.next_partition)?;
        let cursor = next.entry(queue.to_string()).or_insert(0);
        let partition = *cursor % partition_count;
        *cursor = cursor.wrapping_add(1);
        Ok(partition)
    }

    pub fn producer(
        &self,
        queue: &str,
        worker: &str,
        partition_count: usize,
    ) -> Result<ProducerHandle> {
        let key = producer_key(queue, worker);
        let mut producers = self.lock_map(&self.producers)?;
        if let Some(handle) = producers.get(&key) {
            return Ok(Arc::clone(handle));
        }
        let partition = self.assign_partition(queue, partition_count)?;
        let faulted = Arc::new(AtomicBool::new(false));
        let session = ProducerSession {
            key: key.clone(),
            queue: queue.to_string(),
            partition,
            store: Arc::clone(&self.store),
            faulted: Arc::clone(&faulted),
        };
        log::debug!("tier '{}' opened producer {} on partition {}", self.tier, key, partition);
        let handle = Arc::new(SessionHandle::new(key.clone(), faulted, session));
        producers.insert(key, Arc::clone(&handle));
        Ok(handle)
    }

    pub fn consumer(&self, queue: &str, partition: usize, worker: &str) -> Result<ConsumerHandle> {
        let key = consumer_key(queue, partition, worker);
        let mut consumers = self.lock_map(&self.consumers)?;
        if let Some(handle) = consumers.get(&key) {
            return Ok(Arc::clone(handle));
        }
        let faulted = Arc::new(AtomicBool::new(false));
        let session = ConsumerSession {
            key: key.clone(),
            queue: queue.to_string(),
            partition,
            store: Arc::clone(&self.store),
            faulted: Arc::clone(&faulted),
            pending: Vec::new(),
            acked: Vec::new(),
            receiving: false,
            closed: false,
        };
        log::debug!("tier '{}' opened consumer {}", self.tier, key);
        let handle = Arc::new(SessionHandle::new(key.clone(), faulted, session));
        consumers.insert(key, Arc::clone(&handle));
        Ok(handle)
    }

    /// Runs `op` against the worker's producer. A `SessionFault` evicts the
    /// session and the operation is retried once on a fresh one.
    pub fn with_producer<R>(
        &self,
        queue: &str,
        worker: &str,
        partition_count: usize,
        mut op: impl FnMut(&mut ProducerSession) -> Result<R>,
    ) -> Result<R> {
        let mut retried = false;
        loop {
            let handle = self.producer(queue, worker, partition_count)?;
            let outcome = handle.lock().and_then(|mut session| op(&mut session));
            match outcome {
                Err(err) if err.is_session_fault() => {
                    self.stats.get(queue).session_faults.inc();
                    self.evict_producer(handle.key());
                    if retried {
                        return Err(err);
                    }
                    log::warn!("tier '{}': {}; retrying on a fresh session", self.tier, err);
                    retried = true;
                }
                other => return other,
            }
        }
    }

    pub fn evict_producer(&self, key: &str) {
        if let Ok(mut producers) = self.producers.lock() {
            if let Some(handle) = producers.remove(key) {
                handle.invalidate();
            }
        }
    }

    /// Closes and drops a consumer. Records it still held go back to the
    /// partition if the store allows.
    pub fn evict_consumer(&self, key: &str) {
        let handle = match self.consumers.lock() {
            Ok(mut consumers) => consumers.remove(key),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            handle.invalidate();
            Self::close_consumer(&self.tier, &handle);
        }
    }

    fn close_consumer(tier: &str, handle: &SessionHandle<ConsumerSession>) {
        let closed = handle
            .inner
            .lock()
            .map_err(|_| Error::session_fault(handle.key(), "session lock poisoned"))
            .and_then(|mut session| session.close());
        if let Err(err) = closed {
            log::warn!("tier '{}': closing {} failed: {}", tier, handle.key(), err);
        }
    }

    /// Marks a cached session broken without evicting it.
    pub fn invalidate(&self, key: &str) -> bool {
        if let Ok(producers) = self.producers.lock() {
            if let Some(handle) = producers.get(key) {
                handle.invalidate();
                return true;
            }
        }
        if let Ok(consumers) = self.consumers.lock() {
            if let Some(handle) = consumers.get(key) {
                handle.invalidate();
                return true;
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        let producers = self.producers.lock().map(|p| p.len()).unwrap_or(0);
        let consumers = self.consumers.lock().map(|c| c.len()).unwrap_or(0);
        producers + consumers
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes every cached session. Failures are logged and skipped.
    pub fn close_all(&self) {
        let producers: Vec<ProducerHandle> = match self.producers.lock() {
            Ok(mut producers) => producers.drain().map(|(_, handle)| handle).collect(),
            Err(_) => Vec::new(),
        };
        for handle in producers {
            handle.invalidate();
        }
        let consumers: Vec<ConsumerHandle> = match self.consumers.lock() {
            Ok(mut consumers) => consumers.drain().map(|(_, handle)| handle).collect(),
            Err(_) => Vec::new(),
        };
        for handle in consumers {
            handle.invalidate();
            Self::close_consumer(&self.tier, &handle);
        }
    }
}
