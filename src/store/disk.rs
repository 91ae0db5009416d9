use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::core::disk::fs_usage;
use crate::core::segment::{validate_segment_size, DEFAULT_SEGMENT_SIZE};
use crate::store::segment_log::PartitionLog;
use crate::store::{
    Delivery, DeliveryTag, DiskUsage, PartitionedQueueStore, QueueUsage, Record, Slot,
    TruncatedQueue,
};
use crate::{Error, Result};

pub const DEFAULT_MAX_DISK_USAGE_PERCENT: f64 = 70.0;
pub const DEFAULT_DISK_SCAN_INTERVAL: Duration = Duration::from_secs(5);

/// Disk budget for the durable store. Appends keep landing on disk until
/// either limit is crossed.
#[derive(Debug, Clone, PartialEq)]
pub struct SpillPolicy {
    /// Filesystem-wide used percentage above which the disk counts as full.
    pub max_disk_usage_percent: f64,
    /// Optional cap on the bytes of segment files this store keeps.
    pub max_bytes: Option<u64>,
    /// How long a filesystem probe result stays valid.
    pub scan_interval: Duration,
}

impl Default for SpillPolicy {
    fn default() -> Self {
        Self {
            max_disk_usage_percent: DEFAULT_MAX_DISK_USAGE_PERCENT,
            max_bytes: None,
            scan_interval: DEFAULT_DISK_SCAN_INTERVAL,
        }
    }
}

struct FsProbe {
    checked_at: Option<Instant>,
    used_percent: f64,
}

type LogSlot = Slot<PartitionLog>;

#[derive(Default)]
struct DiskQueue {
    partitions: RwLock<BTreeMap<usize, Arc<LogSlot>>>,
}

/// Durable store: one segment log per partition under `{root}/{queue}/{partition}`.
pub struct DiskStore {
    name: String,
    root: PathBuf,
    policy: SpillPolicy,
    segment_size: usize,
    queues: RwLock<HashMap<String, Arc<DiskQueue>>>,
    disk_bytes: Arc<AtomicU64>,
    probe: Mutex<FsProbe>,
    closed: AtomicBool,
}

impl DiskStore {
    pub fn new(
        name: impl Into<String>,
        root: impl Into<PathBuf>,
        policy: SpillPolicy,
        segment_size: u64,
    ) -> Result<Self> {
        let segment_size = if segment_size == 0 {
            DEFAULT_SEGMENT_SIZE
        } else {
            validate_segment_size(segment_size)?
        };
        Ok(Self {
            name: name.into(),
            root: root.into(),
            policy,
            segment_size,
            queues: RwLock::new(HashMap::new()),
            disk_bytes: Arc::new(AtomicU64::new(0)),
            probe: Mutex::new(FsProbe {
                checked_at: None,
                used_percent: 0.0,
            }),
            closed: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Bytes of segment files currently held by all partitions.
    pub fn disk_bytes(&self) -> u64 {
        self.disk_bytes.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::closed(&self.name));
        }
        Ok(())
    }

    fn validate_queue_name(queue: &str) -> Result<()> {
        let invalid = queue.is_empty()
            || queue == "."
            || queue == ".."
            || queue.contains(['/', '\\', '\0']);
        if invalid {
            return Err(Error::Config(format!(
                "queue name '{queue}' is not a valid directory name"
            )));
        }
        Ok(())
    }

    fn queue(&self, queue: &str) -> Result<Arc<DiskQueue>> {
        let queues = self
            .queues
            .read()
            .map_err(|_| Error::InvalidState("queue map lock poisoned"))?;
        queues
            .get(queue)
            .cloned()
            .ok_or_else(|| Error::UnknownQueue(queue.to_string()))
    }

    fn slot(&self, queue: &str, partition: usize) -> Result<Arc<LogSlot>> {
        let disk_queue = self.queue(queue)?;
        let partitions = disk_queue
            .partitions
            .read()
            .map_err(|_| Error::InvalidState("partition map lock poisoned"))?;
        partitions
            .get(&partition)
            .cloned()
            .ok_or_else(|| Error::UnknownPartition {
                queue: queue.to_string(),
                partition,
            })
    }

    fn all_slots(&self, queue: &str) -> Vec<Arc<LogSlot>> {
        self.queue(queue)
            .ok()
            .and_then(|q| q.partitions.read().ok().map(|p| p.values().cloned().collect()))
            .unwrap_or_default()
    }

    /// Opens (or recovers) the log for one partition and registers it.
    fn attach(&self, queue: &str, partition: usize) -> Result<()> {
        let disk_queue = {
            let mut queues = self
                .queues
                .write()
                .map_err(|_| Error::InvalidState("queue map lock poisoned"))?;
            Arc::clone(queues.entry(queue.to_string()).or_default())
        };
        let mut partitions = disk_queue
            .partitions
            .write()
            .map_err(|_| Error::InvalidState("partition map lock poisoned"))?;
        if partitions.contains_key(&partition) {
            return Ok(());
        }
        let dir = self.root.join(queue).join(partition.to_string());
        let log = PartitionLog::open(&dir, self.segment_size, Arc::clone(&self.disk_bytes))?;
        let backlog = log.backlog();
        if backlog.records > 0 {
            log::info!(
                "buffer '{}' recovered {} records ({} points) for {}.{}",
                self.name,
                backlog.records,
                backlog.points,
                queue,
                partition
            );
        }
        partitions.insert(partition, Arc::new(Slot::new(log)));
        Ok(())
    }

    fn fs_used_percent(&self) -> f64 {
        let Ok(mut probe) = self.probe.lock() else {
            return 0.0;
        };
        let stale = probe
            .checked_at
            .map(|at| at.elapsed() >= self.policy.scan_interval)
            .unwrap_or(true);
        if stale {
            match fs_usage(&self.root) {
                Ok(usage) => probe.used_percent = usage.used_percent(),
                Err(err) => {
                    log::warn!("disk usage probe failed for {}: {}", self.root.display(), err)
                }
            }
            probe.checked_at = Some(Instant::now());
        }
        probe.used_percent
    }
}

impl PartitionedQueueStore for DiskStore {
    /// Replays every `{queue}/{partition}` directory found under the root.
    fn open(&self) -> Result<()> {
        self.check_open()?;
        std::fs::create_dir_all(&self.root).map_err(crate::core::Error::from)?;
        let entries = std::fs::read_dir(&self.root).map_err(crate::core::Error::from)?;
        for entry in entries {
            let entry = entry.map_err(crate::core::Error::from)?;
            if !entry.path().is_dir() {
                continue;
            }
            let Some(queue) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let partitions = std::fs::read_dir(entry.path()).map_err(crate::core::Error::from)?;
            for partition in partitions {
                let partition = partition.map_err(crate::core::Error::from)?;
                if !partition.path().is_dir() {
                    continue;
                }
                let index = partition
                    .file_name()
                    .to_str()
                    .and_then(|name| name.parse::<usize>().ok());
                if let Some(index) = index {
                    self.attach(&queue, index)?;
                }
            }
        }
        Ok(())
    }

    fn create_partition(&self, queue: &str, partition: usize) -> Result<()> {
        self.check_open()?;
        Self::validate_queue_name(queue)?;
        self.attach(queue, partition)
    }

    fn partition_count(&self, queue: &str) -> usize {
        self.all_slots(queue).len()
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
        if self.is_disk_full() {
            return Err(Error::capacity(&self.name, queue));
        }
        let slot = self.slot(queue, partition)?;
        let mut log = slot.lock()?;
        match log.append(&record) {
            Ok(()) => {}
            // No segment can hold it; this is a size limit, not a broken log.
            Err(crate::core::Error::PayloadTooLarge { len, max }) => {
                log::warn!(
                    "buffer '{}' refused a {}-byte record for {}: segments hold at most {} bytes",
                    self.name,
                    len,
                    queue,
                    max
                );
                return Err(Error::capacity(&self.name, queue));
            }
            Err(err) => return Err(err.into()),
        }
        drop(log);
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
        let slot = self.slot(queue, partition)?;
        slot.wait_for(timeout, || self.check_open(), |log| Ok(log.next()?))
    }

    fn commit(&self, queue: &str, partition: usize, tags: &[DeliveryTag]) -> Result<()> {
        self.check_open()?;
        let slot = self.slot(queue, partition)?;
        let mut log = slot.lock()?;
        log.commit(tags)?;
        Ok(())
    }

    fn rollback(&self, queue: &str, partition: usize, tags: &[DeliveryTag]) -> Result<()> {
        self.check_open()?;
        let slot = self.slot(queue, partition)?;
        slot.lock()?.rollback(tags);
        slot.notify();
        Ok(())
    }

    fn is_full(&self, _queue: Option<&str>) -> bool {
        self.is_disk_full()
    }

    fn is_disk_full(&self) -> bool {
        if let Some(max_bytes) = self.policy.max_bytes {
            if self.disk_bytes() > max_bytes {
                return true;
            }
        }
        self.fs_used_percent() > self.policy.max_disk_usage_percent
    }

    fn usage(&self, queue: &str) -> QueueUsage {
        let mut usage = QueueUsage {
            limit_bytes: self.policy.max_bytes,
            ..QueueUsage::default()
        };
        for slot in self.all_slots(queue) {
            if let Ok(log) = slot.lock() {
                usage.add(&log.backlog());
            }
        }
        usage
    }

    fn disk_usage(&self) -> Option<DiskUsage> {
        Some(DiskUsage {
            used_bytes: self.disk_bytes(),
            max_bytes: self.policy.max_bytes,
            fs_used_percent: self.fs_used_percent(),
            max_fs_percent: self.policy.max_disk_usage_percent,
        })
    }

    fn truncate(&self, purge: &dyn Fn(&str) -> bool) -> Result<Vec<TruncatedQueue>> {
        self.check_open()?;
        let mut purged = Vec::new();
        for name in self.queues().into_iter().filter(|name| purge(name)) {
            let mut outcome = TruncatedQueue {
                queue: name,
                records: 0,
                points: 0,
            };
            for slot in self.all_slots(&outcome.queue) {
                let (records, points) = slot.lock()?.truncate()?;
                outcome.records += records;
                outcome.points += points;
            }
            purged.push(outcome);
        }
        Ok(purged)
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let queues: Vec<Arc<DiskQueue>> = self
            .queues
            .read()
            .map(|queues| queues.values().cloned().collect())
            .unwrap_or_default();
        let mut first_err = None;
        for disk_queue in queues {
            let slots: Vec<Arc<LogSlot>> = disk_queue
                .partitions
                .read()
                .map(|p| p.values().cloned().collect())
                .unwrap_or_default();
            for slot in slots {
                slot.notify();
                let mut log = slot.lock()?;
                if let Err(err) = log.sync() {
                    first_err.get_or_insert(err);
                }
                log.release();
            }
        }
        match first_err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}
