//! One partition of the durable store: an append-only chain of
//! memory-mapped segments plus a checkpointed consume cursor.
//!
//! ```text
//! {partition_dir}/
//!   000000003.q      ← oldest segment still holding uncommitted records
//!   000000004.q      ← segment being appended to
//!   cursor.meta      ← committed consume position
//! ```
//!
//! Everything between the cursor and the write position is backlog. On
//! reopen the backlog is rescanned and redelivered, so delivery is
//! at-least-once across crashes.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::header::{record_len_for_payload, RecordHeader, RECORD_HEADER_SIZE};
use crate::core::mmap::MmapFile;
use crate::core::segment::{
    create_segment, discover_segments, load_cursor, open_segment, read_segment_header,
    seal_segment, segment_path, store_cursor, CursorMeta, Position, CURSOR_FILE,
    SEG_DATA_OFFSET, SEG_FLAG_SEALED,
};
use crate::core::{Error, Result};
use crate::store::{Delivery, DeliveryTag, QueueUsage, Record};

struct Outstanding {
    start: Position,
    record: Arc<Record>,
    in_flight: bool,
}

struct ReadRecord {
    header: RecordHeader,
    payload: Vec<u8>,
    next: Position,
}

pub struct PartitionLog {
    dir: PathBuf,
    segment_size: usize,
    segments: BTreeMap<u64, MmapFile>,
    write: Position,
    read: Position,
    next_seq: u64,
    cursor: CursorMeta,
    outstanding: BTreeMap<u64, Outstanding>,
    redeliver: VecDeque<u64>,
    epoch: u64,
    backlog: QueueUsage,
    disk_bytes: Arc<AtomicU64>,
}

impl PartitionLog {
    /// Opens the partition at `dir`, creating it if needed and recovering the
    /// backlog after the committed cursor. `disk_bytes` is credited with every
    /// segment this log keeps on disk.
    pub fn open(
        dir: impl AsRef<Path>,
        segment_size: usize,
        disk_bytes: Arc<AtomicU64>,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let ids = discover_segments(&dir)?;
        let newest = ids.last().copied();
        let mut segments = BTreeMap::new();
        for id in ids {
            let mmap = match open_segment(&dir, id) {
                Ok(mmap) => mmap,
                // A crash inside `roll` can leave the newest file sized but
                // without a header. No record was ever written to it.
                Err(err @ (Error::Corrupt(_) | Error::Unsupported(_))) if Some(id) == newest => {
                    log::warn!(
                        "segment {} in {} is uninitialized ({}); recreating it",
                        id,
                        dir.display(),
                        err
                    );
                    create_segment(&dir, id, segment_size)?
                }
                Err(err) => return Err(err),
            };
            disk_bytes.fetch_add(mmap.len() as u64, Ordering::AcqRel);
            segments.insert(id, mmap);
        }
        if segments.is_empty() {
            let mmap = create_segment(&dir, 0, segment_size)?;
            disk_bytes.fetch_add(mmap.len() as u64, Ordering::AcqRel);
            segments.insert(0, mmap);
        }

        let first = *segments.keys().next().ok_or(Error::Corrupt("no segments"))?;
        let stored = match load_cursor(&dir.join(CURSOR_FILE)) {
            Ok(stored) => stored,
            Err(Error::CorruptMetadata(reason)) => {
                log::warn!("{}: {}; replaying from the oldest segment", dir.display(), reason);
                None
            }
            Err(err) => return Err(err),
        };
        let start = match stored {
            Some(meta) if segments.contains_key(&meta.position.segment_id) => meta.position,
            Some(meta) => {
                log::warn!(
                    "cursor in {} points at missing segment {}; resuming from segment {}",
                    dir.display(),
                    meta.position.segment_id,
                    first
                );
                Position::start_of(first)
            }
            None => Position::start_of(first),
        };

        let mut log = Self {
            dir,
            segment_size,
            segments,
            write: start,
            read: start,
            next_seq: 0,
            cursor: CursorMeta::new(start, stored.map(|m| m.generation).unwrap_or(0)),
            outstanding: BTreeMap::new(),
            redeliver: VecDeque::new(),
            epoch: 0,
            backlog: QueueUsage::default(),
            disk_bytes,
        };
        log.recover()?;
        Ok(log)
    }

    /// Walks from the cursor to the last intact record, counting backlog and
    /// positioning the writer after it.
    fn recover(&mut self) -> Result<()> {
        let mut pos = self.cursor.position;
        loop {
            match self.read_at(pos) {
                Ok(Some(found)) => {
                    self.backlog.records += 1;
                    self.backlog.points += found.header.point_count as u64;
                    self.backlog.bytes += found.payload.len() as u64;
                    self.next_seq = found.header.seq + 1;
                    pos = found.next;
                }
                Ok(None) => match self.next_segment_after(pos.segment_id) {
                    Some(next) => pos = Position::start_of(next),
                    None => break,
                },
                Err(Error::Corrupt(reason)) => match self.next_segment_after(pos.segment_id) {
                    Some(next) => {
                        self.warn_skipped(pos, reason);
                        pos = Position::start_of(next);
                    }
                    None => break,
                },
                Err(err) => return Err(err),
            }
        }
        self.write = pos;
        self.clear_torn_tail()?;
        if self.is_sealed(self.write.segment_id)? {
            // Crashed between sealing a segment and creating its successor.
            self.roll()?;
        }

        let stale: Vec<u64> = self
            .segments
            .keys()
            .copied()
            .filter(|id| *id < self.cursor.position.segment_id)
            .collect();
        self.remove_segments(&stale);
        Ok(())
    }

    /// Zeroes whatever a crashed append left after the write position.
    fn clear_torn_tail(&mut self) -> Result<()> {
        let write = self.write;
        let Some(mmap) = self.segments.get_mut(&write.segment_id) else {
            return Ok(());
        };
        let offset = write.offset as usize;
        if offset + RECORD_HEADER_SIZE > mmap.len() {
            return Ok(());
        }
        let header = RecordHeader::from_bytes(mmap.range(offset, RECORD_HEADER_SIZE)?)?;
        if header.is_committed() {
            log::warn!(
                "discarding torn record at {}:{} in {}",
                write.segment_id,
                write.offset,
                self.dir.display()
            );
            let len = mmap.len() - offset;
            mmap.range_mut(offset, len)?.fill(0);
            mmap.flush_sync()?;
        }
        Ok(())
    }

    fn is_sealed(&self, id: u64) -> Result<bool> {
        match self.segments.get(&id) {
            Some(mmap) => Ok(read_segment_header(mmap)?.flags & SEG_FLAG_SEALED != 0),
            None => Ok(false),
        }
    }

    fn warn_skipped(&self, pos: Position, reason: &str) {
        log::warn!(
            "skipping damaged records in segment {} from offset {} in {}: {}",
            pos.segment_id,
            pos.offset,
            self.dir.display(),
            reason
        );
    }

    fn next_segment_after(&self, id: u64) -> Option<u64> {
        self.segments.range(id + 1..).next().map(|(next, _)| *next)
    }

    fn read_at(&self, pos: Position) -> Result<Option<ReadRecord>> {
        let Some(mmap) = self.segments.get(&pos.segment_id) else {
            return Ok(None);
        };
        let offset = pos.offset as usize;
        if offset + RECORD_HEADER_SIZE > mmap.len() {
            return Ok(None);
        }
        let header = RecordHeader::from_bytes(mmap.range(offset, RECORD_HEADER_SIZE)?)?;
        if !header.is_committed() {
            return Ok(None);
        }
        let payload_len = header.payload_len()?;
        let record_len = header.record_len()?;
        if offset + record_len > mmap.len() {
            return Err(Error::Corrupt("record crosses segment end"));
        }
        let payload = mmap.range(offset + RECORD_HEADER_SIZE, payload_len)?.to_vec();
        header.validate_crc(&payload)?;
        Ok(Some(ReadRecord {
            header,
            payload,
            next: Position::new(pos.segment_id, (offset + record_len) as u64),
        }))
    }

    pub fn append(&mut self, record: &Record) -> Result<()> {
        let payload = record.payload();
        let record_len = record_len_for_payload(payload.len());
        if SEG_DATA_OFFSET + record_len > self.segment_size {
            return Err(Error::PayloadTooLarge {
                len: record_len,
                max: self.segment_size - SEG_DATA_OFFSET,
            });
        }
        let fits = self
            .segments
            .get(&self.write.segment_id)
            .map(|mmap| self.write.offset as usize + record_len <= mmap.len())
            .unwrap_or(false);
        if !fits {
            self.roll()?;
        }

        let seq = self.next_seq;
        let header =
            RecordHeader::for_payload(payload, record.point_count(), seq, record.enqueued_ms())?;
        let mut header_bytes = header.to_bytes();
        let commit_word = [header_bytes[0], header_bytes[1], header_bytes[2], header_bytes[3]];
        header_bytes[0..4].fill(0);

        let offset = self.write.offset as usize;
        let mmap = self
            .segments
            .get_mut(&self.write.segment_id)
            .ok_or(Error::Corrupt("active segment missing"))?;
        mmap.write_at(offset, &header_bytes)?;
        mmap.write_at(offset + RECORD_HEADER_SIZE, payload)?;
        // Publish last: a zero commit word marks the end of data on recovery.
        mmap.write_at(offset, &commit_word)?;

        self.write.offset += record_len as u64;
        self.next_seq += 1;
        self.backlog.records += 1;
        self.backlog.points += record.point_count() as u64;
        self.backlog.bytes += payload.len() as u64;
        Ok(())
    }

    fn roll(&mut self) -> Result<()> {
        let current = self.write.segment_id;
        if let Some(mmap) = self.segments.get_mut(&current) {
            seal_segment(mmap)?;
            mmap.flush_async()?;
        }
        let next = current + 1;
        let mmap = create_segment(&self.dir, next, self.segment_size)?;
        self.disk_bytes.fetch_add(mmap.len() as u64, Ordering::AcqRel);
        self.segments.insert(next, mmap);
        self.write = Position::start_of(next);
        log::debug!("rolled {} to segment {}", self.dir.display(), next);
        Ok(())
    }

    /// Hands out the next record: rolled-back records first, then unread log.
    pub fn next(&mut self) -> Result<Option<Delivery>> {
        let epoch = self.epoch;
        if let Some(seq) = self.redeliver.pop_front() {
            if let Some(entry) = self.outstanding.get_mut(&seq) {
                entry.in_flight = true;
                return Ok(Some(Delivery {
                    tag: DeliveryTag { seq, epoch },
                    record: Arc::clone(&entry.record),
                }));
            }
        }
        while self.read < self.write {
            match self.read_at(self.read) {
                Ok(Some(found)) => {
                    let start = self.read;
                    self.read = found.next;
                    let record = Arc::new(Record::new(
                        found.payload,
                        found.header.point_count,
                        found.header.timestamp_ms,
                    ));
                    let seq = found.header.seq;
                    self.outstanding.insert(
                        seq,
                        Outstanding {
                            start,
                            record: Arc::clone(&record),
                            in_flight: true,
                        },
                    );
                    return Ok(Some(Delivery {
                        tag: DeliveryTag { seq, epoch },
                        record,
                    }));
                }
                Ok(None) => match self.next_segment_after(self.read.segment_id) {
                    Some(next) => self.read = Position::start_of(next),
                    None => break,
                },
                // Recovery already stepped over damaged tails the same way.
                Err(Error::Corrupt(reason)) => match self.next_segment_after(self.read.segment_id) {
                    Some(next) => {
                        self.warn_skipped(self.read, reason);
                        self.read = Position::start_of(next);
                    }
                    None => break,
                },
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    pub fn commit(&mut self, tags: &[DeliveryTag]) -> Result<()> {
        let epoch = self.epoch;
        for tag in tags.iter().filter(|tag| tag.epoch == epoch) {
            let delivered =
                matches!(self.outstanding.get(&tag.seq), Some(entry) if entry.in_flight);
            if !delivered {
                continue;
            }
            if let Some(entry) = self.outstanding.remove(&tag.seq) {
                self.backlog.records = self.backlog.records.saturating_sub(1);
                self.backlog.points = self
                    .backlog
                    .points
                    .saturating_sub(entry.record.point_count() as u64);
                self.backlog.bytes = self.backlog.bytes.saturating_sub(entry.record.size());
            }
        }
        self.advance_cursor()
    }

    pub fn rollback(&mut self, tags: &[DeliveryTag]) {
        let epoch = self.epoch;
        let mut returned = false;
        for tag in tags.iter().filter(|tag| tag.epoch == epoch) {
            if let Some(entry) = self.outstanding.get_mut(&tag.seq) {
                if entry.in_flight {
                    entry.in_flight = false;
                    self.redeliver.push_back(tag.seq);
                    returned = true;
                }
            }
        }
        if returned {
            self.redeliver.make_contiguous().sort_unstable();
        }
    }

    /// Moves the checkpoint to the oldest uncommitted record and drops the
    /// segments wholly behind it.
    fn advance_cursor(&mut self) -> Result<()> {
        let target = self
            .outstanding
            .values()
            .next()
            .map(|entry| entry.start)
            .unwrap_or(self.read);
        if target <= self.cursor.position {
            return Ok(());
        }
        self.cursor.position = target;
        store_cursor(&self.dir.join(CURSOR_FILE), &mut self.cursor)?;
        let behind: Vec<u64> = self
            .segments
            .range(..target.segment_id)
            .map(|(id, _)| *id)
            .collect();
        self.remove_segments(&behind);
        Ok(())
    }

    fn remove_segments(&mut self, ids: &[u64]) {
        for id in ids {
            if let Some(mmap) = self.segments.remove(id) {
                self.disk_bytes.fetch_sub(mmap.len() as u64, Ordering::AcqRel);
                drop(mmap);
                if let Err(err) = std::fs::remove_file(segment_path(&self.dir, *id)) {
                    log::warn!(
                        "failed to remove segment {} in {}: {}",
                        id,
                        self.dir.display(),
                        err
                    );
                }
            }
        }
    }

    /// Discards the whole backlog, including records handed out but not yet
    /// committed. Returns the purged record and point counts.
    pub fn truncate(&mut self) -> Result<(u64, u64)> {
        let purged = (self.backlog.records, self.backlog.points);
        self.outstanding.clear();
        self.redeliver.clear();
        self.epoch += 1;
        self.read = self.write;
        self.backlog = QueueUsage::default();
        self.advance_cursor()?;
        Ok(purged)
    }

    pub fn backlog(&self) -> QueueUsage {
        self.backlog
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn write_position(&self) -> Position {
        self.write
    }

    pub fn committed_position(&self) -> Position {
        self.cursor.position
    }

    pub fn sync(&self) -> Result<()> {
        for mmap in self.segments.values() {
            mmap.sync()?;
        }
        Ok(())
    }

    /// Gives back this log's share of the disk accounting on shutdown.
    pub fn release(&mut self) {
        let held: u64 = self.segments.values().map(|m| m.len() as u64).sum();
        self.disk_bytes.fetch_sub(held, Ordering::AcqRel);
        self.segments.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SEGMENT: usize = 4096;

    fn open(dir: &Path) -> PartitionLog {
        PartitionLog::open(dir, SEGMENT, Arc::new(AtomicU64::new(0))).expect("open log")
    }

    fn rec(text: &str) -> Record {
        Record::from_points(&[text], 1_000)
    }

    #[test]
    fn append_then_consume_in_order() {
        let dir = tempdir().expect("tempdir");
        let mut log = open(dir.path());
        log.append(&rec("alpha")).expect("append a");
        log.append(&rec("bravo")).expect("append b");
        assert_eq!(log.backlog().records, 2);

        let a = log.next().expect("next").expect("a");
        let b = log.next().expect("next").expect("b");
        assert_eq!(a.record.points(), vec!["alpha"]);
        assert_eq!(b.record.points(), vec!["bravo"]);
        assert!(log.next().expect("next").is_none());

        log.commit(&[a.tag, b.tag]).expect("commit");
        assert_eq!(log.backlog().records, 0);
        assert_eq!(log.committed_position(), log.write_position());
    }

    #[test]
    fn uncommitted_records_survive_reopen() {
        let dir = tempdir().expect("tempdir");
        {
            let mut log = open(dir.path());
            log.append(&rec("alpha")).expect("append a");
            log.append(&rec("bravo")).expect("append b");
            let a = log.next().expect("next").expect("a");
            log.commit(&[a.tag]).expect("commit a");
            let _b = log.next().expect("next").expect("b in flight");
        }
        let mut log = open(dir.path());
        assert_eq!(log.backlog().records, 1);
        let b = log.next().expect("next").expect("b redelivered");
        assert_eq!(b.record.points(), vec!["bravo"]);
        assert_eq!(b.record.enqueued_ms(), 1_000);
        log.append(&rec("charlie")).expect("append after reopen");
        let c = log.next().expect("next").expect("c");
        assert!(c.tag.seq > b.tag.seq);
    }

    #[test]
    fn rollback_redelivers_before_new_records() {
        let dir = tempdir().expect("tempdir");
        let mut log = open(dir.path());
        for text in ["a", "b", "c"] {
            log.append(&rec(text)).expect("append");
        }
        let a = log.next().expect("next").expect("a");
        let b = log.next().expect("next").expect("b");
        log.rollback(&[b.tag, a.tag]);
        log.rollback(&[a.tag]);

        let order: Vec<String> = std::iter::from_fn(|| log.next().expect("next"))
            .map(|d| d.record.points().remove(0))
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn rolls_segments_and_reclaims_committed_ones() {
        let dir = tempdir().expect("tempdir");
        let disk = Arc::new(AtomicU64::new(0));
        let mut log = PartitionLog::open(dir.path(), SEGMENT, Arc::clone(&disk)).expect("open");
        let line = "x".repeat(1000);
        for _ in 0..8 {
            log.append(&rec(&line)).expect("append");
        }
        assert!(log.segment_count() >= 2);
        assert_eq!(disk.load(Ordering::Acquire), (log.segment_count() * SEGMENT) as u64);

        let mut tags = Vec::new();
        while let Some(delivery) = log.next().expect("next") {
            tags.push(delivery.tag);
        }
        assert_eq!(tags.len(), 8);
        log.commit(&tags).expect("commit");
        assert_eq!(log.segment_count(), 1);
        assert_eq!(disk.load(Ordering::Acquire), SEGMENT as u64);
    }

    #[test]
    fn oversized_record_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let mut log = open(dir.path());
        let line = "x".repeat(SEGMENT);
        assert!(matches!(
            log.append(&rec(&line)),
            Err(Error::PayloadTooLarge { max, .. }) if max == SEGMENT - SEG_DATA_OFFSET
        ));
    }

    #[test]
    fn torn_tail_is_discarded_on_reopen() {
        let dir = tempdir().expect("tempdir");
        let tail = {
            let mut log = open(dir.path());
            log.append(&rec("alpha")).expect("append");
            log.sync().expect("sync");
            log.write_position()
        };
        {
            // Fake a half-written record: nonzero commit word, garbage payload.
            let mut mmap = open_segment(dir.path(), tail.segment_id).expect("segment");
            mmap.write_at(tail.offset as usize, &[9, 0, 0, 0]).expect("commit word");
            mmap.write_at(tail.offset as usize + RECORD_HEADER_SIZE, b"garbage!")
                .expect("payload");
            mmap.flush_sync().expect("flush");
        }
        let mut log = open(dir.path());
        assert_eq!(log.backlog().records, 1);
        assert_eq!(log.write_position(), tail);
        log.append(&rec("bravo")).expect("append after repair");
        let first = log.next().expect("next").expect("alpha");
        let second = log.next().expect("next").expect("bravo");
        assert_eq!(first.record.points(), vec!["alpha"]);
        assert_eq!(second.record.points(), vec!["bravo"]);
    }

    #[test]
    fn uninitialized_newest_segment_is_recreated_on_reopen() {
        let dir = tempdir().expect("tempdir");
        {
            let mut log = open(dir.path());
            log.append(&rec("alpha")).expect("append");
            log.sync().expect("sync");
        }
        // Sized by a roll that crashed before the header was written.
        std::fs::write(segment_path(dir.path(), 1), vec![0u8; SEGMENT]).expect("zero segment");

        let mut log = open(dir.path());
        assert_eq!(log.backlog().records, 1);
        assert_eq!(log.segment_count(), 2);
        let header = read_segment_header(&open_segment(dir.path(), 1).expect("segment 1"))
            .expect("header rewritten");
        assert_eq!(header.segment_id, 1);

        log.append(&rec("bravo")).expect("append after repair");
        let first = log.next().expect("next").expect("alpha");
        let second = log.next().expect("next").expect("bravo");
        assert_eq!(first.record.points(), vec!["alpha"]);
        assert_eq!(second.record.points(), vec!["bravo"]);
    }

    #[test]
    fn empty_newest_segment_file_is_recreated_on_reopen() {
        let dir = tempdir().expect("tempdir");
        {
            let mut log = open(dir.path());
            log.append(&rec("alpha")).expect("append");
        }
        std::fs::write(segment_path(dir.path(), 1), b"").expect("empty segment");

        let mut log = open(dir.path());
        assert_eq!(log.backlog().records, 1);
        let only = log.next().expect("next").expect("alpha");
        assert_eq!(only.record.points(), vec!["alpha"]);
    }

    #[test]
    fn damaged_older_segment_still_fails_open() {
        let dir = tempdir().expect("tempdir");
        {
            let mut log = open(dir.path());
            let line = "x".repeat(1000);
            for _ in 0..6 {
                log.append(&rec(&line)).expect("append");
            }
            assert!(log.segment_count() >= 2);
        }
        let mut zeroed = std::fs::read(segment_path(dir.path(), 0)).expect("read segment 0");
        zeroed[..SEG_DATA_OFFSET].fill(0);
        std::fs::write(segment_path(dir.path(), 0), &zeroed).expect("write segment 0");

        let err = PartitionLog::open(dir.path(), SEGMENT, Arc::new(AtomicU64::new(0)))
            .err()
            .expect("damaged segment 0");
        assert!(matches!(err, Error::Corrupt(_)));
    }

    #[test]
    fn damaged_record_skips_to_next_segment() {
        let dir = tempdir().expect("tempdir");
        let lines: Vec<String> = ["a", "b", "c", "d", "e", "f"]
            .iter()
            .map(|c| c.repeat(1000))
            .collect();
        {
            let mut log = open(dir.path());
            for line in &lines {
                log.append(&rec(line)).expect("append");
            }
            assert_eq!(log.segment_count(), 2);
        }
        // Flip a payload byte of the second record in segment 0.
        let second = SEG_DATA_OFFSET + record_len_for_payload(1000);
        let mut bytes = std::fs::read(segment_path(dir.path(), 0)).expect("read segment 0");
        bytes[second + RECORD_HEADER_SIZE] ^= 0xFF;
        std::fs::write(segment_path(dir.path(), 0), &bytes).expect("write segment 0");

        let mut log = open(dir.path());
        assert_eq!(log.backlog().records, 4);
        let order: Vec<String> = std::iter::from_fn(|| log.next().expect("next"))
            .map(|d| d.record.points().remove(0))
            .collect();
        let expected: Vec<String> = [0, 3, 4, 5].iter().map(|idx| lines[*idx].clone()).collect();
        assert_eq!(order, expected);
    }

    #[test]
    fn sealed_tail_rolls_before_next_append() {
        let dir = tempdir().expect("tempdir");
        {
            let mut log = open(dir.path());
            log.append(&rec("alpha")).expect("append");
        }
        {
            let mut mmap = open_segment(dir.path(), 0).expect("segment 0");
            seal_segment(&mut mmap).expect("seal");
            mmap.flush_sync().expect("flush");
        }

        let mut log = open(dir.path());
        assert_eq!(log.write_position(), Position::start_of(1));
        log.append(&rec("bravo")).expect("append");
        let order: Vec<String> = std::iter::from_fn(|| log.next().expect("next"))
            .map(|d| d.record.points().remove(0))
            .collect();
        assert_eq!(order, vec!["alpha", "bravo"]);
    }

    #[test]
    fn truncate_moves_cursor_to_write_head() {
        let dir = tempdir().expect("tempdir");
        let mut log = open(dir.path());
        log.append(&rec("alpha")).expect("append");
        log.append(&rec("bravo")).expect("append");
        let stale = log.next().expect("next").expect("alpha");
        assert_eq!(log.truncate().expect("truncate"), (2, 2));
        log.commit(&[stale.tag]).expect("stale commit ignored");
        assert!(log.next().expect("next").is_none());
        assert_eq!(log.truncate().expect("second truncate"), (0, 0));
        drop(log);

        let mut log = open(dir.path());
        assert_eq!(log.backlog().records, 0);
        assert!(log.next().expect("next").is_none());
    }
}
