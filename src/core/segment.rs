use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::core::header::RECORD_HEADER_SIZE;
use crate::core::mmap::MmapFile;
use crate::core::{Error, Result};

pub const DEFAULT_SEGMENT_SIZE: usize = 16 * 1024 * 1024;
pub const SEG_HEADER_SIZE: usize = 64;
pub const SEG_DATA_OFFSET: usize = 64;
pub const SEG_MAGIC: u32 = 0x5442_5330; // 'TBS0'
pub const SEG_VERSION: u32 = 1;
pub const SEG_FLAG_SEALED: u32 = 1;

pub const CURSOR_FILE: &str = "cursor.meta";
const CURSOR_SLOT_SIZE: usize = 32;
const CURSOR_FILE_SIZE: usize = CURSOR_SLOT_SIZE * 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub magic: u32,
    pub version: u32,
    pub segment_id: u64,
    pub flags: u32,
}

/// A byte position inside a partition log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    pub segment_id: u64,
    pub offset: u64,
}

/// Checkpoint of the committed consume position of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorMeta {
    pub position: Position,
    pub generation: u64,
}

impl Position {
    pub fn new(segment_id: u64, offset: u64) -> Self {
        Self { segment_id, offset }
    }

    pub fn start_of(segment_id: u64) -> Self {
        Self::new(segment_id, SEG_DATA_OFFSET as u64)
    }
}

impl CursorMeta {
    pub fn new(position: Position, generation: u64) -> Self {
        Self {
            position,
            generation,
        }
    }
}

pub fn segment_filename(id: u64) -> String {
    format!("{:09}.q", id)
}

pub fn segment_path(root: &Path, id: u64) -> PathBuf {
    root.join(segment_filename(id))
}

pub fn parse_segment_id(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(".q")?;
    if stem.is_empty() {
        return None;
    }
    stem.parse::<u64>().ok()
}

/// Returns the ids of all segment files under `root`, ascending.
pub fn discover_segments(root: &Path) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(id) = name.to_str().and_then(parse_segment_id) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

pub fn validate_segment_size(segment_size: u64) -> Result<usize> {
    let size = usize::try_from(segment_size)
        .map_err(|_| Error::Unsupported("segment size exceeds addressable range"))?;
    let min_size = SEG_DATA_OFFSET + RECORD_HEADER_SIZE;
    if size < min_size {
        return Err(Error::Unsupported("segment size too small"));
    }
    Ok(size)
}

pub fn create_segment(root: &Path, id: u64, segment_size: usize) -> Result<MmapFile> {
    let mut mmap = MmapFile::create(&segment_path(root, id), segment_size)?;
    write_segment_header(&mut mmap, id, 0)?;
    Ok(mmap)
}

pub fn open_segment(root: &Path, id: u64) -> Result<MmapFile> {
    let mmap = MmapFile::open(&segment_path(root, id))?;
    let header = read_segment_header(&mmap)?;
    if header.segment_id != id {
        return Err(Error::Corrupt("segment id mismatch"));
    }
    Ok(mmap)
}

pub fn read_segment_header(mmap: &MmapFile) -> Result<SegmentHeader> {
    let buf = mmap.range(0, SEG_HEADER_SIZE)?;
    let magic = u32::from_le_bytes(buf[0..4].try_into().expect("slice length"));
    let version = u32::from_le_bytes(buf[4..8].try_into().expect("slice length"));
    let segment_id = u64::from_le_bytes(buf[8..16].try_into().expect("slice length"));
    let flags = u32::from_le_bytes(buf[16..20].try_into().expect("slice length"));
    if magic != SEG_MAGIC {
        return Err(Error::Corrupt("segment magic mismatch"));
    }
    if version != SEG_VERSION {
        return Err(Error::UnsupportedVersion(version));
    }
    Ok(SegmentHeader {
        magic,
        version,
        segment_id,
        flags,
    })
}

pub fn write_segment_header(mmap: &mut MmapFile, segment_id: u64, flags: u32) -> Result<()> {
    let mut buf = [0u8; SEG_HEADER_SIZE];
    buf[0..4].copy_from_slice(&SEG_MAGIC.to_le_bytes());
    buf[4..8].copy_from_slice(&SEG_VERSION.to_le_bytes());
    buf[8..16].copy_from_slice(&segment_id.to_le_bytes());
    buf[16..20].copy_from_slice(&flags.to_le_bytes());
    mmap.write_at(0, &buf)
}

pub fn seal_segment(mmap: &mut MmapFile) -> Result<()> {
    let header = read_segment_header(mmap)?;
    if (header.flags & SEG_FLAG_SEALED) != 0 {
        return Ok(());
    }
    write_segment_header(mmap, header.segment_id, header.flags | SEG_FLAG_SEALED)
}

/// Loads the newest valid cursor slot, or `None` if no cursor was ever stored.
pub fn load_cursor(path: &Path) -> Result<Option<CursorMeta>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if file.metadata()?.len() != CURSOR_FILE_SIZE as u64 {
        return Err(Error::CorruptMetadata("cursor metadata has unexpected size"));
    }
    let mut buf = [0u8; CURSOR_FILE_SIZE];
    file.read_exact(&mut buf)?;
    let slot0 = parse_cursor_slot(&buf[0..CURSOR_SLOT_SIZE]);
    let slot1 = parse_cursor_slot(&buf[CURSOR_SLOT_SIZE..CURSOR_FILE_SIZE]);
    match (slot0, slot1) {
        (None, None) => Err(Error::CorruptMetadata("no valid cursor slot")),
        (Some(meta), None) | (None, Some(meta)) => Ok(Some(meta)),
        (Some(a), Some(b)) => Ok(Some(if b.generation > a.generation { b } else { a })),
    }
}

/// Writes `meta` into the slot not holding the previous generation, so a torn
/// write always leaves the older checkpoint readable.
pub fn store_cursor(path: &Path, meta: &mut CursorMeta) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)?;
    file.set_len(CURSOR_FILE_SIZE as u64)?;
    meta.generation = meta.generation.saturating_add(1);
    let slot = (meta.generation % 2) as usize;
    file.seek(SeekFrom::Start((slot * CURSOR_SLOT_SIZE) as u64))?;
    file.write_all(&encode_cursor_slot(meta))?;
    file.sync_all()?;
    Ok(())
}

fn encode_cursor_slot(meta: &CursorMeta) -> [u8; CURSOR_SLOT_SIZE] {
    let mut buf = [0u8; CURSOR_SLOT_SIZE];
    buf[0..8].copy_from_slice(&meta.position.segment_id.to_le_bytes());
    buf[8..16].copy_from_slice(&meta.position.offset.to_le_bytes());
    buf[16..24].copy_from_slice(&meta.generation.to_le_bytes());
    let crc = cursor_crc(&buf[0..24]);
    buf[24..28].copy_from_slice(&crc.to_le_bytes());
    buf
}

fn parse_cursor_slot(buf: &[u8]) -> Option<CursorMeta> {
    let crc = u32::from_le_bytes(buf[24..28].try_into().ok()?);
    if cursor_crc(&buf[0..24]) != crc {
        return None;
    }
    let segment_id = u64::from_le_bytes(buf[0..8].try_into().ok()?);
    let offset = u64::from_le_bytes(buf[8..16].try_into().ok()?);
    let generation = u64::from_le_bytes(buf[16..24].try_into().ok()?);
    if generation == 0 {
        return None;
    }
    Some(CursorMeta::new(Position::new(segment_id, offset), generation))
}

fn cursor_crc(payload: &[u8]) -> u32 {
    use crc32fast::Hasher;
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn segment_header_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let mut mmap = create_segment(dir.path(), 7, 4096)?;
        seal_segment(&mut mmap)?;
        drop(mmap);

        let opened = open_segment(dir.path(), 7)?;
        let header = read_segment_header(&opened)?;
        assert_eq!(header.segment_id, 7);
        assert_eq!(header.flags & SEG_FLAG_SEALED, SEG_FLAG_SEALED);
        Ok(())
    }

    #[test]
    fn discover_ignores_foreign_files() -> Result<()> {
        let dir = tempdir()?;
        create_segment(dir.path(), 2, 4096)?;
        create_segment(dir.path(), 0, 4096)?;
        std::fs::write(dir.path().join(CURSOR_FILE), b"")?;
        std::fs::write(dir.path().join("notes.txt"), b"x")?;
        assert_eq!(discover_segments(dir.path())?, vec![0, 2]);
        Ok(())
    }

    #[test]
    fn cursor_keeps_newest_generation() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join(CURSOR_FILE);
        assert!(load_cursor(&path)?.is_none());

        let mut meta = CursorMeta::new(Position::new(0, 128), 0);
        store_cursor(&path, &mut meta)?;
        meta.position = Position::new(1, 64);
        store_cursor(&path, &mut meta)?;

        let loaded = load_cursor(&path)?.expect("cursor");
        assert_eq!(loaded.position, Position::new(1, 64));
        assert_eq!(loaded.generation, 2);
        Ok(())
    }

    #[test]
    fn cursor_falls_back_when_slot_torn() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join(CURSOR_FILE);
        let mut meta = CursorMeta::new(Position::new(0, 96), 0);
        store_cursor(&path, &mut meta)?;
        meta.position = Position::new(0, 200);
        store_cursor(&path, &mut meta)?;

        // Generation 2 lives in slot 0; corrupt it.
        let mut bytes = std::fs::read(&path)?;
        bytes[3] ^= 0xFF;
        std::fs::write(&path, &bytes)?;

        let loaded = load_cursor(&path)?.expect("cursor");
        assert_eq!(loaded.position, Position::new(0, 96));
        Ok(())
    }
}
