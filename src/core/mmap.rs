use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};

use crate::core::{Error, Result};

/// A read/write memory map over a fixed-length segment file.
pub struct MmapFile {
    file: File,
    map: MmapMut,
    len: usize,
}

impl MmapFile {
    /// Creates (or truncates) `path` to `len` zeroed bytes and maps it.
    pub fn create(path: &Path, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::Unsupported("mmap length must be non-zero"));
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        // SAFETY: the file is owned by this process for the lifetime of the map;
        // segment files are never resized while mapped.
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self { file, map, len })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(Error::Unsupported("mmap length must be non-zero"));
        }
        // SAFETY: see `create`.
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self { file, map, len })
    }

    pub fn range(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = offset.checked_add(len).ok_or(Error::Corrupt("range overflow"))?;
        if end > self.len {
            return Err(Error::Corrupt("range out of bounds"));
        }
        Ok(&self.map[offset..end])
    }

    pub fn range_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let end = offset.checked_add(len).ok_or(Error::Corrupt("range overflow"))?;
        if end > self.len {
            return Err(Error::Corrupt("range out of bounds"));
        }
        Ok(&mut self.map[offset..end])
    }

    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.range_mut(offset, bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Flushes dirty pages and then the file metadata.
    pub fn sync(&self) -> Result<()> {
        self.map.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    pub fn flush_async(&self) -> Result<()> {
        self.map.flush_async()?;
        Ok(())
    }

    pub fn flush_sync(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }
}
