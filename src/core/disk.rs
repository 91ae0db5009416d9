use std::path::Path;

use crate::core::Result;

/// Capacity figures for the filesystem holding a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsUsage {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl FsUsage {
    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.available_bytes)
    }

    /// Percentage of the filesystem in use, 0..=100.
    pub fn used_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.used_bytes() as f64 * 100.0 / self.total_bytes as f64
    }
}

#[cfg(unix)]
pub fn fs_usage(path: &Path) -> Result<FsUsage> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| crate::core::Error::Unsupported("path contains null byte"))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is NUL-terminated and stat is a valid out-pointer.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(crate::core::Error::Io(std::io::Error::last_os_error()));
    }
    let frsize = stat.f_frsize as u64;
    Ok(FsUsage {
        total_bytes: (stat.f_blocks as u64).saturating_mul(frsize),
        available_bytes: (stat.f_bavail as u64).saturating_mul(frsize),
    })
}

#[cfg(not(unix))]
pub fn fs_usage(_path: &Path) -> Result<FsUsage> {
    Err(crate::core::Error::Unsupported("filesystem usage probe"))
}

/// Sum of the sizes of the regular files directly under `dir`.
pub fn dir_size(dir: &Path) -> Result<u64> {
    let mut total = 0u64;
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let meta = entry?.metadata()?;
        if meta.is_file() {
            total = total.saturating_add(meta.len());
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn used_percent_handles_empty_fs() {
        let usage = FsUsage {
            total_bytes: 0,
            available_bytes: 0,
        };
        assert_eq!(usage.used_percent(), 0.0);
        let usage = FsUsage {
            total_bytes: 200,
            available_bytes: 50,
        };
        assert_eq!(usage.used_percent(), 75.0);
    }

    #[cfg(unix)]
    #[test]
    fn probes_tempdir() {
        let dir = tempdir().expect("tempdir");
        let usage = fs_usage(dir.path()).expect("statvfs");
        assert!(usage.total_bytes >= usage.available_bytes);
    }

    #[test]
    fn dir_size_sums_files() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a"), [0u8; 10]).expect("write a");
        std::fs::write(dir.path().join("b"), [0u8; 5]).expect("write b");
        assert_eq!(dir_size(dir.path()).expect("size"), 15);
        assert_eq!(dir_size(&dir.path().join("missing")).expect("missing"), 0);
    }
}
