//! I/O backends for log files
//!
//! An IoSelector is the uniform contract for positioned reads and writes
//! over one file. Two implementations exist: FileIo issues positioned
//! syscalls on a file descriptor, MmapIo memcpys into a memory-mapped
//! region over the pre-sized file. Both guarantee that a successful write
//! followed by a successful sync renders the byte range durable.
//!
//! Opening always creates the file if absent; a file smaller than the
//! requested cap is truncated up to the cap so that mapping the full
//! region is legal.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use parking_lot::RwLock;

use crate::error::{BarrelError, BarrelResult};

/// Uniform contract for positioned file I/O.
pub trait IoSelector: Send + Sync {
    /// Write `buf` at `offset`. Returns the number of bytes written.
    fn write(&self, buf: &[u8], offset: u64) -> BarrelResult<usize>;

    /// Read into `buf` at `offset`. Returns the number of bytes read,
    /// which is less than `buf.len()` only at the end of the region.
    fn read(&self, buf: &mut [u8], offset: u64) -> BarrelResult<usize>;

    /// Flush written data to persistent storage.
    fn sync(&self) -> BarrelResult<()>;

    /// Flush and stop accepting I/O. The descriptor is released on drop.
    fn close(&self) -> BarrelResult<()>;

    /// Remove the backing file. The selector is unusable afterwards.
    fn delete(&self) -> BarrelResult<()>;
}

/// Open (or create) `path` and grow it to `fsize` if it is smaller.
fn open_file(path: &Path, fsize: u64) -> BarrelResult<File> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| BarrelError::Io {
            path: Some(path.to_path_buf()),
            kind: e.kind(),
            message: format!("failed to open log file: {}", e),
        })?;

    let len = file
        .metadata()
        .map_err(|e| BarrelError::Io {
            path: Some(path.to_path_buf()),
            kind: e.kind(),
            message: format!("failed to stat log file: {}", e),
        })?
        .len();

    if len < fsize {
        file.set_len(fsize).map_err(|e| BarrelError::Io {
            path: Some(path.to_path_buf()),
            kind: e.kind(),
            message: format!("failed to pre-size log file to {} bytes: {}", fsize, e),
        })?;
    }

    Ok(file)
}

// ---------------------------------------------------------------------------
// FileIo — positioned syscalls
// ---------------------------------------------------------------------------

/// Positioned read/write over a plain file descriptor.
pub struct FileIo {
    file: File,
    path: PathBuf,
}

impl FileIo {
    pub fn open(path: &Path, fsize: u64) -> BarrelResult<Self> {
        let file = open_file(path, fsize)?;
        Ok(Self { file, path: path.to_path_buf() })
    }

    #[cfg(unix)]
    fn write_at(&self, buf: &[u8], offset: u64) -> std::io::Result<usize> {
        use std::os::unix::fs::FileExt;
        self.file.write_at(buf, offset)
    }

    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        use std::os::unix::fs::FileExt;
        self.file.read_at(buf, offset)
    }

    #[cfg(windows)]
    fn write_at(&self, buf: &[u8], offset: u64) -> std::io::Result<usize> {
        use std::os::windows::fs::FileExt;
        self.file.seek_write(buf, offset)
    }

    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        use std::os::windows::fs::FileExt;
        self.file.seek_read(buf, offset)
    }
}

impl IoSelector for FileIo {
    fn write(&self, buf: &[u8], offset: u64) -> BarrelResult<usize> {
        let mut written = 0usize;
        while written < buf.len() {
            let n = self
                .write_at(&buf[written..], offset + written as u64)
                .map_err(|e| BarrelError::Io {
                    path: Some(self.path.clone()),
                    kind: e.kind(),
                    message: format!("positioned write failed: {}", e),
                })?;
            if n == 0 {
                break;
            }
            written += n;
        }
        Ok(written)
    }

    fn read(&self, buf: &mut [u8], offset: u64) -> BarrelResult<usize> {
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = self
                .read_at(&mut buf[filled..], offset + filled as u64)
                .map_err(|e| BarrelError::Io {
                    path: Some(self.path.clone()),
                    kind: e.kind(),
                    message: format!("positioned read failed: {}", e),
                })?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    fn sync(&self) -> BarrelResult<()> {
        self.file.sync_data().map_err(|e| BarrelError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("sync failed: {}", e),
        })
    }

    fn close(&self) -> BarrelResult<()> {
        self.sync()
    }

    fn delete(&self) -> BarrelResult<()> {
        std::fs::remove_file(&self.path).map_err(|e| BarrelError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("failed to remove log file: {}", e),
        })
    }
}

// ---------------------------------------------------------------------------
// MmapIo — memory-mapped region
// ---------------------------------------------------------------------------

/// Memory-mapped I/O over a pre-sized file. Writes copy into the map and
/// sync issues a map flush. `delete` unmaps before removing the file.
pub struct MmapIo {
    map: RwLock<Option<MmapMut>>,
    _file: File,
    path: PathBuf,
}

impl MmapIo {
    pub fn open(path: &Path, fsize: u64) -> BarrelResult<Self> {
        let file = open_file(path, fsize)?;
        // SAFETY: the file stays open for the lifetime of the map, and the
        // engine never truncates a mapped log file.
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(|e| BarrelError::Io {
            path: Some(path.to_path_buf()),
            kind: e.kind(),
            message: format!("failed to mmap log file: {}", e),
        })?;

        Ok(Self {
            map: RwLock::new(Some(map)),
            _file: file,
            path: path.to_path_buf(),
        })
    }

    fn deleted_err(&self) -> BarrelError {
        BarrelError::Io {
            path: Some(self.path.clone()),
            kind: std::io::ErrorKind::NotFound,
            message: "mapped region has been deleted".into(),
        }
    }
}

impl IoSelector for MmapIo {
    fn write(&self, buf: &[u8], offset: u64) -> BarrelResult<usize> {
        let mut guard = self.map.write();
        let map = guard.as_mut().ok_or_else(|| self.deleted_err())?;

        let start = offset as usize;
        let end = start + buf.len();
        if end > map.len() {
            return Err(BarrelError::Io {
                path: Some(self.path.clone()),
                kind: std::io::ErrorKind::InvalidInput,
                message: format!(
                    "write of {} bytes at offset {} exceeds mapped region of {} bytes",
                    buf.len(),
                    offset,
                    map.len()
                ),
            });
        }

        map[start..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn read(&self, buf: &mut [u8], offset: u64) -> BarrelResult<usize> {
        let guard = self.map.read();
        let map = guard.as_ref().ok_or_else(|| self.deleted_err())?;

        let start = offset as usize;
        if start >= map.len() {
            return Ok(0);
        }
        let n = buf.len().min(map.len() - start);
        buf[..n].copy_from_slice(&map[start..start + n]);
        Ok(n)
    }

    fn sync(&self) -> BarrelResult<()> {
        let guard = self.map.read();
        let map = guard.as_ref().ok_or_else(|| self.deleted_err())?;
        map.flush().map_err(|e| BarrelError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("mmap flush failed: {}", e),
        })
    }

    fn close(&self) -> BarrelResult<()> {
        self.sync()
    }

    fn delete(&self) -> BarrelResult<()> {
        // Unmap first; removing a mapped file is legal on unix but the map
        // must not outlive the engine's last reference to this region.
        let mut guard = self.map.write();
        guard.take();
        std::fs::remove_file(&self.path).map_err(|e| BarrelError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("failed to remove mapped log file: {}", e),
        })
    }
}
