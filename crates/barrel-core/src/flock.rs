//! Directory lock
//!
//! A single advisory lock file guards the whole data directory so that at
//! most one process opens an engine over it. The lock is exclusive and
//! non-blocking: a second open fails immediately. The OS releases the lock
//! when the guard (and with it the descriptor) drops.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{BarrelError, BarrelResult};

/// Holds the exclusive lock on a data directory for its lifetime.
pub struct FileLockGuard {
    _file: File,
    path: PathBuf,
}

impl FileLockGuard {
    /// Acquire the lock file at `path`, creating it if needed. The file
    /// records the owning process id for debugging.
    pub fn acquire<P: AsRef<Path>>(path: P) -> BarrelResult<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| BarrelError::Io {
                path: Some(path.clone()),
                kind: e.kind(),
                message: format!("failed to open lock file: {}", e),
            })?;

        try_lock(&file).map_err(|e| BarrelError::Io {
            path: Some(path.clone()),
            kind: e.kind(),
            message: format!("data directory is locked by another process: {}", e),
        })?;

        let _ = writeln!(file, "{}", std::process::id());
        let _ = file.flush();

        Ok(Self { _file: file, path })
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn try_lock(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let fd = file.as_raw_fd();
    // SAFETY: flock operates on a valid open descriptor obtained from `file`.
    let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if result != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(windows)]
fn try_lock(file: &File) -> std::io::Result<()> {
    use std::os::windows::io::AsRawHandle;
    use winapi::um::fileapi::LockFileEx;
    use winapi::um::minwinbase::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY};

    let handle = file.as_raw_handle();
    // SAFETY: LockFileEx operates on a valid handle obtained from `file`.
    let result = unsafe {
        LockFileEx(
            handle as *mut _,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            !0,
            !0,
            std::ptr::null_mut(),
        )
    };
    if result == 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn try_lock(_file: &File) -> std::io::Result<()> {
    Ok(())
}
