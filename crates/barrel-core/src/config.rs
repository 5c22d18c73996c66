//! Configuration for a Barrel instance
//!
//! All knobs live in one Options struct with public fields; `validate()`
//! rejects nonsensical combinations before the engine touches the disk.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which I/O backend log files are opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoType {
    /// Positioned read/write syscalls over a file descriptor
    FileIo,
    /// Memory-mapped region over a pre-sized file
    Mmap,
}

/// Whether index nodes keep the value bytes in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMode {
    /// Index stores only key metadata; reads go to the log file
    KeyOnlyMem,
    /// Index stores the value inline; reads never touch the disk
    KeyValueMem,
}

/// Barrel engine configuration.
#[derive(Debug, Clone)]
pub struct Options {
    /// Directory holding log files, the discard tables and the lock file
    pub db_path: PathBuf,
    /// I/O backend for log files
    pub io_type: IoType,
    /// In-memory index mode
    pub index_mode: IndexMode,
    /// Size cap per log file in bytes; files are pre-sized to this cap
    pub log_file_size_threshold: u64,
    /// Sync every write to persistent storage before returning
    pub sync: bool,
    /// Byte size of each per-type discard table file; slot count is size/12.
    /// Also bounds the in-flight discard channel.
    pub discard_buffer_size: usize,
    /// Period of the background log file GC loop
    pub log_file_gc_interval: Duration,
    /// Minimum discard ratio for a log file to become a GC candidate
    pub log_file_gc_ratio: f64,
}

impl Options {
    /// Default options rooted at the given directory.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            io_type: IoType::FileIo,
            index_mode: IndexMode::KeyOnlyMem,
            log_file_size_threshold: 512 * 1024 * 1024,
            sync: false,
            discard_buffer_size: 8 * 1024,
            log_file_gc_interval: Duration::from_secs(8 * 60 * 60),
            log_file_gc_ratio: 0.5,
        }
    }

    /// Validate all configuration parameters.
    pub fn validate(&self) -> Result<(), String> {
        if self.db_path.as_os_str().is_empty() {
            return Err("db_path must not be empty".into());
        }
        if self.log_file_size_threshold < 64 {
            return Err("log_file_size_threshold must be >= 64 bytes".into());
        }
        if self.discard_buffer_size < 12 {
            return Err("discard_buffer_size must hold at least one 12-byte slot".into());
        }
        if self.log_file_gc_interval.as_millis() == 0 {
            return Err("log_file_gc_interval must be > 0".into());
        }
        if self.log_file_gc_ratio <= 0.0 || self.log_file_gc_ratio > 1.0 {
            return Err("log_file_gc_ratio must be in (0.0, 1.0]".into());
        }
        Ok(())
    }
}
