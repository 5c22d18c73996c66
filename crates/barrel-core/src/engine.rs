//! Core storage engine — the heart of Barrel.
//!
//! BarrelEngine owns the per-type active log file, the archived read-only
//! logs, the in-memory index trees and the discard tables. Every mutation
//! appends to a log, then updates the index; reads resolve through the
//! index to a file position (or an inline value in KeyValueMem mode).
//!
//! **Write path**: encode entry -> rotate active log if the cap would be
//! exceeded -> append -> update index -> forward the superseded position
//! to the discard channel.
//! **Recovery**: scan the directory, replay every log in ascending file-id
//! order, then reposition the active file's append offset.
//! **Background**: a GC thread rewrites live entries out of stale files.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use crate::config::Options;
use crate::discard::{Discard, DISCARD_DIR, DISCARD_FILE_SUFFIX};
use crate::entry::{encode_entry, LogEntry};
use crate::error::{BarrelError, BarrelResult};
use crate::flock::FileLockGuard;
use crate::gc;
use crate::index::{DataType, KeyedIndex, StrIndex, ZSetIndex};
use crate::logfile::{LogFile, FILE_PREFIX};
use crate::util;

/// Name of the directory lock file.
pub const LOCK_FILE_NAME: &str = "FLOCK";

/// Where a just-written entry landed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ValuePos {
    pub fid: u32,
    pub offset: u64,
    pub entry_size: usize,
}

/// Log-structured engine over five typed namespaces.
///
/// All public methods take `&self`; per-type locks serialize writers while
/// readers of the same type proceed shared. One engine owns a data
/// directory exclusively, enforced by an advisory file lock.
pub struct BarrelEngine {
    pub(crate) opts: Options,
    /// Per type, the log file currently receiving appends
    pub(crate) active_files: RwLock<HashMap<DataType, Arc<LogFile>>>,
    /// Per type, the read-only logs still reachable through the index
    pub(crate) archived_files: RwLock<HashMap<DataType, HashMap<u32, Arc<LogFile>>>>,
    /// Per type, the dead-bytes accounting table
    pub(crate) discards: HashMap<DataType, Discard>,
    pub(crate) str_index: StrIndex,
    pub(crate) list_index: KeyedIndex,
    pub(crate) hash_index: KeyedIndex,
    pub(crate) set_index: KeyedIndex,
    pub(crate) zset_index: ZSetIndex,
    file_lock: Mutex<Option<FileLockGuard>>,
    closed: AtomicBool,
    /// At most one GC runs across the whole engine
    pub(crate) gc_running: AtomicBool,
    pub(crate) gc_shutdown: Arc<AtomicBool>,
    pub(crate) gc_handle: Mutex<Option<JoinHandle<()>>>,
}

impl BarrelEngine {
    /// Open (or create) an engine over `opts.db_path`. Acquires the
    /// directory lock, replays every log file into the in-memory indexes
    /// and starts the background GC loop.
    pub fn open(opts: Options) -> BarrelResult<Arc<Self>> {
        opts.validate().map_err(|message| BarrelError::Config { message })?;

        fs::create_dir_all(&opts.db_path).map_err(|e| BarrelError::Io {
            path: Some(opts.db_path.clone()),
            kind: e.kind(),
            message: format!("failed to create data directory: {}", e),
        })?;

        let file_lock = FileLockGuard::acquire(opts.db_path.join(LOCK_FILE_NAME))?;

        let discard_dir = opts.db_path.join(DISCARD_DIR);
        fs::create_dir_all(&discard_dir).map_err(|e| BarrelError::Io {
            path: Some(discard_dir.clone()),
            kind: e.kind(),
            message: format!("failed to create discard directory: {}", e),
        })?;

        let mut discards = HashMap::new();
        for data_type in DataType::ALL {
            let name = format!("{}{}", data_type.file_name(), DISCARD_FILE_SUFFIX);
            discards.insert(
                data_type,
                Discard::new(&discard_dir, &name, opts.discard_buffer_size)?,
            );
        }

        let engine = Self {
            opts,
            active_files: RwLock::new(HashMap::new()),
            archived_files: RwLock::new(HashMap::new()),
            discards,
            str_index: StrIndex::new(),
            list_index: KeyedIndex::new(),
            hash_index: KeyedIndex::new(),
            set_index: KeyedIndex::new(),
            zset_index: ZSetIndex::new(),
            file_lock: Mutex::new(Some(file_lock)),
            closed: AtomicBool::new(false),
            gc_running: AtomicBool::new(false),
            gc_shutdown: Arc::new(AtomicBool::new(false)),
            gc_handle: Mutex::new(None),
        };

        let fid_map = engine.load_log_files()?;
        engine.load_index_from_log_files(&fid_map)?;

        let engine = Arc::new(engine);
        gc::spawn(&engine)?;
        Ok(engine)
    }

    /// Flush all active logs and discard tables.
    pub fn sync(&self) -> BarrelResult<()> {
        self.check_open()?;
        let actives = self.active_files.read();
        for log_file in actives.values() {
            log_file.sync()?;
        }
        drop(actives);
        for discard in self.discards.values() {
            discard.sync()?;
        }
        Ok(())
    }

    /// Compaction candidate list for one type: archived-or-active fids at
    /// or above `min_fid` whose discard ratio reaches `ratio`, best
    /// candidates first. Diagnostic counterpart of the GC's own selection.
    pub fn discard_candidates(
        &self,
        data_type: DataType,
        min_fid: u32,
        ratio: f64,
    ) -> BarrelResult<Vec<u32>> {
        self.check_open()?;
        self.discards[&data_type].get_ccl(min_fid, ratio)
    }

    /// Copy the data directory (log files and discard tables, not the
    /// lock file) into `dest`.
    pub fn backup<P: AsRef<Path>>(&self, dest: P) -> BarrelResult<()> {
        self.check_open()?;
        self.sync()?;

        let dest = dest.as_ref();
        fs::create_dir_all(dest).map_err(|e| BarrelError::Io {
            path: Some(dest.to_path_buf()),
            kind: e.kind(),
            message: format!("failed to create backup directory: {}", e),
        })?;

        let entries = fs::read_dir(&self.opts.db_path).map_err(|e| BarrelError::Io {
            path: Some(self.opts.db_path.clone()),
            kind: e.kind(),
            message: format!("failed to read data directory: {}", e),
        })?;
        for dir_entry in entries {
            let dir_entry = dir_entry.map_err(BarrelError::from)?;
            let name = dir_entry.file_name();
            if name.to_str() == Some(LOCK_FILE_NAME) {
                continue;
            }
            let src_path = dir_entry.path();
            let dst_path = dest.join(&name);
            let result = if dir_entry.file_type().map_err(BarrelError::from)?.is_dir() {
                util::copy_dir(&src_path, &dst_path)
            } else {
                fs::copy(&src_path, &dst_path).map(|_| ())
            };
            result.map_err(|e| BarrelError::Io {
                path: Some(src_path),
                kind: e.kind(),
                message: format!("backup copy failed: {}", e),
            })?;
        }
        Ok(())
    }

    /// Flush active logs, stop the GC loop and the discard consumers, and
    /// release the directory lock. Every operation afterwards fails with
    /// DbClosed. Idempotent.
    pub fn close(&self) -> BarrelResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.gc_shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.gc_handle.lock().take() {
            // The last engine reference can be dropped from the GC thread
            // itself; joining our own thread would never return.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }

        let mut first_err = None;
        let actives = self.active_files.read();
        for log_file in actives.values() {
            if let Err(e) = log_file.sync() {
                eprintln!("[CLOSE] failed to sync active log: {}", e);
                first_err.get_or_insert(e);
            }
        }
        drop(actives);

        for discard in self.discards.values() {
            discard.close();
        }

        self.file_lock.lock().take();

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub(crate) fn check_open(&self) -> BarrelResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BarrelError::DbClosed);
        }
        Ok(())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // Log file management
    // -----------------------------------------------------------------------

    /// Scan the directory for `log.<type>.<fid>` files, open them all, and
    /// mark the highest fid of each type active. Returns the fids per type
    /// in ascending order for the replay pass.
    fn load_log_files(&self) -> BarrelResult<HashMap<DataType, Vec<u32>>> {
        let mut fid_map: HashMap<DataType, Vec<u32>> = HashMap::new();

        let entries = fs::read_dir(&self.opts.db_path).map_err(|e| BarrelError::Io {
            path: Some(self.opts.db_path.clone()),
            kind: e.kind(),
            message: format!("failed to read data directory: {}", e),
        })?;
        for dir_entry in entries {
            let dir_entry = dir_entry.map_err(BarrelError::from)?;
            let name = dir_entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !name.starts_with(FILE_PREFIX) {
                continue;
            }
            let parts: Vec<&str> = name.split('.').collect();
            if parts.len() != 3 {
                continue;
            }
            let Some(data_type) = DataType::from_file_name(parts[1]) else {
                continue;
            };
            let Ok(fid) = parts[2].parse::<u32>() else {
                continue;
            };
            fid_map.entry(data_type).or_default().push(fid);
        }

        let mut actives = self.active_files.write();
        let mut archived = self.archived_files.write();
        for (&data_type, fids) in fid_map.iter_mut() {
            fids.sort_unstable();
            for (i, &fid) in fids.iter().enumerate() {
                let log_file = Arc::new(LogFile::open(
                    &self.opts.db_path,
                    fid,
                    self.opts.log_file_size_threshold,
                    data_type,
                    self.opts.io_type,
                )?);
                if i == fids.len() - 1 {
                    // Re-register defensively; set_total is a no-op for
                    // fids that already own a slot.
                    self.discards[&data_type]
                        .set_total(fid, self.opts.log_file_size_threshold as u32)?;
                    actives.insert(data_type, log_file);
                } else {
                    archived.entry(data_type).or_default().insert(fid, log_file);
                }
            }
        }
        Ok(fid_map)
    }

    /// Replay every log file into the indexes, one thread per data type.
    /// A CRC mismatch truncates that file's tail; any other error is fatal.
    fn load_index_from_log_files(
        &self,
        fid_map: &HashMap<DataType, Vec<u32>>,
    ) -> BarrelResult<()> {
        std::thread::scope(|scope| {
            let mut handles = Vec::new();
            for data_type in DataType::ALL {
                let fids = fid_map.get(&data_type).cloned().unwrap_or_default();
                handles.push(scope.spawn(move || self.replay_type(data_type, &fids)));
            }
            for handle in handles {
                handle.join().map_err(|_| BarrelError::Io {
                    path: None,
                    kind: std::io::ErrorKind::Other,
                    message: "recovery thread panicked".into(),
                })??;
            }
            Ok(())
        })
    }

    fn replay_type(&self, data_type: DataType, fids: &[u32]) -> BarrelResult<()> {
        for (i, &fid) in fids.iter().enumerate() {
            let log_file = self
                .get_log_file(data_type, fid)
                .ok_or(BarrelError::LogFileNotFound { fid })?;

            let mut offset = 0u64;
            loop {
                match log_file.read_entry(offset) {
                    Ok((entry, size)) => {
                        let pos = ValuePos { fid, offset, entry_size: size };
                        self.build_index(data_type, &entry, &pos);
                        offset += size as u64;
                    }
                    Err(BarrelError::EndOfEntries) => break,
                    Err(BarrelError::InvalidCrc { .. }) => {
                        eprintln!(
                            "[RECOVERY] crc mismatch in log.{}.{:09} at offset {}, truncating tail",
                            data_type.file_name(),
                            fid,
                            offset
                        );
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }

            // The active file resumes appending right after the last
            // valid entry.
            if i == fids.len() - 1 {
                log_file.set_write_at(offset);
            }
        }
        Ok(())
    }

    /// Create the first log file of a type on demand.
    fn init_log_file(&self, data_type: DataType) -> BarrelResult<()> {
        {
            let actives = self.active_files.read();
            if actives.contains_key(&data_type) {
                return Ok(());
            }
        }
        let mut actives = self.active_files.write();
        if actives.contains_key(&data_type) {
            return Ok(());
        }
        let log_file = Arc::new(LogFile::open(
            &self.opts.db_path,
            0,
            self.opts.log_file_size_threshold,
            data_type,
            self.opts.io_type,
        )?);
        self.discards[&data_type].set_total(0, self.opts.log_file_size_threshold as u32)?;
        actives.insert(data_type, log_file);
        Ok(())
    }

    /// Append an encoded entry to the type's active log, rotating to a new
    /// file when the cap would be exceeded.
    pub(crate) fn write_log_entry(
        &self,
        entry: &LogEntry,
        data_type: DataType,
    ) -> BarrelResult<ValuePos> {
        self.init_log_file(data_type)?;
        let mut active = self
            .get_active_log_file(data_type)
            .ok_or(BarrelError::LogFileNotFound { fid: 0 })?;

        let (buf, entry_size) = encode_entry(entry);

        if active.write_at() + entry_size as u64 > self.opts.log_file_size_threshold {
            active.sync()?;

            let mut actives = self.active_files.write();
            let current = actives
                .get(&data_type)
                .cloned()
                .ok_or(BarrelError::LogFileNotFound { fid: 0 })?;
            if Arc::ptr_eq(&current, &active) {
                let new_fid = current.fid + 1;
                let log_file = Arc::new(LogFile::open(
                    &self.opts.db_path,
                    new_fid,
                    self.opts.log_file_size_threshold,
                    data_type,
                    self.opts.io_type,
                )?);
                self.discards[&data_type]
                    .set_total(new_fid, self.opts.log_file_size_threshold as u32)?;
                self.archived_files
                    .write()
                    .entry(data_type)
                    .or_default()
                    .insert(current.fid, Arc::clone(&current));
                actives.insert(data_type, Arc::clone(&log_file));
                active = log_file;
            } else {
                // Another writer rotated while we waited for the lock.
                active = current;
            }
        }

        let offset = active.write(&buf)?;
        if self.opts.sync {
            active.sync()?;
        }
        Ok(ValuePos { fid: active.fid, offset, entry_size })
    }

    pub(crate) fn get_active_log_file(&self, data_type: DataType) -> Option<Arc<LogFile>> {
        self.active_files.read().get(&data_type).cloned()
    }

    pub(crate) fn get_archived_log_file(
        &self,
        data_type: DataType,
        fid: u32,
    ) -> Option<Arc<LogFile>> {
        self.archived_files.read().get(&data_type).and_then(|m| m.get(&fid)).cloned()
    }

    /// Locate the log file holding `fid`, active or archived.
    pub(crate) fn get_log_file(&self, data_type: DataType, fid: u32) -> Option<Arc<LogFile>> {
        if let Some(active) = self.get_active_log_file(data_type) {
            if active.fid == fid {
                return Some(active);
            }
        }
        self.get_archived_log_file(data_type, fid)
    }
}

impl Drop for BarrelEngine {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
