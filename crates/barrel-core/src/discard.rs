//! Discard statistics
//!
//! One fixed-slot file per data type tracks how many dead bytes each log
//! file carries. Each 12-byte slot is `fid u32 LE | total u32 LE |
//! discarded u32 LE`. The garbage collector asks this table for compaction
//! candidates; the statistics are an optimization, so a lost update only
//! delays a collection.
//!
//! Writers never touch the table directly: superseded index nodes travel
//! over a bounded channel to a consumer thread that applies the byte
//! deltas. Overflow is dropped with a warning instead of stalling a write.

use std::path::Path;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::error::{BarrelError, BarrelResult};
use crate::index::IndexNode;
use crate::ioselector::{FileIo, IoSelector};

/// Bytes per discard slot: fid + total + discarded, all u32 LE.
pub const DISCARD_RECORD_SIZE: usize = 12;

/// Directory under the db path holding the per-type discard files.
pub const DISCARD_DIR: &str = "DISCARD";

/// File name suffix for each per-type table.
pub const DISCARD_FILE_SUFFIX: &str = ".discard";

struct DiscardState {
    /// Slot offsets available for allocation
    free_list: Vec<u64>,
    /// fid -> slot offset for every live file
    location: HashMap<u32, u64>,
}

struct DiscardShared {
    io: FileIo,
    state: Mutex<DiscardState>,
}

/// Per-type discard table plus its stale-position channel.
pub struct Discard {
    shared: Arc<DiscardShared>,
    tx: Mutex<Option<SyncSender<IndexNode>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DiscardShared {
    fn read_slot(&self, offset: u64) -> BarrelResult<(u32, u32, u32)> {
        let mut buf = [0u8; DISCARD_RECORD_SIZE];
        self.io.read(&mut buf, offset)?;
        let fid = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let total = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let discarded = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        Ok((fid, total, discarded))
    }

    fn write_slot(&self, offset: u64, fid: u32, total: u32, discarded: u32) -> BarrelResult<()> {
        let mut buf = [0u8; DISCARD_RECORD_SIZE];
        buf[0..4].copy_from_slice(&fid.to_le_bytes());
        buf[4..8].copy_from_slice(&total.to_le_bytes());
        buf[8..12].copy_from_slice(&discarded.to_le_bytes());
        self.io.write(&buf, offset)?;
        Ok(())
    }

    /// Add `delta` dead bytes to the slot for `fid`. No-op for unknown fids.
    fn incr_discard(&self, fid: u32, delta: u32) {
        let state = self.state.lock();
        let Some(&offset) = state.location.get(&fid) else {
            return;
        };
        match self.read_slot(offset) {
            Ok((slot_fid, total, discarded)) => {
                let next = discarded.saturating_add(delta).min(total);
                if let Err(e) = self.write_slot(offset, slot_fid, total, next) {
                    eprintln!("[DISCARD] failed to update slot for fid {}: {}", fid, e);
                }
            }
            Err(e) => eprintln!("[DISCARD] failed to read slot for fid {}: {}", fid, e),
        }
    }
}

impl Discard {
    /// Open (or create) the discard table at `<dir>/<name>`, pre-sized to
    /// `buffer_size` bytes. Existing slots are scanned to rebuild the free
    /// list and the fid -> offset map.
    pub fn new(dir: &Path, name: &str, buffer_size: usize) -> BarrelResult<Self> {
        let path = dir.join(name);
        let io = FileIo::open(&path, buffer_size as u64)?;

        let slot_count = buffer_size / DISCARD_RECORD_SIZE;
        let shared = DiscardShared {
            io,
            state: Mutex::new(DiscardState {
                free_list: Vec::with_capacity(slot_count),
                location: HashMap::new(),
            }),
        };

        {
            let mut state = shared.state.lock();
            for slot in 0..slot_count {
                let offset = (slot * DISCARD_RECORD_SIZE) as u64;
                let (fid, total, _) = shared.read_slot(offset)?;
                if total == 0 {
                    state.free_list.push(offset);
                } else {
                    state.location.insert(fid, offset);
                }
            }
            // Allocate low offsets first.
            state.free_list.reverse();
        }

        let shared = Arc::new(shared);
        let (tx, rx) = sync_channel::<IndexNode>(slot_count.max(1));
        let worker = Self::spawn_consumer(Arc::clone(&shared), rx)?;

        Ok(Self {
            shared,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    fn spawn_consumer(
        shared: Arc<DiscardShared>,
        rx: Receiver<IndexNode>,
    ) -> BarrelResult<JoinHandle<()>> {
        thread::Builder::new()
            .name("barrel-discard".to_string())
            .spawn(move || {
                // Ends when every sender is dropped at close.
                for node in rx {
                    shared.incr_discard(node.fid, node.entry_size as u32);
                }
            })
            .map_err(|e| BarrelError::Io {
                path: None,
                kind: std::io::ErrorKind::Other,
                message: format!("failed to spawn discard consumer: {}", e),
            })
    }

    /// Queue a superseded index node for accounting. Never blocks; a full
    /// channel drops the update.
    pub fn send(&self, node: IndexNode) {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return;
        };
        match tx.try_send(node) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                eprintln!("[DISCARD] channel full, dropping stale-position update");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Register a newly active file's capacity. Allocates a slot from the
    /// free list; already-registered fids are left untouched.
    pub fn set_total(&self, fid: u32, total: u32) -> BarrelResult<()> {
        let mut state = self.shared.state.lock();
        if state.location.contains_key(&fid) {
            return Ok(());
        }
        let offset = state.free_list.pop().ok_or(BarrelError::DiscardNoSpace)?;
        if let Err(e) = self.shared.write_slot(offset, fid, total, 0) {
            state.free_list.push(offset);
            return Err(e);
        }
        state.location.insert(fid, offset);
        Ok(())
    }

    /// Directly add dead bytes for `fid`. The channel consumer uses this
    /// path; GC also calls it when retiring entries synchronously.
    pub fn incr_discard(&self, fid: u32, delta: u32) {
        self.shared.incr_discard(fid, delta);
    }

    /// Drop the slot for a deleted file and return it to the free list.
    pub fn clear(&self, fid: u32) -> BarrelResult<()> {
        let mut state = self.shared.state.lock();
        let Some(offset) = state.location.remove(&fid) else {
            return Ok(());
        };
        self.shared.write_slot(offset, 0, 0, 0)?;
        state.free_list.push(offset);
        Ok(())
    }

    /// Compaction candidate list: fids at or above `min_fid` whose discard
    /// ratio reaches `ratio`, sorted by descending ratio.
    pub fn get_ccl(&self, min_fid: u32, ratio: f64) -> BarrelResult<Vec<u32>> {
        let state = self.shared.state.lock();
        let mut candidates: Vec<(u32, f64)> = Vec::new();
        for (&fid, &offset) in state.location.iter() {
            let (_, total, discarded) = self.shared.read_slot(offset)?;
            if total == 0 || fid < min_fid {
                continue;
            }
            let cur = f64::from(discarded) / f64::from(total);
            if cur >= ratio {
                candidates.push((fid, cur));
            }
        }
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
        Ok(candidates.into_iter().map(|(fid, _)| fid).collect())
    }

    /// Flush slot updates to disk.
    pub fn sync(&self) -> BarrelResult<()> {
        self.shared.io.sync()
    }

    /// Stop the consumer thread and flush. Called once at engine close.
    pub fn close(&self) {
        self.tx.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
        let _ = self.shared.io.sync();
    }
}

impl Drop for Discard {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn open(dir: &Path, size: usize) -> Discard {
        Discard::new(dir, "strs.discard", size).unwrap()
    }

    #[test]
    fn test_new_builds_free_list() {
        let dir = TempDir::new().unwrap();
        let dis = open(dir.path(), 4096);
        let state = dis.shared.state.lock();
        assert_eq!(state.free_list.len(), 4096 / DISCARD_RECORD_SIZE);
        assert!(state.location.is_empty());
    }

    #[test]
    fn test_set_total_and_ccl() {
        let dir = TempDir::new().unwrap();
        let dis = open(dir.path(), 4096);

        dis.set_total(1, 1000).unwrap();
        dis.set_total(2, 1000).unwrap();
        dis.incr_discard(1, 900);
        dis.incr_discard(2, 400);

        let ccl = dis.get_ccl(0, 0.5).unwrap();
        assert_eq!(ccl, vec![1]);

        let ccl = dis.get_ccl(0, 0.3).unwrap();
        assert_eq!(ccl, vec![1, 2]); // descending by ratio

        let ccl = dis.get_ccl(2, 0.3).unwrap();
        assert_eq!(ccl, vec![2]);
    }

    #[test]
    fn test_set_total_idempotent() {
        let dir = TempDir::new().unwrap();
        let dis = open(dir.path(), 4096);
        dis.set_total(7, 500).unwrap();
        dis.incr_discard(7, 100);
        dis.set_total(7, 999).unwrap(); // second registration ignored
        let state = dis.shared.state.lock();
        let offset = state.location[&7];
        let (fid, total, discarded) = dis.shared.read_slot(offset).unwrap();
        assert_eq!((fid, total, discarded), (7, 500, 100));
    }

    #[test]
    fn test_discard_capped_at_total() {
        let dir = TempDir::new().unwrap();
        let dis = open(dir.path(), 4096);
        dis.set_total(3, 100).unwrap();
        dis.incr_discard(3, 250);
        let ccl = dis.get_ccl(0, 1.0).unwrap();
        assert_eq!(ccl, vec![3]);
        let state = dis.shared.state.lock();
        let (_, total, discarded) = dis.shared.read_slot(state.location[&3]).unwrap();
        assert!(discarded <= total);
    }

    #[test]
    fn test_clear_frees_slot() {
        let dir = TempDir::new().unwrap();
        let dis = open(dir.path(), 120); // ten slots
        for fid in 0..10 {
            dis.set_total(fid, 100).unwrap();
        }
        assert!(matches!(dis.set_total(10, 100), Err(BarrelError::DiscardNoSpace)));

        dis.clear(4).unwrap();
        dis.set_total(10, 100).unwrap();
        assert!(dis.get_ccl(0, 0.9).unwrap().is_empty());
    }

    #[test]
    fn test_reopen_recovers_locations() {
        let dir = TempDir::new().unwrap();
        {
            let dis = open(dir.path(), 4096);
            dis.set_total(11, 300).unwrap();
            dis.incr_discard(11, 200);
            dis.close();
        }
        let dis = open(dir.path(), 4096);
        let ccl = dis.get_ccl(0, 0.5).unwrap();
        assert_eq!(ccl, vec![11]);
        let state = dis.shared.state.lock();
        assert_eq!(state.free_list.len(), 4096 / DISCARD_RECORD_SIZE - 1);
    }

    #[test]
    fn test_channel_applies_updates() {
        let dir = TempDir::new().unwrap();
        let dis = open(dir.path(), 4096);
        dis.set_total(5, 100).unwrap();

        dis.send(IndexNode { fid: 5, offset: 0, entry_size: 60, expired_at: 0, value: None });
        dis.send(IndexNode { fid: 99, offset: 0, entry_size: 10, expired_at: 0, value: None });

        // The consumer runs on its own thread; poll briefly.
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if dis.get_ccl(0, 0.5).unwrap() == vec![5] {
                break;
            }
            assert!(Instant::now() < deadline, "discard update never applied");
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
