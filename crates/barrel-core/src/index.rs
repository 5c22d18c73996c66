//! In-memory index plumbing
//!
//! One Adaptive Radix Tree holds the flat string namespace; the compound
//! types (list, hash, set, zset) keep one tree per outer key. An index node
//! records where a key's latest entry lives on disk, plus the value itself
//! in KeyValueMem mode.
//!
//! The build routines here replay log entries during recovery. Trees are
//! always looked up per operation and passed down as parameters.

use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::art::AdaptiveRadixTree;
use crate::config::IndexMode;
use crate::engine::{BarrelEngine, ValuePos};
use crate::entry::{EntryType, LogEntry};
use crate::error::{BarrelError, BarrelResult};
use crate::list;
use crate::sorted_set::SortedSet;
use crate::util;

/// The five value-type namespaces. Each gets its own log files, index
/// trees and discard table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    String,
    List,
    Hash,
    Set,
    ZSet,
}

impl DataType {
    pub const ALL: [DataType; 5] =
        [DataType::String, DataType::List, DataType::Hash, DataType::Set, DataType::ZSet];

    /// The type tag embedded in log file names.
    pub fn file_name(self) -> &'static str {
        match self {
            DataType::String => "strs",
            DataType::List => "list",
            DataType::Hash => "hash",
            DataType::Set => "sets",
            DataType::ZSet => "zset",
        }
    }

    pub fn from_file_name(name: &str) -> Option<Self> {
        match name {
            "strs" => Some(DataType::String),
            "list" => Some(DataType::List),
            "hash" => Some(DataType::Hash),
            "sets" => Some(DataType::Set),
            "zset" => Some(DataType::ZSet),
            _ => None,
        }
    }
}

/// What the index stores per live key.
#[derive(Debug, Clone)]
pub struct IndexNode {
    pub fid: u32,
    pub offset: u64,
    /// On-disk size of the entry, fed to the discard table when superseded
    pub entry_size: usize,
    /// Absolute UNIX-seconds deadline; 0 means none
    pub expired_at: i64,
    /// Inline value, present only in KeyValueMem mode
    pub value: Option<Vec<u8>>,
}

pub(crate) type Tree = AdaptiveRadixTree<IndexNode>;

/// Flat string namespace: one tree.
pub(crate) struct StrIndex {
    pub tree: RwLock<Tree>,
}

/// Compound namespaces: one tree per outer key.
pub(crate) struct KeyedIndex {
    pub trees: RwLock<HashMap<Vec<u8>, Tree>>,
}

/// Sorted sets additionally keep the score ordering next to the trees,
/// under one lock so a write updates both views atomically.
pub(crate) struct ZSetIndex {
    pub inner: RwLock<ZSetInner>,
}

pub(crate) struct ZSetInner {
    pub sorted: SortedSet,
    pub trees: HashMap<Vec<u8>, Tree>,
}

impl StrIndex {
    pub fn new() -> Self {
        Self { tree: RwLock::new(Tree::new()) }
    }
}

impl KeyedIndex {
    pub fn new() -> Self {
        Self { trees: RwLock::new(HashMap::new()) }
    }
}

impl ZSetIndex {
    pub fn new() -> Self {
        Self { inner: RwLock::new(ZSetInner { sorted: SortedSet::new(), trees: HashMap::new() }) }
    }
}

/// Current UNIX time in seconds.
pub(crate) fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Frame an outer key and a sub-key into one log-entry key:
/// `klen (u32 LE) | key | sub`. Decodes uniquely for arbitrary bytes.
pub(crate) fn encode_composite_key(key: &[u8], sub: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + key.len() + sub.len());
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(sub);
    buf
}

/// Inverse of encode_composite_key. Returns (key, sub).
pub(crate) fn decode_composite_key(buf: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let klen = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    (buf[4..4 + klen].to_vec(), buf[4 + klen..].to_vec())
}

impl BarrelEngine {
    /// Replay one recovered entry into the index for its data type.
    pub(crate) fn build_index(&self, data_type: DataType, entry: &LogEntry, pos: &ValuePos) {
        match data_type {
            DataType::String => self.build_strs_index(entry, pos),
            DataType::List => self.build_list_index(entry, pos),
            DataType::Hash => self.build_hash_index(entry, pos),
            DataType::Set => self.build_sets_index(entry, pos),
            DataType::ZSet => self.build_zset_index(entry, pos),
        }
    }

    fn entry_dead(entry: &LogEntry, ts: i64) -> bool {
        entry.typ == EntryType::Delete || (entry.expire_at != 0 && entry.expire_at <= ts)
    }

    fn build_strs_index(&self, entry: &LogEntry, pos: &ValuePos) {
        let mut tree = self.str_index.tree.write();
        if Self::entry_dead(entry, now_unix()) {
            tree.delete(&entry.key);
            return;
        }
        let node = self.make_index_node(entry, pos);
        tree.put(&entry.key, node);
    }

    fn build_list_index(&self, entry: &LogEntry, pos: &ValuePos) {
        let list_key = if entry.typ == EntryType::ListMeta {
            entry.key.clone()
        } else {
            list::decode_list_key(&entry.key).0
        };

        let mut trees = self.list_index.trees.write();
        let tree = trees.entry(list_key).or_default();
        if Self::entry_dead(entry, now_unix()) {
            tree.delete(&entry.key);
            return;
        }
        let node = self.make_index_node(entry, pos);
        tree.put(&entry.key, node);
    }

    fn build_hash_index(&self, entry: &LogEntry, pos: &ValuePos) {
        let (key, field) = decode_composite_key(&entry.key);
        let mut trees = self.hash_index.trees.write();
        let tree = trees.entry(key).or_default();
        if Self::entry_dead(entry, now_unix()) {
            tree.delete(&field);
            return;
        }
        let node = self.make_index_node(entry, pos);
        tree.put(&field, node);
    }

    fn build_sets_index(&self, entry: &LogEntry, pos: &ValuePos) {
        let sum = util::murmur128(&entry.value);
        let mut trees = self.set_index.trees.write();
        let tree = trees.entry(entry.key.clone()).or_default();
        if Self::entry_dead(entry, now_unix()) {
            tree.delete(&sum);
            return;
        }
        let node = self.make_index_node(entry, pos);
        tree.put(&sum, node);
    }

    fn build_zset_index(&self, entry: &LogEntry, pos: &ValuePos) {
        let mut inner = self.zset_index.inner.write();

        // Tombstones carry the raw member under the plain outer key.
        if Self::entry_dead(entry, now_unix()) {
            let sum = util::murmur128(&entry.value);
            inner.sorted.zrem(&entry.key, &sum);
            if let Some(tree) = inner.trees.get_mut(&entry.key) {
                tree.delete(&sum);
            }
            return;
        }

        let (key, score_buf) = decode_composite_key(&entry.key);
        let Some(score) = util::str_to_float(&String::from_utf8_lossy(&score_buf)) else {
            eprintln!("[RECOVERY] unparseable zset score, skipping entry");
            return;
        };
        let sum = util::murmur128(&entry.value);
        let node = self.make_index_node(entry, pos);
        inner.sorted.zadd(&key, score, &sum);
        inner.trees.entry(key).or_default().put(&sum, node);
    }

    /// Build the index node for an entry that just landed at `pos`.
    pub(crate) fn make_index_node(&self, entry: &LogEntry, pos: &ValuePos) -> IndexNode {
        IndexNode {
            fid: pos.fid,
            offset: pos.offset,
            entry_size: pos.entry_size,
            expired_at: entry.expire_at,
            value: if self.opts.index_mode == IndexMode::KeyValueMem {
                Some(entry.value.clone())
            } else {
                None
            },
        }
    }

    /// Insert the entry's new position under `tree_key`, forwarding any
    /// superseded prior position to the discard channel.
    pub(crate) fn update_index_tree(
        &self,
        tree: &mut Tree,
        tree_key: &[u8],
        entry: &LogEntry,
        pos: &ValuePos,
        send_discard: bool,
        data_type: DataType,
    ) {
        let node = self.make_index_node(entry, pos);
        let (old, updated) = tree.put(tree_key, node);
        if send_discard {
            self.send_discard_node(old, updated, data_type);
        }
    }

    /// Forward a superseded index node to the type's discard channel.
    pub(crate) fn send_discard_node(
        &self,
        old: Option<IndexNode>,
        updated: bool,
        data_type: DataType,
    ) {
        if !updated {
            return;
        }
        let Some(node) = old else {
            return;
        };
        if node.entry_size == 0 {
            return;
        }
        self.discards[&data_type].send(node);
    }

    /// Resolve a key through `tree` to its live value: inline in
    /// KeyValueMem mode, otherwise read back from the log file the index
    /// node points at. Expired and tombstoned entries read as absent.
    pub(crate) fn get_val(
        &self,
        tree: &Tree,
        key: &[u8],
        data_type: DataType,
    ) -> BarrelResult<Vec<u8>> {
        let node = tree.get(key).ok_or(BarrelError::KeyNotFound)?;

        let ts = now_unix();
        if node.expired_at != 0 && node.expired_at <= ts {
            return Err(BarrelError::KeyNotFound);
        }

        if self.opts.index_mode == IndexMode::KeyValueMem {
            if let Some(value) = &node.value {
                return Ok(value.clone());
            }
        }

        let log_file = self
            .get_log_file(data_type, node.fid)
            .ok_or(BarrelError::LogFileNotFound { fid: node.fid })?;
        let (entry, _) = log_file.read_entry(node.offset)?;

        if Self::entry_dead(&entry, ts) {
            return Err(BarrelError::KeyNotFound);
        }
        Ok(entry.value)
    }
}
