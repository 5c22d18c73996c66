//! String operations
//!
//! The flat namespace: one log entry per write, one ART keyed by the
//! caller's key. Deletes append a tombstone whose own bytes are accounted
//! as dead immediately.

use std::time::Duration;

use crate::engine::BarrelEngine;
use crate::entry::{EntryType, LogEntry};
use crate::error::{BarrelError, BarrelResult};
use crate::index::{self, DataType, IndexNode};

impl BarrelEngine {
    /// Set `key` to `value`, replacing any previous value.
    pub fn set(&self, key: &[u8], value: &[u8]) -> BarrelResult<()> {
        self.check_open()?;
        let mut tree = self.str_index.tree.write();
        self.set_internal(&mut tree, key, value, 0)
    }

    /// Set `key` to `value` with a time-to-live. The key reads as absent
    /// once the deadline passes; the bytes are reclaimed by GC.
    pub fn set_ex(&self, key: &[u8], value: &[u8], ttl: Duration) -> BarrelResult<()> {
        self.check_open()?;
        let expire_at = index::now_unix() + ttl.as_secs() as i64;
        let mut tree = self.str_index.tree.write();
        self.set_internal(&mut tree, key, value, expire_at)
    }

    /// Set `key` only if it does not already hold a live value. Returns
    /// whether the write happened.
    pub fn set_nx(&self, key: &[u8], value: &[u8]) -> BarrelResult<bool> {
        self.check_open()?;
        let mut tree = self.str_index.tree.write();
        match self.get_val(&tree, key, DataType::String) {
            Ok(_) => Ok(false),
            Err(BarrelError::KeyNotFound) => {
                self.set_internal(&mut tree, key, value, 0)?;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Set multiple keys at once from a flat `[key, value, key, value, ..]`
    /// argument list.
    pub fn mset(&self, args: &[&[u8]]) -> BarrelResult<()> {
        self.check_open()?;
        if args.is_empty() || args.len() % 2 != 0 {
            return Err(BarrelError::WrongNumberOfArgs { cmd: "mset" });
        }
        let mut tree = self.str_index.tree.write();
        for pair in args.chunks_exact(2) {
            self.set_internal(&mut tree, pair[0], pair[1], 0)?;
        }
        Ok(())
    }

    /// Read `key`'s live value.
    pub fn get(&self, key: &[u8]) -> BarrelResult<Vec<u8>> {
        self.check_open()?;
        let tree = self.str_index.tree.read();
        self.get_val(&tree, key, DataType::String)
    }

    /// Read several keys; absent keys yield None.
    pub fn mget(&self, keys: &[&[u8]]) -> BarrelResult<Vec<Option<Vec<u8>>>> {
        self.check_open()?;
        if keys.is_empty() {
            return Err(BarrelError::WrongNumberOfArgs { cmd: "mget" });
        }
        let tree = self.str_index.tree.read();
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            match self.get_val(&tree, key, DataType::String) {
                Ok(v) => values.push(Some(v)),
                Err(BarrelError::KeyNotFound) => values.push(None),
                Err(e) => return Err(e),
            }
        }
        Ok(values)
    }

    /// Remove `key` by appending a tombstone.
    pub fn delete(&self, key: &[u8]) -> BarrelResult<()> {
        self.check_open()?;
        let mut tree = self.str_index.tree.write();

        let entry = LogEntry { key: key.to_vec(), typ: EntryType::Delete, ..Default::default() };
        let pos = self.write_log_entry(&entry, DataType::String)?;

        let (old, updated) = tree.delete(key);
        self.send_discard_node(old, updated, DataType::String);

        // The tombstone itself is dead weight from the moment it lands.
        self.discards[&DataType::String].send(IndexNode {
            fid: pos.fid,
            offset: pos.offset,
            entry_size: pos.entry_size,
            expired_at: 0,
            value: None,
        });
        Ok(())
    }

    /// Increment the integer stored at `key` by one.
    pub fn incr(&self, key: &[u8]) -> BarrelResult<i64> {
        self.incr_decr_by(key, 1)
    }

    /// Decrement the integer stored at `key` by one.
    pub fn decr(&self, key: &[u8]) -> BarrelResult<i64> {
        self.incr_decr_by(key, -1)
    }

    /// Add `delta` to the integer stored at `key` (missing keys read as 0).
    pub fn incr_by(&self, key: &[u8], delta: i64) -> BarrelResult<i64> {
        self.incr_decr_by(key, delta)
    }

    /// Subtract `delta` from the integer stored at `key`.
    pub fn decr_by(&self, key: &[u8], delta: i64) -> BarrelResult<i64> {
        self.incr_decr_by(key, delta.checked_neg().ok_or(BarrelError::IntegerOverflow)?)
    }

    /// Length in bytes of `key`'s value, 0 when absent.
    pub fn str_len(&self, key: &[u8]) -> BarrelResult<usize> {
        self.check_open()?;
        let tree = self.str_index.tree.read();
        match self.get_val(&tree, key, DataType::String) {
            Ok(v) => Ok(v.len()),
            Err(BarrelError::KeyNotFound) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn set_internal(
        &self,
        tree: &mut index::Tree,
        key: &[u8],
        value: &[u8],
        expire_at: i64,
    ) -> BarrelResult<()> {
        let entry = LogEntry {
            key: key.to_vec(),
            value: value.to_vec(),
            expire_at,
            typ: EntryType::Normal,
        };
        let pos = self.write_log_entry(&entry, DataType::String)?;
        self.update_index_tree(tree, key, &entry, &pos, true, DataType::String);
        Ok(())
    }

    fn incr_decr_by(&self, key: &[u8], delta: i64) -> BarrelResult<i64> {
        self.check_open()?;
        let mut tree = self.str_index.tree.write();

        let current = match self.get_val(&tree, key, DataType::String) {
            Ok(v) => std::str::from_utf8(&v)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or(BarrelError::WrongValueType)?,
            Err(BarrelError::KeyNotFound) => 0,
            Err(e) => return Err(e),
        };

        let next = current.checked_add(delta).ok_or(BarrelError::IntegerOverflow)?;
        self.set_internal(&mut tree, key, next.to_string().as_bytes(), 0)?;
        Ok(next)
    }
}
