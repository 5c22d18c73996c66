//! Hash operations
//!
//! Each hash key owns one index tree keyed by field. The log-entry key is
//! the `klen | key | field` composite so recovery can route an entry back
//! to its hash without any index state.

use crate::engine::BarrelEngine;
use crate::entry::{EntryType, LogEntry};
use crate::error::{BarrelError, BarrelResult};
use crate::index::{encode_composite_key, DataType, IndexNode, Tree};

impl BarrelEngine {
    /// Set `field` in the hash at `key`. Returns true when the field is new.
    pub fn hset(&self, key: &[u8], field: &[u8], value: &[u8]) -> BarrelResult<bool> {
        self.check_open()?;
        let mut trees = self.hash_index.trees.write();
        let tree = trees.entry(key.to_vec()).or_default();
        self.hset_internal(tree, key, field, value)
    }

    /// Set several fields from a flat `[field, value, ..]` argument list.
    pub fn hmset(&self, key: &[u8], args: &[&[u8]]) -> BarrelResult<()> {
        self.check_open()?;
        if args.is_empty() || args.len() % 2 != 0 {
            return Err(BarrelError::WrongNumberOfArgs { cmd: "hmset" });
        }
        let mut trees = self.hash_index.trees.write();
        let tree = trees.entry(key.to_vec()).or_default();
        for pair in args.chunks_exact(2) {
            self.hset_internal(tree, key, pair[0], pair[1])?;
        }
        Ok(())
    }

    /// Set `field` only if it is absent. Returns whether the write happened.
    pub fn hset_nx(&self, key: &[u8], field: &[u8], value: &[u8]) -> BarrelResult<bool> {
        self.check_open()?;
        let mut trees = self.hash_index.trees.write();
        let tree = trees.entry(key.to_vec()).or_default();
        if tree.get(field).is_some() {
            return Ok(false);
        }
        self.hset_internal(tree, key, field, value)?;
        Ok(true)
    }

    /// Read one field.
    pub fn hget(&self, key: &[u8], field: &[u8]) -> BarrelResult<Vec<u8>> {
        self.check_open()?;
        let trees = self.hash_index.trees.read();
        let tree = trees.get(key).ok_or(BarrelError::KeyNotFound)?;
        self.get_val(tree, field, DataType::Hash)
    }

    /// Read several fields; absent fields yield None.
    pub fn hmget(&self, key: &[u8], fields: &[&[u8]]) -> BarrelResult<Vec<Option<Vec<u8>>>> {
        self.check_open()?;
        if fields.is_empty() {
            return Err(BarrelError::WrongNumberOfArgs { cmd: "hmget" });
        }
        let trees = self.hash_index.trees.read();
        let Some(tree) = trees.get(key) else {
            return Ok(vec![None; fields.len()]);
        };
        let mut values = Vec::with_capacity(fields.len());
        for field in fields {
            match self.get_val(tree, field, DataType::Hash) {
                Ok(v) => values.push(Some(v)),
                Err(BarrelError::KeyNotFound) => values.push(None),
                Err(e) => return Err(e),
            }
        }
        Ok(values)
    }

    /// Every (field, value) pair, fields in byte order.
    pub fn hget_all(&self, key: &[u8]) -> BarrelResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.check_open()?;
        let trees = self.hash_index.trees.read();
        let Some(tree) = trees.get(key) else {
            return Ok(Vec::new());
        };
        let mut pairs = Vec::with_capacity(tree.len());
        for (field, _) in tree.iter() {
            let value = self.get_val(tree, &field, DataType::Hash)?;
            pairs.push((field, value));
        }
        Ok(pairs)
    }

    /// Remove fields. Returns how many were present.
    pub fn hdel(&self, key: &[u8], fields: &[&[u8]]) -> BarrelResult<usize> {
        self.check_open()?;
        let mut trees = self.hash_index.trees.write();
        let Some(tree) = trees.get_mut(key) else {
            return Ok(0);
        };
        let mut removed = 0;
        for field in fields {
            if self.hdel_internal(tree, key, field)? {
                removed += 1;
            }
        }
        if tree.is_empty() {
            trees.remove(key);
        }
        Ok(removed)
    }

    /// Whether `field` exists in the hash.
    pub fn hexists(&self, key: &[u8], field: &[u8]) -> BarrelResult<bool> {
        self.check_open()?;
        let trees = self.hash_index.trees.read();
        Ok(trees.get(key).map_or(false, |tree| tree.get(field).is_some()))
    }

    /// Number of fields in the hash.
    pub fn hlen(&self, key: &[u8]) -> BarrelResult<usize> {
        self.check_open()?;
        let trees = self.hash_index.trees.read();
        Ok(trees.get(key).map_or(0, |tree| tree.len()))
    }

    /// All field names in byte order.
    pub fn hkeys(&self, key: &[u8]) -> BarrelResult<Vec<Vec<u8>>> {
        self.check_open()?;
        let trees = self.hash_index.trees.read();
        let Some(tree) = trees.get(key) else {
            return Ok(Vec::new());
        };
        Ok(tree.iter().map(|(field, _)| field).collect())
    }

    /// All values, ordered by field.
    pub fn hvals(&self, key: &[u8]) -> BarrelResult<Vec<Vec<u8>>> {
        self.check_open()?;
        let trees = self.hash_index.trees.read();
        let Some(tree) = trees.get(key) else {
            return Ok(Vec::new());
        };
        let mut values = Vec::with_capacity(tree.len());
        for (field, _) in tree.iter() {
            values.push(self.get_val(tree, &field, DataType::Hash)?);
        }
        Ok(values)
    }

    /// Add `delta` to the integer at `field` (absent fields read as 0).
    pub fn hincr_by(&self, key: &[u8], field: &[u8], delta: i64) -> BarrelResult<i64> {
        self.check_open()?;
        let mut trees = self.hash_index.trees.write();
        let tree = trees.entry(key.to_vec()).or_default();

        let current = match self.get_val(tree, field, DataType::Hash) {
            Ok(v) => std::str::from_utf8(&v)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or(BarrelError::WrongValueType)?,
            Err(BarrelError::KeyNotFound) => 0,
            Err(e) => return Err(e),
        };
        let next = current.checked_add(delta).ok_or(BarrelError::IntegerOverflow)?;
        self.hset_internal(tree, key, field, next.to_string().as_bytes())?;
        Ok(next)
    }

    /// Byte length of the value at `field`, 0 when absent.
    pub fn hstr_len(&self, key: &[u8], field: &[u8]) -> BarrelResult<usize> {
        self.check_open()?;
        let trees = self.hash_index.trees.read();
        let Some(tree) = trees.get(key) else {
            return Ok(0);
        };
        match self.get_val(tree, field, DataType::Hash) {
            Ok(v) => Ok(v.len()),
            Err(BarrelError::KeyNotFound) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Drop the whole hash: tombstone every field, then forget its tree.
    pub fn hclear(&self, key: &[u8]) -> BarrelResult<()> {
        self.check_open()?;
        let mut trees = self.hash_index.trees.write();
        let Some(tree) = trees.get_mut(key) else {
            return Ok(());
        };
        let fields: Vec<Vec<u8>> = tree.iter().map(|(field, _)| field).collect();
        for field in fields {
            self.hdel_internal(tree, key, &field)?;
        }
        trees.remove(key);
        Ok(())
    }

    fn hset_internal(
        &self,
        tree: &mut Tree,
        key: &[u8],
        field: &[u8],
        value: &[u8],
    ) -> BarrelResult<bool> {
        let entry = LogEntry {
            key: encode_composite_key(key, field),
            value: value.to_vec(),
            ..Default::default()
        };
        let pos = self.write_log_entry(&entry, DataType::Hash)?;

        let was_present = tree.get(field).is_some();
        self.update_index_tree(tree, field, &entry, &pos, true, DataType::Hash);
        Ok(!was_present)
    }

    fn hdel_internal(&self, tree: &mut Tree, key: &[u8], field: &[u8]) -> BarrelResult<bool> {
        if tree.get(field).is_none() {
            return Ok(false);
        }
        let entry = LogEntry {
            key: encode_composite_key(key, field),
            typ: EntryType::Delete,
            ..Default::default()
        };
        let pos = self.write_log_entry(&entry, DataType::Hash)?;

        let (old, updated) = tree.delete(field);
        self.send_discard_node(old, updated, DataType::Hash);
        self.discards[&DataType::Hash].send(IndexNode {
            fid: pos.fid,
            offset: pos.offset,
            entry_size: pos.entry_size,
            expired_at: 0,
            value: None,
        });
        Ok(true)
    }
}
