//! List operations
//!
//! A list is a run of physical sequence numbers. Elements are stored under
//! `seq (4 LE bytes) | user key`; a per-list metadata record (written with
//! the ListMeta entry type under the plain user key) tracks `head_seq` and
//! `tail_seq`. Sequences start in the middle of the u32 space so either
//! end can grow for a long time, and reset to the initial pair whenever a
//! pop empties the list.
//!
//! The live elements occupy the open interval (head_seq, tail_seq).

use crate::engine::BarrelEngine;
use crate::entry::{EntryType, LogEntry};
use crate::error::{BarrelError, BarrelResult};
use crate::index::{DataType, IndexNode, Tree};

/// First head_seq of a fresh list; tail starts one above.
pub(crate) const INITIAL_LIST_SEQ: u32 = u32::MAX >> 1;

/// Physical log-entry key for one element: `seq (4 LE) | key`.
pub(crate) fn encode_list_key(key: &[u8], seq: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + key.len());
    buf.extend_from_slice(&seq.to_le_bytes());
    buf.extend_from_slice(key);
    buf
}

/// Inverse of encode_list_key. Returns (key, seq).
pub(crate) fn decode_list_key(buf: &[u8]) -> (Vec<u8>, u32) {
    let seq = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    (buf[4..].to_vec(), seq)
}

impl BarrelEngine {
    /// Prepend values to the list, leftmost argument first.
    pub fn lpush(&self, key: &[u8], values: &[&[u8]]) -> BarrelResult<()> {
        self.check_open()?;
        let mut trees = self.list_index.trees.write();
        let tree = trees.entry(key.to_vec()).or_default();
        for value in values {
            self.push_internal(tree, key, value, true)?;
        }
        Ok(())
    }

    /// Append values to the list.
    pub fn rpush(&self, key: &[u8], values: &[&[u8]]) -> BarrelResult<()> {
        self.check_open()?;
        let mut trees = self.list_index.trees.write();
        let tree = trees.entry(key.to_vec()).or_default();
        for value in values {
            self.push_internal(tree, key, value, false)?;
        }
        Ok(())
    }

    /// Remove and return the first element, or None for an empty list.
    pub fn lpop(&self, key: &[u8]) -> BarrelResult<Option<Vec<u8>>> {
        self.check_open()?;
        self.pop_internal(key, true)
    }

    /// Remove and return the last element, or None for an empty list.
    pub fn rpop(&self, key: &[u8]) -> BarrelResult<Option<Vec<u8>>> {
        self.check_open()?;
        self.pop_internal(key, false)
    }

    /// Number of elements; a missing list reads as empty.
    pub fn llen(&self, key: &[u8]) -> BarrelResult<usize> {
        self.check_open()?;
        let trees = self.list_index.trees.read();
        let Some(tree) = trees.get(key) else {
            return Ok(0);
        };
        let (head_seq, tail_seq) = self.list_meta(tree, key)?;
        Ok((tail_seq - head_seq - 1) as usize)
    }

    /// Element at `index`; negative indices count from the tail (-1 is the
    /// last element).
    pub fn lindex(&self, key: &[u8], index: i64) -> BarrelResult<Vec<u8>> {
        self.check_open()?;
        let trees = self.list_index.trees.read();
        let tree = trees.get(key).ok_or(BarrelError::KeyNotFound)?;
        let (head_seq, tail_seq) = self.list_meta(tree, key)?;

        let seq = logical_index_to_seq(head_seq, tail_seq, index);
        if seq <= head_seq || seq >= tail_seq {
            return Err(BarrelError::IndexOutOfRange);
        }
        self.get_val(tree, &encode_list_key(key, seq), DataType::List)
    }

    /// Overwrite the element at `index` in place (same sequence slot).
    pub fn lset(&self, key: &[u8], index: i64, value: &[u8]) -> BarrelResult<()> {
        self.check_open()?;
        let mut trees = self.list_index.trees.write();
        let tree = trees.get_mut(key).ok_or(BarrelError::KeyNotFound)?;
        let (head_seq, tail_seq) = self.list_meta(tree, key)?;

        let seq = logical_index_to_seq(head_seq, tail_seq, index);
        if seq <= head_seq || seq >= tail_seq {
            return Err(BarrelError::IndexOutOfRange);
        }

        let enc_key = encode_list_key(key, seq);
        let entry = LogEntry {
            key: enc_key.clone(),
            value: value.to_vec(),
            ..Default::default()
        };
        let pos = self.write_log_entry(&entry, DataType::List)?;
        self.update_index_tree(tree, &enc_key, &entry, &pos, true, DataType::List);
        Ok(())
    }

    /// Elements in `[start, end]`, both ends inclusive and possibly
    /// negative. The start clamps up to the head, the end clamps down to
    /// the tail; a range entirely outside the list fails.
    pub fn lrange(&self, key: &[u8], start: i64, end: i64) -> BarrelResult<Vec<Vec<u8>>> {
        self.check_open()?;
        let trees = self.list_index.trees.read();
        let tree = trees.get(key).ok_or(BarrelError::KeyNotFound)?;
        let (head_seq, tail_seq) = self.list_meta(tree, key)?;

        let mut start_seq = logical_index_to_seq(head_seq, tail_seq, start);
        let mut end_seq = logical_index_to_seq(head_seq, tail_seq, end);

        if start_seq <= head_seq {
            start_seq = head_seq + 1;
        }
        if start_seq >= tail_seq {
            return Err(BarrelError::IndexOutOfRange);
        }
        if end_seq >= tail_seq {
            end_seq = tail_seq - 1;
        }
        if end_seq <= head_seq {
            return Err(BarrelError::IndexOutOfRange);
        }
        if start_seq > end_seq {
            return Err(BarrelError::IndexStartGreaterThanEnd);
        }

        let mut values = Vec::with_capacity((end_seq - start_seq + 1) as usize);
        for seq in start_seq..=end_seq {
            values.push(self.get_val(tree, &encode_list_key(key, seq), DataType::List)?);
        }
        Ok(values)
    }

    /// Head/tail sequences from the list's metadata record, or the initial
    /// pair for a list with no metadata yet.
    fn list_meta(&self, tree: &Tree, key: &[u8]) -> BarrelResult<(u32, u32)> {
        match self.get_val(tree, key, DataType::List) {
            Ok(value) if value.len() >= 8 => {
                let head_seq = u32::from_le_bytes([value[0], value[1], value[2], value[3]]);
                let tail_seq = u32::from_le_bytes([value[4], value[5], value[6], value[7]]);
                Ok((head_seq, tail_seq))
            }
            Ok(_) | Err(BarrelError::KeyNotFound) => {
                Ok((INITIAL_LIST_SEQ, INITIAL_LIST_SEQ + 1))
            }
            Err(e) => Err(e),
        }
    }

    fn save_list_meta(
        &self,
        tree: &mut Tree,
        key: &[u8],
        head_seq: u32,
        tail_seq: u32,
    ) -> BarrelResult<()> {
        let mut value = Vec::with_capacity(8);
        value.extend_from_slice(&head_seq.to_le_bytes());
        value.extend_from_slice(&tail_seq.to_le_bytes());

        let entry = LogEntry {
            key: key.to_vec(),
            value,
            expire_at: 0,
            typ: EntryType::ListMeta,
        };
        let pos = self.write_log_entry(&entry, DataType::List)?;
        self.update_index_tree(tree, key, &entry, &pos, true, DataType::List);
        Ok(())
    }

    fn push_internal(
        &self,
        tree: &mut Tree,
        key: &[u8],
        value: &[u8],
        is_left: bool,
    ) -> BarrelResult<()> {
        let (mut head_seq, mut tail_seq) = self.list_meta(tree, key)?;
        let seq = if is_left { head_seq } else { tail_seq };

        let enc_key = encode_list_key(key, seq);
        let entry = LogEntry { key: enc_key.clone(), value: value.to_vec(), ..Default::default() };
        let pos = self.write_log_entry(&entry, DataType::List)?;
        self.update_index_tree(tree, &enc_key, &entry, &pos, true, DataType::List);

        if is_left {
            head_seq -= 1;
        } else {
            tail_seq += 1;
        }
        self.save_list_meta(tree, key, head_seq, tail_seq)
    }

    fn pop_internal(&self, key: &[u8], is_left: bool) -> BarrelResult<Option<Vec<u8>>> {
        let mut trees = self.list_index.trees.write();
        let Some(tree) = trees.get_mut(key) else {
            return Ok(None);
        };

        let (mut head_seq, mut tail_seq) = self.list_meta(tree, key)?;
        if tail_seq - head_seq - 1 == 0 {
            // Empty list: make sure the meta is back at its initial state
            // so the sequence space does not drift.
            if head_seq != INITIAL_LIST_SEQ || tail_seq != INITIAL_LIST_SEQ + 1 {
                self.save_list_meta(tree, key, INITIAL_LIST_SEQ, INITIAL_LIST_SEQ + 1)?;
            }
            return Ok(None);
        }

        let seq = if is_left { head_seq + 1 } else { tail_seq - 1 };
        let enc_key = encode_list_key(key, seq);
        let value = self.get_val(tree, &enc_key, DataType::List)?;

        let entry = LogEntry { key: enc_key.clone(), typ: EntryType::Delete, ..Default::default() };
        let pos = self.write_log_entry(&entry, DataType::List)?;

        let (old, updated) = tree.delete(&enc_key);
        self.send_discard_node(old, updated, DataType::List);
        self.discards[&DataType::List].send(IndexNode {
            fid: pos.fid,
            offset: pos.offset,
            entry_size: pos.entry_size,
            expired_at: 0,
            value: None,
        });

        if is_left {
            head_seq += 1;
        } else {
            tail_seq -= 1;
        }
        if tail_seq - head_seq - 1 == 0 {
            head_seq = INITIAL_LIST_SEQ;
            tail_seq = INITIAL_LIST_SEQ + 1;
        }
        self.save_list_meta(tree, key, head_seq, tail_seq)?;
        Ok(Some(value))
    }
}

/// Map a logical index onto the physical sequence space. Bounds are not
/// validated here; callers check against (head, tail).
fn logical_index_to_seq(head_seq: u32, tail_seq: u32, index: i64) -> u32 {
    if index >= 0 {
        head_seq.wrapping_add(index as u32).wrapping_add(1)
    } else {
        tail_seq.wrapping_sub(index.unsigned_abs() as u32)
    }
}
