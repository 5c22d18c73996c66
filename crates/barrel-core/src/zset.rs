//! Sorted-set operations
//!
//! Two in-memory structures back each sorted set: the score ordering in
//! SortedSet (keyed by member fingerprint) and one ART per outer key
//! mapping fingerprints to log positions. The log-entry key is the
//! `klen | key | score-string` composite with the member bytes as the
//! value, so recovery can rebuild both structures from the log alone.

use crate::engine::BarrelEngine;
use crate::entry::{EntryType, LogEntry};
use crate::error::{BarrelError, BarrelResult};
use crate::index::{encode_composite_key, DataType, IndexNode, ZSetInner};
use crate::util;

impl BarrelEngine {
    /// Add `member` with `score`, updating the score if it already exists.
    pub fn zadd(&self, key: &[u8], score: f64, member: &[u8]) -> BarrelResult<()> {
        self.check_open()?;
        let mut inner = self.zset_index.inner.write();
        self.zadd_internal(&mut inner, key, score, member)
    }

    /// The member's score, if present.
    pub fn zscore(&self, key: &[u8], member: &[u8]) -> BarrelResult<Option<f64>> {
        self.check_open()?;
        let inner = self.zset_index.inner.read();
        let sum = util::murmur128(member);
        Ok(inner.sorted.zscore(key, &sum))
    }

    /// Remove `member`. Returns whether it was present.
    pub fn zrem(&self, key: &[u8], member: &[u8]) -> BarrelResult<bool> {
        self.check_open()?;
        let mut inner = self.zset_index.inner.write();
        let sum = util::murmur128(member);
        if !inner.sorted.zrem(key, &sum) {
            return Ok(false);
        }

        // Tombstone carries the raw member under the plain outer key, so
        // recovery can re-derive the fingerprint.
        let entry = LogEntry {
            key: key.to_vec(),
            value: member.to_vec(),
            typ: EntryType::Delete,
            ..Default::default()
        };
        let pos = self.write_log_entry(&entry, DataType::ZSet)?;

        if let Some(tree) = inner.trees.get_mut(key) {
            let (old, updated) = tree.delete(&sum);
            self.send_discard_node(old, updated, DataType::ZSet);
            if tree.is_empty() {
                inner.trees.remove(key);
            }
        }
        self.discards[&DataType::ZSet].send(IndexNode {
            fid: pos.fid,
            offset: pos.offset,
            entry_size: pos.entry_size,
            expired_at: 0,
            value: None,
        });
        Ok(true)
    }

    /// Number of members.
    pub fn zcard(&self, key: &[u8]) -> BarrelResult<usize> {
        self.check_open()?;
        let inner = self.zset_index.inner.read();
        Ok(inner.sorted.zcard(key))
    }

    /// Ascending rank of `member` (0 = lowest score).
    pub fn zrank(&self, key: &[u8], member: &[u8]) -> BarrelResult<Option<usize>> {
        self.check_open()?;
        let inner = self.zset_index.inner.read();
        let sum = util::murmur128(member);
        Ok(inner.sorted.zrank(key, &sum))
    }

    /// Descending rank of `member` (0 = highest score).
    pub fn zrev_rank(&self, key: &[u8], member: &[u8]) -> BarrelResult<Option<usize>> {
        self.check_open()?;
        let inner = self.zset_index.inner.read();
        let sum = util::murmur128(member);
        Ok(inner.sorted.zrev_rank(key, &sum))
    }

    /// Members ranked `[start, stop]` by ascending score. Negative indices
    /// count from the end; bounds clamp; inverted ranges are empty.
    pub fn zrange(&self, key: &[u8], start: i64, stop: i64) -> BarrelResult<Vec<Vec<u8>>> {
        self.check_open()?;
        let inner = self.zset_index.inner.read();
        self.resolve_members(&inner, key, inner.sorted.zrange(key, start, stop))
    }

    /// Members ranked `[start, stop]` by descending score.
    pub fn zrev_range(&self, key: &[u8], start: i64, stop: i64) -> BarrelResult<Vec<Vec<u8>>> {
        self.check_open()?;
        let inner = self.zset_index.inner.read();
        self.resolve_members(&inner, key, inner.sorted.zrev_range(key, start, stop))
    }

    /// Add `delta` to the member's score (absent members start at 0).
    /// Returns the new score.
    pub fn zincr_by(&self, key: &[u8], delta: f64, member: &[u8]) -> BarrelResult<f64> {
        self.check_open()?;
        let mut inner = self.zset_index.inner.write();
        let sum = util::murmur128(member);
        let next = inner.sorted.zscore(key, &sum).unwrap_or(0.0) + delta;
        self.zadd_internal(&mut inner, key, next, member)?;
        Ok(next)
    }

    /// Remove and return the lowest-scored member.
    pub fn zpop_min(&self, key: &[u8]) -> BarrelResult<Option<(Vec<u8>, f64)>> {
        self.check_open()?;
        self.zpop_internal(key, true)
    }

    /// Remove and return the highest-scored member.
    pub fn zpop_max(&self, key: &[u8]) -> BarrelResult<Option<(Vec<u8>, f64)>> {
        self.check_open()?;
        self.zpop_internal(key, false)
    }

    fn zadd_internal(
        &self,
        inner: &mut ZSetInner,
        key: &[u8],
        score: f64,
        member: &[u8],
    ) -> BarrelResult<()> {
        let sum = util::murmur128(member);
        let entry = LogEntry {
            key: encode_composite_key(key, util::float_to_str(score).as_bytes()),
            value: member.to_vec(),
            ..Default::default()
        };
        let pos = self.write_log_entry(&entry, DataType::ZSet)?;

        inner.sorted.zadd(key, score, &sum);
        let tree = inner.trees.entry(key.to_vec()).or_default();
        self.update_index_tree(tree, &sum, &entry, &pos, true, DataType::ZSet);
        Ok(())
    }

    fn zpop_internal(&self, key: &[u8], min: bool) -> BarrelResult<Option<(Vec<u8>, f64)>> {
        let mut inner = self.zset_index.inner.write();

        let popped = if min {
            inner.sorted.zpop_min(key)
        } else {
            inner.sorted.zpop_max(key)
        };
        let Some((sum, score)) = popped else {
            return Ok(None);
        };

        let member = {
            let Some(tree) = inner.trees.get(key) else {
                return Err(BarrelError::KeyNotFound);
            };
            self.get_val(tree, &sum, DataType::ZSet)?
        };

        let entry = LogEntry {
            key: key.to_vec(),
            value: member.clone(),
            typ: EntryType::Delete,
            ..Default::default()
        };
        let pos = self.write_log_entry(&entry, DataType::ZSet)?;

        if let Some(tree) = inner.trees.get_mut(key) {
            let (old, updated) = tree.delete(&sum);
            self.send_discard_node(old, updated, DataType::ZSet);
            if tree.is_empty() {
                inner.trees.remove(key);
            }
        }
        self.discards[&DataType::ZSet].send(IndexNode {
            fid: pos.fid,
            offset: pos.offset,
            entry_size: pos.entry_size,
            expired_at: 0,
            value: None,
        });
        Ok(Some((member, score)))
    }

    fn resolve_members(
        &self,
        inner: &ZSetInner,
        key: &[u8],
        ranked: Vec<(Vec<u8>, f64)>,
    ) -> BarrelResult<Vec<Vec<u8>>> {
        if ranked.is_empty() {
            return Ok(Vec::new());
        }
        let tree = inner.trees.get(key).ok_or(BarrelError::KeyNotFound)?;
        let mut members = Vec::with_capacity(ranked.len());
        for (sum, _) in ranked {
            members.push(self.get_val(tree, &sum, DataType::ZSet)?);
        }
        Ok(members)
    }
}
