//! Set operations
//!
//! Members are indexed by their 16-byte Murmur fingerprint; the raw member
//! bytes live in the log entry's value. Membership checks read the member
//! back and compare bytes, so a fingerprint collision degrades to a miss
//! instead of a false positive.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::engine::BarrelEngine;
use crate::entry::{EntryType, LogEntry};
use crate::error::{BarrelError, BarrelResult};
use crate::index::{DataType, IndexNode, Tree};
use crate::util;

impl BarrelEngine {
    /// Add members to the set. Returns how many were newly added.
    pub fn sadd(&self, key: &[u8], members: &[&[u8]]) -> BarrelResult<usize> {
        self.check_open()?;
        let mut trees = self.set_index.trees.write();
        let tree = trees.entry(key.to_vec()).or_default();
        let mut added = 0;
        for member in members {
            if self.sadd_internal(tree, key, member)? {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Remove members. Returns how many were present.
    pub fn srem(&self, key: &[u8], members: &[&[u8]]) -> BarrelResult<usize> {
        self.check_open()?;
        let mut trees = self.set_index.trees.write();
        let Some(tree) = trees.get_mut(key) else {
            return Ok(0);
        };
        let mut removed = 0;
        for member in members {
            if self.srem_internal(tree, key, member)? {
                removed += 1;
            }
        }
        if tree.is_empty() {
            trees.remove(key);
        }
        Ok(removed)
    }

    /// Remove and return up to `count` members, smallest fingerprints
    /// first.
    pub fn spop(&self, key: &[u8], count: usize) -> BarrelResult<Vec<Vec<u8>>> {
        self.check_open()?;
        let mut trees = self.set_index.trees.write();
        let Some(tree) = trees.get_mut(key) else {
            return Ok(Vec::new());
        };

        let sums: Vec<Vec<u8>> = tree.iter().take(count).map(|(sum, _)| sum).collect();
        let mut popped = Vec::with_capacity(sums.len());
        for sum in sums {
            let member = self.get_val(tree, &sum, DataType::Set)?;
            self.srem_internal(tree, key, &member)?;
            popped.push(member);
        }
        if tree.is_empty() {
            trees.remove(key);
        }
        Ok(popped)
    }

    /// Whether `member` is in the set. The stored bytes are compared, not
    /// just the fingerprint.
    pub fn sis_member(&self, key: &[u8], member: &[u8]) -> BarrelResult<bool> {
        self.check_open()?;
        let trees = self.set_index.trees.read();
        let Some(tree) = trees.get(key) else {
            return Ok(false);
        };
        let sum = util::murmur128(member);
        match self.get_val(tree, &sum, DataType::Set) {
            Ok(stored) => Ok(stored == member),
            Err(BarrelError::KeyNotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// `count` random members without removing them. A non-negative count
    /// yields distinct members (at most the whole set); a negative count
    /// yields |count| picks that may repeat.
    pub fn srand_member(&self, key: &[u8], count: i64) -> BarrelResult<Vec<Vec<u8>>> {
        self.check_open()?;
        let members = self.smembers(key)?;
        if members.is_empty() || count == 0 {
            return Ok(Vec::new());
        }

        let mut rng = rand::thread_rng();
        if count > 0 {
            let take = (count as usize).min(members.len());
            Ok(members.choose_multiple(&mut rng, take).cloned().collect())
        } else {
            let take = count.unsigned_abs() as usize;
            Ok((0..take).map(|_| members[rng.gen_range(0..members.len())].clone()).collect())
        }
    }

    /// All members, ordered by fingerprint.
    pub fn smembers(&self, key: &[u8]) -> BarrelResult<Vec<Vec<u8>>> {
        self.check_open()?;
        let trees = self.set_index.trees.read();
        let Some(tree) = trees.get(key) else {
            return Ok(Vec::new());
        };
        self.members_of(tree)
    }

    /// Number of members.
    pub fn scard(&self, key: &[u8]) -> BarrelResult<usize> {
        self.check_open()?;
        let trees = self.set_index.trees.read();
        Ok(trees.get(key).map_or(0, |tree| tree.len()))
    }

    /// Members present in any of the given sets.
    pub fn sunion(&self, keys: &[&[u8]]) -> BarrelResult<Vec<Vec<u8>>> {
        self.check_open()?;
        if keys.is_empty() {
            return Err(BarrelError::WrongNumberOfArgs { cmd: "sunion" });
        }
        let trees = self.set_index.trees.read();
        let mut seen = std::collections::HashSet::new();
        let mut union = Vec::new();
        for key in keys {
            let Some(tree) = trees.get(*key) else {
                continue;
            };
            for (sum, _) in tree.iter() {
                if seen.insert(sum.clone()) {
                    union.push(self.get_val(tree, &sum, DataType::Set)?);
                }
            }
        }
        Ok(union)
    }

    /// Members of the first set that appear in none of the others. An
    /// absent first set yields an empty result; a single key yields all of
    /// its members.
    pub fn sdiff(&self, keys: &[&[u8]]) -> BarrelResult<Vec<Vec<u8>>> {
        self.check_open()?;
        if keys.is_empty() {
            return Err(BarrelError::WrongNumberOfArgs { cmd: "sdiff" });
        }
        let trees = self.set_index.trees.read();
        let Some(first) = trees.get(keys[0]) else {
            return Ok(Vec::new());
        };

        let mut excluded = std::collections::HashSet::new();
        for key in &keys[1..] {
            if let Some(tree) = trees.get(*key) {
                for (sum, _) in tree.iter() {
                    excluded.insert(sum);
                }
            }
        }

        let mut diff = Vec::new();
        for (sum, _) in first.iter() {
            if !excluded.contains(&sum) {
                diff.push(self.get_val(first, &sum, DataType::Set)?);
            }
        }
        Ok(diff)
    }

    /// Move `member` from `src` to `dst`. Returns false when it was absent.
    pub fn smove(&self, src: &[u8], dst: &[u8], member: &[u8]) -> BarrelResult<bool> {
        self.check_open()?;
        let mut trees = self.set_index.trees.write();

        let sum = util::murmur128(member);
        let removed = match trees.get_mut(src) {
            Some(tree) => {
                if tree.get(&sum).is_none() {
                    false
                } else {
                    self.srem_internal(tree, src, member)?
                }
            }
            None => false,
        };
        if !removed {
            return Ok(false);
        }
        if trees.get(src).map_or(false, |tree| tree.is_empty()) {
            trees.remove(src);
        }

        let dst_tree = trees.entry(dst.to_vec()).or_default();
        self.sadd_internal(dst_tree, dst, member)?;
        Ok(true)
    }

    /// Drop the whole set: tombstone every member, then forget its tree.
    pub fn sclear(&self, key: &[u8]) -> BarrelResult<()> {
        self.check_open()?;
        let mut trees = self.set_index.trees.write();
        let Some(tree) = trees.get_mut(key) else {
            return Ok(());
        };
        let members = self.members_of(tree)?;
        for member in members {
            self.srem_internal(tree, key, &member)?;
        }
        trees.remove(key);
        Ok(())
    }

    fn members_of(&self, tree: &Tree) -> BarrelResult<Vec<Vec<u8>>> {
        let mut members = Vec::with_capacity(tree.len());
        for (sum, _) in tree.iter() {
            members.push(self.get_val(tree, &sum, DataType::Set)?);
        }
        Ok(members)
    }

    fn sadd_internal(&self, tree: &mut Tree, key: &[u8], member: &[u8]) -> BarrelResult<bool> {
        let sum = util::murmur128(member);
        let was_present = tree.get(&sum).is_some();

        let entry = LogEntry {
            key: key.to_vec(),
            value: member.to_vec(),
            ..Default::default()
        };
        let pos = self.write_log_entry(&entry, DataType::Set)?;
        self.update_index_tree(tree, &sum, &entry, &pos, true, DataType::Set);
        Ok(!was_present)
    }

    fn srem_internal(&self, tree: &mut Tree, key: &[u8], member: &[u8]) -> BarrelResult<bool> {
        let sum = util::murmur128(member);
        if tree.get(&sum).is_none() {
            return Ok(false);
        }

        let entry = LogEntry {
            key: key.to_vec(),
            value: member.to_vec(),
            typ: EntryType::Delete,
            ..Default::default()
        };
        let pos = self.write_log_entry(&entry, DataType::Set)?;

        let (old, updated) = tree.delete(&sum);
        self.send_discard_node(old, updated, DataType::Set);
        self.discards[&DataType::Set].send(IndexNode {
            fid: pos.fid,
            offset: pos.offset,
            entry_size: pos.entry_size,
            expired_at: 0,
            value: None,
        });
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Options;
    use crate::engine::BarrelEngine;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn test_engine() -> (Arc<BarrelEngine>, TempDir) {
        let dir = TempDir::new().unwrap();
        let engine = BarrelEngine::open(Options::new(dir.path())).unwrap();
        (engine, dir)
    }

    fn sorted(mut v: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        v.sort();
        v
    }

    #[test]
    fn test_sadd_scard_smembers() {
        let (engine, _dir) = test_engine();
        assert_eq!(engine.sadd(b"s", &[b"a", b"b", b"a"]).unwrap(), 2);
        assert_eq!(engine.scard(b"s").unwrap(), 2);
        assert_eq!(
            sorted(engine.smembers(b"s").unwrap()),
            vec![b"a".to_vec(), b"b".to_vec()]
        );
        assert_eq!(engine.scard(b"empty").unwrap(), 0);
    }

    #[test]
    fn test_sis_member() {
        let (engine, _dir) = test_engine();
        engine.sadd(b"s", &[b"present"]).unwrap();
        assert!(engine.sis_member(b"s", b"present").unwrap());
        assert!(!engine.sis_member(b"s", b"absent").unwrap());
        assert!(!engine.sis_member(b"no such set", b"x").unwrap());
    }

    #[test]
    fn test_srem() {
        let (engine, _dir) = test_engine();
        engine.sadd(b"s", &[b"a", b"b", b"c"]).unwrap();
        assert_eq!(engine.srem(b"s", &[b"a", b"missing"]).unwrap(), 1);
        assert_eq!(engine.scard(b"s").unwrap(), 2);
        assert!(!engine.sis_member(b"s", b"a").unwrap());
    }

    #[test]
    fn test_spop() {
        let (engine, _dir) = test_engine();
        engine.sadd(b"s", &[b"a", b"b", b"c"]).unwrap();
        let popped = engine.spop(b"s", 2).unwrap();
        assert_eq!(popped.len(), 2);
        assert_eq!(engine.scard(b"s").unwrap(), 1);
        for member in &popped {
            assert!(!engine.sis_member(b"s", member).unwrap());
        }
        // Popping more than remain drains the set.
        assert_eq!(engine.spop(b"s", 10).unwrap().len(), 1);
        assert_eq!(engine.scard(b"s").unwrap(), 0);
    }

    #[test]
    fn test_srand_member() {
        let (engine, _dir) = test_engine();
        engine.sadd(b"s", &[b"a", b"b", b"c"]).unwrap();

        let distinct = engine.srand_member(b"s", 2).unwrap();
        assert_eq!(distinct.len(), 2);
        let mut unique = distinct.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 2);

        // Oversize positive count returns the whole set once.
        assert_eq!(engine.srand_member(b"s", 99).unwrap().len(), 3);
        // Negative count may repeat but always returns |count| picks.
        assert_eq!(engine.srand_member(b"s", -7).unwrap().len(), 7);
        assert!(engine.srand_member(b"s", 0).unwrap().is_empty());
        // Set is untouched throughout.
        assert_eq!(engine.scard(b"s").unwrap(), 3);
    }

    #[test]
    fn test_sunion_sdiff() {
        let (engine, _dir) = test_engine();
        engine.sadd(b"s1", &[b"a", b"b", b"c"]).unwrap();
        engine.sadd(b"s2", &[b"b", b"d"]).unwrap();

        assert_eq!(
            sorted(engine.sunion(&[b"s1", b"s2"]).unwrap()),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
        );

        assert_eq!(
            sorted(engine.sdiff(&[b"s1", b"s2"]).unwrap()),
            vec![b"a".to_vec(), b"c".to_vec()]
        );
        // Single key: the whole set. Absent first key: empty.
        assert_eq!(engine.sdiff(&[b"s1"]).unwrap().len(), 3);
        assert!(engine.sdiff(&[b"ghost", b"s1"]).unwrap().is_empty());
    }

    #[test]
    fn test_smove() {
        let (engine, _dir) = test_engine();
        engine.sadd(b"src", &[b"m"]).unwrap();
        assert!(engine.smove(b"src", b"dst", b"m").unwrap());
        assert!(!engine.sis_member(b"src", b"m").unwrap());
        assert!(engine.sis_member(b"dst", b"m").unwrap());
        assert!(!engine.smove(b"src", b"dst", b"never there").unwrap());
    }

    #[test]
    fn test_sclear() {
        let (engine, _dir) = test_engine();
        engine.sadd(b"s", &[b"a", b"b"]).unwrap();
        engine.sclear(b"s").unwrap();
        assert_eq!(engine.scard(b"s").unwrap(), 0);
        assert!(engine.smembers(b"s").unwrap().is_empty());
        engine.sclear(b"s").unwrap();
    }
}
