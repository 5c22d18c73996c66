//! In-memory sorted-set index
//!
//! Holds every sorted set's (member fingerprint -> score) mapping together
//! with an ordered view keyed by (score, member), so rank queries and range
//! scans walk members in ascending score order. Ties order by member bytes.
//!
//! This structure is rebuilt from the logs on open; the engine's ART trees
//! hold the member positions, this one holds the ordering.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use hashbrown::HashMap;

/// f64 wrapper with a total order, so scores can key an ordered set.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Score(f64);

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Default)]
struct SortedSetNode {
    /// member -> score
    dict: HashMap<Vec<u8>, f64>,
    /// (score, member), ascending
    scores: BTreeSet<(Score, Vec<u8>)>,
}

/// All sorted sets, keyed by outer key.
#[derive(Default)]
pub struct SortedSet {
    records: HashMap<Vec<u8>, SortedSetNode>,
}

impl SortedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a member's score. Returns true if the member was new.
    pub fn zadd(&mut self, key: &[u8], score: f64, member: &[u8]) -> bool {
        let node = self.records.entry(key.to_vec()).or_default();
        let prior = node.dict.insert(member.to_vec(), score);
        if let Some(old) = prior {
            node.scores.remove(&(Score(old), member.to_vec()));
        }
        node.scores.insert((Score(score), member.to_vec()));
        prior.is_none()
    }

    pub fn zscore(&self, key: &[u8], member: &[u8]) -> Option<f64> {
        self.records.get(key)?.dict.get(member).copied()
    }

    /// Remove a member. Returns true if it was present.
    pub fn zrem(&mut self, key: &[u8], member: &[u8]) -> bool {
        let Some(node) = self.records.get_mut(key) else {
            return false;
        };
        let Some(score) = node.dict.remove(member) else {
            return false;
        };
        node.scores.remove(&(Score(score), member.to_vec()));
        if node.dict.is_empty() {
            self.records.remove(key);
        }
        true
    }

    pub fn zcard(&self, key: &[u8]) -> usize {
        self.records.get(key).map_or(0, |n| n.dict.len())
    }

    /// Ascending rank of a member (0 = lowest score), if present.
    pub fn zrank(&self, key: &[u8], member: &[u8]) -> Option<usize> {
        let node = self.records.get(key)?;
        let score = *node.dict.get(member)?;
        let target = (Score(score), member.to_vec());
        node.scores.iter().position(|entry| *entry == target)
    }

    /// Descending rank of a member (0 = highest score), if present.
    pub fn zrev_rank(&self, key: &[u8], member: &[u8]) -> Option<usize> {
        let rank = self.zrank(key, member)?;
        Some(self.zcard(key) - 1 - rank)
    }

    /// Members with scores in ascending rank order over [start, stop],
    /// Redis-style: negative indices count from the tail, bounds clamp,
    /// inverted ranges are empty.
    pub fn zrange(&self, key: &[u8], start: i64, stop: i64) -> Vec<(Vec<u8>, f64)> {
        self.range_inner(key, start, stop, false)
    }

    /// As zrange, walking from the highest score down.
    pub fn zrev_range(&self, key: &[u8], start: i64, stop: i64) -> Vec<(Vec<u8>, f64)> {
        self.range_inner(key, start, stop, true)
    }

    fn range_inner(&self, key: &[u8], start: i64, stop: i64, rev: bool) -> Vec<(Vec<u8>, f64)> {
        let Some(node) = self.records.get(key) else {
            return Vec::new();
        };
        let card = node.dict.len() as i64;
        let mut start = if start < 0 { card + start } else { start };
        let mut stop = if stop < 0 { card + stop } else { stop };
        if start < 0 {
            start = 0;
        }
        if stop >= card {
            stop = card - 1;
        }
        if start > stop || start >= card {
            return Vec::new();
        }

        let take = (stop - start + 1) as usize;
        let pick = |entry: &(Score, Vec<u8>)| (entry.1.clone(), entry.0 .0);
        if rev {
            node.scores.iter().rev().skip(start as usize).take(take).map(pick).collect()
        } else {
            node.scores.iter().skip(start as usize).take(take).map(pick).collect()
        }
    }

    /// Add `delta` to a member's score (missing members start at 0).
    /// Returns the new score.
    pub fn zincr_by(&mut self, key: &[u8], delta: f64, member: &[u8]) -> f64 {
        let current = self.zscore(key, member).unwrap_or(0.0);
        let next = current + delta;
        self.zadd(key, next, member);
        next
    }

    /// Remove and return the lowest-scored member.
    pub fn zpop_min(&mut self, key: &[u8]) -> Option<(Vec<u8>, f64)> {
        let node = self.records.get_mut(key)?;
        let (score, member) = node.scores.iter().next().cloned()?;
        self.zrem(key, &member);
        Some((member, score.0))
    }

    /// Remove and return the highest-scored member.
    pub fn zpop_max(&mut self, key: &[u8]) -> Option<(Vec<u8>, f64)> {
        let node = self.records.get_mut(key)?;
        let (score, member) = node.scores.iter().next_back().cloned()?;
        self.zrem(key, &member);
        Some((member, score.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SortedSet {
        let mut zs = SortedSet::new();
        zs.zadd(b"k", 3.0, b"c");
        zs.zadd(b"k", 1.0, b"a");
        zs.zadd(b"k", 2.0, b"b");
        zs
    }

    #[test]
    fn test_zadd_and_score() {
        let mut zs = sample();
        assert_eq!(zs.zscore(b"k", b"a"), Some(1.0));
        assert_eq!(zs.zcard(b"k"), 3);

        // Updating a score re-sorts the member.
        assert!(!zs.zadd(b"k", 9.0, b"a"));
        assert_eq!(zs.zrank(b"k", b"a"), Some(2));
        assert_eq!(zs.zcard(b"k"), 3);
    }

    #[test]
    fn test_rank_and_rev_rank() {
        let zs = sample();
        assert_eq!(zs.zrank(b"k", b"a"), Some(0));
        assert_eq!(zs.zrank(b"k", b"c"), Some(2));
        assert_eq!(zs.zrev_rank(b"k", b"c"), Some(0));
        assert_eq!(zs.zrank(b"k", b"missing"), None);
        assert_eq!(zs.zrank(b"other", b"a"), None);
    }

    #[test]
    fn test_range_with_negative_indices() {
        let zs = sample();
        let all: Vec<_> = zs.zrange(b"k", 0, -1).into_iter().map(|(m, _)| m).collect();
        assert_eq!(all, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

        let tail: Vec<_> = zs.zrange(b"k", -2, -1).into_iter().map(|(m, _)| m).collect();
        assert_eq!(tail, vec![b"b".to_vec(), b"c".to_vec()]);

        // Oversize stop clamps, inverted range is empty.
        assert_eq!(zs.zrange(b"k", 1, 100).len(), 2);
        assert!(zs.zrange(b"k", 2, 1).is_empty());
        assert!(zs.zrange(b"k", 5, 9).is_empty());
    }

    #[test]
    fn test_rev_range() {
        let zs = sample();
        let top: Vec<_> = zs.zrev_range(b"k", 0, 1).into_iter().map(|(m, _)| m).collect();
        assert_eq!(top, vec![b"c".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn test_zrem_and_cleanup() {
        let mut zs = sample();
        assert!(zs.zrem(b"k", b"b"));
        assert!(!zs.zrem(b"k", b"b"));
        assert_eq!(zs.zcard(b"k"), 2);
        zs.zrem(b"k", b"a");
        zs.zrem(b"k", b"c");
        assert_eq!(zs.zcard(b"k"), 0);
        assert!(zs.records.is_empty());
    }

    #[test]
    fn test_pop_min_max() {
        let mut zs = sample();
        assert_eq!(zs.zpop_min(b"k"), Some((b"a".to_vec(), 1.0)));
        assert_eq!(zs.zpop_max(b"k"), Some((b"c".to_vec(), 3.0)));
        assert_eq!(zs.zpop_min(b"k"), Some((b"b".to_vec(), 2.0)));
        assert_eq!(zs.zpop_min(b"k"), None);
    }

    #[test]
    fn test_incr_by() {
        let mut zs = SortedSet::new();
        assert_eq!(zs.zincr_by(b"k", 2.5, b"m"), 2.5);
        assert_eq!(zs.zincr_by(b"k", -1.0, b"m"), 1.5);
        assert_eq!(zs.zscore(b"k", b"m"), Some(1.5));
    }

    #[test]
    fn test_score_ties_order_by_member() {
        let mut zs = SortedSet::new();
        zs.zadd(b"k", 1.0, b"y");
        zs.zadd(b"k", 1.0, b"x");
        let members: Vec<_> = zs.zrange(b"k", 0, -1).into_iter().map(|(m, _)| m).collect();
        assert_eq!(members, vec![b"x".to_vec(), b"y".to_vec()]);
    }
}
