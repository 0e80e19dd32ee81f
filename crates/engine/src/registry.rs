//! Value-ordered registry of participants for one (market, side).
//!
//! The registry ranks participants by a caller-supplied value (the
//! underlying-equivalent of the on-pool balance at last update) in descending
//! order, breaking ties oldest-first. Matching walks it from the head, so the
//! largest positions are consumed first and equal positions rotate fairly:
//! every `upsert` re-enqueues the participant behind peers of equal value.
//!
//! Traversal is lazy and bounded (`head`/`tail` take a limit); the borrow
//! checker makes an in-flight iterator unusable across mutations, so callers
//! snapshot the bounded prefix before applying changes.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use alloy_primitives::{Address, U256};

/// Composite ranking key: descending by value, then ascending by insertion
/// sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RankKey {
    value: U256,
    seq: u64,
}

impl Ord for RankKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .value
            .cmp(&self.value)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for RankKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Ordered registry of participant rankings for one (market, side).
#[derive(Debug, Clone, Default)]
pub struct OrderedRegistry {
    ranked: BTreeMap<RankKey, Address>,
    index: HashMap<Address, RankKey>,
    next_seq: u64,
}

impl OrderedRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the participant, or repositions them if already present.
    ///
    /// Every call assigns a fresh sequence number, so a repositioned
    /// participant queues behind existing peers of equal value.
    pub fn upsert(&mut self, participant: Address, value: U256) {
        if let Some(old) = self.index.remove(&participant) {
            self.ranked.remove(&old);
        }
        let key = RankKey {
            value,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.ranked.insert(key, participant);
        self.index.insert(participant, key);
    }

    /// Removes the participant. Absent participants are a no-op.
    pub fn remove(&mut self, participant: Address) {
        if let Some(key) = self.index.remove(&participant) {
            self.ranked.remove(&key);
        }
    }

    /// Returns up to `limit` entries from the head, in descending value
    /// order (oldest first among equals).
    pub fn head(&self, limit: usize) -> impl Iterator<Item = (Address, U256)> + '_ {
        self.ranked
            .iter()
            .take(limit)
            .map(|(key, participant)| (*participant, key.value))
    }

    /// Returns up to `limit` entries from the tail, in ascending value
    /// order. Used when the smallest on-pool positions should be displaced
    /// first.
    pub fn tail(&self, limit: usize) -> impl Iterator<Item = (Address, U256)> + '_ {
        self.ranked
            .iter()
            .rev()
            .take(limit)
            .map(|(key, participant)| (*participant, key.value))
    }

    /// Returns the participant's current ranking value, if present.
    pub fn value_of(&self, participant: Address) -> Option<U256> {
        self.index.get(&participant).map(|key| key.value)
    }

    /// Whether the participant is present.
    pub fn contains(&self, participant: Address) -> bool {
        self.index.contains_key(&participant)
    }

    /// Number of participants in the registry.
    pub fn len(&self) -> usize {
        self.ranked.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.ranked.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    #[test]
    fn test_head_descending_order() {
        let mut reg = OrderedRegistry::new();
        reg.upsert(addr(1), U256::from(50));
        reg.upsert(addr(2), U256::from(200));
        reg.upsert(addr(3), U256::from(100));

        let order: Vec<U256> = reg.head(10).map(|(_, v)| v).collect();
        assert_eq!(order, vec![U256::from(200), U256::from(100), U256::from(50)]);
    }

    #[test]
    fn test_ties_oldest_first() {
        let mut reg = OrderedRegistry::new();
        reg.upsert(addr(1), U256::from(100));
        reg.upsert(addr(2), U256::from(100));
        reg.upsert(addr(3), U256::from(100));

        let order: Vec<Address> = reg.head(10).map(|(a, _)| a).collect();
        assert_eq!(order, vec![addr(1), addr(2), addr(3)]);
    }

    #[test]
    fn test_upsert_reenqueues_behind_equals() {
        let mut reg = OrderedRegistry::new();
        reg.upsert(addr(1), U256::from(100));
        reg.upsert(addr(2), U256::from(100));

        // Repositioning addr(1) at the same value moves it behind addr(2)
        reg.upsert(addr(1), U256::from(100));

        let order: Vec<Address> = reg.head(10).map(|(a, _)| a).collect();
        assert_eq!(order, vec![addr(2), addr(1)]);
    }

    #[test]
    fn test_upsert_repositions() {
        let mut reg = OrderedRegistry::new();
        reg.upsert(addr(1), U256::from(100));
        reg.upsert(addr(2), U256::from(50));
        assert_eq!(reg.len(), 2);

        reg.upsert(addr(2), U256::from(300));
        let head: Vec<Address> = reg.head(1).map(|(a, _)| a).collect();
        assert_eq!(head, vec![addr(2)]);
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.value_of(addr(2)), Some(U256::from(300)));
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let mut reg = OrderedRegistry::new();
        reg.upsert(addr(1), U256::from(10));
        reg.remove(addr(9));
        assert_eq!(reg.len(), 1);

        reg.remove(addr(1));
        assert!(reg.is_empty());
        assert!(!reg.contains(addr(1)));
    }

    #[test]
    fn test_head_and_tail_respect_limit() {
        let mut reg = OrderedRegistry::new();
        for n in 1..=5u8 {
            reg.upsert(addr(n), U256::from(u64::from(n) * 10));
        }

        assert_eq!(reg.head(2).count(), 2);
        assert_eq!(reg.tail(3).count(), 3);

        // Tail yields ascending values
        let tail: Vec<U256> = reg.tail(2).map(|(_, v)| v).collect();
        assert_eq!(tail, vec![U256::from(10), U256::from(20)]);
    }
}
