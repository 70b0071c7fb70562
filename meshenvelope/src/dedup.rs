//! Bounded LRU of recently completed envelopes.
//!
//! Replayed envelopes within the window are acknowledged on the wire but
//! suppressed from handler dispatch, so a handler runs exactly once per
//! dedup key.

use std::collections::{HashMap, VecDeque};

use crate::envelope::DedupKey;

pub struct DedupCache {
    capacity: usize,
    stamp: u64,
    /// Key -> latest stamp. A stamp mismatch in `order` marks a stale
    /// entry to skip at eviction time.
    map: HashMap<DedupKey, u64>,
    order: VecDeque<(u64, DedupKey)>,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            stamp: 0,
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Record a completed envelope. Returns `true` when the key was
    /// already present (a replay), promoting it to most-recent either way.
    pub fn check_and_insert(&mut self, key: DedupKey) -> bool {
        self.stamp += 1;
        let replay = self.map.insert(key.clone(), self.stamp).is_some();
        self.order.push_back((self.stamp, key));
        while self.map.len() > self.capacity {
            let Some((stamp, key)) = self.order.pop_front() else {
                break;
            };
            if self.map.get(&key) == Some(&stamp) {
                self.map.remove(&key);
            }
        }
        replay
    }

    pub fn contains(&self, key: &DedupKey) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> DedupKey {
        DedupKey::Derived {
            sender: 1,
            command: "echo".into(),
            id: id.into(),
        }
    }

    #[test]
    fn replay_detected_within_window() {
        let mut cache = DedupCache::new(8);
        assert!(!cache.check_and_insert(key("a")));
        assert!(cache.check_and_insert(key("a")));
    }

    #[test]
    fn capacity_evicts_least_recent() {
        let mut cache = DedupCache::new(2);
        cache.check_and_insert(key("a"));
        cache.check_and_insert(key("b"));
        cache.check_and_insert(key("c"));
        assert!(!cache.contains(&key("a")));
        assert!(cache.contains(&key("b")));
        assert!(cache.contains(&key("c")));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn reinsert_promotes() {
        let mut cache = DedupCache::new(2);
        cache.check_and_insert(key("a"));
        cache.check_and_insert(key("b"));
        // Touch "a" so "b" becomes the eviction candidate.
        cache.check_and_insert(key("a"));
        cache.check_and_insert(key("c"));
        assert!(cache.contains(&key("a")));
        assert!(!cache.contains(&key("b")));
    }

    #[test]
    fn distinct_senders_do_not_collide() {
        let mut cache = DedupCache::new(8);
        let k1 = DedupKey::Explicit {
            sender: 1,
            key: "x".into(),
        };
        let k2 = DedupKey::Explicit {
            sender: 2,
            key: "x".into(),
        };
        assert!(!cache.check_and_insert(k1));
        assert!(!cache.check_and_insert(k2));
    }
}
