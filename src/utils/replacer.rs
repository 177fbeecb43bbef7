use std::collections::VecDeque;
use std::hash::Hash;

use hashlink::LinkedHashMap;

/// Eviction policy over buffer pool frames. Only frames marked evictable
/// (pin count zero) may ever be returned by `evict`.
pub trait Replacer<ID: Eq + Hash + Copy>: Send {
    fn evict(&mut self) -> Option<ID>;
    fn record_access(&mut self, entry_id: ID);
    fn set_evictable(&mut self, entry_id: ID, evictability: bool);
    fn remove(&mut self, entry_id: ID) -> bool;
    // Number of evictable entries
    fn size(&self) -> usize;
}

/// Pure LRU: the entry whose last access is oldest goes first.
pub struct LruReplacer<ID: Eq + Hash + Copy> {
    // Front is least recently used
    node_store: LinkedHashMap<ID, bool>,
    evictable_size: usize,
}

impl<ID: Eq + Hash + Copy> Default for LruReplacer<ID> {
    fn default() -> Self {
        Self::new()
    }
}

impl<ID: Eq + Hash + Copy> LruReplacer<ID> {
    pub fn new() -> Self {
        LruReplacer {
            node_store: LinkedHashMap::new(),
            evictable_size: 0,
        }
    }
}

impl<ID: Eq + Hash + Copy + Send> Replacer<ID> for LruReplacer<ID> {
    fn evict(&mut self) -> Option<ID> {
        let victim = self
            .node_store
            .iter()
            .find(|(_, evictable)| **evictable)
            .map(|(id, _)| *id)?;

        self.node_store.remove(&victim);
        self.evictable_size -= 1;
        Some(victim)
    }

    fn record_access(&mut self, entry_id: ID) {
        if self.node_store.to_back(&entry_id).is_none() {
            self.node_store.insert(entry_id, false);
        }
    }

    fn set_evictable(&mut self, entry_id: ID, evictability: bool) {
        if let Some(evictable) = self.node_store.get_mut(&entry_id) {
            if *evictable != evictability {
                *evictable = evictability;
                if evictability {
                    self.evictable_size += 1;
                } else {
                    self.evictable_size -= 1;
                }
            }
        }
    }

    fn remove(&mut self, entry_id: ID) -> bool {
        match self.node_store.remove(&entry_id) {
            Some(evictable) => {
                if evictable {
                    self.evictable_size -= 1;
                }
                true
            }
            None => false,
        }
    }

    fn size(&self) -> usize {
        self.evictable_size
    }
}

#[derive(Debug)]
struct LruKNode {
    // Most recent access at the front, at most k entries
    history: VecDeque<u64>,
    is_evictable: bool,
}

/// LRU-K: evicts the entry with the largest backward k-distance. Entries
/// with fewer than k accesses have infinite distance and are evicted first,
/// oldest access first.
pub struct LruKReplacer<ID: Eq + Hash + Copy> {
    node_store: LinkedHashMap<ID, LruKNode>,
    current_timestamp: u64,
    evictable_size: usize,
    k: usize,
}

impl<ID: Eq + Hash + Copy> LruKReplacer<ID> {
    pub fn new(k: usize) -> Self {
        LruKReplacer {
            node_store: LinkedHashMap::new(),
            current_timestamp: 0,
            evictable_size: 0,
            k: k.max(1),
        }
    }
}

impl<ID: Eq + Hash + Copy + Send> Replacer<ID> for LruKReplacer<ID> {
    fn evict(&mut self) -> Option<ID> {
        let now = self.current_timestamp;
        let k = self.k;

        // (infinite distance, distance or oldest timestamp)
        let victim = self
            .node_store
            .iter()
            .filter(|(_, node)| node.is_evictable)
            .max_by_key(|(_, node)| match node.history.get(k - 1) {
                Some(kth) => (false, now - kth),
                None => (true, u64::MAX - node.history.back().copied().unwrap_or(0)),
            })
            .map(|(id, _)| *id)?;

        self.remove(victim);
        Some(victim)
    }

    fn record_access(&mut self, entry_id: ID) {
        let timestamp = self.current_timestamp;
        self.current_timestamp += 1;
        let k = self.k;

        let node = self.node_store.entry(entry_id).or_insert_with(|| LruKNode {
            history: VecDeque::with_capacity(k),
            is_evictable: false,
        });
        node.history.push_front(timestamp);
        node.history.truncate(k);
    }

    fn set_evictable(&mut self, entry_id: ID, evictability: bool) {
        if let Some(node) = self.node_store.get_mut(&entry_id) {
            if node.is_evictable != evictability {
                node.is_evictable = evictability;
                if evictability {
                    self.evictable_size += 1;
                } else {
                    self.evictable_size -= 1;
                }
            }
        }
    }

    fn remove(&mut self, entry_id: ID) -> bool {
        match self.node_store.remove(&entry_id) {
            Some(node) => {
                if node.is_evictable {
                    self.evictable_size -= 1;
                }
                true
            }
            None => false,
        }
    }

    fn size(&self) -> usize {
        self.evictable_size
    }
}

#[cfg(test)]
pub mod test {
    use super::{LruKReplacer, LruReplacer, Replacer};

    #[test]
    fn lru_evicts_least_recently_unpinned() {
        let mut replacer = LruReplacer::new();

        for frame in 1..=4 {
            replacer.record_access(frame);
            replacer.set_evictable(frame, true);
        }
        // Frame 1 is used again and becomes the most recent
        replacer.record_access(1);
        // Frame 2 is pinned
        replacer.set_evictable(2, false);

        assert_eq!(3, replacer.size());
        assert_eq!(Some(3), replacer.evict());
        assert_eq!(Some(4), replacer.evict());
        assert_eq!(Some(1), replacer.evict());
        assert_eq!(None, replacer.evict());
        assert_eq!(0, replacer.size());

        replacer.set_evictable(2, true);
        assert_eq!(Some(2), replacer.evict());

        // Unknown frames are ignored
        replacer.set_evictable(9, true);
        assert_eq!(0, replacer.size());
        assert!(!replacer.remove(9));
    }

    #[test]
    fn lru_k_prefers_infinite_distance() {
        // Initialize the replacer
        let mut replacer = LruKReplacer::new(2);

        for frame in 1..=6 {
            replacer.record_access(frame);
        }
        for frame in 1..=5 {
            replacer.set_evictable(frame, true);
        }
        replacer.set_evictable(6, false);
        assert_eq!(5, replacer.size());

        // Frame 1 now has two accesses, every other frame has infinite distance
        replacer.record_access(1);

        assert_eq!(Some(2), replacer.evict());
        assert_eq!(Some(3), replacer.evict());
        assert_eq!(Some(4), replacer.evict());
        assert_eq!(2, replacer.size());

        // [5, 1] remain. Give 5 two accesses, bring back 3 and 4.
        replacer.record_access(3);
        replacer.record_access(4);
        replacer.record_access(5);
        replacer.record_access(4);
        replacer.set_evictable(3, true);
        replacer.set_evictable(4, true);
        assert_eq!(4, replacer.size());

        // 3 is the only one with a single access
        assert_eq!(Some(3), replacer.evict());

        replacer.set_evictable(1, false);
        assert_eq!(2, replacer.size());

        // 5 has the oldest second to last access
        assert_eq!(Some(5), replacer.evict());
        assert_eq!(Some(4), replacer.evict());
        assert_eq!(None, replacer.evict());

        replacer.set_evictable(1, true);
        assert_eq!(Some(1), replacer.evict());
        assert_eq!(0, replacer.size());
    }
}
