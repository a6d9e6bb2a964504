//! Slab-backed LRU map keyed by block id

use ahash::AHashMap;

use crate::BlockId;

struct Node<V> {
    key: BlockId,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

/// LRU map with O(1) get, insert, remove and eviction
pub(crate) struct LruMap<V> {
    capacity: usize,
    index: AHashMap<BlockId, usize>,
    slots: Vec<Option<Node<V>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<V: Clone> LruMap<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            index: AHashMap::with_capacity(capacity),
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn get(&mut self, key: BlockId) -> Option<V> {
        let slot = *self.index.get(&key)?;
        self.touch(slot);
        self.slots[slot].as_ref().map(|n| n.value.clone())
    }

    /// Insert or replace; returns the evicted key, if any
    pub fn insert(&mut self, key: BlockId, value: V) -> Option<BlockId> {
        if self.capacity == 0 {
            return None;
        }
        if let Some(&slot) = self.index.get(&key) {
            if let Some(node) = self.slots[slot].as_mut() {
                node.value = value;
            }
            self.touch(slot);
            return None;
        }
        let evicted = if self.index.len() >= self.capacity {
            self.tail.and_then(|t| self.slots[t].as_ref().map(|n| n.key))
        } else {
            None
        };
        if let Some(old) = evicted {
            self.remove(old);
        }
        let node = Node {
            key,
            value,
            prev: None,
            next: None,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, slot);
        self.link_front(slot);
        evicted
    }

    pub fn remove(&mut self, key: BlockId) -> Option<V> {
        let slot = self.index.remove(&key)?;
        self.unlink(slot);
        self.free.push(slot);
        self.slots[slot].take().map(|n| n.value)
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
    }

    fn touch(&mut self, slot: usize) {
        if self.head != Some(slot) {
            self.unlink(slot);
            self.link_front(slot);
        }
    }

    fn link_front(&mut self, slot: usize) {
        let old_head = self.head;
        if let Some(node) = self.slots[slot].as_mut() {
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(node) = self.slots[h].as_mut() {
                node.prev = Some(slot);
            }
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }

    fn unlink(&mut self, slot: usize) {
        let Some((prev, next)) = self.slots[slot].as_ref().map(|n| (n.prev, n.next)) else {
            return;
        };
        match prev {
            Some(p) => {
                if let Some(node) = self.slots[p].as_mut() {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.slots[n].as_mut() {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(node) = self.slots[slot].as_mut() {
            node.prev = None;
            node.next = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_least_recently_used() {
        let mut lru = LruMap::new(2);
        lru.insert(1, "a");
        lru.insert(2, "b");
        assert_eq!(lru.get(1), Some("a"));
        assert_eq!(lru.insert(3, "c"), Some(2));
        assert_eq!(lru.get(2), None);
        assert_eq!(lru.len(), 2);
    }

    #[test]
    fn test_remove_and_reuse_slots() {
        let mut lru = LruMap::new(3);
        for k in 0..3 {
            lru.insert(k, k * 10);
        }
        assert_eq!(lru.remove(1), Some(10));
        lru.insert(7, 70);
        assert_eq!(lru.get(7), Some(70));
        assert_eq!(lru.get(0), Some(0));
        assert_eq!(lru.insert(8, 80), Some(2));
    }

    #[test]
    fn test_zero_capacity_stores_nothing() {
        let mut lru = LruMap::new(0);
        lru.insert(1, 1);
        assert_eq!(lru.get(1), None);
    }
}
