//! Decoded block cache
//!
//! Persisted blocks are immutable and block ids are only reused after the
//! release agent frees them, so a cached block stays valid until the
//! release agent evicts its id.

mod lru;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::block::ReadOnlyBlock;
use crate::BlockId;
use lru::LruMap;

/// Cache hit/miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

pub struct BlockCache {
    map: Mutex<LruMap<Arc<ReadOnlyBlock>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache").field("stats", &self.stats()).finish()
    }
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: Mutex::new(LruMap::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, id: BlockId) -> Option<Arc<ReadOnlyBlock>> {
        let found = self.map.lock().get(id);
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    pub fn insert(&self, id: BlockId, block: Arc<ReadOnlyBlock>) {
        self.map.lock().insert(id, block);
    }

    pub fn evict(&self, id: BlockId) {
        self.map.lock().remove(id);
    }

    pub fn clear(&self) {
        self.map.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.map.lock().len(),
        }
    }
}
