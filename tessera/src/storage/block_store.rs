//! Block store abstraction and the in-memory implementation

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::{BlockId, Result, TesseraError};

/// Key/value store of persisted block bytes
///
/// Writes of a given id happen once, before any metadata row referencing
/// the id is published. Removal happens only after no transaction can
/// reach the block any more.
pub trait BlockStore: Send + Sync + std::fmt::Debug {
    fn write(&self, id: BlockId, bytes: &[u8]) -> Result<()>;

    fn read(&self, id: BlockId) -> Result<Arc<[u8]>>;

    fn remove(&self, id: BlockId) -> Result<()>;

    fn contains(&self, id: BlockId) -> bool;

    /// Number of blocks currently stored
    fn block_count(&self) -> usize;

    /// Total bytes read since creation
    fn bytes_read(&self) -> u64 {
        0
    }
}

/// Block store keeping everything in a hash map
#[derive(Debug, Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<AHashMap<BlockId, Arc<[u8]>>>,
    bytes_read: AtomicU64,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes held
    pub fn stored_bytes(&self) -> usize {
        self.blocks.read().values().map(|b| b.len()).sum()
    }
}

impl BlockStore for MemoryBlockStore {
    fn write(&self, id: BlockId, bytes: &[u8]) -> Result<()> {
        self.blocks.write().insert(id, Arc::from(bytes));
        Ok(())
    }

    fn read(&self, id: BlockId) -> Result<Arc<[u8]>> {
        let bytes = self
            .blocks
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| TesseraError::Corrupt(format!("block {} not found in store", id)))?;
        self.bytes_read.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(bytes)
    }

    fn remove(&self, id: BlockId) -> Result<()> {
        self.blocks.write().remove(&id);
        Ok(())
    }

    fn contains(&self, id: BlockId) -> bool {
        self.blocks.read().contains_key(&id)
    }

    fn block_count(&self) -> usize {
        self.blocks.read().len()
    }

    fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store() {
        let store = MemoryBlockStore::new();
        store.write(3, &[1, 2, 3]).unwrap();
        assert!(store.contains(3));
        assert_eq!(&*store.read(3).unwrap(), &[1, 2, 3]);
        assert_eq!(store.block_count(), 1);
        assert_eq!(store.bytes_read(), 3);

        store.remove(3).unwrap();
        assert!(!store.contains(3));
        assert!(matches!(store.read(3), Err(TesseraError::Corrupt(_))));
    }
}
