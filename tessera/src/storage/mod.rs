//! Persisted block storage
//!
//! The engine writes every serialized block exactly once under a fresh
//! block id and removes it only when the release agent frees the id.

mod block_store;
mod file_store;

pub use block_store::{BlockStore, MemoryBlockStore};
pub use file_store::FileBlockStore;
