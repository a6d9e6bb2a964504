//! Compaction - persisting, merging and rewriting blocks
//!
//! ```text
//!   in-memory log ──persist──► data blocks ◄── $meta:T rows ◄── $meta:$meta:T rows ...
//!                                  ▲
//!   tombstones ──hard delete───────┘  rewrite subtrees, merge siblings,
//!                                     release replaced blocks
//! ```
//!
//! All passes run on the lifecycle worker. They read one snapshot, write
//! new blocks to the block store and install their result with a single
//! state transition; blocks they replace are released later.

mod facade;
mod hard_delete;
mod hierarchy;
mod merge;
mod meta_row;
mod persist;
mod repair;

pub use meta_row::MetaRow;

pub(crate) use hard_delete::{hard_delete, HardDeleteMode};
pub(crate) use persist::{persist_data, persist_metadata};
pub(crate) use repair::repair_tombstones;
