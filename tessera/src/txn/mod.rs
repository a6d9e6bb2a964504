//! Transactions and the shared database state
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │  StateCell                                       │
//! │  - Holds the current immutable DatabaseState     │
//! │  - Transitions clone, mutate and swap (CAS)      │
//! ├──────────────────────────────────────────────────┤
//! │  DatabaseState                                   │
//! │  - Table registry and metadata chains            │
//! │  - In-memory log per table                       │
//! │  - Active transactions, block id pools           │
//! ├──────────────────────────────────────────────────┤
//! │  Transaction                                     │
//! │  - Snapshot of the state at begin                │
//! │  - Private delta (appends + tombstones)          │
//! │  - Commit publishes the delta in one transition  │
//! └──────────────────────────────────────────────────┘
//! ```

mod context;
mod state;
mod tombstone;

pub use context::Transaction;
pub use state::{DatabaseState, StateCell, TableProperties, TxnInfo};
pub use tombstone::{TombstoneIndex, TombstoneRecord};

pub(crate) use context::Delta;
pub(crate) use state::concat_blocks;
