//! Data lifecycle - background agents moving data through the hierarchy
//!
//! A single worker thread receives triggers, batches them and runs a fixed
//! pipeline of agents once per batch:
//!
//! ```text
//!   commit ──opportunistic──┐
//!   run_lifecycle ─forced───┼──► queue ──► batch (window) ──► merge logs
//!                           │                                 persist data, then metadata
//!                           │                                 hard delete
//!                           │                                 release blocks
//!                           └──────────── results ◄───────────┘
//! ```

mod agents;
mod scheduler;

use std::sync::mpsc::Sender;

use crate::Result;

pub(crate) use scheduler::spawn;

bitflags::bitflags! {
    /// Set of lifecycle activities to run
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Activities: u32 {
        const NONE = 0;
        /// Fold excess in-memory log blocks of every table into one
        const MERGE_LOGS = 1 << 0;
        /// Persist in-memory rows beyond the configured thresholds
        const PERSIST_EXCESS = 1 << 1;
        /// Persist every final in-memory row of the data tables
        const PERSIST_ALL = 1 << 2;
        /// Hard delete until tables fall within their tombstone budget
        const HARD_DELETE_EXCESS = 1 << 3;
        /// Hard delete every tombstoned record
        const HARD_DELETE_ALL = 1 << 4;
        /// Return superseded block ids to the free pool once no reader remains
        const RELEASE_BLOCKS = 1 << 5;

        const ALL = Self::MERGE_LOGS.bits()
            | Self::PERSIST_ALL.bits()
            | Self::HARD_DELETE_ALL.bits()
            | Self::RELEASE_BLOCKS.bits();
        /// What an opportunistic trigger runs
        const POLICY = Self::MERGE_LOGS.bits()
            | Self::PERSIST_EXCESS.bits()
            | Self::HARD_DELETE_EXCESS.bits()
            | Self::RELEASE_BLOCKS.bits();
    }
}

/// Message to the lifecycle worker
pub(crate) enum Trigger {
    /// Emitted after every commit; runs the policy activities
    Opportunistic,
    /// Explicit request awaiting the outcome of its batch
    Forced {
        activities: Activities,
        done: Sender<Result<()>>,
    },
    /// Re-resolve orphan tombstones of one table after the batch
    Repair {
        table: String,
        done: Sender<Result<usize>>,
    },
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_sets() {
        let a = Activities::MERGE_LOGS | Activities::PERSIST_ALL;
        assert!(a.contains(Activities::MERGE_LOGS));
        assert!(!a.contains(Activities::MERGE_LOGS | Activities::RELEASE_BLOCKS));
        assert!(a.intersects(Activities::PERSIST_ALL | Activities::PERSIST_EXCESS));
        assert!(Activities::ALL.contains(Activities::HARD_DELETE_ALL));
        assert!(!Activities::POLICY.contains(Activities::PERSIST_ALL));
        assert!(Activities::default().is_empty());
        assert_eq!(Activities::default(), Activities::NONE);

        let mut batch = Activities::NONE;
        batch |= Activities::POLICY;
        batch |= Activities::HARD_DELETE_ALL;
        assert!(batch.contains(Activities::HARD_DELETE_EXCESS | Activities::HARD_DELETE_ALL));
        assert!(!batch.contains(Activities::PERSIST_ALL));
        assert_eq!(Activities::from_bits(batch.bits()), Some(batch));
    }
}
