//! Transaction log - durable record of committed deltas
//!
//! The engine appends one [`TransactionDelta`] per committing write
//! transaction, in commit order, and replays the log on open: the last
//! [`Checkpoint`] first, then every delta appended after it.
//!
//! ```text
//!   ┌────────────┬─────────┬─────────┬─────────┐
//!   │ Checkpoint │ Delta 1 │ Delta 2 │ ...     │   replay left to right
//!   └────────────┴─────────┴─────────┴─────────┘
//! ```

mod file_log;

pub use file_log::FileLog;

use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::data::Value;
use crate::txn::TombstoneRecord;
use crate::{RecordId, Result, TxnId};

/// Rows of one table with their record ids
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRows {
    pub table: String,
    pub rows: Vec<(RecordId, Vec<Value>)>,
}

/// Everything one transaction committed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionDelta {
    pub txn_id: TxnId,
    pub committed_at: DateTime<Utc>,
    pub tables: Vec<TableRows>,
    pub tombstones: Vec<TombstoneRecord>,
}

impl TransactionDelta {
    pub fn is_empty(&self) -> bool {
        self.tombstones.is_empty() && self.tables.iter().all(|t| t.rows.is_empty())
    }
}

/// Every live record at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub taken_at: DateTime<Utc>,
    pub next_record_id: RecordId,
    /// Visible rows per host table; deleted records are left out
    pub tables: Vec<TableRows>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogEntry {
    Delta(TransactionDelta),
    Checkpoint(Checkpoint),
}

/// Durable log backend
pub trait TransactionLog: Send + Sync + fmt::Debug {
    /// Entries to replay, oldest first
    fn load(&self) -> Result<Vec<LogEntry>>;

    fn append(&self, delta: &TransactionDelta) -> Result<()>;

    /// Replace everything logged so far by `checkpoint`
    fn checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Whether appends are worth building; `false` skips delta encoding
    fn is_durable(&self) -> bool {
        true
    }
}

/// Log that keeps nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLog;

impl TransactionLog for NoopLog {
    fn load(&self) -> Result<Vec<LogEntry>> {
        Ok(Vec::new())
    }

    fn append(&self, _delta: &TransactionDelta) -> Result<()> {
        Ok(())
    }

    fn checkpoint(&self, _checkpoint: &Checkpoint) -> Result<()> {
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }
}

/// Log held in memory, shareable between database instances of one process
#[derive(Debug, Default)]
pub struct MemoryLog {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl TransactionLog for MemoryLog {
    fn load(&self) -> Result<Vec<LogEntry>> {
        Ok(self.entries())
    }

    fn append(&self, delta: &TransactionDelta) -> Result<()> {
        self.entries.lock().push(LogEntry::Delta(delta.clone()));
        Ok(())
    }

    fn checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.clear();
        entries.push(LogEntry::Checkpoint(checkpoint.clone()));
        Ok(())
    }
}

/// Entries that matter for replay: the last checkpoint and what follows it
pub fn replay_tail(entries: Vec<LogEntry>) -> Vec<LogEntry> {
    let start = entries
        .iter()
        .rposition(|e| matches!(e, LogEntry::Checkpoint(_)))
        .unwrap_or(0);
    entries.into_iter().skip(start).collect()
}
