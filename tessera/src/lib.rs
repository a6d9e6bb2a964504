//! Tessera Core Storage Engine
//!
//! An embeddable, transactional, columnar record store. Records live in
//! typed tables; writes go through snapshot-isolated transactions and land
//! in in-memory logs that background agents merge, persist into immutable
//! compressed blocks and compact through a hierarchy of metadata tables.
//!
//! ```text
//!   Transaction ──append/delete──► delta ──commit (CAS)──► DatabaseState
//!                                                          │
//!        ┌──────────────── lifecycle worker ◄── triggers ──┘
//!        ▼
//!   merge logs ─► persist (data, then $meta:*) ─► hard delete ─► release
//!                      │                              │
//!                      ▼                              ▼
//!                 BlockStore (id → bytes)      tombstones resolved
//! ```
//!
//! Every table T with persisted blocks has a metadata table `$meta:T`
//! holding one row per block (per-column min/max, item count, byte size,
//! block id). Metadata tables are ordinary tables and get their own
//! metadata table once they persist, forming a hierarchy that queries
//! descend using min/max pruning.

pub mod block;
pub mod cache;
pub mod codec;
pub mod column;
pub mod compaction;
pub mod config;
pub mod data;
pub mod db;
pub mod lifecycle;
pub mod query;
pub mod storage;
pub mod txn;
pub mod wal;

use std::sync::Arc;

// Re-export main types
pub use config::DatabaseConfig;
pub use data::{ColumnDef, DataType, Record, TableSchema, Value};
pub use db::{Database, DatabaseStatistics, TableStatistics, TypedTable};
pub use lifecycle::Activities;
pub use query::{CompareOp, Filter, Query};
pub use storage::{BlockStore, FileBlockStore, MemoryBlockStore};
pub use txn::Transaction;
pub use wal::{FileLog, MemoryLog, NoopLog, TransactionLog};

/// Monotonic, globally unique identifier of a record (and of metadata rows).
pub type RecordId = u64;
/// Identifier of a persisted block inside a [`BlockStore`].
pub type BlockId = u64;
/// Identifier of a transaction.
pub type TxnId = u64;

/// Storage engine error type
#[derive(Debug, thiserror::Error)]
pub enum TesseraError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Table already exists: {0}")]
    TableExists(String),

    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    #[error("Duplicate column: {0}")]
    DuplicateColumn(String),

    #[error("Reserved name: {0}")]
    ReservedName(String),

    #[error("Arity mismatch: expected {expected} values, got {actual}")]
    ArityMismatch { expected: usize, actual: usize },

    #[error("Type mismatch in column {column}: expected {expected}, got {actual}")]
    TypeMismatch {
        column: String,
        expected: String,
        actual: String,
    },

    #[error("Null value for non-nullable column: {0}")]
    NullViolation(String),

    #[error("Operator {op} not supported on {data_type} values")]
    UnsupportedOperator { op: String, data_type: String },

    #[error("Table is read-only: {0}")]
    ReadOnlyTable(String),

    #[error("Transaction already finished")]
    TransactionFinished,

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Record does not fit into a block of {0} bytes")]
    RecordTooLarge(usize),

    #[error("Column payload of {0} bytes exceeds the block format limit")]
    BlockOverflow(usize),

    #[error("Consistency violation: {0}")]
    Consistency(String),

    #[error("Corrupt data: {0}")]
    Corrupt(String),

    #[error("Lifecycle failure: {0}")]
    Lifecycle(Arc<TesseraError>),

    #[error("Lifecycle worker stopped")]
    WorkerStopped,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl TesseraError {
    /// Errors caused by the caller's input rather than the engine's state.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            TesseraError::TableNotFound(_)
                | TesseraError::TableExists(_)
                | TesseraError::ColumnNotFound(_)
                | TesseraError::DuplicateColumn(_)
                | TesseraError::ReservedName(_)
                | TesseraError::ArityMismatch { .. }
                | TesseraError::TypeMismatch { .. }
                | TesseraError::NullViolation(_)
                | TesseraError::UnsupportedOperator { .. }
                | TesseraError::ReadOnlyTable(_)
                | TesseraError::TransactionFinished
                | TesseraError::SchemaMismatch(_)
                | TesseraError::Config(_)
                | TesseraError::RecordTooLarge(_)
        )
    }

    /// Errors that indicate a broken engine invariant or damaged storage.
    pub fn is_fatal(&self) -> bool {
        match self {
            TesseraError::Consistency(_) | TesseraError::Corrupt(_) => true,
            TesseraError::Lifecycle(inner) => inner.is_fatal(),
            _ => false,
        }
    }

    pub(crate) fn type_mismatch(column: &str, expected: DataType, actual: &Value) -> Self {
        TesseraError::TypeMismatch {
            column: column.to_string(),
            expected: format!("{:?}", expected),
            actual: actual.type_name().to_string(),
        }
    }
}

impl From<bincode::Error> for TesseraError {
    fn from(e: bincode::Error) -> Self {
        TesseraError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for TesseraError {
    fn from(e: serde_json::Error) -> Self {
        TesseraError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TesseraError>;
