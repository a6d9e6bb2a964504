//! Database handle
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │  Database (cheap to clone, Send + Sync)          │
//! │  - Table registry, transactions                  │
//! │  - Lifecycle requests, statistics, checkpoints   │
//! ├──────────────────────────────────────────────────┤
//! │  DbInner                                         │
//! │  - StateCell, counters, id allocation            │
//! │  - BlockStore + BlockCache, TransactionLog       │
//! ├──────────────────────────────────────────────────┤
//! │  lifecycle worker (one thread per database)      │
//! └──────────────────────────────────────────────────┘
//! ```

pub(crate) mod inner;
pub(crate) mod reader;
mod stats;
mod typed;

pub use stats::{DatabaseStatistics, TableStatistics};
pub use typed::TypedTable;

use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::Utc;
use parking_lot::Mutex;

use crate::block::BlockBuilder;
use crate::config::DatabaseConfig;
use crate::data::{Record, TableSchema, Value, TOMBSTONE_TABLE};
use crate::lifecycle::{self, Activities};
use crate::query::Query;
use crate::storage::{BlockStore, MemoryBlockStore};
use crate::txn::Transaction;
use crate::wal::{replay_tail, Checkpoint, LogEntry, NoopLog, TableRows, TransactionLog};
use crate::{RecordId, Result, TesseraError};
use inner::DbInner;

struct Shared {
    inner: Arc<DbInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn stop_worker(&self) -> Result<()> {
        self.inner.detach_worker();
        if let Some(handle) = self.worker.lock().take() {
            handle.join().map_err(|_| TesseraError::WorkerStopped)?;
        }
        Ok(())
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Err(e) = self.stop_worker() {
            log::warn!("lifecycle worker did not stop cleanly: {}", e);
        }
    }
}

/// An open database
///
/// Clones share the same engine; the lifecycle worker stops when the last
/// clone is dropped or [`Database::close`] is called.
#[derive(Clone)]
pub struct Database {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("inner", &self.shared.inner)
            .finish()
    }
}

impl Database {
    /// In-memory database: memory block store, no transaction log
    pub fn open(config: DatabaseConfig) -> Result<Self> {
        Self::open_with(
            config,
            Vec::new(),
            Arc::new(MemoryBlockStore::new()),
            Arc::new(NoopLog),
        )
    }

    /// Open a database over `store` and `log`. `tables` are registered
    /// before the log is replayed, so every table the log mentions must be
    /// among them.
    pub fn open_with(
        config: DatabaseConfig,
        tables: Vec<TableSchema>,
        store: Arc<dyn BlockStore>,
        log: Arc<dyn TransactionLog>,
    ) -> Result<Self> {
        let inner = Arc::new(DbInner::new(config, store, log)?);
        for schema in tables {
            register(&inner, schema)?;
        }
        replay(&inner)?;

        let (sender, receiver) = mpsc::channel();
        inner.attach_worker(sender);
        let handle = lifecycle::spawn(inner.clone(), receiver)?;
        log::info!(
            "database opened at version {}, next record id {}",
            inner.state.load().version(),
            inner.peek_record_id()
        );
        Ok(Self {
            shared: Arc::new(Shared {
                inner,
                worker: Mutex::new(Some(handle)),
            }),
        })
    }

    pub(crate) fn inner(&self) -> &Arc<DbInner> {
        &self.shared.inner
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.inner().config
    }

    // ========================================================================
    // Tables
    // ========================================================================

    pub fn create_table(&self, schema: TableSchema) -> Result<Arc<TableSchema>> {
        register(self.inner(), schema)
    }

    /// Create a table whose columns come from `R`
    pub fn create_typed_table<R: Record>(&self, name: &str) -> Result<TypedTable<R>> {
        let schema = self.create_table(TableSchema::new(name, R::columns())?)?;
        Ok(TypedTable::new(self.clone(), schema))
    }

    /// Typed access to an existing table whose columns must match `R`
    pub fn typed_table<R: Record>(&self, name: &str) -> Result<TypedTable<R>> {
        let schema = self.table_schema(name)?;
        let expected = R::columns();
        if schema.columns()[..schema.user_column_count()] != expected[..] {
            return Err(TesseraError::SchemaMismatch(format!(
                "table {} does not store the columns of the requested record type",
                name
            )));
        }
        Ok(TypedTable::new(self.clone(), schema))
    }

    pub fn table_schema(&self, name: &str) -> Result<Arc<TableSchema>> {
        Ok(self.inner().state.load().table(name)?.schema.clone())
    }

    /// Names of the host-declared tables
    pub fn table_names(&self) -> Vec<String> {
        self.inner()
            .state
            .load()
            .data_tables()
            .map(|t| t.name().to_string())
            .collect()
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    pub fn begin(&self) -> Result<Transaction> {
        self.inner().begin(false)
    }

    pub fn begin_read_only(&self) -> Result<Transaction> {
        self.inner().begin(true)
    }

    /// Run `f` in a transaction, committing on success and rolling back on
    /// error
    pub fn transaction<T>(&self, f: impl FnOnce(&mut Transaction) -> Result<T>) -> Result<T> {
        let mut txn = self.begin()?;
        match f(&mut txn) {
            Ok(out) => {
                txn.commit()?;
                Ok(out)
            }
            Err(e) => {
                let id = txn.id();
                if let Err(rollback) = txn.rollback() {
                    log::warn!("rollback of transaction {} failed: {}", id, rollback);
                }
                Err(e)
            }
        }
    }

    /// Rows of `query` in a fresh read-only transaction
    pub fn query(&self, query: &Query) -> Result<Vec<Vec<Value>>> {
        let txn = self.begin_read_only()?;
        let rows = txn.query(query)?;
        txn.commit()?;
        Ok(rows)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Run `activities` on the lifecycle worker and wait for the batch
    /// that ran them. Also raises a failure of an earlier unattended batch.
    pub fn run_lifecycle(&self, activities: Activities) -> Result<()> {
        self.inner().run_lifecycle(activities)
    }

    /// Re-point or drop tombstones of `table` whose block id went stale;
    /// returns how many changed
    pub fn repair_orphan_tombstones(&self, table: &str) -> Result<usize> {
        self.inner().state.load().table(table)?;
        self.inner().repair_tombstones(table)
    }

    /// Replace the transaction log with a checkpoint of every visible row
    pub fn checkpoint(&self) -> Result<()> {
        let inner = self.inner();
        let _guard = inner.log_lock.lock();
        let txn = inner.begin(true)?;
        let mut tables = Vec::new();
        for name in self.table_names() {
            let rows = txn.query_with_ids(&Query::new(name.clone()))?;
            tables.push(TableRows { table: name, rows });
        }
        let checkpoint = Checkpoint {
            taken_at: Utc::now(),
            next_record_id: inner.peek_record_id(),
            tables,
        };
        inner.log.checkpoint(&checkpoint)?;
        txn.commit()?;
        log::info!(
            "checkpoint of {} rows written",
            checkpoint.tables.iter().map(|t| t.rows.len()).sum::<usize>()
        );
        Ok(())
    }

    /// Stop the lifecycle worker. Later lifecycle requests fail with
    /// `WorkerStopped`; transactions keep working.
    pub fn close(&self) -> Result<()> {
        self.shared.stop_worker()?;
        self.inner().check_fault()
    }
}

fn register(inner: &DbInner, schema: TableSchema) -> Result<Arc<TableSchema>> {
    if schema.is_system() {
        return Err(TesseraError::ReservedName(schema.name().to_string()));
    }
    let schema = Arc::new(schema);
    inner.state.update(|s| s.register_table(schema.clone()))?;
    log::debug!("created table {}", schema.name());
    Ok(schema)
}

/// Rebuild the in-memory logs from the transaction log
fn replay(inner: &DbInner) -> Result<()> {
    let entries = replay_tail(inner.log.load()?);
    if entries.is_empty() {
        return Ok(());
    }

    // every id the log mentions lies below the counter before tombstone
    // rows get their own ids
    let mut floor: RecordId = 1;
    for entry in &entries {
        match entry {
            LogEntry::Checkpoint(cp) => floor = floor.max(cp.next_record_id),
            LogEntry::Delta(delta) => {
                let rows = delta.tables.iter().flat_map(|t| t.rows.iter().map(|(rid, _)| *rid));
                let deleted = delta.tombstones.iter().map(|t| t.record_id);
                if let Some(max) = rows.chain(deleted).max() {
                    floor = floor.max(max + 1);
                }
            }
        }
    }
    inner.advance_record_ids(floor);

    let snapshot = inner.state.load();
    let mut blocks: BTreeMap<String, BlockBuilder> = BTreeMap::new();
    let mut load_rows = |rows: &TableRows| -> Result<()> {
        let props = snapshot.table(&rows.table)?;
        let block = blocks
            .entry(rows.table.clone())
            .or_insert_with(|| BlockBuilder::new(props.schema.clone()));
        for (rid, values) in &rows.rows {
            block.append_record(*rid, values).map_err(|e| {
                TesseraError::SchemaMismatch(format!(
                    "logged row {} of {} does not fit the declared schema: {}",
                    rid, rows.table, e
                ))
            })?;
        }
        Ok(())
    };

    let tombstone_schema = snapshot.table(TOMBSTONE_TABLE)?.schema.clone();
    let mut tombstones = BlockBuilder::new(tombstone_schema);
    let mut deltas = 0;
    for entry in &entries {
        match entry {
            LogEntry::Checkpoint(cp) => {
                for rows in &cp.tables {
                    load_rows(rows)?;
                }
            }
            LogEntry::Delta(delta) => {
                deltas += 1;
                for rows in &delta.tables {
                    load_rows(rows)?;
                }
                for tombstone in &delta.tombstones {
                    snapshot.table(&tombstone.table)?;
                    // block ids of an earlier session mean nothing now
                    let mut tombstone = tombstone.clone();
                    tombstone.block_id = None;
                    tombstones.append_record(inner.allocate_record_id(), &tombstone.to_values())?;
                }
            }
        }
    }

    let mut logs: Vec<(String, Arc<BlockBuilder>)> = blocks
        .into_iter()
        .map(|(table, mut block)| {
            block.order_by_record_id();
            (table, Arc::new(block))
        })
        .collect();
    logs.push((TOMBSTONE_TABLE.to_string(), Arc::new(tombstones)));
    inner.state.update(|s| {
        for (table, block) in &logs {
            s.append_log(table, block.clone())?;
        }
        Ok(())
    })?;
    log::info!(
        "replayed {} log entries ({} deltas), {} rows",
        entries.len(),
        deltas,
        logs.iter().map(|(_, b)| b.len()).sum::<usize>()
    );
    Ok(())
}
