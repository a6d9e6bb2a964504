//! Shared engine core: state cell, storage, counters and worker link

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::block::{BlockBuilder, ReadOnlyBlock};
use crate::cache::BlockCache;
use crate::compaction::MetaRow;
use crate::config::DatabaseConfig;
use crate::data::{TableSchema, TOMBSTONE_TABLE};
use crate::lifecycle::{Activities, Trigger};
use crate::storage::BlockStore;
use crate::txn::{DatabaseState, Delta, StateCell, Transaction, TxnInfo};
use crate::wal::TransactionLog;
use crate::{RecordId, Result, TesseraError, TxnId};

/// Monotonic engine counters
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub commits: AtomicU64,
    pub rollbacks: AtomicU64,
    pub lifecycle_batches: AtomicU64,
    pub blocks_written: AtomicU64,
    pub blocks_released: AtomicU64,
    pub records_hard_deleted: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

pub(crate) struct DbInner {
    pub config: DatabaseConfig,
    pub state: StateCell,
    pub store: Arc<dyn BlockStore>,
    pub cache: BlockCache,
    pub log: Arc<dyn TransactionLog>,
    /// Orders log appends with their state transitions
    pub log_lock: Mutex<()>,
    pub counters: Counters,
    next_record_id: AtomicU64,
    next_txn_id: AtomicU64,
    trigger: Mutex<Option<Sender<Trigger>>>,
    /// Failure of a batch nobody waited for, raised at the next request
    fault: Mutex<Option<Arc<TesseraError>>>,
}

impl std::fmt::Debug for DbInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbInner")
            .field("version", &self.state.load().version())
            .field("next_record_id", &self.peek_record_id())
            .field("store", &self.store)
            .finish()
    }
}

impl DbInner {
    pub fn new(
        config: DatabaseConfig,
        store: Arc<dyn BlockStore>,
        log: Arc<dyn TransactionLog>,
    ) -> Result<Self> {
        config.validate()?;
        let mut state = DatabaseState::default();
        state.register_table(Arc::new(TableSchema::tombstones()))?;
        Ok(Self {
            cache: BlockCache::new(config.block_cache_capacity),
            config,
            state: StateCell::new(state),
            store,
            log,
            log_lock: Mutex::new(()),
            counters: Counters::default(),
            next_record_id: AtomicU64::new(1),
            next_txn_id: AtomicU64::new(1),
            trigger: Mutex::new(None),
            fault: Mutex::new(None),
        })
    }

    // ========================================================================
    // Identifiers
    // ========================================================================

    pub fn allocate_record_id(&self) -> RecordId {
        self.next_record_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn peek_record_id(&self) -> RecordId {
        self.next_record_id.load(Ordering::SeqCst)
    }

    /// Make sure future ids are at least `floor` (log replay)
    pub fn advance_record_ids(&self, floor: RecordId) {
        self.next_record_id.fetch_max(floor, Ordering::SeqCst);
    }

    /// Rows with a record id below the result can no longer be joined by
    /// a commit. The counter is read before the state so that transactions
    /// registering in between allocate above it.
    pub fn record_watermark(&self) -> (RecordId, Arc<DatabaseState>) {
        let next = self.peek_record_id();
        let state = self.state.load();
        (state.record_watermark(next), state)
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    pub fn begin(self: &Arc<Self>, read_only: bool) -> Result<Transaction> {
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let info = TxnInfo {
            id,
            record_floor: if read_only {
                RecordId::MAX
            } else {
                self.peek_record_id()
            },
            read_only,
            started_at: chrono::Utc::now(),
        };
        self.state.update(|s| {
            s.begin_transaction(info.clone());
            Ok(())
        })?;
        let snapshot = self.state.load();
        log::trace!("transaction {} started at version {}", id, snapshot.version());
        Ok(Transaction::new(self.clone(), id, snapshot, read_only, true))
    }

    /// Transaction over the current state that is never registered. Its
    /// writes stay private and its commit publishes nothing. The lifecycle
    /// agents read through it; blocks are only released by the worker
    /// itself, after the agents are done with the view.
    pub fn detached(self: &Arc<Self>) -> Transaction {
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        Transaction::new(self.clone(), id, self.state.load(), false, false)
    }

    pub fn commit(&self, id: TxnId, delta: Delta) -> Result<()> {
        if delta.is_empty() {
            self.end_transaction(id)?;
            Counters::bump(&self.counters.commits, 1);
            return Ok(());
        }

        let result = self.publish(id, delta);
        if let Err(e) = result {
            log::warn!("commit of transaction {} failed: {}", id, e);
            self.end_transaction(id)?;
            Counters::bump(&self.counters.rollbacks, 1);
            return Err(e);
        }
        Counters::bump(&self.counters.commits, 1);
        if self.config.background_lifecycle {
            self.notify(Trigger::Opportunistic);
        }
        Ok(())
    }

    fn publish(&self, id: TxnId, delta: Delta) -> Result<()> {
        let durable = self.log.is_durable();
        let entry = if durable { Some(delta.to_log(id)?) } else { None };

        let tombstone_schema = self.state.load().table(TOMBSTONE_TABLE)?.schema.clone();
        let tombstones = delta.tombstone_block(&tombstone_schema)?.map(Arc::new);
        let blocks: Vec<(String, Arc<BlockBuilder>)> = delta
            .appended
            .into_iter()
            .filter(|(_, b)| !b.is_empty())
            .map(|(t, b)| (t, Arc::new(b)))
            .collect();
        let rows: usize = blocks.iter().map(|(_, b)| b.len()).sum();

        let _guard = durable.then(|| self.log_lock.lock());
        if let Some(entry) = &entry {
            self.log.append(entry)?;
        }
        self.state.update(|s| {
            for (table, block) in &blocks {
                s.append_log(table, block.clone())?;
            }
            if let Some(block) = &tombstones {
                s.append_log(TOMBSTONE_TABLE, block.clone())?;
            }
            s.end_transaction(id);
            Ok(())
        })?;
        log::debug!(
            "transaction {} committed {} rows, {} tombstones",
            id,
            rows,
            tombstones.as_ref().map_or(0, |b| b.len())
        );
        Ok(())
    }

    pub fn rollback(&self, id: TxnId) -> Result<()> {
        self.end_transaction(id)?;
        Counters::bump(&self.counters.rollbacks, 1);
        log::debug!("transaction {} rolled back", id);
        Ok(())
    }

    fn end_transaction(&self, id: TxnId) -> Result<()> {
        self.state.update(|s| {
            s.end_transaction(id);
            Ok(())
        })
    }

    // ========================================================================
    // Blocks
    // ========================================================================

    /// Persisted block described by `row`, through the cache
    pub fn load_block(&self, schema: &Arc<TableSchema>, row: &MetaRow) -> Result<Arc<ReadOnlyBlock>> {
        if let Some(block) = self.cache.get(row.block_id) {
            return Ok(block);
        }
        let bytes = self.store.read(row.block_id)?;
        if bytes.len() != row.byte_size {
            return Err(TesseraError::Corrupt(format!(
                "block {} holds {} bytes, its metadata says {}",
                row.block_id,
                bytes.len(),
                row.byte_size
            )));
        }
        let block = Arc::new(ReadOnlyBlock::open(
            schema.clone(),
            Some(row.block_id),
            row.item_count,
            row.bounds.clone(),
            bytes,
        )?);
        self.cache.insert(row.block_id, block.clone());
        Ok(block)
    }

    // ========================================================================
    // Lifecycle worker link
    // ========================================================================

    pub fn attach_worker(&self, sender: Sender<Trigger>) {
        *self.trigger.lock() = Some(sender);
    }

    /// Fire-and-forget message to the worker
    pub fn notify(&self, trigger: Trigger) {
        if let Some(sender) = self.trigger.lock().as_ref() {
            // a stopped worker has nothing left to do
            let _ = sender.send(trigger);
        }
    }

    fn submit(&self, trigger: Trigger) -> Result<()> {
        self.check_fault()?;
        let guard = self.trigger.lock();
        let sender = guard.as_ref().ok_or(TesseraError::WorkerStopped)?;
        sender.send(trigger).map_err(|_| TesseraError::WorkerStopped)
    }

    /// Run `activities` in the next batch and wait for its outcome
    pub fn run_lifecycle(&self, activities: Activities) -> Result<()> {
        let (done, wait) = mpsc::channel();
        self.submit(Trigger::Forced { activities, done })?;
        wait.recv().map_err(|_| TesseraError::WorkerStopped)?
    }

    pub fn repair_tombstones(&self, table: &str) -> Result<usize> {
        let (done, wait) = mpsc::channel();
        self.submit(Trigger::Repair {
            table: table.to_string(),
            done,
        })?;
        wait.recv().map_err(|_| TesseraError::WorkerStopped)?
    }

    /// Stop accepting triggers and ask the worker to exit after its batch
    pub fn detach_worker(&self) {
        if let Some(sender) = self.trigger.lock().take() {
            let _ = sender.send(Trigger::Shutdown);
        }
    }

    pub fn record_fault(&self, error: Arc<TesseraError>) {
        *self.fault.lock() = Some(error);
    }

    pub fn check_fault(&self) -> Result<()> {
        match self.fault.lock().take() {
            Some(error) => Err(TesseraError::Lifecycle(error)),
            None => Ok(()),
        }
    }
}
