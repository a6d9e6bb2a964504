//! Immutable database state and its compare-and-swap cell
//!
//! Every change to shared state builds a new [`DatabaseState`] from the
//! current one and installs it only if nobody else installed a newer state
//! in the meantime. Losers rebuild against the fresh state and try again.
//!
//! ```text
//!   load ──► current ──f(current)──► next ──swap if still current──► done
//!     ▲                                          │
//!     └──────────────── lost the race ───────────┘
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::block::{BlockBuilder, BlockRead};
use crate::data::{metadata_name, TableSchema};
use crate::{BlockId, RecordId, Result, TesseraError, TxnId};

/// Upper bound on attempts of one state transition
const MAX_CAS_ATTEMPTS: usize = 10_000;

/// Registry entry of a table
#[derive(Debug, Clone)]
pub struct TableProperties {
    pub schema: Arc<TableSchema>,
    /// Metadata table describing this table's persisted blocks, assigned on
    /// the first persistence of the table
    pub metadata_table: Option<String>,
}

impl TableProperties {
    pub fn new(schema: Arc<TableSchema>) -> Self {
        Self {
            schema,
            metadata_table: None,
        }
    }

    pub fn name(&self) -> &str {
        self.schema.name()
    }

    pub fn is_persisted(&self) -> bool {
        self.metadata_table.is_some()
    }
}

/// Bookkeeping of an active transaction
#[derive(Debug, Clone, PartialEq)]
pub struct TxnInfo {
    pub id: TxnId,
    /// Lowest record id the transaction may still commit; `u64::MAX` for
    /// read-only transactions
    pub record_floor: RecordId,
    pub read_only: bool,
    pub started_at: DateTime<Utc>,
}

/// One immutable version of the database
#[derive(Debug, Clone, Default)]
pub struct DatabaseState {
    pub(crate) version: u64,
    pub(crate) tables: BTreeMap<String, Arc<TableProperties>>,
    /// Committed in-memory rows per table, oldest block first
    pub(crate) logs: BTreeMap<String, Vec<Arc<BlockBuilder>>>,
    pub(crate) transactions: BTreeMap<TxnId, TxnInfo>,
    /// Superseded block ids waiting for every reader to finish
    pub(crate) pending_release: Vec<BlockId>,
    pub(crate) free_blocks: Vec<BlockId>,
    pub(crate) next_block_id: BlockId,
}

impl DatabaseState {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn table(&self, name: &str) -> Result<&Arc<TableProperties>> {
        self.tables
            .get(name)
            .ok_or_else(|| TesseraError::TableNotFound(name.to_string()))
    }

    pub fn tables(&self) -> impl Iterator<Item = &Arc<TableProperties>> {
        self.tables.values()
    }

    /// Host-declared tables
    pub fn data_tables(&self) -> impl Iterator<Item = &Arc<TableProperties>> {
        self.tables.values().filter(|t| !t.schema.is_system())
    }

    pub fn log(&self, table: &str) -> &[Arc<BlockBuilder>] {
        self.logs.get(table).map_or(&[], Vec::as_slice)
    }

    pub fn in_memory_rows(&self, table: &str) -> usize {
        self.log(table).iter().map(|b| b.len()).sum()
    }

    /// The table followed by its metadata tables, lowest level first
    pub fn metadata_chain(&self, table: &str) -> Result<Vec<Arc<TableProperties>>> {
        let mut chain = vec![self.table(table)?.clone()];
        while let Some(meta) = chain.last().and_then(|t| t.metadata_table.clone()) {
            chain.push(self.table(&meta)?.clone());
        }
        Ok(chain)
    }

    /// Number of metadata levels currently holding rows
    pub fn hierarchy_depth(&self, table: &str) -> Result<usize> {
        let chain = self.metadata_chain(table)?;
        Ok(chain
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, t)| self.in_memory_rows(t.name()) > 0)
            .map(|(level, _)| level)
            .max()
            .unwrap_or(0))
    }

    pub fn transactions(&self) -> impl Iterator<Item = &TxnInfo> {
        self.transactions.values()
    }

    pub fn active_transactions(&self) -> usize {
        self.transactions.len()
    }

    /// Lowest record id any active transaction may still commit, bounded by
    /// `next_record_id`. Rows below it are final.
    pub fn record_watermark(&self, next_record_id: RecordId) -> RecordId {
        self.transactions
            .values()
            .map(|t| t.record_floor)
            .fold(next_record_id, RecordId::min)
    }

    pub fn pending_release(&self) -> &[BlockId] {
        &self.pending_release
    }

    pub fn free_blocks(&self) -> &[BlockId] {
        &self.free_blocks
    }

    // State transitions. They mutate a private copy handed out by
    // `StateCell::update`.

    pub(crate) fn register_table(&mut self, schema: Arc<TableSchema>) -> Result<()> {
        let name = schema.name().to_string();
        if self.tables.contains_key(&name) {
            return Err(TesseraError::TableExists(name));
        }
        self.tables
            .insert(name.clone(), Arc::new(TableProperties::new(schema)));
        self.logs.insert(name, Vec::new());
        Ok(())
    }

    /// Metadata table of `table`, registering it on first use
    pub(crate) fn ensure_metadata_table(&mut self, table: &str) -> Result<Arc<TableProperties>> {
        let props = self.table(table)?.clone();
        if let Some(meta) = &props.metadata_table {
            return Ok(self.table(meta)?.clone());
        }
        let meta_schema = Arc::new(TableSchema::metadata_for(&props.schema));
        let meta_name = metadata_name(table);
        if !self.tables.contains_key(&meta_name) {
            self.register_table(meta_schema)?;
        }
        let mut linked = (*props).clone();
        linked.metadata_table = Some(meta_name.clone());
        self.tables.insert(table.to_string(), Arc::new(linked));
        Ok(self.table(&meta_name)?.clone())
    }

    pub(crate) fn begin_transaction(&mut self, info: TxnInfo) {
        self.transactions.insert(info.id, info);
    }

    pub(crate) fn end_transaction(&mut self, id: TxnId) -> Option<TxnInfo> {
        self.transactions.remove(&id)
    }

    pub(crate) fn append_log(&mut self, table: &str, block: Arc<BlockBuilder>) -> Result<()> {
        if block.is_empty() {
            return Ok(());
        }
        self.table(table)?;
        self.logs.entry(table.to_string()).or_default().push(block);
        Ok(())
    }

    /// Remove `consumed` from the log of `table` and put `replacement` in
    /// their place at the front. Blocks committed after `consumed` was read
    /// stay behind it.
    pub(crate) fn replace_log_prefix(
        &mut self,
        table: &str,
        consumed: &[Arc<BlockBuilder>],
        replacement: Vec<Arc<BlockBuilder>>,
    ) -> Result<()> {
        let log = self.logs.entry(table.to_string()).or_default();
        for block in consumed {
            let Some(pos) = log.iter().position(|b| Arc::ptr_eq(b, block)) else {
                return Err(TesseraError::Consistency(format!(
                    "log block of {} vanished during a lifecycle pass",
                    table
                )));
            };
            log.remove(pos);
        }
        let rest = std::mem::take(log);
        log.extend(replacement.into_iter().filter(|b| !b.is_empty()));
        log.extend(rest);
        Ok(())
    }

    pub(crate) fn allocate_block_id(&mut self) -> BlockId {
        match self.free_blocks.pop() {
            Some(id) => id,
            None => {
                let id = self.next_block_id;
                self.next_block_id += 1;
                id
            }
        }
    }

    pub(crate) fn supersede(&mut self, ids: &[BlockId]) {
        self.pending_release.extend_from_slice(ids);
    }
}

/// Holder of the current [`DatabaseState`]
#[derive(Debug)]
pub struct StateCell {
    current: RwLock<Arc<DatabaseState>>,
    conflicts: AtomicU64,
}

impl StateCell {
    pub fn new(state: DatabaseState) -> Self {
        Self {
            current: RwLock::new(Arc::new(state)),
            conflicts: AtomicU64::new(0),
        }
    }

    pub fn load(&self) -> Arc<DatabaseState> {
        self.current.read().clone()
    }

    /// Number of transitions that lost a race and were retried
    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    /// Run `f` on a private copy of the current state and install the
    /// copy, retrying until no concurrent transition intervened. `f` may
    /// run several times and must not have side effects outside the copy.
    pub fn update<R>(&self, mut f: impl FnMut(&mut DatabaseState) -> Result<R>) -> Result<R> {
        for attempt in 0..MAX_CAS_ATTEMPTS {
            let current = self.load();
            let mut next = (*current).clone();
            let out = f(&mut next)?;
            next.version = current.version + 1;

            let mut guard = self.current.write();
            if Arc::ptr_eq(&guard, &current) {
                *guard = Arc::new(next);
                return Ok(out);
            }
            drop(guard);
            self.conflicts.fetch_add(1, Ordering::Relaxed);
            log::trace!("state transition lost a race (attempt {})", attempt + 1);
        }
        Err(TesseraError::Consistency(format!(
            "state transition did not settle after {} attempts",
            MAX_CAS_ATTEMPTS
        )))
    }

    /// Like [`StateCell::update`] for closures that may decline to change
    /// anything: `Ok(None)` leaves the current state installed.
    pub fn try_update<R>(
        &self,
        mut f: impl FnMut(&mut DatabaseState) -> Result<Option<R>>,
    ) -> Result<Option<R>> {
        for attempt in 0..MAX_CAS_ATTEMPTS {
            let current = self.load();
            let mut next = (*current).clone();
            let Some(out) = f(&mut next)? else {
                return Ok(None);
            };
            next.version = current.version + 1;

            let mut guard = self.current.write();
            if Arc::ptr_eq(&guard, &current) {
                *guard = Arc::new(next);
                return Ok(Some(out));
            }
            drop(guard);
            self.conflicts.fetch_add(1, Ordering::Relaxed);
            log::trace!("state transition lost a race (attempt {})", attempt + 1);
        }
        Err(TesseraError::Consistency(format!(
            "state transition did not settle after {} attempts",
            MAX_CAS_ATTEMPTS
        )))
    }
}

/// Rows of `blocks` as a single builder ordered by the table key
pub(crate) fn concat_blocks(
    schema: &Arc<TableSchema>,
    blocks: &[Arc<BlockBuilder>],
) -> Result<BlockBuilder> {
    let mut merged = BlockBuilder::new(schema.clone());
    for block in blocks {
        merged.append_block(&**block, None)?;
    }
    merged.order_by_record_id();
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ColumnDef, DataType, Value};
    use std::thread;

    fn schema() -> Arc<TableSchema> {
        Arc::new(TableSchema::new("t", vec![ColumnDef::new("n", DataType::Int64)]).unwrap())
    }

    fn block(rids: &[u64]) -> Arc<BlockBuilder> {
        let mut b = BlockBuilder::new(schema());
        for &rid in rids {
            b.append_record(rid, &[Value::Int64(rid as i64)]).unwrap();
        }
        Arc::new(b)
    }

    #[test]
    fn test_register_and_metadata_chain() {
        let mut state = DatabaseState::default();
        state.register_table(schema()).unwrap();
        assert!(matches!(
            state.register_table(schema()),
            Err(TesseraError::TableExists(_))
        ));

        let meta = state.ensure_metadata_table("t").unwrap();
        assert_eq!(meta.name(), "$meta:t");
        let meta2 = state.ensure_metadata_table("$meta:t").unwrap();
        assert_eq!(meta2.schema.level(), 2);

        let chain = state.metadata_chain("t").unwrap();
        let names: Vec<_> = chain.iter().map(|t| t.name().to_string()).collect();
        assert_eq!(names, vec!["t", "$meta:t", "$meta:$meta:t"]);
        assert_eq!(state.hierarchy_depth("t").unwrap(), 0);
    }

    #[test]
    fn test_replace_log_prefix_keeps_later_commits() {
        let mut state = DatabaseState::default();
        state.register_table(schema()).unwrap();
        let (a, b, c) = (block(&[1]), block(&[2]), block(&[3]));
        for blk in [&a, &b, &c] {
            state.append_log("t", blk.clone()).unwrap();
        }
        state
            .replace_log_prefix("t", &[a.clone(), b.clone()], vec![block(&[2])])
            .unwrap();
        let ids: Vec<_> = state
            .log("t")
            .iter()
            .flat_map(|b| b.record_ids().unwrap())
            .collect();
        assert_eq!(ids, vec![2, 3]);

        // consuming a block twice is a broken invariant
        assert!(matches!(
            state.replace_log_prefix("t", &[a], vec![]),
            Err(TesseraError::Consistency(_))
        ));
    }

    #[test]
    fn test_watermark_and_block_ids() {
        let mut state = DatabaseState::default();
        assert_eq!(state.record_watermark(50), 50);
        state.begin_transaction(TxnInfo {
            id: 1,
            record_floor: 20,
            read_only: false,
            started_at: Utc::now(),
        });
        state.begin_transaction(TxnInfo {
            id: 2,
            record_floor: u64::MAX,
            read_only: true,
            started_at: Utc::now(),
        });
        assert_eq!(state.record_watermark(50), 20);
        state.end_transaction(1);
        assert_eq!(state.record_watermark(50), 50);

        assert_eq!(state.allocate_block_id(), 0);
        assert_eq!(state.allocate_block_id(), 1);
        state.free_blocks.push(0);
        assert_eq!(state.allocate_block_id(), 0);
        assert_eq!(state.allocate_block_id(), 2);
    }

    #[test]
    fn test_concurrent_updates_are_linearized() {
        let cell = Arc::new(StateCell::new(DatabaseState::default()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cell = cell.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        cell.update(|s| Ok(s.allocate_block_id())).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let state = cell.load();
        assert_eq!(state.next_block_id, 1600);
        assert_eq!(state.version(), 1600);
    }

    #[test]
    fn test_try_update_can_decline() {
        let cell = StateCell::new(DatabaseState::default());
        let out: Option<()> = cell.try_update(|_| Ok(None)).unwrap();
        assert!(out.is_none());
        assert_eq!(cell.load().version(), 0);
    }
}
