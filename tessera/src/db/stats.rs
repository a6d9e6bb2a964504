//! Database and table statistics

use serde::Serialize;

use super::inner::Counters;
use super::reader::Reader;
use super::Database;
use crate::cache::CacheStats;
use crate::data::TOMBSTONE_TABLE;
use crate::{RecordId, Result};

/// Engine-wide counters and gauges
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseStatistics {
    pub state_version: u64,
    pub next_record_id: RecordId,
    /// Rows in the in-memory logs of host tables
    pub in_memory_data_rows: usize,
    /// Rows in the in-memory logs of metadata tables
    pub in_memory_meta_rows: usize,
    pub in_memory_tombstones: usize,
    /// Deepest metadata level holding rows, over all tables
    pub max_hierarchy_depth: usize,
    pub persisted_blocks: usize,
    pub pending_release: usize,
    pub free_blocks: usize,
    pub active_transactions: usize,
    pub commits: u64,
    pub rollbacks: u64,
    pub state_conflicts: u64,
    pub lifecycle_batches: u64,
    pub blocks_written: u64,
    pub blocks_released: u64,
    pub records_hard_deleted: u64,
    #[serde(skip)]
    pub cache: CacheStats,
}

/// Shape of one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableStatistics {
    pub in_memory_rows: usize,
    pub log_blocks: usize,
    pub persisted_rows: usize,
    pub persisted_blocks: usize,
    /// Outstanding tombstones of the table
    pub tombstones: usize,
    pub hierarchy_depth: usize,
}

impl Database {
    pub fn statistics(&self) -> Result<DatabaseStatistics> {
        let inner = self.inner();
        let state = inner.state.load();
        let mut data_rows = 0;
        let mut meta_rows = 0;
        let mut depth = 0;
        for props in state.tables() {
            let rows = state.in_memory_rows(props.name());
            if props.schema.is_metadata() {
                meta_rows += rows;
            } else if !props.schema.is_system() {
                data_rows += rows;
                depth = depth.max(state.hierarchy_depth(props.name())?);
            }
        }
        let counters = &inner.counters;
        Ok(DatabaseStatistics {
            state_version: state.version(),
            next_record_id: inner.peek_record_id(),
            in_memory_data_rows: data_rows,
            in_memory_meta_rows: meta_rows,
            in_memory_tombstones: state.in_memory_rows(TOMBSTONE_TABLE),
            max_hierarchy_depth: depth,
            persisted_blocks: inner.store.block_count(),
            pending_release: state.pending_release().len(),
            free_blocks: state.free_blocks().len(),
            active_transactions: state.active_transactions(),
            commits: Counters::get(&counters.commits),
            rollbacks: Counters::get(&counters.rollbacks),
            state_conflicts: inner.state.conflicts(),
            lifecycle_batches: Counters::get(&counters.lifecycle_batches),
            blocks_written: Counters::get(&counters.blocks_written),
            blocks_released: Counters::get(&counters.blocks_released),
            records_hard_deleted: Counters::get(&counters.records_hard_deleted),
            cache: inner.cache.stats(),
        })
    }

    /// Statistics of one table, read inside a read-only transaction so no
    /// block it walks is released meanwhile
    pub fn table_statistics(&self, table: &str) -> Result<TableStatistics> {
        let inner = self.inner();
        let txn = inner.begin(true)?;
        let state = txn.snapshot().clone();
        let props = state.table(table)?;
        let reader = Reader::new(inner, &state);
        let blocks = reader.all_block_rows(props)?;
        let tombstones = reader
            .tombstones()?
            .deleted(table)
            .map_or(0, |ids| ids.len());
        let stats = TableStatistics {
            in_memory_rows: state.in_memory_rows(table),
            log_blocks: state.log(table).len(),
            persisted_rows: blocks.iter().map(|b| b.item_count).sum(),
            persisted_blocks: blocks.len(),
            tombstones,
            hierarchy_depth: state.hierarchy_depth(table)?,
        };
        txn.commit()?;
        Ok(stats)
    }
}
