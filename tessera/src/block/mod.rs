//! Blocks: the unit of storage
//!
//! A block is a set of rows of one table stored column by column. Two forms
//! share the [`BlockRead`] surface:
//!
//! - [`BlockBuilder`]: mutable, lives in transaction deltas and in-memory logs
//! - [`ReadOnlyBlock`]: immutable, backed by the serialized bytes of a
//!   persisted block, decoding columns on demand

mod builder;
pub mod format;
mod readonly;

pub use builder::BlockBuilder;
pub use format::SerializedBlock;
pub use readonly::ReadOnlyBlock;

use std::sync::Arc;

use crate::column::Column;
use crate::data::{TableSchema, Value};
use crate::query::predicate::{self, Predicate};
use crate::{BlockId, RecordId, Result, TesseraError};

/// Read access shared by mutable and persisted blocks
pub trait BlockRead: Send + Sync {
    fn schema(&self) -> &Arc<TableSchema>;

    fn row_count(&self) -> usize;

    /// Id of the persisted block, `None` for in-memory blocks
    fn block_id(&self) -> Option<BlockId>;

    /// Stored column by position
    fn column(&self, idx: usize) -> Result<&Column>;

    /// Value of a stored or virtual column
    fn value(&self, col: usize, row: usize) -> Result<Value> {
        let schema = self.schema();
        if col == schema.row_index_column() {
            return Ok(Value::Int64(row as i64));
        }
        if col == schema.block_id_column() {
            return Ok(self
                .block_id()
                .map_or(Value::Null, |id| Value::Int64(id as i64)));
        }
        Ok(self.column(col)?.get(row))
    }

    fn record_id(&self, row: usize) -> Result<RecordId> {
        let rid = self.schema().record_id_column();
        self.column(rid)?
            .get_i64(row)
            .map(|v| v as RecordId)
            .ok_or_else(|| TesseraError::Corrupt(format!("row {} has a null record id", row)))
    }

    fn record_ids(&self) -> Result<Vec<RecordId>> {
        (0..self.row_count()).map(|row| self.record_id(row)).collect()
    }

    /// Stored values of one row, record id last
    fn row(&self, row: usize) -> Result<Vec<Value>> {
        (0..self.schema().column_count())
            .map(|col| self.value(col, row))
            .collect()
    }

    /// Ascending indexes of the rows satisfying `predicate`
    fn filter(&self, predicate: &Predicate) -> Result<Vec<usize>> {
        predicate::resolve(self, predicate)
    }

    /// Values of `columns` (stored or virtual) for each of `rows`
    fn project(&self, columns: &[usize], rows: &[usize]) -> Result<Vec<Vec<Value>>> {
        rows.iter()
            .map(|&row| columns.iter().map(|&col| self.value(col, row)).collect())
            .collect()
    }
}
