//! Typed view of one metadata row

use std::sync::Arc;

use crate::block::{BlockBuilder, BlockRead, SerializedBlock};
use crate::data::{TableSchema, Value};
use crate::{BlockId, RecordId, Result, TesseraError};

/// Description of one persisted block: per-column bounds, size and id
#[derive(Debug, Clone, PartialEq)]
pub struct MetaRow {
    /// Own record id of the row inside its metadata table
    pub record_id: RecordId,
    /// (min, max) per stored column of the described table
    pub bounds: Vec<(Value, Value)>,
    pub item_count: usize,
    pub byte_size: usize,
    pub block_id: BlockId,
}

impl MetaRow {
    pub fn describe(block: &SerializedBlock, block_id: BlockId, record_id: RecordId) -> Self {
        Self {
            record_id,
            bounds: block.bounds(),
            item_count: block.item_count,
            byte_size: block.byte_size(),
            block_id,
        }
    }

    /// Read row `row` of a metadata block
    pub fn read<B: BlockRead + ?Sized>(block: &B, row: usize) -> Result<Self> {
        let schema = block.schema();
        let layout = schema.meta_layout().ok_or_else(|| {
            TesseraError::Consistency(format!("{} is not a metadata table", schema.name()))
        })?;
        let bounds = (0..layout.parent_columns())
            .map(|c| Ok((block.value(layout.min(c), row)?, block.value(layout.max(c), row)?)))
            .collect::<Result<Vec<_>>>()?;
        let int = |col: usize, what: &str| -> Result<i64> {
            block.value(col, row)?.as_i64().ok_or_else(|| {
                TesseraError::Corrupt(format!("metadata row {} of {} has no {}", row, schema.name(), what))
            })
        };
        Ok(Self {
            record_id: block.record_id(row)?,
            item_count: int(layout.item_count(), "item count")? as usize,
            byte_size: int(layout.byte_size(), "byte size")? as usize,
            block_id: int(layout.block_id(), "block id")? as BlockId,
            bounds,
        })
    }

    pub fn read_all<B: BlockRead + ?Sized>(block: &B) -> Result<Vec<Self>> {
        (0..block.row_count()).map(|row| Self::read(block, row)).collect()
    }

    pub fn read_rows<B: BlockRead + ?Sized>(block: &B, rows: &[usize]) -> Result<Vec<Self>> {
        rows.iter().map(|&row| Self::read(block, row)).collect()
    }

    /// Stored values in metadata column order, record id last
    pub fn to_values(&self) -> Vec<Value> {
        let mut values = Vec::with_capacity(2 * self.bounds.len() + 4);
        for (min, max) in &self.bounds {
            values.push(min.clone());
            values.push(max.clone());
        }
        values.push(Value::Int64(self.item_count as i64));
        values.push(Value::Int64(self.byte_size as i64));
        values.push(Value::Int64(self.block_id as i64));
        values.push(Value::Int64(self.record_id as i64));
        values
    }

    /// Data record-id range covered by the block, given the schema of the
    /// table the block belongs to
    pub fn key_range(&self, described: &TableSchema) -> Result<(i64, i64)> {
        let (lo, hi) = described.key_range_columns();
        let lo = self.bounds.get(lo).and_then(|b| b.0.as_i64());
        let hi = self.bounds.get(hi).and_then(|b| b.1.as_i64());
        match (lo, hi) {
            (Some(lo), Some(hi)) => Ok((lo, hi)),
            _ => Err(TesseraError::Corrupt(format!(
                "metadata row for block {} has no record-id bounds",
                self.block_id
            ))),
        }
    }

    /// Rows as a builder of the metadata table `meta`
    pub fn to_builder(meta: &Arc<TableSchema>, rows: &[MetaRow]) -> Result<BlockBuilder> {
        let mut builder = BlockBuilder::new(meta.clone());
        for row in rows {
            builder.append_row(&row.to_values())?;
        }
        Ok(builder)
    }
}
