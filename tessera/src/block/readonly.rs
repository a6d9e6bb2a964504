//! Immutable block backed by serialized bytes
//!
//! Columns decode lazily on first access and stay cached for the lifetime
//! of the block, so a filter touching one column never decodes the rest.

use std::sync::Arc;

use once_cell::sync::OnceCell;

use super::builder::BlockBuilder;
use super::format::{self, SerializedBlock};
use super::BlockRead;
use crate::column::{Column, ColumnMeta};
use crate::data::{TableSchema, Value};
use crate::{BlockId, Result, TesseraError};

pub struct ReadOnlyBlock {
    schema: Arc<TableSchema>,
    block_id: Option<BlockId>,
    item_count: usize,
    bytes: Arc<[u8]>,
    metas: Vec<ColumnMeta>,
    payloads: Vec<std::ops::Range<usize>>,
    columns: Vec<OnceCell<Column>>,
}

impl std::fmt::Debug for ReadOnlyBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadOnlyBlock")
            .field("table", &self.schema.name())
            .field("block_id", &self.block_id)
            .field("item_count", &self.item_count)
            .field("byte_size", &self.bytes.len())
            .finish()
    }
}

impl ReadOnlyBlock {
    /// Wrap stored bytes. `bounds` are the per-column (min, max) values
    /// recorded in the block's metadata row.
    pub fn open(
        schema: Arc<TableSchema>,
        block_id: Option<BlockId>,
        item_count: usize,
        bounds: Vec<(Value, Value)>,
        bytes: Arc<[u8]>,
    ) -> Result<Self> {
        let ncols = schema.column_count();
        if bounds.len() != ncols {
            return Err(TesseraError::Corrupt(format!(
                "block of {} described by {} column bounds, expected {}",
                schema.name(),
                bounds.len(),
                ncols
            )));
        }
        let layout = format::read_layout(ncols, &bytes)?;
        let metas = bounds
            .into_iter()
            .enumerate()
            .map(|(i, (min, max))| ColumnMeta {
                has_nulls: layout.has_nulls.get(i),
                min,
                max,
            })
            .collect();
        Ok(Self {
            columns: (0..ncols).map(|_| OnceCell::new()).collect(),
            schema,
            block_id,
            item_count,
            bytes,
            metas,
            payloads: layout.payloads,
        })
    }

    pub fn from_serialized(
        schema: Arc<TableSchema>,
        block_id: Option<BlockId>,
        block: &SerializedBlock,
    ) -> Result<Self> {
        Self::open(
            schema,
            block_id,
            block.item_count,
            block.bounds(),
            Arc::from(block.bytes.as_slice()),
        )
    }

    pub fn byte_size(&self) -> usize {
        self.bytes.len()
    }

    pub fn column_meta(&self, idx: usize) -> Option<&ColumnMeta> {
        self.metas.get(idx)
    }

    /// Number of columns decoded so far
    pub fn decoded_columns(&self) -> usize {
        self.columns.iter().filter(|c| c.get().is_some()).count()
    }

    /// Mutable copy of every row
    pub fn to_builder(&self) -> Result<BlockBuilder> {
        let columns = (0..self.schema.column_count())
            .map(|i| self.column(i).cloned())
            .collect::<Result<Vec<_>>>()?;
        BlockBuilder::from_columns(self.schema.clone(), columns)
    }
}

impl BlockRead for ReadOnlyBlock {
    fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    fn row_count(&self) -> usize {
        self.item_count
    }

    fn block_id(&self) -> Option<BlockId> {
        self.block_id
    }

    fn column(&self, idx: usize) -> Result<&Column> {
        let cell = self
            .columns
            .get(idx)
            .ok_or_else(|| TesseraError::ColumnNotFound(format!("{}#{}", self.schema.name(), idx)))?;
        cell.get_or_try_init(|| {
            let def = &self.schema.columns()[idx];
            Column::decode(
                def.data_type,
                def.nullable,
                self.item_count,
                &self.metas[idx],
                &self.bytes[self.payloads[idx].clone()],
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ColumnDef, DataType};
    use crate::query::{CompareOp, Predicate};

    fn sample() -> BlockBuilder {
        let schema = Arc::new(
            TableSchema::new(
                "points",
                vec![
                    ColumnDef::new("x", DataType::Int64),
                    ColumnDef::new("label", DataType::String).nullable(true),
                ],
            )
            .unwrap(),
        );
        let mut block = BlockBuilder::new(schema);
        for i in 0..100u64 {
            let label = if i % 10 == 0 { Value::Null } else { Value::String(format!("l{}", i % 7)) };
            block.append_record(1000 + i, &[Value::Int64(i as i64 * 3), label]).unwrap();
        }
        block
    }

    #[test]
    fn test_round_trip_through_bytes() {
        let builder = sample();
        let serialized = builder.serialize().unwrap();
        let block =
            ReadOnlyBlock::from_serialized(builder.schema().clone(), Some(7), &serialized).unwrap();
        assert_eq!(block.row_count(), 100);
        assert_eq!(block.block_id(), Some(7));
        for row in [0usize, 10, 55, 99] {
            assert_eq!(block.row(row).unwrap(), builder.row(row).unwrap());
        }
        assert_eq!(
            block.value(block.schema().block_id_column(), 3).unwrap(),
            Value::Int64(7)
        );
    }

    #[test]
    fn test_columns_decode_lazily() {
        let builder = sample();
        let serialized = builder.serialize().unwrap();
        let block = ReadOnlyBlock::from_serialized(builder.schema().clone(), None, &serialized).unwrap();
        assert_eq!(block.decoded_columns(), 0);

        let hits = block
            .filter(&Predicate::Compare {
                column: 0,
                op: CompareOp::LessThan,
                value: Value::Int64(9),
            })
            .unwrap();
        assert_eq!(hits, vec![0, 1, 2]);
        assert_eq!(block.decoded_columns(), 1);
    }

    #[test]
    fn test_rejects_wrong_bounds() {
        let builder = sample();
        let serialized = builder.serialize().unwrap();
        let bytes: Arc<[u8]> = Arc::from(serialized.bytes.as_slice());
        assert!(ReadOnlyBlock::open(builder.schema().clone(), None, 100, vec![], bytes).is_err());
    }
}
