//! Mutable in-memory block
//!
//! A `BlockBuilder` accumulates rows for one table. Transactions append to
//! builders in their delta; committed builders sit in the table's in-memory
//! log (shared as `Arc`, never mutated again) until the lifecycle agents
//! merge, persist or compact them into fresh builders.

use std::sync::Arc;

use ahash::AHashSet;

use super::format::{self, SerializedBlock};
use super::BlockRead;
use crate::column::Column;
use crate::data::{TableSchema, Value};
use crate::{BlockId, RecordId, Result, TesseraError};

#[derive(Debug, Clone)]
pub struct BlockBuilder {
    schema: Arc<TableSchema>,
    columns: Vec<Column>,
}

impl BlockBuilder {
    pub fn new(schema: Arc<TableSchema>) -> Self {
        let columns = schema
            .columns()
            .iter()
            .map(|c| Column::new(c.data_type, c.nullable))
            .collect();
        Self { schema, columns }
    }

    pub(crate) fn from_columns(schema: Arc<TableSchema>, columns: Vec<Column>) -> Result<Self> {
        if columns.len() != schema.column_count() {
            return Err(TesseraError::ArityMismatch {
                expected: schema.column_count(),
                actual: columns.len(),
            });
        }
        let len = columns.first().map_or(0, Column::len);
        if columns.iter().any(|c| c.len() != len) {
            return Err(TesseraError::Consistency(format!(
                "ragged columns building a block of {}",
                schema.name()
            )));
        }
        Ok(Self { schema, columns })
    }

    pub fn len(&self) -> usize {
        self.columns.first().map_or(0, Column::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append one record: the user column values plus its record id.
    /// Either every column receives the value or none does.
    pub fn append_record(&mut self, record_id: RecordId, values: &[Value]) -> Result<()> {
        let user = self.schema.user_column_count();
        if values.len() != user {
            return Err(TesseraError::ArityMismatch {
                expected: user,
                actual: values.len(),
            });
        }
        for (i, value) in values.iter().enumerate() {
            self.columns[i].check(value, self.schema.column_name(i))?;
        }
        for (i, value) in values.iter().enumerate() {
            self.columns[i].push(value, self.schema.column_name(i))?;
        }
        let rid = self.schema.record_id_column();
        self.columns[rid].push(&Value::Int64(record_id as i64), self.schema.column_name(rid))
    }

    /// Append a full stored row, record id included as the last value
    pub fn append_row(&mut self, values: &[Value]) -> Result<()> {
        let n = self.schema.column_count();
        if values.len() != n {
            return Err(TesseraError::ArityMismatch {
                expected: n,
                actual: values.len(),
            });
        }
        for (i, value) in values.iter().enumerate() {
            self.columns[i].check(value, self.schema.column_name(i))?;
        }
        for (i, value) in values.iter().enumerate() {
            self.columns[i].push(value, self.schema.column_name(i))?;
        }
        Ok(())
    }

    /// Append rows of another block of the same table shape. `None` copies
    /// every row.
    pub fn append_block<B: BlockRead + ?Sized>(&mut self, other: &B, rows: Option<&[usize]>) -> Result<()> {
        if !self.schema.same_columns(other.schema()) {
            return Err(TesseraError::SchemaMismatch(format!(
                "cannot append a block of {} to {}",
                other.schema().name(),
                self.schema.name()
            )));
        }
        for i in 0..self.columns.len() {
            let src = other.column(i)?;
            let name = self.schema.column_name(i);
            match rows {
                Some(rows) => self.columns[i].extend_rows(src, rows, name)?,
                None => self.columns[i].extend(src, name)?,
            }
        }
        Ok(())
    }

    /// Remove rows at ascending, unique positions
    pub fn delete_rows(&mut self, rows: &[usize]) {
        for col in &mut self.columns {
            col.delete_sorted(rows);
        }
    }

    /// Remove every row whose record id is in `ids`; returns the removed ids
    pub fn delete_records_by_id(&mut self, ids: &AHashSet<RecordId>) -> Vec<RecordId> {
        if ids.is_empty() {
            return Vec::new();
        }
        let rid = &self.columns[self.schema.record_id_column()];
        let mut rows = Vec::new();
        let mut removed = Vec::new();
        for row in 0..rid.len() {
            if let Some(id) = rid.get_i64(row) {
                if ids.contains(&(id as RecordId)) {
                    rows.push(row);
                    removed.push(id as RecordId);
                }
            }
        }
        self.delete_rows(&rows);
        removed
    }

    /// Stable sort of rows by the table's key column (the record id, or
    /// the propagated minimum record id for metadata tables).
    pub fn order_by_record_id(&mut self) {
        if self.is_ordered() {
            return;
        }
        let key = &self.columns[self.schema.key_column()];
        let mut perm: Vec<usize> = (0..self.len()).collect();
        perm.sort_by_key(|&row| key.get_i64(row));
        self.columns = self.columns.iter().map(|c| c.select(&perm)).collect();
    }

    pub fn is_ordered(&self) -> bool {
        let key = &self.columns[self.schema.key_column()];
        (1..key.len()).all(|row| key.get_i64(row - 1) <= key.get_i64(row))
    }

    /// Lowest and highest data record id covered by the rows
    pub fn key_range(&self) -> Option<(i64, i64)> {
        let (lo, hi) = self.schema.key_range_columns();
        let lo_col = &self.columns[lo];
        let hi_col = &self.columns[hi];
        let min = (0..self.len()).filter_map(|r| lo_col.get_i64(r)).min()?;
        let max = (0..self.len()).filter_map(|r| hi_col.get_i64(r)).max()?;
        Some((min, max))
    }

    pub fn select(&self, rows: &[usize]) -> BlockBuilder {
        BlockBuilder {
            schema: self.schema.clone(),
            columns: self.columns.iter().map(|c| c.select(rows)).collect(),
        }
    }

    /// Move rows `at..` into a new builder
    pub fn split_off(&mut self, at: usize) -> BlockBuilder {
        let len = self.len();
        let tail: Vec<usize> = (at.min(len)..len).collect();
        let rest = self.select(&tail);
        self.delete_rows(&tail);
        rest
    }

    /// Bytes the first `n` rows would occupy once serialized
    pub fn serialized_size(&self, n: usize) -> usize {
        format::header_len(self.columns.len())
            + self.columns.iter().map(|c| c.encoded_len(n)).sum::<usize>()
    }

    pub fn serialize(&self) -> Result<SerializedBlock> {
        self.serialize_prefix(self.len())
    }

    pub fn serialize_prefix(&self, n: usize) -> Result<SerializedBlock> {
        let encoded = self.columns.iter().map(|c| c.encode(n)).collect();
        format::write_block(n, encoded)
    }

    /// Longest prefix whose serialized size fits `max_bytes`, found by
    /// exponential bracketing then interpolated bisection. The search stops
    /// early once the fitting prefix is within `tolerance` of the budget.
    pub fn fitting_prefix(&self, max_bytes: usize, tolerance: f64) -> Result<usize> {
        let n = self.len();
        if n == 0 {
            return Ok(0);
        }
        let mut hi_size = self.serialized_size(n);
        if hi_size <= max_bytes {
            return Ok(n);
        }
        let mut lo_size = self.serialized_size(1);
        if lo_size > max_bytes {
            return Err(TesseraError::RecordTooLarge(max_bytes));
        }

        let mut lo = 1;
        let mut hi = n;
        let mut candidate = 2;
        while candidate < hi {
            let size = self.serialized_size(candidate);
            if size <= max_bytes {
                lo = candidate;
                lo_size = size;
                candidate *= 2;
            } else {
                hi = candidate;
                hi_size = size;
                break;
            }
        }

        let slack = (max_bytes as f64 * tolerance) as usize;
        let mut step = 0u32;
        while hi - lo > 1 && max_bytes - lo_size > slack {
            let guess = if step % 2 == 0 && hi_size > lo_size {
                let frac = (max_bytes - lo_size) as f64 / (hi_size - lo_size) as f64;
                lo + ((hi - lo) as f64 * frac) as usize
            } else {
                lo + (hi - lo) / 2
            };
            let guess = guess.clamp(lo + 1, hi - 1);
            let size = self.serialized_size(guess);
            if size <= max_bytes {
                lo = guess;
                lo_size = size;
            } else {
                hi = guess;
                hi_size = size;
            }
            step += 1;
        }
        Ok(lo)
    }

    /// Longest prefix fitting `max_bytes`, as a new builder
    pub fn truncate(&self, max_bytes: usize, tolerance: f64) -> Result<BlockBuilder> {
        let n = self.fitting_prefix(max_bytes, tolerance)?;
        let rows: Vec<usize> = (0..n).collect();
        Ok(self.select(&rows))
    }
}

impl BlockRead for BlockBuilder {
    fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    fn row_count(&self) -> usize {
        self.len()
    }

    fn block_id(&self) -> Option<BlockId> {
        None
    }

    fn column(&self, idx: usize) -> Result<&Column> {
        self.columns
            .get(idx)
            .ok_or_else(|| TesseraError::ColumnNotFound(format!("{}#{}", self.schema.name(), idx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ColumnDef, DataType};

    fn schema() -> Arc<TableSchema> {
        Arc::new(
            TableSchema::new(
                "events",
                vec![
                    ColumnDef::new("kind", DataType::String),
                    ColumnDef::new("value", DataType::Int64).nullable(true),
                ],
            )
            .unwrap(),
        )
    }

    fn filled(n: u64) -> BlockBuilder {
        let mut block = BlockBuilder::new(schema());
        for i in 0..n {
            block
                .append_record(i, &[Value::String(format!("kind-{}", i * 7919 % 1000)), Value::Int64(i as i64 * 31)])
                .unwrap();
        }
        block
    }

    #[test]
    fn test_append_is_atomic() {
        let mut block = BlockBuilder::new(schema());
        let err = block.append_record(1, &[Value::from("a"), Value::from("not an int")]);
        assert!(err.is_err());
        assert_eq!(block.len(), 0);
        assert_eq!(block.column(0).unwrap().len(), 0);

        assert!(matches!(
            block.append_record(1, &[Value::from("a")]),
            Err(TesseraError::ArityMismatch { .. })
        ));
        block.append_record(1, &[Value::from("a"), Value::Null]).unwrap();
        assert_eq!(block.record_id(0).unwrap(), 1);
    }

    #[test]
    fn test_delete_and_order() {
        let mut block = BlockBuilder::new(schema());
        for rid in [5u64, 2, 9, 1] {
            block.append_record(rid, &[Value::from("k"), Value::Int64(rid as i64)]).unwrap();
        }
        assert!(!block.is_ordered());
        block.order_by_record_id();
        assert_eq!(block.record_ids().unwrap(), vec![1, 2, 5, 9]);
        assert_eq!(block.key_range(), Some((1, 9)));

        let ids: AHashSet<RecordId> = [2, 9, 42].into_iter().collect();
        let mut removed = block.delete_records_by_id(&ids);
        removed.sort();
        assert_eq!(removed, vec![2, 9]);
        assert_eq!(block.record_ids().unwrap(), vec![1, 5]);
    }

    #[test]
    fn test_truncate_fits_budget() {
        let block = filled(2000);
        let budget = 2048;
        let head = block.truncate(budget, 0.02).unwrap();
        assert!(head.len() > 0 && head.len() < block.len());
        assert!(head.serialize().unwrap().byte_size() <= budget);
        // one more row must not fit within tolerance of the budget
        let next = block.serialized_size(head.len() + 1);
        assert!(next > budget || budget - head.serialized_size(head.len()) <= budget / 50);
    }

    #[test]
    fn test_truncate_record_too_large() {
        let mut block = BlockBuilder::new(schema());
        for (rid, c) in [(1u64, 'x'), (2, 'y'), (3, 'z')] {
            block
                .append_record(rid, &[Value::String(c.to_string().repeat(500)), Value::Null])
                .unwrap();
        }
        // the header alone exceeds the budget
        assert!(matches!(block.truncate(4, 0.0), Err(TesseraError::RecordTooLarge(4))));
        // min and max travel in statistics; the third string does not fit
        assert_eq!(block.truncate(64, 0.0).unwrap().len(), 2);
        assert_eq!(block.truncate(4096, 0.0).unwrap().len(), 3);
    }

    #[test]
    fn test_truncate_random_budgets() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(7);
        let mut block = BlockBuilder::new(schema());
        for rid in 0..500u64 {
            let kind = "k".repeat(rng.gen_range(1..40));
            let value = if rng.gen_bool(0.1) {
                Value::Null
            } else {
                Value::Int64(rng.gen_range(-1_000_000..1_000_000))
            };
            block.append_record(rid, &[Value::String(kind), value]).unwrap();
        }

        let smallest = block.serialized_size(1);
        for _ in 0..50 {
            let budget = rng.gen_range(smallest..smallest * 40);
            let head = block.truncate(budget, 0.0).unwrap();
            assert!(!head.is_empty());
            assert!(head.serialize().unwrap().byte_size() <= budget);
            if head.len() < block.len() {
                let size = head.serialized_size(head.len());
                assert!(block.serialized_size(head.len() + 1) > budget || size == budget);
            }
        }
    }

    #[test]
    fn test_split_off() {
        let mut block = filled(10);
        let tail = block.split_off(7);
        assert_eq!(block.len(), 7);
        assert_eq!(tail.record_ids().unwrap(), vec![7, 8, 9]);
    }
}
