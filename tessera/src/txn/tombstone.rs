//! Tombstones: soft-delete markers stored in the `$tombstones` table

use ahash::{AHashMap, AHashSet};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::block::BlockRead;
use crate::data::Value;
use crate::{BlockId, RecordId, Result, TesseraError};

const COL_RECORD_ID: usize = 0;
const COL_TABLE: usize = 1;
const COL_BLOCK_ID: usize = 2;
const COL_DELETED_AT: usize = 3;

/// A deleted record, by id, with its last known persisted block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TombstoneRecord {
    pub record_id: RecordId,
    pub table: String,
    /// `None` while the record lived in memory, or once the id went stale
    pub block_id: Option<BlockId>,
    pub deleted_at: DateTime<Utc>,
}

impl TombstoneRecord {
    pub fn new(record_id: RecordId, table: impl Into<String>, block_id: Option<BlockId>) -> Self {
        Self {
            record_id,
            table: table.into(),
            block_id,
            deleted_at: Utc::now(),
        }
    }

    /// User column values of the tombstone table
    pub fn to_values(&self) -> Vec<Value> {
        vec![
            Value::Int64(self.record_id as i64),
            Value::String(self.table.clone()),
            self.block_id
                .map_or(Value::Null, |id| Value::Int64(id as i64)),
            Value::Timestamp(self.deleted_at.timestamp_micros()),
        ]
    }

    pub fn read<B: BlockRead + ?Sized>(block: &B, row: usize) -> Result<Self> {
        let record_id = block
            .value(COL_RECORD_ID, row)?
            .as_i64()
            .ok_or_else(|| corrupt("record id"))? as RecordId;
        let table = match block.value(COL_TABLE, row)? {
            Value::String(s) => s,
            _ => return Err(corrupt("table")),
        };
        let block_id = block
            .value(COL_BLOCK_ID, row)?
            .as_i64()
            .map(|id| id as BlockId);
        let micros = match block.value(COL_DELETED_AT, row)? {
            Value::Timestamp(t) => t,
            _ => return Err(corrupt("deletion time")),
        };
        let deleted_at = Utc
            .timestamp_micros(micros)
            .single()
            .ok_or_else(|| corrupt("deletion time"))?;
        Ok(Self {
            record_id,
            table,
            block_id,
            deleted_at,
        })
    }

    pub fn read_all<B: BlockRead + ?Sized>(block: &B) -> Result<Vec<Self>> {
        (0..block.row_count()).map(|row| Self::read(block, row)).collect()
    }
}

fn corrupt(what: &str) -> TesseraError {
    TesseraError::Corrupt(format!("tombstone row has an invalid {}", what))
}

/// Tombstoned record ids per table
#[derive(Debug, Default, Clone)]
pub struct TombstoneIndex {
    by_table: AHashMap<String, AHashSet<RecordId>>,
    rows: usize,
}

impl TombstoneIndex {
    pub fn from_blocks<'a, B, I>(blocks: I) -> Result<Self>
    where
        B: BlockRead + ?Sized + 'a,
        I: IntoIterator<Item = &'a B>,
    {
        let mut index = Self::default();
        for block in blocks {
            for row in 0..block.row_count() {
                index.insert(&TombstoneRecord::read(block, row)?);
            }
        }
        Ok(index)
    }

    pub fn insert(&mut self, tombstone: &TombstoneRecord) {
        self.rows += 1;
        self.by_table
            .entry(tombstone.table.clone())
            .or_default()
            .insert(tombstone.record_id);
    }

    pub fn is_deleted(&self, table: &str, record_id: RecordId) -> bool {
        self.by_table
            .get(table)
            .map_or(false, |ids| ids.contains(&record_id))
    }

    /// Distinct deleted ids of `table`
    pub fn deleted(&self, table: &str) -> Option<&AHashSet<RecordId>> {
        self.by_table.get(table)
    }

    /// Tombstone rows seen, duplicates included
    pub fn row_count(&self) -> usize {
        self.rows
    }

    /// Tables with tombstones and their distinct deleted id counts
    pub fn counts(&self) -> Vec<(String, usize)> {
        let mut counts: Vec<_> = self
            .by_table
            .iter()
            .map(|(t, ids)| (t.clone(), ids.len()))
            .collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockBuilder;
    use crate::data::TableSchema;
    use std::sync::Arc;

    #[test]
    fn test_tombstone_row_round_trip() {
        let schema = Arc::new(TableSchema::tombstones());
        let mut block = BlockBuilder::new(schema);
        let stones = vec![
            TombstoneRecord::new(7, "users", Some(3)),
            TombstoneRecord::new(9, "users", None),
            TombstoneRecord::new(7, "users", None),
            TombstoneRecord::new(1, "orders", None),
        ];
        for (i, t) in stones.iter().enumerate() {
            block.append_record(100 + i as u64, &t.to_values()).unwrap();
        }

        let read = TombstoneRecord::read_all(&block).unwrap();
        assert_eq!(read[0].block_id, Some(3));
        assert_eq!(read[1].table, "users");
        assert_eq!(
            read[0].deleted_at.timestamp_micros(),
            stones[0].deleted_at.timestamp_micros()
        );

        let index = TombstoneIndex::from_blocks([&block]).unwrap();
        assert_eq!(index.row_count(), 4);
        assert!(index.is_deleted("users", 9));
        assert!(!index.is_deleted("orders", 9));
        assert_eq!(index.counts(), vec![("users".to_string(), 2), ("orders".to_string(), 1)]);
    }
}
