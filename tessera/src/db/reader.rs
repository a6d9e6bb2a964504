//! Snapshot reads through the metadata hierarchy
//!
//! The committed rows of a table are its persisted blocks followed by its
//! in-memory log. Persisted blocks are found through the table's metadata
//! table, whose own rows are found the same way one level up:
//!
//! ```text
//!   visit(T, p)
//!     ├─ block_rows(T, p) = visit($meta:T, translate(p)) ─► load + filter blocks
//!     └─ filter log(T)
//! ```

use std::sync::Arc;

use rayon::prelude::*;

use super::inner::DbInner;
use crate::block::{BlockRead, ReadOnlyBlock};
use crate::compaction::MetaRow;
use crate::data::TOMBSTONE_TABLE;
use crate::query::predicate::Predicate;
use crate::query::range;
use crate::txn::{DatabaseState, TableProperties, TombstoneIndex};
use crate::Result;

/// Callback receiving a block and the ascending rows that matched
pub(crate) type Visitor<'v> = dyn FnMut(&dyn BlockRead, &[usize]) -> Result<()> + 'v;

pub(crate) struct Reader<'a> {
    inner: &'a DbInner,
    state: &'a DatabaseState,
}

impl<'a> Reader<'a> {
    pub fn new(inner: &'a DbInner, state: &'a DatabaseState) -> Self {
        Self { inner, state }
    }

    /// Metadata rows of the persisted blocks of `table` that may hold rows
    /// matching `predicate`
    pub fn block_rows(&self, table: &TableProperties, predicate: &Predicate) -> Result<Vec<MetaRow>> {
        let Some(meta_name) = &table.metadata_table else {
            return Ok(Vec::new());
        };
        let meta = self.state.table(meta_name)?;
        let meta_predicate = range::translate(predicate, &table.schema, &meta.schema);
        let mut rows = Vec::new();
        self.visit(meta, &meta_predicate, &mut |block: &dyn BlockRead, matched: &[usize]| {
            rows.extend(MetaRow::read_rows(block, matched)?);
            Ok(())
        })?;
        Ok(rows)
    }

    /// Every committed block of `table` with rows matching `predicate`,
    /// persisted blocks first, in key order
    pub fn visit(
        &self,
        table: &TableProperties,
        predicate: &Predicate,
        visitor: &mut Visitor<'_>,
    ) -> Result<()> {
        let mut rows = self.block_rows(table, predicate)?;
        rows.sort_by_key(|r| r.key_range(&table.schema).map_or(i64::MIN, |(lo, _)| lo));

        let schema = &table.schema;
        let hits: Vec<(Arc<ReadOnlyBlock>, Vec<usize>)> = rows
            .par_iter()
            .map(|row| {
                let block = self.inner.load_block(schema, row)?;
                let matched = block.filter(predicate)?;
                Ok((block, matched))
            })
            .collect::<Result<Vec<_>>>()?;
        for (block, matched) in hits {
            if !matched.is_empty() {
                visitor(&*block, &matched)?;
            }
        }

        for block in self.state.log(table.name()) {
            let matched = block.filter(predicate)?;
            if !matched.is_empty() {
                visitor(&**block, &matched)?;
            }
        }
        Ok(())
    }

    /// Tombstones committed in the snapshot
    pub fn tombstones(&self) -> Result<TombstoneIndex> {
        TombstoneIndex::from_blocks(self.state.log(TOMBSTONE_TABLE).iter().map(|b| &**b))
    }

    /// Metadata rows of every persisted block of `table`
    pub fn all_block_rows(&self, table: &TableProperties) -> Result<Vec<MetaRow>> {
        self.block_rows(table, &Predicate::All)
    }
}
