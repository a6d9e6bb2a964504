//! Block writing and same-level merging

use std::sync::Arc;

use super::facade::BlockFacade;
use super::meta_row::MetaRow;
use crate::block::{BlockBuilder, BlockRead, ReadOnlyBlock};
use crate::db::inner::{Counters, DbInner};
use crate::data::TableSchema;
use crate::txn::DatabaseState;
use crate::{BlockId, Result};

/// Bookkeeping of one compaction pass: the snapshot it reads, the blocks it
/// wrote and the persisted blocks its result replaces
pub(crate) struct Compactor<'a> {
    inner: &'a DbInner,
    snapshot: Arc<DatabaseState>,
    written: Vec<BlockId>,
    superseded: Vec<BlockId>,
}

impl<'a> Compactor<'a> {
    pub fn new(inner: &'a DbInner, snapshot: Arc<DatabaseState>) -> Self {
        Self {
            inner,
            snapshot,
            written: Vec::new(),
            superseded: Vec::new(),
        }
    }

    pub fn snapshot(&self) -> &Arc<DatabaseState> {
        &self.snapshot
    }

    pub fn inner(&self) -> &'a DbInner {
        self.inner
    }

    pub fn budget(&self, schema: &TableSchema) -> usize {
        self.inner.config.block_budget(schema.level())
    }

    pub fn load(&self, schema: &Arc<TableSchema>, row: &MetaRow) -> Result<Arc<ReadOnlyBlock>> {
        self.inner.load_block(schema, row)
    }

    /// Persist `block` under a fresh block id and describe it
    pub fn write(&mut self, block: &BlockBuilder) -> Result<MetaRow> {
        let serialized = block.serialize()?;
        let id = self.inner.state.update(|s| Ok(s.allocate_block_id()))?;
        self.written.push(id);
        self.inner.store.write(id, &serialized.bytes)?;
        Counters::bump(&self.inner.counters.blocks_written, 1);
        log::trace!(
            "wrote block {} of {} ({} rows, {} bytes)",
            id,
            block.schema().name(),
            serialized.item_count,
            serialized.byte_size()
        );
        Ok(MetaRow::describe(&serialized, id, self.inner.allocate_record_id()))
    }

    /// Persist the rows of `block` in key order, as many blocks as the
    /// level's byte budget requires
    pub fn write_chunks(&mut self, mut block: BlockBuilder) -> Result<Vec<MetaRow>> {
        block.order_by_record_id();
        let budget = self.budget(block.schema());
        let tolerance = self.inner.config.truncate_tolerance;
        let mut rows = Vec::new();
        while !block.is_empty() {
            let n = block.fitting_prefix(budget, tolerance)?;
            let rest = block.split_off(n);
            rows.push(self.write(&block)?);
            block = rest;
        }
        Ok(rows)
    }

    pub fn supersede(&mut self, ids: impl IntoIterator<Item = BlockId>) {
        self.superseded.extend(ids);
    }

    pub fn superseded(&self) -> &[BlockId] {
        &self.superseded
    }

    /// Give back the blocks written by a pass that failed before it was
    /// installed
    pub fn abandon(self) {
        if self.written.is_empty() {
            return;
        }
        for &id in &self.written {
            if let Err(e) = self.inner.store.remove(id) {
                log::warn!("could not remove abandoned block {}: {}", id, e);
            }
        }
        let ids = self.written;
        if let Err(e) = self.inner.state.update(|s| {
            s.free_blocks.extend_from_slice(&ids);
            Ok(())
        }) {
            log::warn!("could not return {} abandoned block ids: {}", ids.len(), e);
        }
    }
}

/// Merge adjacent blocks of one level while the result fits the level's
/// budget and persist whatever was rebuilt. Returns the metadata rows
/// describing the level afterwards, in key order.
pub(crate) fn merge_level(
    c: &mut Compactor<'_>,
    schema: &Arc<TableSchema>,
    facades: Vec<BlockFacade>,
) -> Result<Vec<MetaRow>> {
    let budget = c.budget(schema);
    let mut keyed = facades
        .into_iter()
        .filter(|f| !f.is_empty())
        .map(|f| Ok((f.max_key(schema)?, f)))
        .collect::<Result<Vec<_>>>()?;
    keyed.sort_by_key(|(key, _)| *key);

    let mut out = Vec::new();
    let mut iter = keyed.into_iter().map(|(_, f)| f);
    let Some(mut current) = iter.next() else {
        return Ok(out);
    };
    for next in iter {
        if current.byte_size() + next.byte_size() <= budget {
            let mut merged = current.to_builder(c, schema)?;
            merged.append_block(&next.to_builder(c, schema)?, None)?;
            merged.order_by_record_id();
            if merged.serialized_size(merged.len()) <= budget {
                c.supersede(current.persisted_id());
                c.supersede(next.persisted_id());
                current = BlockFacade::InMemory(merged);
                continue;
            }
        }
        out.extend(emit(c, current)?);
        current = next;
    }
    out.extend(emit(c, current)?);
    Ok(out)
}

fn emit(c: &mut Compactor<'_>, facade: BlockFacade) -> Result<Vec<MetaRow>> {
    match facade {
        BlockFacade::Persisted(row) => Ok(vec![row]),
        BlockFacade::InMemory(block) => c.write_chunks(block),
    }
}
