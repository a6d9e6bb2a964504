use std::sync::Arc;

use super::merge::Compactor;
use super::meta_row::MetaRow;
use crate::block::BlockBuilder;
use crate::data::TableSchema;
use crate::Result;

/// A block of one hierarchy level during a rewrite: either still persisted
/// and known only by its metadata row, or rebuilt in memory
#[derive(Debug, Clone)]
pub(crate) enum BlockFacade {
    Persisted(MetaRow),
    InMemory(BlockBuilder),
}

impl BlockFacade {
    pub fn item_count(&self) -> usize {
        match self {
            BlockFacade::Persisted(row) => row.item_count,
            BlockFacade::InMemory(block) => block.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.item_count() == 0
    }

    /// Serialized size, exact for persisted blocks
    pub fn byte_size(&self) -> usize {
        match self {
            BlockFacade::Persisted(row) => row.byte_size,
            BlockFacade::InMemory(block) => block.serialized_size(block.len()),
        }
    }

    /// Highest data record id covered by the block
    pub fn max_key(&self, schema: &TableSchema) -> Result<i64> {
        match self {
            BlockFacade::Persisted(row) => Ok(row.key_range(schema)?.1),
            BlockFacade::InMemory(block) => Ok(block.key_range().map_or(i64::MIN, |(_, hi)| hi)),
        }
    }

    /// Rows of the block as a fresh builder; nothing is superseded yet
    pub fn to_builder(&self, c: &Compactor<'_>, schema: &Arc<TableSchema>) -> Result<BlockBuilder> {
        match self {
            BlockFacade::Persisted(row) => c.load(schema, row)?.to_builder(),
            BlockFacade::InMemory(block) => Ok(block.clone()),
        }
    }

    pub fn persisted_id(&self) -> Option<u64> {
        match self {
            BlockFacade::Persisted(row) => Some(row.block_id),
            BlockFacade::InMemory(_) => None,
        }
    }
}
