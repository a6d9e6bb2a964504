//! Re-pointing tombstones whose block id went stale
//!
//! A tombstone records the persisted block its record lived in when it was
//! deleted. Compaction moves records between blocks, so the id may name a
//! released block. Repair looks the records up again; tombstones of records
//! that no longer exist anywhere are dropped.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};

use crate::block::{BlockBuilder, BlockRead};
use crate::data::{Value, RECORD_ID_COLUMN, TOMBSTONE_TABLE};
use crate::db::inner::DbInner;
use crate::db::reader::Reader;
use crate::query::Filter;
use crate::txn::TombstoneRecord;
use crate::{BlockId, RecordId, Result};

/// Repair the tombstones of `table`; returns how many were rewritten or
/// dropped
pub(crate) fn repair_tombstones(inner: &Arc<DbInner>, table: &str) -> Result<usize> {
    let view = inner.detached();
    let snapshot = view.snapshot().clone();
    view.commit()?;
    let props = snapshot.table(table)?;
    let reader = Reader::new(inner, &snapshot);
    let live: AHashSet<BlockId> = reader
        .all_block_rows(props)?
        .into_iter()
        .map(|r| r.block_id)
        .collect();

    let consumed: Vec<Arc<BlockBuilder>> = snapshot.log(TOMBSTONE_TABLE).to_vec();
    let mut suspects = Vec::new();
    for block in &consumed {
        for row in 0..block.len() {
            let tombstone = TombstoneRecord::read(&**block, row)?;
            if tombstone.table != table {
                continue;
            }
            if tombstone.block_id.map_or(true, |id| !live.contains(&id)) {
                suspects.push(tombstone.record_id);
            }
        }
    }
    if suspects.is_empty() {
        return Ok(0);
    }

    // where each suspect lives now: Some(None) in memory, Some(Some(id)) in a block
    let mut location: AHashMap<RecordId, Option<BlockId>> = AHashMap::new();
    let predicate = Filter::is_in(
        RECORD_ID_COLUMN,
        suspects.iter().map(|&id| Value::Int64(id as i64)),
    )
    .bind(&props.schema)?;
    let mut locate = |block: &dyn BlockRead, rows: &[usize]| -> Result<()> {
        for &row in rows {
            location.insert(block.record_id(row)?, block.block_id());
        }
        Ok(())
    };
    reader.visit(props, &predicate, &mut locate)?;

    let mut repaired = 0;
    let mut changed = Vec::new();
    let mut replacement = Vec::new();
    for block in &consumed {
        let mut rebuilt = BlockBuilder::new(block.schema().clone());
        let mut touched = false;
        for row in 0..block.len() {
            let own_id = block.record_id(row)?;
            let mut tombstone = TombstoneRecord::read(&**block, row)?;
            let stale = tombstone.table == table
                && tombstone.block_id.map_or(true, |id| !live.contains(&id));
            if stale {
                match location.get(&tombstone.record_id) {
                    None => {
                        touched = true;
                        repaired += 1;
                        continue;
                    }
                    Some(&now) if now != tombstone.block_id => {
                        tombstone.block_id = now;
                        touched = true;
                        repaired += 1;
                    }
                    Some(_) => {}
                }
            }
            rebuilt.append_record(own_id, &tombstone.to_values())?;
        }
        if touched {
            changed.push(block.clone());
            replacement.push(Arc::new(rebuilt));
        }
    }
    if changed.is_empty() {
        return Ok(0);
    }

    inner.state.update(|s| {
        s.replace_log_prefix(TOMBSTONE_TABLE, &changed, replacement.clone())?;
        Ok(())
    })?;
    log::info!("{}: repaired {} tombstones", table, repaired);
    Ok(repaired)
}
