//! Rewriting and pruning the metadata hierarchy of one table
//!
//! ```text
//!   $meta:$meta:T   [ r ]                     level 2 (root row, in memory)
//!                     │ describes
//!   $meta:T         [ a | b | c ]             level 1 block (persisted)
//!                     │   │   │
//!   T              [..] [..] [..]             data blocks (persisted)
//! ```
//!
//! A rewrite descends from a root row into every subtree whose record-id
//! range holds deleted records, removes them from the data blocks, merges
//! the rebuilt siblings of each level and returns what replaces the root.

use std::collections::BTreeSet;
use std::sync::Arc;

use ahash::AHashSet;

use super::facade::BlockFacade;
use super::merge::{merge_level, Compactor};
use super::meta_row::MetaRow;
use crate::db::inner::DbInner;
use crate::txn::TableProperties;
use crate::{RecordId, Result};

/// Outcome of rewriting data blocks
#[derive(Debug, Default)]
pub(crate) struct Removal {
    /// Deleted records physically removed
    pub removed: AHashSet<RecordId>,
    /// Deleted records inside a rewritten block's range but not in it
    pub missing: AHashSet<RecordId>,
}

/// Ids of `deletes` inside `[lo, hi]`
pub(crate) fn deletes_in(deletes: &BTreeSet<RecordId>, lo: i64, hi: i64) -> Vec<RecordId> {
    if hi < lo || hi < 0 {
        return Vec::new();
    }
    let lo = lo.max(0) as RecordId;
    deletes.range(lo..=hi as RecordId).copied().collect()
}

/// Rewrite the subtree under `row`, a row of `chain[level]` describing a
/// block of `chain[level - 1]`. The result replaces `row` among its
/// siblings.
pub(crate) fn rewrite_row(
    c: &mut Compactor<'_>,
    chain: &[Arc<TableProperties>],
    level: usize,
    row: MetaRow,
    deletes: &BTreeSet<RecordId>,
    removal: &mut Removal,
) -> Result<Vec<BlockFacade>> {
    let described = &chain[level - 1].schema;
    let (lo, hi) = row.key_range(described)?;
    let hits = deletes_in(deletes, lo, hi);
    if hits.is_empty() {
        return Ok(vec![BlockFacade::Persisted(row)]);
    }

    let block = c.load(described, &row)?;
    if level == 1 {
        let mut builder = block.to_builder()?;
        let wanted: AHashSet<RecordId> = hits.iter().copied().collect();
        let removed = builder.delete_records_by_id(&wanted);
        if removed.is_empty() {
            removal.missing.extend(wanted);
            return Ok(vec![BlockFacade::Persisted(row)]);
        }
        removal.removed.extend(removed.iter().copied());
        let removed: AHashSet<RecordId> = removed.into_iter().collect();
        removal
            .missing
            .extend(wanted.into_iter().filter(|id| !removed.contains(id)));
        c.supersede([row.block_id]);
        if builder.is_empty() {
            return Ok(Vec::new());
        }
        return Ok(vec![BlockFacade::InMemory(builder)]);
    }

    let children = MetaRow::read_all(&*block)?;
    let mut changed = false;
    let mut facades = Vec::with_capacity(children.len());
    for child in children {
        let own = child.block_id;
        let out = rewrite_row(c, chain, level - 1, child, deletes, removal)?;
        let untouched = matches!(out.as_slice(), [BlockFacade::Persisted(r)] if r.block_id == own);
        changed |= !untouched;
        facades.extend(out);
    }
    if !changed {
        return Ok(vec![BlockFacade::Persisted(row)]);
    }

    let rows = merge_level(c, &chain[level - 2].schema, facades)?;
    c.supersede([row.block_id]);
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    Ok(vec![BlockFacade::InMemory(MetaRow::to_builder(
        &chain[level - 1].schema,
        &rows,
    )?)])
}

/// Collapse the top of the hierarchy of `table` while it is a single
/// in-memory row describing a single-row block: that row moves down one
/// level and its block is released. Returns the number of levels removed.
pub(crate) fn prune(inner: &DbInner, table: &str) -> Result<usize> {
    let mut pruned = 0;
    loop {
        let snapshot = inner.state.load();
        let chain = snapshot.metadata_chain(table)?;
        let Some(level) = (1..chain.len())
            .rev()
            .find(|&i| snapshot.in_memory_rows(chain[i].name()) > 0)
        else {
            break;
        };
        let top = chain[level].name();
        if snapshot.in_memory_rows(top) != 1 {
            break;
        }
        let consumed = snapshot.log(top).to_vec();
        let Some(row) = consumed
            .iter()
            .find(|b| !b.is_empty())
            .map(|b| MetaRow::read(&**b, 0))
            .transpose()?
        else {
            break;
        };
        if row.item_count != 1 {
            break;
        }

        let below = &chain[level - 1];
        let block = Arc::new(inner.load_block(&below.schema, &row)?.to_builder()?);
        inner.state.update(|s| {
            s.replace_log_prefix(top, &consumed, Vec::new())?;
            s.replace_log_prefix(below.name(), &[], vec![block.clone()])?;
            s.supersede(&[row.block_id]);
            Ok(())
        })?;
        log::debug!("pruned level {} of {}", level, table);
        pruned += 1;
    }
    Ok(pruned)
}
