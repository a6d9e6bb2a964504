//! Hard deletion: physically removing tombstoned records
//!
//! One round for a table T:
//!
//! 1. collect the record ids tombstoned for T
//! 2. drop them from T's in-memory log
//! 3. pick root rows (in-memory metadata rows of any level) whose range
//!    holds deleted ids, densest first, and rewrite their subtrees
//! 4. settle ids that a rewrite did not find: an id no block or log row
//!    holds any more is resolved as well
//! 5. remove the tombstones of resolved ids
//!
//! Everything a round changes is installed in a single state transition;
//! replaced blocks wait in `pending_release` until no reader can see them.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};
use std::sync::Arc;

use ahash::AHashSet;

use super::facade::BlockFacade;
use super::hierarchy::{deletes_in, prune, rewrite_row, Removal};
use super::merge::{merge_level, Compactor};
use super::meta_row::MetaRow;
use crate::block::{BlockBuilder, BlockRead};
use crate::data::{Value, RECORD_ID_COLUMN, TOMBSTONE_TABLE};
use crate::db::inner::{Counters, DbInner};
use crate::db::reader::Reader;
use crate::query::Filter;
use crate::txn::{DatabaseState, TombstoneRecord};
use crate::{RecordId, Result};

/// How much a hard delete pass attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HardDeleteMode {
    /// Tables over their tombstone budget, a bounded number of branches
    Excess,
    /// Every tombstone of every table
    All,
}

/// Result of one round on one table
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RoundOutcome {
    pub records_removed: usize,
    pub tombstones_resolved: usize,
}

/// Run hard deletion over the database. Returns the number of records
/// physically removed.
pub(crate) fn hard_delete(inner: &Arc<DbInner>, mode: HardDeleteMode) -> Result<usize> {
    let view = inner.detached();
    let counts = Reader::new(inner, view.snapshot()).tombstones()?.counts();
    view.commit()?;

    let mut removed = 0;
    for (table, count) in counts {
        match mode {
            HardDeleteMode::All => {
                let mut touched = false;
                loop {
                    let outcome = hard_delete_round(inner, &table, None)?;
                    removed += outcome.records_removed;
                    if outcome.tombstones_resolved == 0 {
                        break;
                    }
                    touched = true;
                }
                if touched {
                    prune(inner, &table)?;
                }
            }
            HardDeleteMode::Excess => {
                if count <= inner.config.tombstone_budget {
                    continue;
                }
                if removed >= inner.config.hard_delete_target {
                    break;
                }
                let outcome =
                    hard_delete_round(inner, &table, Some(inner.config.hard_delete_branches))?;
                removed += outcome.records_removed;
                if outcome.tombstones_resolved > 0 {
                    prune(inner, &table)?;
                }
            }
        }
    }
    if removed > 0 {
        Counters::bump(&inner.counters.records_hard_deleted, removed as u64);
    }
    Ok(removed)
}

/// A root row with the number of deleted ids in its range
struct Candidate {
    density: u128,
    level: usize,
    index: usize,
}

/// Deleted ids per unit of record-id range, scaled to an integer
fn density(hits: usize, lo: i64, hi: i64) -> u128 {
    let width = (hi as i128 - lo as i128 + 1).max(1) as u128;
    ((hits as u128) << 64) / width
}

/// Keep the `k` densest candidates
fn densest(candidates: Vec<Candidate>, k: usize) -> AHashSet<(usize, usize)> {
    let mut heap = BinaryHeap::with_capacity(k + 1);
    for c in candidates {
        heap.push(Reverse((c.density, c.level, c.index)));
        if heap.len() > k {
            heap.pop();
        }
    }
    heap.into_iter()
        .map(|Reverse((_, level, index))| (level, index))
        .collect()
}

pub(crate) fn hard_delete_round(
    inner: &DbInner,
    table: &str,
    branches: Option<usize>,
) -> Result<RoundOutcome> {
    let snapshot = inner.state.load();
    let tombstones = Reader::new(inner, &snapshot).tombstones()?;
    let Some(deleted) = tombstones.deleted(table) else {
        return Ok(RoundOutcome::default());
    };
    let deletes: BTreeSet<RecordId> = deleted.iter().copied().collect();

    let mut c = Compactor::new(inner, snapshot.clone());
    let result = rewrite_table(&mut c, table, &deletes, branches)
        .and_then(|plan| install(&mut c, &snapshot, table, plan));
    match result {
        Ok(outcome) => {
            if outcome.tombstones_resolved > 0 {
                log::debug!(
                    "{}: hard delete removed {} records, resolved {} tombstones",
                    table,
                    outcome.records_removed,
                    outcome.tombstones_resolved
                );
            }
            Ok(outcome)
        }
        Err(e) => {
            c.abandon();
            Err(e)
        }
    }
}

/// Log blocks a transition consumes, and what takes their place
type LogSwap = (Vec<Arc<BlockBuilder>>, Vec<Arc<BlockBuilder>>);

/// New contents of the logs touched by a round
struct Plan {
    data_log: Option<LogSwap>,
    meta_logs: Vec<(String, LogSwap)>,
    removed: usize,
    resolved: AHashSet<RecordId>,
}

fn rewrite_table(
    c: &mut Compactor<'_>,
    table: &str,
    deletes: &BTreeSet<RecordId>,
    branches: Option<usize>,
) -> Result<Plan> {
    let snapshot = c.snapshot().clone();
    let chain = snapshot.metadata_chain(table)?;
    let mut removal = Removal::default();

    // in-memory rows
    let wanted: AHashSet<RecordId> = deletes.iter().copied().collect();
    let log = snapshot.log(table);
    let mut log_ids = AHashSet::new();
    let mut data_log = None;
    let mut replacement = Vec::with_capacity(log.len());
    let mut changed = false;
    for block in log {
        log_ids.extend(block.record_ids()?);
        let mut copy = BlockBuilder::clone(block);
        let removed = copy.delete_records_by_id(&wanted);
        if removed.is_empty() {
            replacement.push(block.clone());
        } else {
            changed = true;
            removal.removed.extend(removed);
            replacement.push(Arc::new(copy));
        }
    }
    if changed {
        data_log = Some((log.to_vec(), replacement));
    }

    // root rows of every level, and the candidates among them
    let mut roots: Vec<Vec<MetaRow>> = vec![Vec::new(); chain.len()];
    let mut candidates = Vec::new();
    for level in 1..chain.len() {
        for block in snapshot.log(chain[level].name()) {
            roots[level].extend(MetaRow::read_all(&**block)?);
        }
        for (index, row) in roots[level].iter().enumerate() {
            let (lo, hi) = row.key_range(&chain[level - 1].schema)?;
            let hits = deletes_in(deletes, lo, hi).len();
            if hits > 0 {
                candidates.push(Candidate {
                    density: density(hits, lo, hi),
                    level,
                    index,
                });
            }
        }
    }
    let mut covered = AHashSet::new();
    for level in 1..chain.len() {
        for row in &roots[level] {
            let (lo, hi) = row.key_range(&chain[level - 1].schema)?;
            covered.extend(deletes_in(deletes, lo, hi));
        }
    }
    let selected: AHashSet<(usize, usize)> = match branches {
        Some(k) => densest(candidates, k),
        None => candidates.iter().map(|c| (c.level, c.index)).collect(),
    };

    let mut meta_logs = Vec::new();
    for level in 1..chain.len() {
        if !selected.iter().any(|&(l, _)| l == level) {
            continue;
        }
        let mut facades = Vec::with_capacity(roots[level].len());
        for (index, row) in roots[level].iter().enumerate() {
            if selected.contains(&(level, index)) {
                facades.extend(rewrite_row(c, &chain, level, row.clone(), deletes, &mut removal)?);
            } else {
                facades.push(BlockFacade::Persisted(row.clone()));
            }
        }
        let rows = merge_level(c, &chain[level - 1].schema, facades)?;
        let name = chain[level].name().to_string();
        let consumed = snapshot.log(&name).to_vec();
        let replacement = if rows.is_empty() {
            Vec::new()
        } else {
            vec![Arc::new(MetaRow::to_builder(&chain[level].schema, &rows)?)]
        };
        meta_logs.push((name, (consumed, replacement)));
    }

    let mut resolved: AHashSet<RecordId> = removal.removed.iter().copied().collect();
    // deleted ids nothing covers any more
    resolved.extend(
        deletes
            .iter()
            .copied()
            .filter(|id| !log_ids.contains(id) && !covered.contains(id)),
    );
    let missing: Vec<RecordId> = removal
        .missing
        .iter()
        .copied()
        .filter(|id| !resolved.contains(id))
        .collect();
    if !missing.is_empty() {
        let present = locate(c.inner(), &snapshot, table, &missing)?;
        resolved.extend(missing.into_iter().filter(|id| !present.contains(id)));
    }

    Ok(Plan {
        data_log,
        meta_logs,
        removed: removal.removed.len(),
        resolved,
    })
}

/// Which of `ids` some committed row of `table` still holds
fn locate(
    inner: &DbInner,
    snapshot: &DatabaseState,
    table: &str,
    ids: &[RecordId],
) -> Result<AHashSet<RecordId>> {
    let props = snapshot.table(table)?;
    let predicate = Filter::is_in(
        RECORD_ID_COLUMN,
        ids.iter().map(|&id| Value::Int64(id as i64)),
    )
    .bind(&props.schema)?;
    let mut present = AHashSet::new();
    let mut collect = |block: &dyn BlockRead, rows: &[usize]| -> Result<()> {
        for &row in rows {
            present.insert(block.record_id(row)?);
        }
        Ok(())
    };
    Reader::new(inner, snapshot).visit(props, &predicate, &mut collect)?;
    Ok(present)
}

fn install(
    c: &mut Compactor<'_>,
    snapshot: &DatabaseState,
    table: &str,
    plan: Plan,
) -> Result<RoundOutcome> {
    let (consumed, replacement) = tombstone_rewrite(snapshot, table, &plan.resolved)?;
    if plan.data_log.is_none() && plan.meta_logs.is_empty() && consumed.is_empty() {
        return Ok(RoundOutcome::default());
    }

    let superseded = c.superseded().to_vec();
    c.inner().state.update(|s| {
        if let Some((consumed, replacement)) = &plan.data_log {
            s.replace_log_prefix(table, consumed, replacement.clone())?;
        }
        for (name, (consumed, replacement)) in &plan.meta_logs {
            s.replace_log_prefix(name, consumed, replacement.clone())?;
        }
        s.replace_log_prefix(TOMBSTONE_TABLE, &consumed, replacement.clone())?;
        s.supersede(&superseded);
        Ok(())
    })?;
    Ok(RoundOutcome {
        records_removed: plan.removed,
        tombstones_resolved: plan.resolved.len(),
    })
}

/// Tombstone log blocks holding resolved tombstones of `table`, and the
/// same blocks without them
fn tombstone_rewrite(
    snapshot: &DatabaseState,
    table: &str,
    resolved: &AHashSet<RecordId>,
) -> Result<LogSwap> {
    let mut consumed = Vec::new();
    let mut replacement = Vec::new();
    if resolved.is_empty() {
        return Ok((consumed, replacement));
    }
    for block in snapshot.log(TOMBSTONE_TABLE) {
        let mut drop_rows = Vec::new();
        for row in 0..block.len() {
            let tombstone = TombstoneRecord::read(&**block, row)?;
            if tombstone.table == table && resolved.contains(&tombstone.record_id) {
                drop_rows.push(row);
            }
        }
        if drop_rows.is_empty() {
            continue;
        }
        let mut copy = BlockBuilder::clone(block);
        copy.delete_rows(&drop_rows);
        consumed.push(block.clone());
        replacement.push(Arc::new(copy));
    }
    Ok((consumed, replacement))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_densest_keeps_top_k() {
        let candidate = |hits, hi, level, index| Candidate {
            density: density(hits, 0, hi),
            level,
            index,
        };
        let candidates = vec![candidate(1, 99, 1, 0), candidate(5, 9, 1, 1), candidate(2, 9, 2, 0)];
        let picked = densest(candidates, 2);
        assert!(picked.contains(&(1, 1)));
        assert!(picked.contains(&(2, 0)));
        assert!(!picked.contains(&(1, 0)));
    }

    #[test]
    fn test_density_prefers_narrow_ranges() {
        assert!(density(3, 10, 12) > density(3, 10, 100));
        assert_eq!(density(0, 1, 5), 0);
    }
}
