//! Moving in-memory rows into persisted blocks
//!
//! Data tables persist an ordered prefix of their log: only rows below the
//! record watermark, so no transaction still running can commit a row into
//! a range that is already persisted. Each written block gets a row in the
//! table's metadata table, which persists the same way one level up once
//! it holds too many rows.

use std::sync::Arc;

use super::merge::Compactor;
use super::meta_row::MetaRow;
use crate::block::{BlockBuilder, BlockRead};
use crate::db::inner::DbInner;
use crate::txn::concat_blocks;
use crate::Result;

/// Persist the logs of every data table; `all` persists every eligible
/// row, otherwise only the rows above `max_in_memory_rows`. Returns the
/// number of rows persisted.
pub(crate) fn persist_data(inner: &DbInner, all: bool) -> Result<usize> {
    let names: Vec<String> = inner
        .state
        .load()
        .data_tables()
        .map(|t| t.name().to_string())
        .collect();
    let mut persisted = 0;
    for name in names {
        persisted += persist_table(inner, &name, all)?;
    }
    Ok(persisted)
}

fn persist_table(inner: &DbInner, table: &str, all: bool) -> Result<usize> {
    let (watermark, snapshot) = inner.record_watermark();
    let consumed = snapshot.log(table).to_vec();
    let total: usize = consumed.iter().map(|b| b.len()).sum();
    let limit = inner.config.max_in_memory_rows;
    if total == 0 || (!all && total <= limit) {
        return Ok(0);
    }

    let props = snapshot.table(table)?;
    let mut eligible = concat_blocks(&props.schema, &consumed)?;
    let ids = eligible.record_ids()?;
    let cut = ids.partition_point(|&rid| rid < watermark);
    let rest = eligible.split_off(cut);
    let target = if all { cut } else { cut.min(total - limit) };
    if target == 0 {
        log::trace!("{}: nothing below watermark {} to persist", table, watermark);
        return Ok(0);
    }

    let mut c = Compactor::new(inner, snapshot.clone());
    let result = write_prefix(&mut c, eligible, target).and_then(|(rows, mut remainder)| {
        remainder.append_block(&rest, None)?;
        let remainder = Arc::new(remainder);
        let persisted: usize = rows.iter().map(|r| r.item_count).sum();
        inner.state.update(|s| {
            let meta = s.ensure_metadata_table(table)?;
            s.append_log(meta.name(), Arc::new(MetaRow::to_builder(&meta.schema, &rows)?))?;
            s.replace_log_prefix(table, &consumed, vec![remainder.clone()])?;
            Ok(())
        })?;
        log::debug!("{}: persisted {} rows in {} blocks", table, persisted, rows.len());
        Ok(persisted)
    });
    if result.is_err() {
        c.abandon();
    }
    result
}

/// Write blocks from the front of `block` until at least `target` rows are
/// persisted; returns their rows and the unwritten remainder
fn write_prefix(
    c: &mut Compactor<'_>,
    mut block: BlockBuilder,
    target: usize,
) -> Result<(Vec<MetaRow>, BlockBuilder)> {
    let budget = c.budget(block.schema());
    let tolerance = c.inner().config.truncate_tolerance;
    let mut rows = Vec::new();
    let mut written = 0;
    while written < target && !block.is_empty() {
        let n = block.fitting_prefix(budget, tolerance)?;
        let rest = block.split_off(n);
        rows.push(c.write(&block)?);
        written += n;
        block = rest;
    }
    Ok((rows, block))
}

/// Persist metadata levels holding more than `max_in_memory_meta_rows`
/// rows, bottom-up, for every data table. Returns the number of metadata
/// rows persisted.
pub(crate) fn persist_metadata(inner: &DbInner) -> Result<usize> {
    let names: Vec<String> = inner
        .state
        .load()
        .data_tables()
        .map(|t| t.name().to_string())
        .collect();
    let mut persisted = 0;
    for name in names {
        let mut level = 1;
        loop {
            let snapshot = inner.state.load();
            let chain = snapshot.metadata_chain(&name)?;
            let Some(meta) = chain.get(level) else {
                break;
            };
            if snapshot.in_memory_rows(meta.name()) > inner.config.max_in_memory_meta_rows {
                persisted += persist_level(inner, meta.name())?;
            }
            level += 1;
        }
    }
    Ok(persisted)
}

/// Persist every in-memory row of the metadata table `table`
fn persist_level(inner: &DbInner, table: &str) -> Result<usize> {
    let snapshot = inner.state.load();
    let consumed = snapshot.log(table).to_vec();
    let props = snapshot.table(table)?;
    let merged = concat_blocks(&props.schema, &consumed)?;
    if merged.is_empty() {
        return Ok(0);
    }

    let mut c = Compactor::new(inner, snapshot.clone());
    let result = c.write_chunks(merged).and_then(|rows| {
        let persisted: usize = rows.iter().map(|r| r.item_count).sum();
        inner.state.update(|s| {
            let meta = s.ensure_metadata_table(table)?;
            s.append_log(meta.name(), Arc::new(MetaRow::to_builder(&meta.schema, &rows)?))?;
            s.replace_log_prefix(table, &consumed, Vec::new())?;
            Ok(())
        })?;
        log::debug!("{}: persisted {} rows in {} blocks", table, persisted, rows.len());
        Ok(persisted)
    });
    if result.is_err() {
        c.abandon();
    }
    result
}
