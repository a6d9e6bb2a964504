//! The agents of the lifecycle pipeline, in the order a batch runs them

use std::sync::Arc;

use super::Activities;
use crate::compaction::{self, HardDeleteMode};
use crate::db::inner::{Counters, DbInner};
use crate::txn::concat_blocks;
use crate::Result;

pub(crate) fn run(inner: &Arc<DbInner>, activities: Activities) -> Result<()> {
    if activities.contains(Activities::MERGE_LOGS) {
        merge_logs(inner)?;
    }
    if activities.intersects(Activities::PERSIST_ALL | Activities::PERSIST_EXCESS) {
        let all = activities.contains(Activities::PERSIST_ALL);
        compaction::persist_data(inner, all)?;
        compaction::persist_metadata(inner)?;
    }
    if activities.contains(Activities::HARD_DELETE_ALL) {
        compaction::hard_delete(inner, HardDeleteMode::All)?;
    } else if activities.contains(Activities::HARD_DELETE_EXCESS) {
        compaction::hard_delete(inner, HardDeleteMode::Excess)?;
    }
    if activities.contains(Activities::RELEASE_BLOCKS) {
        release(inner)?;
    }
    Ok(())
}

/// Fold the oldest blocks of every log longer than `max_log_blocks` into
/// one, so the log is `max_log_blocks` long again
pub(crate) fn merge_logs(inner: &DbInner) -> Result<usize> {
    let snapshot = inner.state.load();
    let max = inner.config.max_log_blocks;
    let mut merged = 0;
    for props in snapshot.tables() {
        let log = snapshot.log(props.name());
        if log.len() <= max {
            continue;
        }
        let consumed = log[..log.len() - max + 1].to_vec();
        let block = Arc::new(concat_blocks(&props.schema, &consumed)?);
        inner.state.update(|s| {
            s.replace_log_prefix(props.name(), &consumed, vec![block.clone()])
        })?;
        log::trace!("{}: folded {} log blocks", props.name(), consumed.len());
        merged += 1;
    }
    Ok(merged)
}

/// Free superseded blocks once no transaction can still read them.
/// Returns the number of blocks released.
pub(crate) fn release(inner: &DbInner) -> Result<usize> {
    let taken = inner.state.try_update(|s| {
        if !s.transactions.is_empty() || s.pending_release.is_empty() {
            return Ok(None);
        }
        Ok(Some(std::mem::take(&mut s.pending_release)))
    })?;
    let Some(ids) = taken else {
        return Ok(0);
    };

    for &id in &ids {
        if let Err(e) = inner.store.remove(id) {
            log::warn!("could not remove released block {}: {}", id, e);
        }
        inner.cache.evict(id);
    }
    inner.state.update(|s| {
        s.free_blocks.extend_from_slice(&ids);
        Ok(())
    })?;
    Counters::bump(&inner.counters.blocks_released, ids.len() as u64);
    log::debug!("released {} blocks", ids.len());
    Ok(ids.len())
}
