use std::cmp::Ordering;

use crate::data::Value;
use crate::RecordId;

/// One ORDER BY key, resolved to a position in the projected row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SortKey {
    pub position: usize,
    pub descending: bool,
}

/// A scanned row: record id plus the projected values
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ScanRow {
    pub record_id: RecordId,
    pub values: Vec<Value>,
}

pub(crate) fn compare_values(a: &Value, b: &Value, descending: bool) -> Ordering {
    // nulls first in ascending order, last in descending order
    let cmp = a.total_cmp(b);
    if descending {
        cmp.reverse()
    } else {
        cmp
    }
}

/// Sort by `keys`, breaking ties by record id, and keep at most `limit` rows
pub(crate) fn sort_rows(rows: &mut Vec<ScanRow>, keys: &[SortKey], limit: Option<usize>) {
    if keys.is_empty() {
        rows.sort_unstable_by_key(|r| r.record_id);
    } else {
        rows.sort_by(|a, b| {
            for key in keys {
                let cmp = compare_values(&a.values[key.position], &b.values[key.position], key.descending);
                if cmp != Ordering::Equal {
                    return cmp;
                }
            }
            a.record_id.cmp(&b.record_id)
        });
    }
    if let Some(limit) = limit {
        rows.truncate(limit);
    }
}
