//! Translation of data predicates into metadata predicates
//!
//! A row of `$meta:T` describes one block of `T` by per-column min/max. A
//! predicate over `T` becomes a predicate over `$meta:T` that keeps every
//! block which may contain a matching row:
//!
//! ```text
//!   c =  v   ->  min(c) <= v AND max(c) >= v
//!   c <  v   ->  min(c) <  v
//!   c <= v   ->  min(c) <= v
//!   c >  v   ->  max(c) >  v
//!   c >= v   ->  max(c) >= v
//!   c IN vs  ->  OR of the equality translations
//!   c != v, null tests, unordered types  ->  All
//! ```
//!
//! The block-id virtual column maps onto the `$block_id` column; the row
//! index has no metadata counterpart.

use super::predicate::Predicate;
use super::CompareOp;
use crate::data::{TableSchema, Value};

/// Translate `predicate` over `data` into a predicate over `meta`, the
/// metadata schema describing `data`'s blocks.
pub fn translate(predicate: &Predicate, data: &TableSchema, meta: &TableSchema) -> Predicate {
    let Some(layout) = meta.meta_layout() else {
        return Predicate::All;
    };
    match predicate {
        Predicate::All => Predicate::All,
        Predicate::Nothing => Predicate::Nothing,
        Predicate::Rows(_) => Predicate::All,
        Predicate::And(parts) => {
            Predicate::And(parts.iter().map(|p| translate(p, data, meta)).collect())
        }
        Predicate::Or(parts) => {
            Predicate::Or(parts.iter().map(|p| translate(p, data, meta)).collect())
        }
        Predicate::Compare { column, op, value } if *column == data.block_id_column() => {
            if value.is_null() {
                // persisted blocks never have a null id
                return match op {
                    CompareOp::Equal => Predicate::Nothing,
                    _ => Predicate::All,
                };
            }
            Predicate::Compare {
                column: layout.block_id(),
                op: *op,
                value: value.clone(),
            }
        }
        Predicate::In { column, values } if *column == data.block_id_column() => Predicate::In {
            column: layout.block_id(),
            values: values.iter().filter(|v| !v.is_null()).cloned().collect(),
        },
        Predicate::Compare { column, op, value } => {
            if !prunable(data, *column) || value.is_null() {
                return Predicate::All;
            }
            compare_range(layout.min(*column), layout.max(*column), *op, value)
        }
        Predicate::In { column, values } => {
            if !prunable(data, *column) || values.iter().any(Value::is_null) {
                return Predicate::All;
            }
            Predicate::Or(
                values
                    .iter()
                    .map(|v| compare_range(layout.min(*column), layout.max(*column), CompareOp::Equal, v))
                    .collect(),
            )
        }
    }
}

fn prunable(data: &TableSchema, column: usize) -> bool {
    !data.is_virtual(column)
        && data
            .column(column)
            .map_or(false, |c| c.data_type.is_ordered())
}

fn compare_range(min: usize, max: usize, op: CompareOp, value: &Value) -> Predicate {
    let bound = |column, op| Predicate::Compare {
        column,
        op,
        value: value.clone(),
    };
    match op {
        CompareOp::Equal => Predicate::And(vec![
            bound(min, CompareOp::LessEqual),
            bound(max, CompareOp::GreaterEqual),
        ]),
        CompareOp::NotEqual => Predicate::All,
        CompareOp::LessThan => bound(min, CompareOp::LessThan),
        CompareOp::LessEqual => bound(min, CompareOp::LessEqual),
        CompareOp::GreaterThan => bound(max, CompareOp::GreaterThan),
        CompareOp::GreaterEqual => bound(max, CompareOp::GreaterEqual),
    }
}

/// Predicate over `meta` keeping rows whose data record-id range
/// intersects `[lo, hi]`
pub fn record_range(meta: &TableSchema, lo: i64, hi: i64) -> Predicate {
    let (lo_col, hi_col) = meta.key_range_columns();
    Predicate::And(vec![
        Predicate::Compare {
            column: lo_col,
            op: CompareOp::LessEqual,
            value: Value::Int64(hi),
        },
        Predicate::Compare {
            column: hi_col,
            op: CompareOp::GreaterEqual,
            value: Value::Int64(lo),
        },
    ])
}
