//! Predicate resolution
//!
//! A bound predicate is resolved against one block by repeatedly
//! evaluating a single leaf, replacing it with the concrete set of matching
//! rows, and simplifying the tree:
//!
//! ```text
//!   And(Compare a, Or(In b, Compare c))
//!     -> And(Rows[..], Or(In b, Compare c))      evaluate first leaf
//!     -> And(Rows[..], Or(Rows[..], Compare c))  ...
//!     -> Rows[..]                                 simplification collapses
//! ```
//!
//! Simplification short-circuits: an `And` holding an empty row set is
//! `Nothing` without evaluating its other leaves, an `Or` holding every row
//! is `All`.

use super::CompareOp;
use crate::block::BlockRead;
use crate::data::Value;
use crate::{Result, TesseraError};

/// Index-based condition over the stored and virtual columns of a table
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    All,
    Nothing,
    Compare {
        column: usize,
        op: CompareOp,
        value: Value,
    },
    In {
        column: usize,
        values: Vec<Value>,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    /// Concrete ascending row indexes
    Rows(Vec<usize>),
}

/// Upper bound on resolution rounds; every round removes one leaf
const MAX_RESOLUTION_STEPS: usize = 100_000;

impl Predicate {
    pub fn and(parts: Vec<Predicate>) -> Self {
        Predicate::And(parts)
    }

    pub fn or(parts: Vec<Predicate>) -> Self {
        Predicate::Or(parts)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Predicate::All | Predicate::Nothing | Predicate::Rows(_))
    }

    /// Apply boolean-algebra identities given a block of `n` rows
    pub fn simplify(self, n: usize) -> Predicate {
        match self {
            Predicate::Rows(rows) if rows.is_empty() => Predicate::Nothing,
            Predicate::Rows(rows) if rows.len() == n => Predicate::All,
            Predicate::And(parts) => simplify_and(parts, n),
            Predicate::Or(parts) => simplify_or(parts, n),
            other => other,
        }
    }

    /// First unevaluated leaf, depth first
    fn first_leaf(&mut self) -> Option<&mut Predicate> {
        if matches!(self, Predicate::Compare { .. } | Predicate::In { .. }) {
            return Some(self);
        }
        match self {
            Predicate::And(parts) | Predicate::Or(parts) => {
                parts.iter_mut().find_map(|p| p.first_leaf())
            }
            _ => None,
        }
    }
}

fn simplify_and(parts: Vec<Predicate>, n: usize) -> Predicate {
    let mut rest = Vec::with_capacity(parts.len());
    let mut rows: Option<Vec<usize>> = None;
    let mut queue = parts;
    while let Some(part) = queue.pop() {
        match part.simplify(n) {
            Predicate::All => {}
            Predicate::Nothing => return Predicate::Nothing,
            Predicate::And(inner) => queue.extend(inner),
            Predicate::Rows(r) => {
                let merged = match rows.take() {
                    None => r,
                    Some(acc) => intersect(&acc, &r),
                };
                if merged.is_empty() {
                    return Predicate::Nothing;
                }
                rows = Some(merged);
            }
            other => rest.push(other),
        }
    }
    rest.reverse();
    if let Some(rows) = rows {
        if rows.len() < n {
            rest.insert(0, Predicate::Rows(rows));
        }
    }
    match rest.len() {
        0 => Predicate::All,
        1 => rest.pop().unwrap_or(Predicate::All),
        _ => Predicate::And(rest),
    }
}

fn simplify_or(parts: Vec<Predicate>, n: usize) -> Predicate {
    let mut rest = Vec::with_capacity(parts.len());
    let mut rows: Option<Vec<usize>> = None;
    let mut queue = parts;
    while let Some(part) = queue.pop() {
        match part.simplify(n) {
            Predicate::Nothing => {}
            Predicate::All => return Predicate::All,
            Predicate::Or(inner) => queue.extend(inner),
            Predicate::Rows(r) => {
                let merged = match rows.take() {
                    None => r,
                    Some(acc) => union(&acc, &r),
                };
                if merged.len() == n {
                    return Predicate::All;
                }
                rows = Some(merged);
            }
            other => rest.push(other),
        }
    }
    rest.reverse();
    if let Some(rows) = rows {
        if !rows.is_empty() {
            rest.insert(0, Predicate::Rows(rows));
        }
    }
    match rest.len() {
        0 => Predicate::Nothing,
        1 => rest.pop().unwrap_or(Predicate::Nothing),
        _ => Predicate::Or(rest),
    }
}

fn intersect(a: &[usize], b: &[usize]) -> Vec<usize> {
    let (mut i, mut j) = (0, 0);
    let mut out = Vec::with_capacity(a.len().min(b.len()));
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

fn union(a: &[usize], b: &[usize]) -> Vec<usize> {
    let (mut i, mut j) = (0, 0);
    let mut out = Vec::with_capacity(a.len() + b.len());
    while i < a.len() || j < b.len() {
        let next = match (a.get(i), b.get(j)) {
            (Some(x), Some(y)) if x < y => {
                i += 1;
                *x
            }
            (Some(x), Some(y)) if x > y => {
                j += 1;
                *y
            }
            (Some(x), Some(_)) => {
                i += 1;
                j += 1;
                *x
            }
            (Some(x), None) => {
                i += 1;
                *x
            }
            (None, Some(y)) => {
                j += 1;
                *y
            }
            (None, None) => break,
        };
        out.push(next);
    }
    out
}

/// Rows of `block` satisfying `predicate`, ascending
pub fn resolve<B: BlockRead + ?Sized>(block: &B, predicate: &Predicate) -> Result<Vec<usize>> {
    let n = block.row_count();
    let mut tree = predicate.clone().simplify(n);
    for _ in 0..MAX_RESOLUTION_STEPS {
        match tree {
            Predicate::All => return Ok((0..n).collect()),
            Predicate::Nothing => return Ok(Vec::new()),
            Predicate::Rows(rows) => return Ok(rows),
            _ => {}
        }
        let Some(leaf) = tree.first_leaf() else {
            return Err(TesseraError::Consistency(
                "predicate has no leaf left but did not reduce to rows".to_string(),
            ));
        };
        let rows = evaluate_leaf(block, leaf)?;
        *leaf = Predicate::Rows(rows);
        tree = tree.simplify(n);
    }
    Err(TesseraError::Consistency(
        "predicate resolution did not converge".to_string(),
    ))
}

fn evaluate_leaf<B: BlockRead + ?Sized>(block: &B, leaf: &Predicate) -> Result<Vec<usize>> {
    let schema = block.schema();
    match leaf {
        Predicate::Compare { column, op, value } if schema.is_virtual(*column) => {
            virtual_rows(block, *column, |v| matches_value(v, *op, value))
        }
        Predicate::Compare { column, op, value } => {
            block.column(*column)?.filter(*op, value, schema.column_name(*column))
        }
        Predicate::In { column, values } if schema.is_virtual(*column) => {
            virtual_rows(block, *column, |v| {
                values.iter().any(|t| matches_value(v, CompareOp::Equal, t))
            })
        }
        Predicate::In { column, values } => {
            block.column(*column)?.filter_in(values, schema.column_name(*column))
        }
        other => Err(TesseraError::Consistency(format!("not a leaf: {:?}", other))),
    }
}

fn virtual_rows<B: BlockRead + ?Sized>(
    block: &B,
    column: usize,
    test: impl Fn(&Value) -> bool,
) -> Result<Vec<usize>> {
    let mut rows = Vec::new();
    for row in 0..block.row_count() {
        if test(&block.value(column, row)?) {
            rows.push(row);
        }
    }
    Ok(rows)
}

fn matches_value(v: &Value, op: CompareOp, target: &Value) -> bool {
    match (v.is_null(), target.is_null()) {
        (_, true) => match op {
            CompareOp::Equal => v.is_null(),
            CompareOp::NotEqual => !v.is_null(),
            _ => false,
        },
        (true, false) => false,
        (false, false) => op.matches(v.total_cmp(target)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockBuilder, ReadOnlyBlock};
    use crate::data::{ColumnDef, DataType, TableSchema};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;

    fn block() -> BlockBuilder {
        let schema = Arc::new(
            TableSchema::new(
                "t",
                vec![
                    ColumnDef::new("n", DataType::Int64),
                    ColumnDef::new("tag", DataType::String).nullable(true),
                ],
            )
            .unwrap(),
        );
        let mut b = BlockBuilder::new(schema);
        for i in 0..10u64 {
            let tag = if i % 3 == 0 { Value::Null } else { Value::from(if i < 5 { "lo" } else { "hi" }) };
            b.append_record(100 + i, &[Value::Int64(i as i64), tag]).unwrap();
        }
        b
    }

    fn cmp(column: usize, op: CompareOp, value: impl Into<Value>) -> Predicate {
        Predicate::Compare {
            column,
            op,
            value: value.into(),
        }
    }

    #[test]
    fn test_simplify_identities() {
        assert_eq!(Predicate::And(vec![]).simplify(5), Predicate::All);
        assert_eq!(Predicate::Or(vec![]).simplify(5), Predicate::Nothing);
        assert_eq!(
            Predicate::And(vec![Predicate::Rows(vec![1, 2, 3]), Predicate::Rows(vec![2, 3, 4])]).simplify(5),
            Predicate::Rows(vec![2, 3])
        );
        assert_eq!(
            Predicate::Or(vec![Predicate::Rows(vec![0, 1, 2]), Predicate::Rows(vec![3, 4])]).simplify(5),
            Predicate::All
        );
        let leaf = cmp(0, CompareOp::Equal, 1);
        assert_eq!(
            Predicate::And(vec![leaf.clone(), Predicate::Rows(vec![])]).simplify(5),
            Predicate::Nothing
        );
        assert_eq!(
            Predicate::Or(vec![Predicate::Nothing, Predicate::And(vec![leaf.clone()])]).simplify(5),
            leaf
        );
    }

    #[test]
    fn test_resolve_nested() {
        let b = block();
        let pred = Predicate::And(vec![
            cmp(0, CompareOp::GreaterEqual, 2),
            Predicate::Or(vec![
                cmp(1, CompareOp::Equal, Value::Null),
                Predicate::In {
                    column: 1,
                    values: vec![Value::from("lo")],
                },
            ]),
        ]);
        assert_eq!(resolve(&b, &pred).unwrap(), vec![2, 3, 4, 6, 9]);
    }

    #[test]
    fn test_resolve_virtual_columns() {
        let b = block();
        let rows = resolve(&b, &cmp(b.schema().row_index_column(), CompareOp::LessThan, 3)).unwrap();
        assert_eq!(rows, vec![0, 1, 2]);
        let in_memory = resolve(&b, &cmp(b.schema().block_id_column(), CompareOp::Equal, Value::Null)).unwrap();
        assert_eq!(in_memory.len(), 10);
    }

    #[test]
    fn test_resolve_terminal_shortcuts() {
        let b = block();
        assert_eq!(resolve(&b, &Predicate::All).unwrap().len(), 10);
        assert!(resolve(&b, &Predicate::Nothing).unwrap().is_empty());
        assert_eq!(resolve(&b, &Predicate::Rows(vec![4])).unwrap(), vec![4]);
    }

    const OPS: [CompareOp; 6] = [
        CompareOp::Equal,
        CompareOp::NotEqual,
        CompareOp::LessThan,
        CompareOp::LessEqual,
        CompareOp::GreaterThan,
        CompareOp::GreaterEqual,
    ];

    fn random_value(rng: &mut StdRng, data_type: DataType) -> Value {
        match data_type {
            DataType::Int64 => Value::Int64(rng.gen_range(-20..20)),
            DataType::String => Value::from(["a", "b", "c", "d", "e"][rng.gen_range(0..5)]),
            DataType::Float64 => Value::Float64(rng.gen_range(-8..8) as f64 / 2.0),
            DataType::Bool => Value::Bool(rng.gen()),
            _ => unreachable!(),
        }
    }

    fn random_cell(rng: &mut StdRng, def: &ColumnDef) -> Value {
        if def.nullable && rng.gen_bool(0.2) {
            Value::Null
        } else {
            random_value(rng, def.data_type)
        }
    }

    fn random_predicate(rng: &mut StdRng, defs: &[ColumnDef], depth: usize) -> Predicate {
        if depth > 0 && rng.gen_bool(0.4) {
            let parts = (0..rng.gen_range(1..4))
                .map(|_| random_predicate(rng, defs, depth - 1))
                .collect();
            return if rng.gen() {
                Predicate::And(parts)
            } else {
                Predicate::Or(parts)
            };
        }
        let column = rng.gen_range(0..defs.len());
        let def = &defs[column];
        if rng.gen_bool(0.25) {
            let values = (0..rng.gen_range(1..4))
                .map(|_| random_cell(rng, def))
                .collect();
            return Predicate::In { column, values };
        }
        let value = random_cell(rng, def);
        let op = if value.is_null() || !def.data_type.is_ordered() {
            OPS[rng.gen_range(0..2)]
        } else {
            OPS[rng.gen_range(0..OPS.len())]
        };
        Predicate::Compare { column, op, value }
    }

    /// Row-by-row evaluation over plain values
    fn oracle(row: &[Value], predicate: &Predicate) -> bool {
        match predicate {
            Predicate::All => true,
            Predicate::Nothing => false,
            Predicate::Compare { column, op, value } => {
                let cell = &row[*column];
                match (cell.is_null(), value.is_null()) {
                    (_, true) => (*op == CompareOp::Equal) == cell.is_null(),
                    (true, false) => false,
                    (false, false) => op.matches(cell.total_cmp(value)),
                }
            }
            Predicate::In { column, values } => {
                let cell = &row[*column];
                values.iter().any(|v| v.is_null() == cell.is_null() && v.total_cmp(cell).is_eq())
            }
            Predicate::And(parts) => parts.iter().all(|p| oracle(row, p)),
            Predicate::Or(parts) => parts.iter().any(|p| oracle(row, p)),
            Predicate::Rows(_) => unreachable!(),
        }
    }

    #[test]
    fn test_random_predicates_match_row_by_row_evaluation() {
        let defs = vec![
            ColumnDef::new("n", DataType::Int64).nullable(true),
            ColumnDef::new("tag", DataType::String).nullable(true),
            ColumnDef::new("score", DataType::Float64).nullable(true),
            ColumnDef::new("flag", DataType::Bool),
        ];
        let schema = Arc::new(TableSchema::new("t", defs.clone()).unwrap());
        let mut rng = StdRng::seed_from_u64(11);

        let mut builder = BlockBuilder::new(schema.clone());
        let mut rows = Vec::new();
        for rid in 0..300u64 {
            let row: Vec<Value> = defs.iter().map(|d| random_cell(&mut rng, d)).collect();
            builder.append_record(rid, &row).unwrap();
            rows.push(row);
        }
        let serialized = builder.serialize().unwrap();
        let persisted = ReadOnlyBlock::from_serialized(schema, Some(1), &serialized).unwrap();

        for _ in 0..200 {
            let predicate = random_predicate(&mut rng, &defs, 3);
            let expected: Vec<usize> = (0..rows.len())
                .filter(|&r| oracle(&rows[r], &predicate))
                .collect();
            assert_eq!(resolve(&builder, &predicate).unwrap(), expected, "{:?}", predicate);
            assert_eq!(resolve(&persisted, &predicate).unwrap(), expected, "{:?}", predicate);
        }
    }
}
