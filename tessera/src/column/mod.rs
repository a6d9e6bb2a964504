//! Column store
//!
//! Logical columns adapted onto two physical classes:
//!
//! | logical   | physical | mapping                                   |
//! |-----------|----------|-------------------------------------------|
//! | Bool      | Int      | false = 0, true = 1                       |
//! | Int64     | Int      | identity                                  |
//! | Float64   | Int      | order-preserving bit transform            |
//! | Timestamp | Int      | microseconds                              |
//! | Enum      | Int      | ordinal, null = -1 sentinel               |
//! | String    | Str      | identity                                  |
//! | Uri       | Str      | validated `scheme:rest`                   |

mod int_column;
mod str_column;

pub use int_column::{IntColumn, NullRepr};
pub use str_column::StrColumn;

use ahash::AHashSet;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::codec::{IntStats, StrStats};
use crate::data::{DataType, PhysicalType, Value};
use crate::query::CompareOp;
use crate::{Result, TesseraError};

/// Row count above which filters scan in parallel
pub(crate) const PARALLEL_THRESHOLD: usize = 64 * 1024;
/// Capacity below which deleted-from columns are never shrunk
const MIN_SHRINK_CAPACITY: usize = 1024;
/// Null stand-in for nullable enum columns
const ENUM_NULL_SENTINEL: i64 = -1;

static URI_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*:\S+$").expect("static URI pattern"));

/// Shrink a vector that deletions left mostly empty, keeping headroom so
/// alternating deletes and appends do not reallocate every time.
pub(crate) fn shrink_sparse<T>(values: &mut Vec<T>) {
    let cap = values.capacity();
    if cap > MIN_SHRINK_CAPACITY && values.len() * 4 < cap {
        values.shrink_to(values.len() * 2);
    }
}

/// Map a float onto an i64 whose signed order matches `f64::total_cmp`.
/// The transform is its own inverse.
#[inline]
pub fn float_to_key(f: f64) -> i64 {
    let bits = f.to_bits() as i64;
    bits ^ (((bits >> 63) as u64) >> 1) as i64
}

#[inline]
pub fn key_to_float(key: i64) -> f64 {
    f64::from_bits((key ^ (((key >> 63) as u64) >> 1) as i64) as u64)
}

pub fn is_valid_uri(s: &str) -> bool {
    URI_PATTERN.is_match(s)
}

/// Logical statistics of an encoded column
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMeta {
    pub has_nulls: bool,
    /// Null when no value is present
    pub min: Value,
    pub max: Value,
}

/// Physical storage behind a logical column
#[derive(Debug, Clone)]
pub enum ColumnData {
    Int(IntColumn),
    Str(StrColumn),
}

/// A typed, append-only (plus delete) column
#[derive(Debug, Clone)]
pub struct Column {
    data_type: DataType,
    nullable: bool,
    data: ColumnData,
}

impl Column {
    pub fn new(data_type: DataType, nullable: bool) -> Self {
        let data = match data_type.physical() {
            PhysicalType::Str => ColumnData::Str(StrColumn::new()),
            PhysicalType::Int => ColumnData::Int(IntColumn::new(null_repr(data_type, nullable))),
        };
        Self {
            data_type,
            nullable,
            data,
        }
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn nullable(&self) -> bool {
        self.nullable
    }

    pub fn data(&self) -> &ColumnData {
        &self.data
    }

    pub fn len(&self) -> usize {
        match &self.data {
            ColumnData::Int(c) => c.len(),
            ColumnData::Str(c) => c.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Validate a value against this column without storing it
    pub fn check(&self, value: &Value, name: &str) -> Result<()> {
        if value.is_null() {
            if self.nullable {
                return Ok(());
            }
            return Err(TesseraError::NullViolation(name.to_string()));
        }
        if value.data_type() != Some(self.data_type) {
            return Err(TesseraError::type_mismatch(name, self.data_type, value));
        }
        if let Value::Uri(s) = value {
            if !is_valid_uri(s) {
                return Err(TesseraError::TypeMismatch {
                    column: name.to_string(),
                    expected: "absolute URI".to_string(),
                    actual: s.clone(),
                });
            }
        }
        Ok(())
    }

    /// Append a value after validating it. `name` is used in errors.
    pub fn push(&mut self, value: &Value, name: &str) -> Result<()> {
        self.check(value, name)?;
        match &mut self.data {
            ColumnData::Int(c) => c.push(int_physical(value)),
            ColumnData::Str(c) => c.push(value.as_str().map(str::to_string)),
        }
        Ok(())
    }

    pub fn get(&self, row: usize) -> Value {
        match &self.data {
            ColumnData::Int(c) => match c.get(row) {
                Some(v) => int_logical(self.data_type, v),
                None => Value::Null,
            },
            ColumnData::Str(c) => match c.get(row) {
                Some(s) if self.data_type == DataType::Uri => Value::Uri(s.to_string()),
                Some(s) => Value::String(s.to_string()),
                None => Value::Null,
            },
        }
    }

    /// Integer view of a row (ints, timestamps, enum ordinals)
    pub fn get_i64(&self, row: usize) -> Option<i64> {
        match &self.data {
            ColumnData::Int(c) => c.get(row),
            ColumnData::Str(_) => None,
        }
    }

    pub fn delete_sorted(&mut self, rows: &[usize]) {
        match &mut self.data {
            ColumnData::Int(c) => c.delete_sorted(rows),
            ColumnData::Str(c) => c.delete_sorted(rows),
        }
    }

    pub fn select(&self, rows: &[usize]) -> Column {
        let data = match &self.data {
            ColumnData::Int(c) => ColumnData::Int(c.select(rows)),
            ColumnData::Str(c) => ColumnData::Str(c.select(rows)),
        };
        Column {
            data_type: self.data_type,
            nullable: self.nullable,
            data,
        }
    }

    /// Append `rows` of `other`, which must share this column's type
    pub fn extend_rows(&mut self, other: &Column, rows: &[usize], name: &str) -> Result<()> {
        self.check_compatible(other, name)?;
        match (&mut self.data, &other.data) {
            (ColumnData::Int(a), ColumnData::Int(b)) => a.extend_rows(b, rows),
            (ColumnData::Str(a), ColumnData::Str(b)) => a.extend_rows(b, rows),
            _ => return Err(self.incompatible(other, name)),
        }
        Ok(())
    }

    pub fn extend(&mut self, other: &Column, name: &str) -> Result<()> {
        self.check_compatible(other, name)?;
        match (&mut self.data, &other.data) {
            (ColumnData::Int(a), ColumnData::Int(b)) => a.extend(b),
            (ColumnData::Str(a), ColumnData::Str(b)) => a.extend(b),
            _ => return Err(self.incompatible(other, name)),
        }
        Ok(())
    }

    fn check_compatible(&self, other: &Column, name: &str) -> Result<()> {
        if self.data_type != other.data_type || (!self.nullable && other.nullable) {
            return Err(self.incompatible(other, name));
        }
        Ok(())
    }

    fn incompatible(&self, other: &Column, name: &str) -> TesseraError {
        TesseraError::SchemaMismatch(format!(
            "column {}: cannot copy {}{} into {}{}",
            name,
            other.data_type,
            if other.nullable { "?" } else { "" },
            self.data_type,
            if self.nullable { "?" } else { "" },
        ))
    }

    /// Rows satisfying `op target`. Comparing against Null means is-null
    /// (Equal) or is-not-null (NotEqual).
    pub fn filter(&self, op: CompareOp, target: &Value, name: &str) -> Result<Vec<usize>> {
        if target.is_null() {
            if !matches!(op, CompareOp::Equal | CompareOp::NotEqual) {
                return Err(TesseraError::UnsupportedOperator {
                    op: op.to_string(),
                    data_type: "Null".to_string(),
                });
            }
        } else {
            if !self.data_type.supports(op) {
                return Err(TesseraError::UnsupportedOperator {
                    op: op.to_string(),
                    data_type: self.data_type.to_string(),
                });
            }
            if target.data_type() != Some(self.data_type) {
                return Err(TesseraError::type_mismatch(name, self.data_type, target));
            }
        }
        Ok(match &self.data {
            ColumnData::Int(c) => c.filter(op, int_physical(target)),
            ColumnData::Str(c) => c.filter(op, target.as_str()),
        })
    }

    pub fn filter_in(&self, targets: &[Value], name: &str) -> Result<Vec<usize>> {
        let include_nulls = targets.iter().any(Value::is_null);
        for t in targets.iter().filter(|t| !t.is_null()) {
            if t.data_type() != Some(self.data_type) {
                return Err(TesseraError::type_mismatch(name, self.data_type, t));
            }
        }
        Ok(match &self.data {
            ColumnData::Int(c) => {
                let set: AHashSet<i64> = targets.iter().filter_map(int_physical).collect();
                c.filter_in(&set, include_nulls)
            }
            ColumnData::Str(c) => {
                let set: AHashSet<&str> = targets.iter().filter_map(Value::as_str).collect();
                c.filter_in(&set, include_nulls)
            }
        })
    }

    /// Encode the first `n` rows
    pub fn encode(&self, n: usize) -> (Vec<u8>, ColumnMeta) {
        match &self.data {
            ColumnData::Int(c) => {
                let encoded = c.encode(n);
                let (has_nulls, min, max) = match c.repr() {
                    NullRepr::Sentinel(_) => c.logical_stats(n),
                    _ => (encoded.stats.has_nulls, encoded.stats.min, encoded.stats.max),
                };
                let meta = ColumnMeta {
                    has_nulls,
                    min: min.map_or(Value::Null, |v| int_logical(self.data_type, v)),
                    max: max.map_or(Value::Null, |v| int_logical(self.data_type, v)),
                };
                (encoded.payload, meta)
            }
            ColumnData::Str(c) => {
                let encoded = c.encode(n);
                let wrap = |s: Option<String>| match s {
                    None => Value::Null,
                    Some(s) if self.data_type == DataType::Uri => Value::Uri(s),
                    Some(s) => Value::String(s),
                };
                let meta = ColumnMeta {
                    has_nulls: encoded.stats.has_nulls,
                    min: wrap(encoded.stats.min),
                    max: wrap(encoded.stats.max),
                };
                (encoded.payload, meta)
            }
        }
    }

    /// Payload size of the first `n` rows
    pub fn encoded_len(&self, n: usize) -> usize {
        match &self.data {
            ColumnData::Int(c) => c.encoded_len(n),
            ColumnData::Str(c) => c.encoded_len(n),
        }
    }

    /// Rebuild a column from its payload and logical statistics
    pub fn decode(
        data_type: DataType,
        nullable: bool,
        item_count: usize,
        meta: &ColumnMeta,
        payload: &[u8],
    ) -> Result<Column> {
        let data = match data_type.physical() {
            PhysicalType::Int => {
                let repr = null_repr(data_type, nullable);
                let min = int_physical(&meta.min);
                let max = int_physical(&meta.max);
                let stats = match repr {
                    NullRepr::Sentinel(s) => IntStats {
                        item_count,
                        has_nulls: false,
                        min: if meta.has_nulls { Some(s) } else { min },
                        max: max.or(if meta.has_nulls { Some(s) } else { None }),
                    },
                    _ => IntStats {
                        item_count,
                        has_nulls: meta.has_nulls,
                        min,
                        max,
                    },
                };
                ColumnData::Int(IntColumn::decode(&stats, payload, repr)?)
            }
            PhysicalType::Str => {
                let stats = StrStats {
                    item_count,
                    has_nulls: meta.has_nulls,
                    min: meta.min.as_str().map(str::to_string),
                    max: meta.max.as_str().map(str::to_string),
                };
                ColumnData::Str(StrColumn::decode(&stats, payload)?)
            }
        };
        let column = Column {
            data_type,
            nullable,
            data,
        };
        if column.len() != item_count {
            return Err(TesseraError::Corrupt(format!(
                "decoded {} rows, expected {}",
                column.len(),
                item_count
            )));
        }
        Ok(column)
    }
}

fn null_repr(data_type: DataType, nullable: bool) -> NullRepr {
    match (nullable, data_type) {
        (false, _) => NullRepr::None,
        (true, DataType::Enum) => NullRepr::Sentinel(ENUM_NULL_SENTINEL),
        (true, _) => NullRepr::Bitmap,
    }
}

/// Physical integer of a non-string value
fn int_physical(value: &Value) -> Option<i64> {
    match value {
        Value::Bool(b) => Some(*b as i64),
        Value::Int64(v) | Value::Timestamp(v) => Some(*v),
        Value::Float64(f) => Some(float_to_key(*f)),
        Value::Enum(o) => Some(*o as i64),
        _ => None,
    }
}

fn int_logical(data_type: DataType, v: i64) -> Value {
    match data_type {
        DataType::Bool => Value::Bool(v != 0),
        DataType::Float64 => Value::Float64(key_to_float(v)),
        DataType::Timestamp => Value::Timestamp(v),
        DataType::Enum => Value::Enum(v as u32),
        _ => Value::Int64(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn filled(data_type: DataType, nullable: bool, values: &[Value]) -> Column {
        let mut col = Column::new(data_type, nullable);
        for v in values {
            col.push(v, "c").unwrap();
        }
        col
    }

    fn reload(col: &Column) -> Column {
        let (payload, meta) = col.encode(col.len());
        Column::decode(col.data_type(), col.nullable(), col.len(), &meta, &payload).unwrap()
    }

    #[test]
    fn test_float_key_preserves_order() {
        let floats = [f64::NEG_INFINITY, -2.5, -0.0, 0.0, 1e-300, 3.75, f64::INFINITY];
        let keys: Vec<i64> = floats.iter().map(|f| float_to_key(*f)).collect();
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        for f in floats {
            assert_eq!(key_to_float(float_to_key(f)).to_bits(), f.to_bits());
        }
    }

    #[test]
    fn test_push_validation() {
        let mut col = Column::new(DataType::Int64, false);
        assert!(matches!(col.push(&Value::Null, "n"), Err(TesseraError::NullViolation(_))));
        assert!(matches!(
            col.push(&Value::from("x"), "n"),
            Err(TesseraError::TypeMismatch { .. })
        ));

        let mut uris = Column::new(DataType::Uri, false);
        assert!(uris.push(&Value::Uri("https://example.com/a".into()), "u").is_ok());
        assert!(uris.push(&Value::Uri("not a uri".into()), "u").is_err());
    }

    #[test]
    fn test_adapters_survive_encoding() {
        let floats = filled(
            DataType::Float64,
            true,
            &[Value::Float64(-1.5), Value::Null, Value::Float64(2.25)],
        );
        let reloaded = reload(&floats);
        assert_eq!(reloaded.get(0), Value::Float64(-1.5));
        assert_eq!(reloaded.get(1), Value::Null);
        assert_eq!(reloaded.get(2), Value::Float64(2.25));

        let enums = filled(
            DataType::Enum,
            true,
            &[Value::Enum(3), Value::Null, Value::Enum(1)],
        );
        let (_, meta) = enums.encode(3);
        assert_eq!(meta.min, Value::Enum(1));
        assert_eq!(meta.max, Value::Enum(3));
        assert!(meta.has_nulls);
        let reloaded = reload(&enums);
        assert_eq!(reloaded.get(1), Value::Null);
        assert_eq!(reloaded.get(2), Value::Enum(1));

        let bools = filled(DataType::Bool, false, &[Value::Bool(true), Value::Bool(false)]);
        assert_eq!(reload(&bools).get(0), Value::Bool(true));
    }

    #[test]
    fn test_filter_rules() {
        let bools = filled(DataType::Bool, false, &[Value::Bool(true), Value::Bool(false)]);
        assert_eq!(bools.filter(CompareOp::Equal, &Value::Bool(false), "b").unwrap(), vec![1]);
        assert!(bools.filter(CompareOp::LessThan, &Value::Bool(true), "b").is_err());

        let ints = filled(DataType::Int64, true, &[Value::Int64(1), Value::Null]);
        assert!(ints.filter(CompareOp::GreaterThan, &Value::Null, "i").is_err());
        assert_eq!(ints.filter(CompareOp::Equal, &Value::Null, "i").unwrap(), vec![1]);
        assert!(ints.filter(CompareOp::Equal, &Value::from("1"), "i").is_err());
        assert_eq!(
            ints.filter_in(&[Value::Int64(1), Value::Null], "i").unwrap(),
            vec![0, 1]
        );
    }

    #[test]
    fn test_all_null_enum_round_trip() {
        let enums = filled(DataType::Enum, true, &[Value::Null, Value::Null]);
        let reloaded = reload(&enums);
        assert_eq!(reloaded.get(0), Value::Null);
        assert_eq!(reloaded.len(), 2);
    }

    fn random_value(rng: &mut StdRng, data_type: DataType, distinct: u32) -> Value {
        let pick = rng.gen_range(0..distinct);
        match data_type {
            DataType::Bool => Value::Bool(pick % 2 == 1),
            DataType::Int64 => match rng.gen_range(0..10) {
                0 => Value::Int64(i64::MIN),
                1 => Value::Int64(i64::MAX),
                _ => Value::Int64(rng.gen_range(-1_000_000..1_000_000)),
            },
            DataType::Float64 => Value::Float64(rng.gen_range(-1e9..1e9)),
            DataType::String => Value::String(format!("s{}", pick)),
            DataType::Timestamp => Value::Timestamp(rng.gen_range(0..4_102_444_800_000_000)),
            DataType::Enum => Value::Enum(pick),
            DataType::Uri => Value::Uri(format!("urn:item-{}", pick)),
        }
    }

    #[test]
    fn test_random_round_trips_every_type() {
        const TYPES: [DataType; 7] = [
            DataType::Bool,
            DataType::Int64,
            DataType::Float64,
            DataType::String,
            DataType::Timestamp,
            DataType::Enum,
            DataType::Uri,
        ];
        let mut rng = StdRng::seed_from_u64(5);
        for data_type in TYPES {
            for round in 0..40 {
                let len = rng.gen_range(1..300);
                // all-null, no nulls, and mixed rows
                let null_rate = match round % 4 {
                    0 => 1.0,
                    1 => 0.0,
                    _ => rng.gen_range(0.05..0.6),
                };
                let distinct = [1, 2, 3, 50][rng.gen_range(0..4)];
                let nullable = null_rate > 0.0 || rng.gen();
                let values: Vec<Value> = (0..len)
                    .map(|_| {
                        if rng.gen_bool(null_rate) {
                            Value::Null
                        } else {
                            random_value(&mut rng, data_type, distinct)
                        }
                    })
                    .collect();
                let col = filled(data_type, nullable, &values);

                let (payload, meta) = col.encode(len);
                let present: Vec<&Value> = values.iter().filter(|v| !v.is_null()).collect();
                let min = present.iter().min_by(|a, b| a.total_cmp(b)).map_or(Value::Null, |v| (*v).clone());
                let max = present.iter().max_by(|a, b| a.total_cmp(b)).map_or(Value::Null, |v| (*v).clone());
                assert_eq!(meta.has_nulls, present.len() < len, "{} round {}", data_type, round);
                assert_eq!(meta.min, min, "{} round {}", data_type, round);
                assert_eq!(meta.max, max, "{} round {}", data_type, round);

                let decoded = Column::decode(data_type, nullable, len, &meta, &payload).unwrap();
                let back: Vec<Value> = (0..len).map(|row| decoded.get(row)).collect();
                assert_eq!(back, values, "{} round {}", data_type, round);
            }
        }
    }
}
