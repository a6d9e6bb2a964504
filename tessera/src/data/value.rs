//! Logical data types and values

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::query::CompareOp;

/// Logical column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int64,
    Float64,
    String,
    /// Microseconds since the Unix epoch
    Timestamp,
    /// Ordinal of a host-defined enumeration
    Enum,
    /// Absolute URI (`scheme:rest`)
    Uri,
}

/// Physical storage class a logical type is adapted onto
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysicalType {
    Int,
    Str,
}

impl DataType {
    pub fn physical(&self) -> PhysicalType {
        match self {
            DataType::String | DataType::Uri => PhysicalType::Str,
            _ => PhysicalType::Int,
        }
    }

    /// Whether values of this type have a meaningful order
    pub fn is_ordered(&self) -> bool {
        !matches!(self, DataType::Bool | DataType::Uri)
    }

    /// Whether a comparison operator can be applied to this type
    pub fn supports(&self, op: CompareOp) -> bool {
        self.is_ordered() || matches!(op, CompareOp::Equal | CompareOp::NotEqual)
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataType::Bool => "Bool",
            DataType::Int64 => "Int64",
            DataType::Float64 => "Float64",
            DataType::String => "String",
            DataType::Timestamp => "Timestamp",
            DataType::Enum => "Enum",
            DataType::Uri => "Uri",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single cell value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    String(String),
    Timestamp(i64),
    Enum(u32),
    Uri(String),
}

impl Value {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(DataType::Bool),
            Value::Int64(_) => Some(DataType::Int64),
            Value::Float64(_) => Some(DataType::Float64),
            Value::String(_) => Some(DataType::String),
            Value::Timestamp(_) => Some(DataType::Timestamp),
            Value::Enum(_) => Some(DataType::Enum),
            Value::Uri(_) => Some(DataType::Uri),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.data_type().map(|t| t.name()).unwrap_or("Null")
    }

    /// Integer view of Int64, Timestamp and Enum values
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) | Value::Timestamp(v) => Some(*v),
            Value::Enum(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float64(v) => Some(*v),
            Value::Int64(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Uri(s) => Some(s),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int64(_) => 2,
            Value::Float64(_) => 3,
            Value::Timestamp(_) => 4,
            Value::Enum(_) => 5,
            Value::String(_) => 6,
            Value::Uri(_) => 7,
        }
    }

    /// Total order used for sorting: nulls first, then by value. Values of
    /// different types order by type.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int64(a), Value::Int64(b)) => a.cmp(b),
            (Value::Float64(a), Value::Float64(b)) => a.total_cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Enum(a), Value::Enum(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Uri(a), Value::Uri(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Float64(v) => write!(f, "{}", v),
            Value::String(v) => write!(f, "'{}'", v),
            Value::Timestamp(v) => match chrono::DateTime::from_timestamp_micros(*v) {
                Some(ts) => write!(f, "{}", ts.to_rfc3339()),
                None => write!(f, "ts:{}", v),
            },
            Value::Enum(v) => write!(f, "#{}", v),
            Value::Uri(v) => write!(f, "<{}>", v),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int64(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<chrono::DateTime<chrono::Utc>> for Value {
    fn from(v: chrono::DateTime<chrono::Utc>) -> Self {
        Value::Timestamp(v.timestamp_micros())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_cmp_nulls_first() {
        let mut values = vec![Value::Int64(3), Value::Null, Value::Int64(-1)];
        values.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(values, vec![Value::Null, Value::Int64(-1), Value::Int64(3)]);
    }

    #[test]
    fn test_operator_support() {
        assert!(DataType::Int64.supports(CompareOp::LessThan));
        assert!(DataType::Bool.supports(CompareOp::Equal));
        assert!(!DataType::Bool.supports(CompareOp::GreaterThan));
        assert!(!DataType::Uri.supports(CompareOp::LessEqual));
    }

    #[test]
    fn test_conversions() {
        assert_eq!(Value::from(Some(5i64)), Value::Int64(5));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from("x").as_str(), Some("x"));
        assert_eq!(Value::Enum(4).as_i64(), Some(4));
    }
}
