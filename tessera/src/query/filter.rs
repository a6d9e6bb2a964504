//! Query filter implementation
//!
//! [`Filter`] is the host-facing condition tree addressing columns by
//! name. Binding it against a schema yields an index-based
//! [`Predicate`] that blocks evaluate.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::predicate::Predicate;
use crate::data::{TableSchema, Value};
use crate::{Result, TesseraError};

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    Equal,
    NotEqual,
    LessThan,
    LessEqual,
    GreaterThan,
    GreaterEqual,
}

impl CompareOp {
    /// Whether `lhs op rhs` holds given `lhs.cmp(rhs)`
    #[inline]
    pub fn matches(self, ord: Ordering) -> bool {
        match self {
            CompareOp::Equal => ord == Ordering::Equal,
            CompareOp::NotEqual => ord != Ordering::Equal,
            CompareOp::LessThan => ord == Ordering::Less,
            CompareOp::LessEqual => ord != Ordering::Greater,
            CompareOp::GreaterThan => ord == Ordering::Greater,
            CompareOp::GreaterEqual => ord != Ordering::Less,
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompareOp::Equal => "=",
            CompareOp::NotEqual => "!=",
            CompareOp::LessThan => "<",
            CompareOp::LessEqual => "<=",
            CompareOp::GreaterThan => ">",
            CompareOp::GreaterEqual => ">=",
        })
    }
}

/// A filter condition
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Always true
    True,
    /// Always false
    False,
    /// Compare field to value
    Compare {
        field: String,
        op: CompareOp,
        value: Value,
    },
    /// IN list
    In { field: String, values: Vec<Value> },
    /// AND combination
    And(Vec<Filter>),
    /// OR combination
    Or(Vec<Filter>),
}

impl Filter {
    pub fn all() -> Self {
        Filter::True
    }

    pub fn none() -> Self {
        Filter::False
    }

    pub fn compare(field: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Filter::Compare {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Equal, value)
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::NotEqual, value)
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::LessThan, value)
    }

    pub fn le(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::LessEqual, value)
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::GreaterThan, value)
    }

    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::GreaterEqual, value)
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Self::compare(field, CompareOp::Equal, Value::Null)
    }

    pub fn is_not_null(field: impl Into<String>) -> Self {
        Self::compare(field, CompareOp::NotEqual, Value::Null)
    }

    pub fn is_in<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Filter::In {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn and(self, other: Filter) -> Self {
        match self {
            Filter::And(mut parts) => {
                parts.push(other);
                Filter::And(parts)
            }
            first => Filter::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Filter) -> Self {
        match self {
            Filter::Or(mut parts) => {
                parts.push(other);
                Filter::Or(parts)
            }
            first => Filter::Or(vec![first, other]),
        }
    }

    /// Resolve column names and check operators against column types
    pub fn bind(&self, schema: &TableSchema) -> Result<Predicate> {
        Ok(match self {
            Filter::True => Predicate::All,
            Filter::False => Predicate::Nothing,
            Filter::Compare { field, op, value } => {
                let column = schema.resolve(field)?;
                check_operand(schema, column, *op, value)?;
                Predicate::Compare {
                    column,
                    op: *op,
                    value: value.clone(),
                }
            }
            Filter::In { field, values } => {
                let column = schema.resolve(field)?;
                for value in values {
                    check_operand(schema, column, CompareOp::Equal, value)?;
                }
                Predicate::In {
                    column,
                    values: values.clone(),
                }
            }
            Filter::And(parts) => {
                Predicate::And(parts.iter().map(|p| p.bind(schema)).collect::<Result<_>>()?)
            }
            Filter::Or(parts) => {
                Predicate::Or(parts.iter().map(|p| p.bind(schema)).collect::<Result<_>>()?)
            }
        })
    }
}

fn check_operand(schema: &TableSchema, column: usize, op: CompareOp, value: &Value) -> Result<()> {
    let Some(data_type) = schema.column_type(column) else {
        return Err(TesseraError::ColumnNotFound(schema.column_name(column).to_string()));
    };
    if value.is_null() {
        if matches!(op, CompareOp::Equal | CompareOp::NotEqual) {
            return Ok(());
        }
        return Err(TesseraError::UnsupportedOperator {
            op: op.to_string(),
            data_type: "Null".to_string(),
        });
    }
    if !data_type.supports(op) {
        return Err(TesseraError::UnsupportedOperator {
            op: op.to_string(),
            data_type: data_type.to_string(),
        });
    }
    if value.data_type() != Some(data_type) {
        return Err(TesseraError::type_mismatch(schema.column_name(column), data_type, value));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ColumnDef, DataType};

    fn schema() -> TableSchema {
        TableSchema::new(
            "t",
            vec![
                ColumnDef::new("id", DataType::Int64),
                ColumnDef::new("active", DataType::Bool),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_bind_resolves_columns() {
        let pred = Filter::gt("id", 5).and(Filter::eq("active", true)).bind(&schema()).unwrap();
        assert_eq!(
            pred,
            Predicate::And(vec![
                Predicate::Compare {
                    column: 0,
                    op: CompareOp::GreaterThan,
                    value: Value::Int64(5)
                },
                Predicate::Compare {
                    column: 1,
                    op: CompareOp::Equal,
                    value: Value::Bool(true)
                },
            ])
        );
        assert_eq!(
            Filter::eq("$row", 0).bind(&schema()).unwrap(),
            Predicate::Compare {
                column: 3,
                op: CompareOp::Equal,
                value: Value::Int64(0)
            }
        );
    }

    #[test]
    fn test_bind_rejects_bad_operands() {
        let s = schema();
        assert!(matches!(Filter::eq("nope", 1).bind(&s), Err(TesseraError::ColumnNotFound(_))));
        assert!(matches!(
            Filter::lt("active", true).bind(&s),
            Err(TesseraError::UnsupportedOperator { .. })
        ));
        assert!(matches!(
            Filter::gt("id", Value::Null).bind(&s),
            Err(TesseraError::UnsupportedOperator { .. })
        ));
        assert!(matches!(Filter::eq("id", "x").bind(&s), Err(TesseraError::TypeMismatch { .. })));
        assert!(Filter::is_null("id").bind(&s).is_ok());
    }

    #[test]
    fn test_compare_op_matches() {
        assert!(CompareOp::LessEqual.matches(Ordering::Equal));
        assert!(!CompareOp::LessThan.matches(Ordering::Equal));
        assert!(CompareOp::NotEqual.matches(Ordering::Greater));
    }
}
