//! Typed record mapping
//!
//! Hosts implement [`Record`] for plain structs to append and query them
//! through a [`crate::TypedTable`] instead of raw value vectors.

use super::{ColumnDef, Value};
use crate::{Result, TesseraError};

/// A host type stored as one row of a table
pub trait Record: Sized {
    /// User columns, in storage order
    fn columns() -> Vec<ColumnDef>;

    /// Column values, in the order of [`Record::columns`]
    fn to_values(&self) -> Vec<Value>;

    /// Rebuild the record from column values in storage order
    fn from_values(values: &[Value]) -> Result<Self>;
}

/// Pull column `idx` out of a row, mapping a wrong type to `TypeMismatch`.
pub fn field<T>(
    values: &[Value],
    idx: usize,
    name: &str,
    extract: impl FnOnce(&Value) -> Option<T>,
) -> Result<T> {
    let value = values.get(idx).ok_or(TesseraError::ArityMismatch {
        expected: idx + 1,
        actual: values.len(),
    })?;
    extract(value).ok_or_else(|| TesseraError::TypeMismatch {
        column: name.to_string(),
        expected: "record field".to_string(),
        actual: value.type_name().to_string(),
    })
}
