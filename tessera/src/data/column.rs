//! Column declarations

use serde::{Deserialize, Serialize};

use super::DataType;

/// A named, typed column of a table
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
    /// Nulls are rejected on append unless set
    pub nullable: bool,
}

impl ColumnDef {
    /// Declare a column that rejects nulls
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        ColumnDef {
            data_type,
            name: name.into(),
            nullable: false,
        }
    }

    pub fn nullable(self, nullable: bool) -> Self {
        ColumnDef { nullable, ..self }
    }

    /// Nullable statistics column `<prefix><name>` bounding this column's values
    pub(crate) fn bound_of(&self, prefix: &str) -> Self {
        ColumnDef {
            name: format!("{}{}", prefix, self.name),
            data_type: self.data_type,
            nullable: true,
        }
    }
}
