//! Data model: logical types, values, column definitions and schemas

mod bitvec;
mod column;
mod record;
mod schema;
mod value;

pub use bitvec::BitVec;
pub use column::ColumnDef;
pub use record::{field, Record};
pub use schema::{
    metadata_name, MetaLayout, TableKind, TableSchema, BLOCK_ID_COLUMN, METADATA_PREFIX,
    RECORD_ID_COLUMN, ROW_INDEX_COLUMN, TOMBSTONE_TABLE,
};
pub use value::{DataType, PhysicalType, Value};
