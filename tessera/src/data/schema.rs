//! Table schemas
//!
//! Every table stores its user columns followed by the record-id column.
//! Two virtual columns follow the stored ones: the row index inside a block
//! and the block id. Metadata tables derive their columns from the parent
//! table they describe:
//!
//! ```text
//!   parent:  c0  c1  ...  c(p-1)=$rid
//!   meta:    $min:c0 $max:c0 ... $min:$rid $max:$rid $items $bytes $block_id $rid
//!            └ 2c ┘  └2c+1┘                          2p     2p+1   2p+2     2p+3
//! ```

use std::sync::Arc;

use ahash::AHashMap;

use super::{ColumnDef, DataType};
use crate::{Result, TesseraError};

/// Name of the record-id column present in every table
pub const RECORD_ID_COLUMN: &str = "$rid";
/// Virtual column: position of a row inside its block
pub const ROW_INDEX_COLUMN: &str = "$row";
/// Virtual column: persisted block holding a row (null while in memory)
pub const BLOCK_ID_COLUMN: &str = "$block";
/// Prefix of metadata table names
pub const METADATA_PREFIX: &str = "$meta:";
/// Name of the tombstone system table
pub const TOMBSTONE_TABLE: &str = "$tombstones";

/// Role of a table in the database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Data,
    /// Describes the blocks of the table one level below
    Metadata { level: u32 },
    Tombstone,
}

/// Column positions of a metadata table, relative to its parent width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaLayout {
    parent_columns: usize,
}

impl MetaLayout {
    pub fn min(&self, parent_column: usize) -> usize {
        2 * parent_column
    }

    pub fn max(&self, parent_column: usize) -> usize {
        2 * parent_column + 1
    }

    pub fn item_count(&self) -> usize {
        2 * self.parent_columns
    }

    pub fn byte_size(&self) -> usize {
        2 * self.parent_columns + 1
    }

    pub fn block_id(&self) -> usize {
        2 * self.parent_columns + 2
    }

    pub fn parent_columns(&self) -> usize {
        self.parent_columns
    }
}

/// Table schema
#[derive(Debug, Clone)]
pub struct TableSchema {
    name: String,
    columns: Vec<ColumnDef>,
    kind: TableKind,
    parent: Option<Arc<TableSchema>>,
    /// Columns bounding the data record-id range covered by a row
    key_lo: usize,
    key_hi: usize,
    index: AHashMap<String, usize>,
}

impl PartialEq for TableSchema {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.columns == other.columns && self.kind == other.kind
    }
}

impl TableSchema {
    /// Declare a user data table. The record-id column is appended.
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name.starts_with('$') {
            return Err(TesseraError::ReservedName(name));
        }
        for col in &columns {
            if col.name.is_empty() || col.name.starts_with('$') {
                return Err(TesseraError::ReservedName(col.name.clone()));
            }
        }
        Self::build(name, columns, TableKind::Data, None)
    }

    /// Schema of the tombstone system table
    pub fn tombstones() -> Self {
        let columns = vec![
            ColumnDef::new("record_id", DataType::Int64),
            ColumnDef::new("table", DataType::String),
            ColumnDef::new("block_id", DataType::Int64).nullable(true),
            ColumnDef::new("deleted_at", DataType::Timestamp),
        ];
        Self::system(TOMBSTONE_TABLE.to_string(), columns, TableKind::Tombstone, None)
    }

    /// Schema of the metadata table describing the blocks of `parent`
    pub fn metadata_for(parent: &Arc<TableSchema>) -> Self {
        let mut columns = Vec::with_capacity(2 * parent.columns.len() + 3);
        for col in &parent.columns {
            columns.push(col.bound_of("$min:"));
            columns.push(col.bound_of("$max:"));
        }
        columns.push(ColumnDef::new("$items", DataType::Int64));
        columns.push(ColumnDef::new("$bytes", DataType::Int64));
        columns.push(ColumnDef::new("$block_id", DataType::Int64));

        let level = parent.level() + 1;
        let mut schema = Self::system(
            metadata_name(&parent.name),
            columns,
            TableKind::Metadata { level },
            Some(parent.clone()),
        );
        schema.key_lo = 2 * parent.key_lo;
        schema.key_hi = 2 * parent.key_hi + 1;
        schema
    }

    fn system(
        name: String,
        columns: Vec<ColumnDef>,
        kind: TableKind,
        parent: Option<Arc<TableSchema>>,
    ) -> Self {
        match Self::build(name, columns, kind, parent) {
            Ok(schema) => schema,
            // system column names are generated and unique
            Err(e) => unreachable!("invalid system schema: {}", e),
        }
    }

    fn build(
        name: String,
        mut columns: Vec<ColumnDef>,
        kind: TableKind,
        parent: Option<Arc<TableSchema>>,
    ) -> Result<Self> {
        columns.push(ColumnDef::new(RECORD_ID_COLUMN, DataType::Int64));
        let mut index = AHashMap::with_capacity(columns.len() + 2);
        for (i, col) in columns.iter().enumerate() {
            if index.insert(col.name.clone(), i).is_some() {
                return Err(TesseraError::DuplicateColumn(col.name.clone()));
            }
        }
        let rid = columns.len() - 1;
        index.insert(ROW_INDEX_COLUMN.to_string(), columns.len());
        index.insert(BLOCK_ID_COLUMN.to_string(), columns.len() + 1);
        Ok(Self {
            name,
            columns,
            kind,
            parent,
            key_lo: rid,
            key_hi: rid,
            index,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    /// Hierarchy level: 0 for data and tombstone tables
    pub fn level(&self) -> u32 {
        match self.kind {
            TableKind::Metadata { level } => level,
            _ => 0,
        }
    }

    pub fn is_metadata(&self) -> bool {
        matches!(self.kind, TableKind::Metadata { .. })
    }

    /// Tables whose rows are written by the engine rather than the host
    pub fn is_system(&self) -> bool {
        self.kind != TableKind::Data
    }

    pub fn parent(&self) -> Option<&Arc<TableSchema>> {
        self.parent.as_ref()
    }

    /// Stored columns, record id last
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn column(&self, idx: usize) -> Option<&ColumnDef> {
        self.columns.get(idx)
    }

    /// Stored columns including the record id
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Columns supplied by the host on append
    pub fn user_column_count(&self) -> usize {
        self.columns.len() - 1
    }

    pub fn record_id_column(&self) -> usize {
        self.columns.len() - 1
    }

    pub fn row_index_column(&self) -> usize {
        self.columns.len()
    }

    pub fn block_id_column(&self) -> usize {
        self.columns.len() + 1
    }

    pub fn is_virtual(&self, idx: usize) -> bool {
        idx >= self.columns.len()
    }

    /// Type of a stored or virtual column
    pub fn column_type(&self, idx: usize) -> Option<DataType> {
        match self.columns.get(idx) {
            Some(col) => Some(col.data_type),
            None if idx <= self.block_id_column() => Some(DataType::Int64),
            None => None,
        }
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn resolve(&self, name: &str) -> Result<usize> {
        self.index_of(name)
            .ok_or_else(|| TesseraError::ColumnNotFound(format!("{}.{}", self.name, name)))
    }

    pub fn column_name(&self, idx: usize) -> &str {
        match self.columns.get(idx) {
            Some(col) => &col.name,
            None if idx == self.row_index_column() => ROW_INDEX_COLUMN,
            None => BLOCK_ID_COLUMN,
        }
    }

    /// Column whose values order rows: the record id for data tables, the
    /// propagated minimum record id for metadata tables.
    pub fn key_column(&self) -> usize {
        self.key_lo
    }

    /// Columns holding the lowest and highest data record id covered by a row
    pub fn key_range_columns(&self) -> (usize, usize) {
        (self.key_lo, self.key_hi)
    }

    /// Layout of this metadata table relative to its parent
    pub fn meta_layout(&self) -> Option<MetaLayout> {
        self.parent.as_ref().map(|p| MetaLayout {
            parent_columns: p.column_count(),
        })
    }

    /// Whether two schemas store the same user columns
    pub fn same_columns(&self, other: &TableSchema) -> bool {
        self.columns == other.columns
    }
}

/// Name of the metadata table describing `table`
pub fn metadata_name(table: &str) -> String {
    format!("{}{}", METADATA_PREFIX, table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> Arc<TableSchema> {
        Arc::new(
            TableSchema::new(
                "users",
                vec![
                    ColumnDef::new("name", DataType::String),
                    ColumnDef::new("age", DataType::Int64).nullable(true),
                ],
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_record_id_and_virtual_columns() {
        let schema = users();
        assert_eq!(schema.column_count(), 3);
        assert_eq!(schema.record_id_column(), 2);
        assert_eq!(schema.resolve(RECORD_ID_COLUMN).unwrap(), 2);
        assert_eq!(schema.resolve(ROW_INDEX_COLUMN).unwrap(), 3);
        assert_eq!(schema.resolve(BLOCK_ID_COLUMN).unwrap(), 4);
        assert!(schema.resolve("missing").is_err());
    }

    #[test]
    fn test_rejects_reserved_and_duplicate_names() {
        assert!(matches!(
            TableSchema::new("$t", vec![]),
            Err(TesseraError::ReservedName(_))
        ));
        assert!(matches!(
            TableSchema::new("t", vec![ColumnDef::new("$x", DataType::Int64)]),
            Err(TesseraError::ReservedName(_))
        ));
        assert!(matches!(
            TableSchema::new(
                "t",
                vec![
                    ColumnDef::new("a", DataType::Int64),
                    ColumnDef::new("a", DataType::Bool)
                ]
            ),
            Err(TesseraError::DuplicateColumn(_))
        ));
    }

    #[test]
    fn test_metadata_layout() {
        let data = users();
        let meta = Arc::new(TableSchema::metadata_for(&data));
        assert_eq!(meta.name(), "$meta:users");
        assert_eq!(meta.level(), 1);

        let layout = meta.meta_layout().unwrap();
        assert_eq!(layout.min(1), 2);
        assert_eq!(layout.max(1), 3);
        assert_eq!(layout.item_count(), 6);
        assert_eq!(layout.byte_size(), 7);
        assert_eq!(layout.block_id(), 8);
        assert_eq!(meta.record_id_column(), 9);
        assert_eq!(meta.column(2).unwrap().data_type, DataType::Int64);
        assert_eq!(meta.key_range_columns(), (4, 5));

        let meta2 = TableSchema::metadata_for(&meta);
        assert_eq!(meta2.name(), "$meta:$meta:users");
        assert_eq!(meta2.level(), 2);
        assert_eq!(meta2.key_range_columns(), (8, 11));
    }
}
