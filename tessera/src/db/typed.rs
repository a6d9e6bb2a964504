//! Tables bound to a host record type

use std::marker::PhantomData;
use std::sync::Arc;

use super::Database;
use crate::data::{Record, TableSchema};
use crate::query::{Filter, Query};
use crate::txn::Transaction;
use crate::{RecordId, Result};

/// A table whose rows map to `R`
pub struct TypedTable<R: Record> {
    db: Database,
    schema: Arc<TableSchema>,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> Clone for TypedTable<R> {
    fn clone(&self) -> Self {
        Self::new(self.db.clone(), self.schema.clone())
    }
}

impl<R: Record> std::fmt::Debug for TypedTable<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedTable")
            .field("table", &self.schema.name())
            .finish()
    }
}

impl<R: Record> TypedTable<R> {
    pub(crate) fn new(db: Database, schema: Arc<TableSchema>) -> Self {
        Self {
            db,
            schema,
            _record: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        self.schema.name()
    }

    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    pub fn append(&self, txn: &mut Transaction, record: &R) -> Result<RecordId> {
        txn.append(self.name(), &record.to_values())
    }

    pub fn append_all<'r>(
        &self,
        txn: &mut Transaction,
        records: impl IntoIterator<Item = &'r R>,
    ) -> Result<Vec<RecordId>>
    where
        R: 'r,
    {
        txn.append_many(self.name(), records.into_iter().map(Record::to_values))
    }

    /// Visible records matching `filter`, by record id
    pub fn query(&self, txn: &Transaction, filter: Filter) -> Result<Vec<(RecordId, R)>> {
        txn.query_with_ids(&Query::new(self.name()).filter(filter))?
            .into_iter()
            .map(|(rid, values)| Ok((rid, R::from_values(&values)?)))
            .collect()
    }

    pub fn delete(&self, txn: &mut Transaction, filter: Filter) -> Result<usize> {
        txn.delete(self.name(), filter)
    }

    /// Every visible record, in a fresh read-only transaction
    pub fn all(&self) -> Result<Vec<(RecordId, R)>> {
        let txn = self.db.begin_read_only()?;
        let records = self.query(&txn, Filter::True)?;
        txn.commit()?;
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::data::{field, ColumnDef, DataType, Value};
    use crate::TesseraError;

    #[derive(Debug, Clone, PartialEq)]
    struct Sensor {
        name: String,
        reading: f64,
    }

    impl Record for Sensor {
        fn columns() -> Vec<ColumnDef> {
            vec![
                ColumnDef::new("name", DataType::String),
                ColumnDef::new("reading", DataType::Float64),
            ]
        }

        fn to_values(&self) -> Vec<Value> {
            vec![Value::from(self.name.as_str()), Value::Float64(self.reading)]
        }

        fn from_values(values: &[Value]) -> Result<Self> {
            Ok(Self {
                name: field(values, 0, "name", |v| v.as_str().map(str::to_string))?,
                reading: field(values, 1, "reading", Value::as_f64)?,
            })
        }
    }

    #[test]
    fn test_typed_round_trip() {
        let db = Database::open(DatabaseConfig::default()).unwrap();
        let sensors = db.create_typed_table::<Sensor>("sensors").unwrap();
        let records = vec![
            Sensor { name: "a".into(), reading: 1.5 },
            Sensor { name: "b".into(), reading: -2.0 },
        ];
        let mut txn = db.begin().unwrap();
        let ids = sensors.append_all(&mut txn, &records).unwrap();
        txn.commit().unwrap();

        let all = sensors.all().unwrap();
        assert_eq!(all.iter().map(|(id, _)| *id).collect::<Vec<_>>(), ids);
        assert_eq!(all.into_iter().map(|(_, r)| r).collect::<Vec<_>>(), records);

        let txn = db.begin_read_only().unwrap();
        let low = sensors.query(&txn, Filter::lt("reading", 0.0)).unwrap();
        assert_eq!(low.len(), 1);
        assert_eq!(low[0].1.name, "b");
    }

    #[test]
    fn test_typed_table_checks_columns() {
        let db = Database::open(DatabaseConfig::default()).unwrap();
        db.create_table(
            TableSchema::new("sensors", vec![ColumnDef::new("name", DataType::String)]).unwrap(),
        )
        .unwrap();
        assert!(matches!(
            db.typed_table::<Sensor>("sensors"),
            Err(TesseraError::SchemaMismatch(_))
        ));
    }
}
