//! Transaction handle
//!
//! A transaction reads the snapshot captured when it began plus its own
//! uncommitted delta. Appends land in per-table builders of the delta.
//! Deleting a row the transaction appended itself removes it physically;
//! deleting a committed row records a tombstone. Commit publishes the
//! delta into whatever state is current at that moment.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;

use super::state::DatabaseState;
use super::tombstone::{TombstoneIndex, TombstoneRecord};
use crate::block::{BlockBuilder, BlockRead};
use crate::data::{TableSchema, Value};
use crate::db::inner::DbInner;
use crate::db::reader::Reader;
use crate::query::predicate::Predicate;
use crate::query::sort::{sort_rows, ScanRow, SortKey};
use crate::query::{Filter, Query};
use crate::wal::{TableRows, TransactionDelta};
use crate::{BlockId, RecordId, Result, TesseraError, TxnId};

/// Uncommitted changes of one transaction
#[derive(Debug, Default)]
pub(crate) struct Delta {
    pub appended: BTreeMap<String, BlockBuilder>,
    /// Tombstone rows with their own record ids
    pub tombstones: Vec<(RecordId, TombstoneRecord)>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.tombstones.is_empty() && self.appended.values().all(BlockBuilder::is_empty)
    }

    /// Log entry describing the delta
    pub fn to_log(&self, txn_id: TxnId) -> Result<TransactionDelta> {
        let mut tables = Vec::with_capacity(self.appended.len());
        for (table, block) in &self.appended {
            if block.is_empty() {
                continue;
            }
            let user = block.schema().user_column_count();
            let mut rows = Vec::with_capacity(block.len());
            for row in 0..block.len() {
                let mut values = block.row(row)?;
                values.truncate(user);
                rows.push((block.record_id(row)?, values));
            }
            tables.push(TableRows {
                table: table.clone(),
                rows,
            });
        }
        Ok(TransactionDelta {
            txn_id,
            committed_at: Utc::now(),
            tables,
            tombstones: self.tombstones.iter().map(|(_, t)| t.clone()).collect(),
        })
    }

    pub fn tombstone_block(&self, schema: &Arc<TableSchema>) -> Result<Option<BlockBuilder>> {
        if self.tombstones.is_empty() {
            return Ok(None);
        }
        let mut block = BlockBuilder::new(schema.clone());
        for (rid, tombstone) in &self.tombstones {
            block.append_record(*rid, &tombstone.to_values())?;
        }
        Ok(Some(block))
    }
}

/// A visible row found by a scan
struct Hit {
    record_id: RecordId,
    block_id: Option<BlockId>,
    /// Position inside this transaction's own builder
    delta_row: Option<usize>,
    values: Vec<Value>,
}

/// Snapshot-isolated unit of work
///
/// Dropping an unfinished transaction rolls it back.
pub struct Transaction {
    inner: Arc<DbInner>,
    id: TxnId,
    snapshot: Arc<DatabaseState>,
    delta: Delta,
    read_only: bool,
    /// Detached transactions are invisible to the state and never commit
    registered: bool,
    finished: bool,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("snapshot_version", &self.snapshot.version())
            .field("read_only", &self.read_only)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Transaction {
    pub(crate) fn new(
        inner: Arc<DbInner>,
        id: TxnId,
        snapshot: Arc<DatabaseState>,
        read_only: bool,
        registered: bool,
    ) -> Self {
        Self {
            inner,
            id,
            snapshot,
            delta: Delta::default(),
            read_only,
            registered,
            finished: false,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Version of the database state this transaction reads
    pub fn snapshot_version(&self) -> u64 {
        self.snapshot.version()
    }

    pub(crate) fn snapshot(&self) -> &Arc<DatabaseState> {
        &self.snapshot
    }

    fn check_active(&self) -> Result<()> {
        if self.finished {
            return Err(TesseraError::TransactionFinished);
        }
        Ok(())
    }

    fn writable_schema(&self, table: &str) -> Result<Arc<TableSchema>> {
        self.check_active()?;
        let props = self.snapshot.table(table)?;
        if self.read_only || props.schema.is_system() {
            return Err(TesseraError::ReadOnlyTable(table.to_string()));
        }
        Ok(props.schema.clone())
    }

    /// Validate one record into `block` under a fresh record id
    fn stage(&self, block: &mut BlockBuilder, values: &[Value]) -> Result<RecordId> {
        let mut single = BlockBuilder::new(block.schema().clone());
        let rid = self.inner.allocate_record_id();
        single.append_record(rid, values)?;
        let budget = self.inner.config.max_block_size;
        if single.serialized_size(1) > budget {
            return Err(TesseraError::RecordTooLarge(budget));
        }
        block.append_block(&single, None)?;
        Ok(rid)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Append one record given its user column values in schema order
    pub fn append(&mut self, table: &str, values: &[Value]) -> Result<RecordId> {
        let schema = self.writable_schema(table)?;
        let mut staged = BlockBuilder::new(schema.clone());
        let rid = self.stage(&mut staged, values)?;
        self.own_block(&schema).append_block(&staged, None)?;
        Ok(rid)
    }

    /// Append several records; either all of them are staged or none is
    pub fn append_many<I>(&mut self, table: &str, rows: I) -> Result<Vec<RecordId>>
    where
        I: IntoIterator<Item = Vec<Value>>,
    {
        let schema = self.writable_schema(table)?;
        let mut staged = BlockBuilder::new(schema.clone());
        let ids = rows
            .into_iter()
            .map(|values| self.stage(&mut staged, &values))
            .collect::<Result<Vec<_>>>()?;
        self.own_block(&schema).append_block(&staged, None)?;
        Ok(ids)
    }

    fn own_block(&mut self, schema: &Arc<TableSchema>) -> &mut BlockBuilder {
        self.delta
            .appended
            .entry(schema.name().to_string())
            .or_insert_with(|| BlockBuilder::new(schema.clone()))
    }

    /// Delete every visible record of `table` matching `filter`; returns how
    /// many records were deleted
    pub fn delete(&mut self, table: &str, filter: Filter) -> Result<usize> {
        let schema = self.writable_schema(table)?;
        let predicate = filter.bind(&schema)?;
        let hits = self.scan(table, &predicate, &[])?;
        self.remove_hits(&schema, &hits);
        Ok(hits.len())
    }

    /// Replace every visible record matching `filter` by `f(old values)`,
    /// as a delete plus an append under a new record id
    pub fn update<F>(&mut self, table: &str, filter: Filter, mut f: F) -> Result<usize>
    where
        F: FnMut(&[Value]) -> Vec<Value>,
    {
        let schema = self.writable_schema(table)?;
        let predicate = filter.bind(&schema)?;
        let user: Vec<usize> = (0..schema.user_column_count()).collect();
        let hits = self.scan(table, &predicate, &user)?;

        let mut staged = BlockBuilder::new(schema.clone());
        for hit in &hits {
            self.stage(&mut staged, &f(&hit.values))?;
        }
        self.remove_hits(&schema, &hits);
        self.own_block(&schema).append_block(&staged, None)?;
        Ok(hits.len())
    }

    fn remove_hits(&mut self, schema: &Arc<TableSchema>, hits: &[Hit]) {
        let mut own_rows = Vec::new();
        for hit in hits {
            match hit.delta_row {
                Some(row) => own_rows.push(row),
                None => {
                    let rid = self.inner.allocate_record_id();
                    let tombstone = TombstoneRecord::new(hit.record_id, schema.name(), hit.block_id);
                    self.delta.tombstones.push((rid, tombstone));
                }
            }
        }
        if !own_rows.is_empty() {
            own_rows.sort_unstable();
            own_rows.dedup();
            self.own_block(schema).delete_rows(&own_rows);
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    fn tombstones(&self) -> Result<TombstoneIndex> {
        let mut index = Reader::new(&self.inner, &self.snapshot).tombstones()?;
        for (_, tombstone) in &self.delta.tombstones {
            index.insert(tombstone);
        }
        Ok(index)
    }

    /// Visible rows of `table` matching `predicate`, with `columns` projected
    fn scan(&self, table: &str, predicate: &Predicate, columns: &[usize]) -> Result<Vec<Hit>> {
        self.check_active()?;
        let props = self.snapshot.table(table)?;
        let tombstones = self.tombstones()?;
        let deleted = tombstones.deleted(table);
        let is_live = |rid: RecordId| deleted.map_or(true, |ids| !ids.contains(&rid));

        let mut hits = Vec::new();
        let reader = Reader::new(&self.inner, &self.snapshot);
        reader.visit(props, predicate, &mut |block: &dyn BlockRead, rows: &[usize]| {
            for &row in rows {
                let record_id = block.record_id(row)?;
                if !is_live(record_id) {
                    continue;
                }
                hits.push(Hit {
                    record_id,
                    block_id: block.block_id(),
                    delta_row: None,
                    values: columns
                        .iter()
                        .map(|&c| block.value(c, row))
                        .collect::<Result<_>>()?,
                });
            }
            Ok(())
        })?;

        if let Some(own) = self.delta.appended.get(table) {
            for row in own.filter(predicate)? {
                hits.push(Hit {
                    record_id: own.record_id(row)?,
                    block_id: None,
                    delta_row: Some(row),
                    values: columns
                        .iter()
                        .map(|&c| own.value(c, row))
                        .collect::<Result<_>>()?,
                });
            }
        }
        Ok(hits)
    }

    /// Rows of a query with the record id of each
    pub fn query_with_ids(&self, query: &Query) -> Result<Vec<(RecordId, Vec<Value>)>> {
        let schema = self.snapshot.table(query.table())?.schema.clone();
        let predicate = query.filter.bind(&schema)?;
        let mut columns = match &query.columns {
            None => (0..schema.user_column_count()).collect::<Vec<_>>(),
            Some(names) => names
                .iter()
                .map(|n| schema.resolve(n))
                .collect::<Result<Vec<_>>>()?,
        };
        let projected = columns.len();

        let mut keys = Vec::with_capacity(query.order_by.len());
        for order in &query.order_by {
            let column = schema.resolve(&order.column)?;
            let position = match columns.iter().position(|&c| c == column) {
                Some(p) => p,
                None => {
                    columns.push(column);
                    columns.len() - 1
                }
            };
            keys.push(SortKey {
                position,
                descending: order.descending,
            });
        }

        let mut rows: Vec<ScanRow> = self
            .scan(query.table(), &predicate, &columns)?
            .into_iter()
            .map(|h| ScanRow {
                record_id: h.record_id,
                values: h.values,
            })
            .collect();
        sort_rows(&mut rows, &keys, query.limit);
        Ok(rows
            .into_iter()
            .map(|mut r| {
                r.values.truncate(projected);
                (r.record_id, r.values)
            })
            .collect())
    }

    /// Rows of a query as value tuples in the projected column order
    pub fn query(&self, query: &Query) -> Result<Vec<Vec<Value>>> {
        Ok(self
            .query_with_ids(query)?
            .into_iter()
            .map(|(_, values)| values)
            .collect())
    }

    /// Number of visible records of `table` matching `filter`
    pub fn count(&self, table: &str, filter: Filter) -> Result<usize> {
        let schema = self.snapshot.table(table)?.schema.clone();
        let predicate = filter.bind(&schema)?;
        Ok(self.scan(table, &predicate, &[])?.len())
    }

    // ========================================================================
    // Completion
    // ========================================================================

    /// Publish the delta into the current database state
    pub fn commit(mut self) -> Result<()> {
        self.check_active()?;
        self.finished = true;
        let delta = std::mem::take(&mut self.delta);
        if !self.registered {
            log::debug!("discarding delta of detached transaction {}", self.id);
            return Ok(());
        }
        self.inner.commit(self.id, delta)
    }

    /// Discard the delta; shared state is untouched
    pub fn rollback(mut self) -> Result<()> {
        self.check_active()?;
        self.finished = true;
        self.delta = Delta::default();
        if self.registered {
            self.inner.rollback(self.id)?;
        }
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished && self.registered {
            self.finished = true;
            if let Err(e) = self.inner.rollback(self.id) {
                log::warn!("rolling back dropped transaction {} failed: {}", self.id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::data::{ColumnDef, DataType};
    use crate::lifecycle::Activities;
    use crate::Database;

    fn db() -> Database {
        let db = Database::open(DatabaseConfig::default().with_background_lifecycle(false)).unwrap();
        db.create_table(
            TableSchema::new(
                "items",
                vec![
                    ColumnDef::new("name", DataType::String),
                    ColumnDef::new("qty", DataType::Int64).nullable(true),
                ],
            )
            .unwrap(),
        )
        .unwrap();
        db
    }

    fn names(txn: &Transaction) -> Vec<Value> {
        txn.query(&Query::new("items").select(["name"]))
            .unwrap()
            .into_iter()
            .map(|mut row| row.remove(0))
            .collect()
    }

    #[test]
    fn test_snapshot_isolation() {
        let db = db();
        let mut writer = db.begin().unwrap();
        writer.append("items", &["a".into(), Value::Int64(1)]).unwrap();

        let reader = db.begin_read_only().unwrap();
        assert_eq!(names(&writer), vec![Value::from("a")]);
        writer.commit().unwrap();

        // the reader's snapshot predates the commit
        assert!(names(&reader).is_empty());
        let fresh = db.begin_read_only().unwrap();
        assert_eq!(names(&fresh), vec![Value::from("a")]);
    }

    #[test]
    fn test_deleting_own_rows_leaves_no_tombstone() {
        let db = db();
        let mut txn = db.begin().unwrap();
        txn.append("items", &["a".into(), Value::Null]).unwrap();
        txn.append("items", &["b".into(), Value::Null]).unwrap();
        assert_eq!(txn.delete("items", Filter::eq("name", "a")).unwrap(), 1);
        assert_eq!(names(&txn), vec![Value::from("b")]);
        txn.commit().unwrap();

        let stats = db.statistics().unwrap();
        assert_eq!(stats.in_memory_tombstones, 0);
        assert_eq!(stats.in_memory_data_rows, 1);
    }

    #[test]
    fn test_delete_of_committed_rows_is_a_tombstone() {
        let db = db();
        db.transaction(|txn| {
            txn.append_many("items", (0..4).map(|i| vec![format!("n{}", i).into(), Value::Int64(i)]))
        })
        .unwrap();
        db.run_lifecycle(Activities::PERSIST_ALL).unwrap();

        let mut txn = db.begin().unwrap();
        assert_eq!(txn.delete("items", Filter::ge("qty", 2)).unwrap(), 2);
        // deleting again within the same transaction finds nothing
        assert_eq!(txn.delete("items", Filter::ge("qty", 2)).unwrap(), 0);
        txn.commit().unwrap();

        let txn = db.begin_read_only().unwrap();
        assert_eq!(txn.count("items", Filter::True).unwrap(), 2);
        assert_eq!(db.statistics().unwrap().in_memory_tombstones, 2);
    }

    #[test]
    fn test_update_replaces_records() {
        let db = db();
        db.transaction(|txn| txn.append("items", &["a".into(), Value::Int64(1)]))
            .unwrap();
        let mut txn = db.begin().unwrap();
        let n = txn
            .update("items", Filter::eq("name", "a"), |old| {
                let qty = old[1].as_i64().unwrap_or(0);
                vec![old[0].clone(), Value::Int64(qty + 10)]
            })
            .unwrap();
        assert_eq!(n, 1);
        txn.commit().unwrap();

        let rows = db.query(&Query::new("items").select(["qty"])).unwrap();
        assert_eq!(rows, vec![vec![Value::Int64(11)]]);
    }

    #[test]
    fn test_update_validates_before_deleting() {
        let db = db();
        db.transaction(|txn| txn.append("items", &["a".into(), Value::Int64(1)]))
            .unwrap();
        let mut txn = db.begin().unwrap();
        let err = txn
            .update("items", Filter::True, |_| vec![Value::Int64(3)])
            .unwrap_err();
        assert!(matches!(err, TesseraError::ArityMismatch { .. }));
        assert_eq!(txn.count("items", Filter::True).unwrap(), 1);
    }

    #[test]
    fn test_read_only_and_system_tables_reject_writes() {
        let db = db();
        let mut ro = db.begin_read_only().unwrap();
        assert!(matches!(
            ro.append("items", &["a".into(), Value::Null]),
            Err(TesseraError::ReadOnlyTable(_))
        ));
        let mut rw = db.begin().unwrap();
        assert!(matches!(
            rw.delete("$tombstones", Filter::True),
            Err(TesseraError::ReadOnlyTable(_))
        ));
    }

    #[test]
    fn test_oversized_record_is_rejected() {
        let db = Database::open(
            DatabaseConfig::default()
                .with_max_block_size(64)
                .with_background_lifecycle(false),
        )
        .unwrap();
        db.create_table(TableSchema::new("blobs", vec![ColumnDef::new("body", DataType::String)]).unwrap())
            .unwrap();
        let mut txn = db.begin().unwrap();
        let body = "x".repeat(200);
        assert!(matches!(
            txn.append("blobs", &[body.into()]),
            Err(TesseraError::RecordTooLarge(64))
        ));
    }

    #[test]
    fn test_query_sorts_by_unprojected_column() {
        let db = db();
        db.transaction(|txn| {
            txn.append("items", &["x".into(), Value::Int64(3)])?;
            txn.append("items", &["y".into(), Value::Int64(1)])?;
            txn.append("items", &["z".into(), Value::Null])?;
            Ok(())
        })
        .unwrap();
        let rows = db
            .query(&Query::new("items").select(["name"]).order_by("qty", true).limit(2))
            .unwrap();
        assert_eq!(rows, vec![vec![Value::from("x")], vec![Value::from("y")]]);
    }

    #[test]
    fn test_dropped_transaction_rolls_back() {
        let db = db();
        {
            let mut txn = db.begin().unwrap();
            txn.append("items", &["a".into(), Value::Null]).unwrap();
        }
        let stats = db.statistics().unwrap();
        assert_eq!(stats.active_transactions, 0);
        assert_eq!(stats.rollbacks, 1);
        assert_eq!(stats.in_memory_data_rows, 0);
    }

    #[test]
    fn test_detached_writes_stay_private() {
        let db = db();
        db.transaction(|txn| txn.append("items", &["a".into(), Value::Int64(1)]))
            .unwrap();
        let before = db.statistics().unwrap();

        let mut view = db.inner().detached();
        view.append("items", &["scratch".into(), Value::Null]).unwrap();
        assert_eq!(view.delete("items", Filter::eq("name", "a")).unwrap(), 1);
        assert_eq!(names(&view), vec![Value::from("scratch")]);
        assert_eq!(db.statistics().unwrap().active_transactions, 0);
        view.commit().unwrap();

        let after = db.statistics().unwrap();
        assert_eq!(after.state_version, before.state_version);
        assert_eq!(after.in_memory_tombstones, 0);
        assert_eq!(after.commits, before.commits);
        assert_eq!(names(&db.begin_read_only().unwrap()), vec![Value::from("a")]);
    }

    #[test]
    fn test_failed_rollback_keeps_the_callers_error() {
        let db = db();
        let result: Result<()> = db.transaction(|txn| {
            txn.append("items", &["a".into(), Value::Int64(1)])?;
            // rollback of a finished transaction fails
            txn.finished = true;
            Err(TesseraError::NullViolation("qty".into()))
        });
        assert!(matches!(result, Err(TesseraError::NullViolation(_))));
        assert!(names(&db.begin_read_only().unwrap()).is_empty());
    }
}
