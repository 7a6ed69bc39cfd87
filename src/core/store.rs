use std::{fmt, sync::Arc};

use hashbrown::HashMap;

use crate::{
    core::indices::{VecIndex, pk_hash_key},
    op::{RowUpdateInfo, Statement},
    row::{Collection, DeleteQuery, Record, Row, TableMeta},
    types::{CollectionId, RecordId, RowId, Value},
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("unknown row {0}")]
    MissingRow(RowId),
    #[error("unknown record {0}")]
    MissingRecord(RecordId),
    #[error("unknown collection {0}")]
    MissingCollection(CollectionId),
    #[error("unknown column {column} in {table}")]
    UnknownColumn { table: String, column: String },
    #[error("table {0} has no primary key")]
    MissingPk(String),
}

/// Pure function computing a stored calculated column from the row values.
pub type StoredCalculation = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

#[derive(Default)]
pub struct RowStore {
    rows: HashMap<RowId, Row>,
    records: HashMap<RecordId, Record>,
    collections: HashMap<CollectionId, Collection>,
    by_row: VecIndex<RowId>,
    pk_index: HashMap<String, HashMap<String, RowId>>,
    calcs: HashMap<String, Vec<(usize, StoredCalculation)>>,
    next_row_id: RowId,
    next_record_id: RecordId,
    next_collection_id: CollectionId,
}

impl fmt::Debug for RowStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowStore")
            .field("rows", &self.rows.len())
            .field("records", &self.records.len())
            .field("collections", &self.collections.len())
            .finish()
    }
}

impl RowStore {
    pub fn new() -> Self {
        Self {
            next_row_id: 1,
            next_record_id: 1,
            next_collection_id: 1,
            ..Self::default()
        }
    }

    pub fn add_collection(&mut self, table: Arc<TableMeta>, editable: bool) -> CollectionId {
        let id = self.next_collection_id;
        self.next_collection_id += 1;
        self.collections.insert(
            id,
            Collection {
                id,
                table,
                editable,
                records: Vec::new(),
            },
        );
        id
    }

    /// Adds a row that already exists in the backend.
    pub fn load_row(
        &mut self,
        collection: CollectionId,
        values: Vec<Value>,
    ) -> Result<(RowId, RecordId), StoreError> {
        let table = self.collection_table(collection)?;
        let row_id = self.take_row_id();
        let row = Row::loaded(row_id, table.clone(), values);
        self.pk_index
            .entry(table.key())
            .or_default()
            .insert(row.pk_hash_key(), row_id);
        self.rows.insert(row_id, row);
        let record = self.attach_record(collection, row_id)?;
        Ok((row_id, record))
    }

    /// Adds a row that still has to be inserted.
    pub fn new_record(
        &mut self,
        collection: CollectionId,
        values: Vec<Value>,
    ) -> Result<(RowId, RecordId), StoreError> {
        let table = self.collection_table(collection)?;
        let row_id = self.take_row_id();
        self.rows.insert(row_id, Row::new_unsaved(row_id, table, values));
        let record = self.attach_record(collection, row_id)?;
        Ok((row_id, record))
    }

    /// Adds another record view over an existing row.
    pub fn add_record_view(&mut self, collection: CollectionId, row: RowId) -> Result<RecordId, StoreError> {
        if !self.rows.contains_key(&row) {
            return Err(StoreError::MissingRow(row));
        }
        self.attach_record(collection, row)
    }

    fn attach_record(&mut self, collection: CollectionId, row: RowId) -> Result<RecordId, StoreError> {
        let coll = self
            .collections
            .get_mut(&collection)
            .ok_or(StoreError::MissingCollection(collection))?;
        let id = self.next_record_id;
        self.next_record_id += 1;
        coll.records.push(id);
        self.records.insert(
            id,
            Record {
                id,
                row,
                collection,
                locked: false,
            },
        );
        self.by_row.entry(row).or_default().push(id);
        Ok(id)
    }

    fn take_row_id(&mut self) -> RowId {
        let id = self.next_row_id;
        self.next_row_id += 1;
        id
    }

    fn collection_table(&self, collection: CollectionId) -> Result<Arc<TableMeta>, StoreError> {
        self.collections
            .get(&collection)
            .map(|c| c.table.clone())
            .ok_or(StoreError::MissingCollection(collection))
    }

    pub fn row(&self, id: RowId) -> Option<&Row> {
        self.rows.get(&id)
    }

    pub fn row_mut(&mut self, id: RowId) -> Option<&mut Row> {
        self.rows.get_mut(&id)
    }

    pub fn record(&self, id: RecordId) -> Option<&Record> {
        self.records.get(&id)
    }

    pub fn collection(&self, id: CollectionId) -> Option<&Collection> {
        self.collections.get(&id)
    }

    pub fn record_row(&self, record: RecordId) -> Option<&Row> {
        self.records.get(&record).and_then(|r| self.rows.get(&r.row))
    }

    pub fn record_row_mut(&mut self, record: RecordId) -> Option<&mut Row> {
        let row = self.records.get(&record)?.row;
        self.rows.get_mut(&row)
    }

    pub fn record_collection(&self, record: RecordId) -> Option<&Collection> {
        self.records
            .get(&record)
            .and_then(|r| self.collections.get(&r.collection))
    }

    pub fn records_of_row(&self, row: RowId) -> Vec<RecordId> {
        self.by_row.get(&row).cloned().unwrap_or_default()
    }

    pub fn set_record_locked(&mut self, record: RecordId, locked: bool) -> Result<(), StoreError> {
        let rec = self
            .records
            .get_mut(&record)
            .ok_or(StoreError::MissingRecord(record))?;
        rec.locked = locked;
        Ok(())
    }

    pub fn value(&self, record: RecordId, column: &str) -> Result<Value, StoreError> {
        let row = self.record_row(record).ok_or(StoreError::MissingRecord(record))?;
        let idx = column_index(row.table(), column)?;
        Ok(row.values()[idx].clone())
    }

    /// Writes one column of the record's shared row; returns whether it changed.
    pub fn set_value(&mut self, record: RecordId, column: &str, value: Value) -> Result<bool, StoreError> {
        let row = self
            .record_row_mut(record)
            .ok_or(StoreError::MissingRecord(record))?;
        let idx = column_index(row.table(), column)?;
        Ok(row.set_value(idx, value))
    }

    pub fn add_stored_calculation(
        &mut self,
        table: &TableMeta,
        column: &str,
        calc: StoredCalculation,
    ) -> Result<(), StoreError> {
        let idx = column_index(table, column)?;
        self.calcs.entry(table.key()).or_default().push((idx, calc));
        Ok(())
    }

    /// Recomputes the stored calculations of the record's row into its values.
    pub fn validate_stored_calculations(&mut self, record: RecordId) -> Result<(), StoreError> {
        let row_id = self
            .records
            .get(&record)
            .ok_or(StoreError::MissingRecord(record))?
            .row;
        let row = self.rows.get_mut(&row_id).ok_or(StoreError::MissingRow(row_id))?;
        let Some(calcs) = self.calcs.get(&row.table().key()) else {
            return Ok(());
        };
        for (idx, calc) in calcs {
            let computed = calc(row.values());
            row.set_value(*idx, computed);
        }
        Ok(())
    }

    /// True when the record still sits in its owning collection.
    pub fn is_live(&self, record: RecordId) -> bool {
        self.records
            .get(&record)
            .and_then(|r| self.collections.get(&r.collection))
            .is_some_and(|c| c.contains(record))
    }

    /// Records of the collection whose rows are not flagged for deletion.
    pub fn visible_records(&self, collection: CollectionId) -> Vec<RecordId> {
        let Some(coll) = self.collections.get(&collection) else {
            return Vec::new();
        };
        coll.records
            .iter()
            .copied()
            .filter(|r| self.record_row(*r).is_some_and(|row| !row.is_flagged_for_delete()))
            .collect()
    }

    pub fn find_by_pk(&self, table: &TableMeta, pk: &[Value]) -> Option<RowId> {
        self.pk_index.get(&table.key())?.get(&pk_hash_key(pk)).copied()
    }

    /// Builds the statement the record's row needs, if any.
    ///
    /// Returns `None` for unchanged existing rows and for deleted rows that never
    /// reached the backend.
    pub fn build_update_info(
        &self,
        record: RecordId,
        tracking: bool,
    ) -> Result<Option<RowUpdateInfo>, StoreError> {
        let rec = self
            .records
            .get(&record)
            .ok_or(StoreError::MissingRecord(record))?;
        let row = self.rows.get(&rec.row).ok_or(StoreError::MissingRow(rec.row))?;
        let table = row.table().clone();
        if table.pk_indexes().is_empty() {
            return Err(StoreError::MissingPk(table.key()));
        }

        let mut statement = if row.is_flagged_for_delete() {
            if !row.exists() {
                return Ok(None);
            }
            Statement::delete(&table, row.old_pk())
        } else if !row.exists() {
            Statement::insert(&table, row.id(), row.values().to_vec())
        } else {
            let changed = row.changed_columns();
            if changed.is_empty() {
                return Ok(None);
            }
            let columns = changed.iter().map(|i| table.columns[*i].name.clone()).collect();
            let values = changed.iter().map(|i| row.values()[*i].clone()).collect();
            Statement::update(&table, columns, values, row.old_pk())
        };
        statement.tracking = tracking;

        let changed_columns = row
            .changed_columns()
            .into_iter()
            .map(|i| table.columns[i].name.clone())
            .collect();

        Ok(Some(RowUpdateInfo {
            row: row.id(),
            record,
            collection: rec.collection,
            table,
            values: row.values().to_vec(),
            exists: row.exists(),
            deleting: row.is_flagged_for_delete(),
            statement,
            changed_columns,
        }))
    }

    /// Resolves a generated identity in every row that carries it.
    pub fn resolve_ident(&mut self, owner: RowId, value: &Value) {
        for row in self.rows.values_mut() {
            row.resolve_ident(owner, value);
        }
    }

    /// Re-keys the row in the primary-key index after a committed write.
    pub fn row_updated(&mut self, row: RowId, old_key: &str) {
        let Some(r) = self.rows.get(&row) else {
            return;
        };
        let index = self.pk_index.entry(r.table().key()).or_default();
        if index.get(old_key) == Some(&row) {
            index.remove(old_key);
        }
        index.insert(r.pk_hash_key(), row);
    }

    /// Drops a row and every record over it; returns the removed records.
    pub fn remove_row(&mut self, row: RowId) -> Vec<RecordId> {
        let Some(removed) = self.rows.remove(&row) else {
            return Vec::new();
        };
        if let Some(index) = self.pk_index.get_mut(&removed.table().key()) {
            for key in [pk_hash_key(&removed.old_pk()), removed.pk_hash_key()] {
                if index.get(&key) == Some(&row) {
                    index.remove(&key);
                }
            }
        }
        let records = self.by_row.remove(&row).unwrap_or_default();
        for record in &records {
            if let Some(rec) = self.records.remove(record) {
                if let Some(coll) = self.collections.get_mut(&rec.collection) {
                    coll.records.retain(|r| r != record);
                }
            }
        }
        records
    }

    /// Drops local rows of `table` that `query` would delete; returns the removed records.
    pub fn remove_rows_matching(&mut self, table: &TableMeta, query: &DeleteQuery) -> Vec<RecordId> {
        let key = table.key();
        let doomed: Vec<RowId> = self
            .rows
            .values()
            .filter(|r| r.table().key() == key && query.matches(r))
            .map(|r| r.id())
            .collect();
        doomed.into_iter().flat_map(|row| self.remove_row(row)).collect()
    }
}

fn column_index(table: &TableMeta, column: &str) -> Result<usize, StoreError> {
    table.column_index(column).ok_or_else(|| StoreError::UnknownColumn {
        table: table.name.clone(),
        column: column.to_string(),
    })
}
