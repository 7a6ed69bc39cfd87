//! Table metadata, shared rows, record views and collections.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    core::indices::pk_hash_key,
    engine::coordinator::SaveError,
    types::{CollectionId, DataType, RecordId, RowId, Value},
};

/// Logical column type relevant for key comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ColumnKind {
    /// Compared by exact value.
    #[default]
    Plain,
    /// Compared by logical UUID equality.
    Uuid,
}

/// Column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMeta {
    /// Column name.
    pub name: String,
    /// Comparison kind.
    pub kind: ColumnKind,
    /// Part of the primary key.
    pub pk: bool,
    /// Value is generated by the backend on insert.
    pub identity: bool,
    /// Name of the table this column points at, when it is a foreign key.
    pub references: Option<String>,
}

impl ColumnMeta {
    /// Plain data column.
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ColumnKind::Plain,
            pk: false,
            identity: false,
            references: None,
        }
    }

    /// Primary key column with explicit values.
    pub fn pk(name: impl Into<String>) -> Self {
        Self {
            pk: true,
            ..Self::plain(name)
        }
    }

    /// Primary key column filled by the backend.
    pub fn identity(name: impl Into<String>) -> Self {
        Self {
            pk: true,
            identity: true,
            ..Self::plain(name)
        }
    }

    /// Foreign key column pointing at `table`.
    pub fn foreign(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            references: Some(table.into()),
            ..Self::plain(name)
        }
    }

    /// Marks the column as UUID typed.
    pub fn uuid(mut self) -> Self {
        self.kind = ColumnKind::Uuid;
        self
    }
}

/// Table definition shared by every row of the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
    /// Backend server (connection) name.
    pub server: String,
    /// Table name.
    pub name: String,
    /// Columns in raw storage order.
    pub columns: Vec<ColumnMeta>,
    /// Inserted rows must be re-read because the backend fills defaults.
    pub requery: bool,
    /// Names of the table filters active for this table.
    pub filters: Vec<String>,
    /// Logical row shape.
    pub data_type: DataType,
}

impl TableMeta {
    /// Creates a table on `server` with the given columns.
    pub fn new(server: impl Into<String>, name: impl Into<String>, columns: Vec<ColumnMeta>) -> Self {
        Self {
            server: server.into(),
            name: name.into(),
            columns,
            requery: false,
            filters: Vec::new(),
            data_type: DataType::Regular,
        }
    }

    /// Datasource URI, `db:/<server>/<table>`.
    pub fn datasource(&self) -> String {
        format!("db:/{}/{}", self.server, self.name)
    }

    /// Access-cache key, `<server>.<table>`.
    pub fn key(&self) -> String {
        format!("{}.{}", self.server, self.name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn pk_indexes(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.pk)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn pk_names(&self) -> Vec<String> {
        self.columns.iter().filter(|c| c.pk).map(|c| c.name.clone()).collect()
    }

    pub fn identity_index(&self) -> Option<usize> {
        self.columns.iter().position(|c| c.identity)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// Canonical storage of one database tuple, shared by every [`Record`] over it.
#[derive(Debug, Clone)]
pub struct Row {
    id: RowId,
    table: Arc<TableMeta>,
    values: Vec<Value>,
    old_values: Option<Vec<Value>>,
    exists: bool,
    flagged_for_delete: bool,
    last_error: Option<SaveError>,
}

impl Row {
    /// Row that does not exist in the backend yet.
    ///
    /// An identity column left `Null` is seeded with [`Value::DbIdent`] of this row.
    pub fn new_unsaved(id: RowId, table: Arc<TableMeta>, mut values: Vec<Value>) -> Self {
        values.resize(table.columns.len(), Value::Null);
        if let Some(idx) = table.identity_index() {
            if values[idx].is_null() {
                values[idx] = Value::DbIdent(id);
            }
        }
        Self {
            id,
            table,
            values,
            old_values: None,
            exists: false,
            flagged_for_delete: false,
            last_error: None,
        }
    }

    /// Row loaded from the backend; its values are also its rollback snapshot.
    pub fn loaded(id: RowId, table: Arc<TableMeta>, mut values: Vec<Value>) -> Self {
        values.resize(table.columns.len(), Value::Null);
        Self {
            id,
            table,
            old_values: Some(values.clone()),
            values,
            exists: true,
            flagged_for_delete: false,
            last_error: None,
        }
    }

    pub fn id(&self) -> RowId {
        self.id
    }

    pub fn table(&self) -> &Arc<TableMeta> {
        &self.table
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn old_values(&self) -> Option<&[Value]> {
        self.old_values.as_deref()
    }

    pub fn value(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Overwrites one slot; returns whether the stored value changed.
    pub fn set_value(&mut self, idx: usize, value: Value) -> bool {
        match self.values.get_mut(idx) {
            Some(slot) if *slot != value => {
                *slot = value;
                true
            }
            _ => false,
        }
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn is_flagged_for_delete(&self) -> bool {
        self.flagged_for_delete
    }

    pub fn flag_for_delete(&mut self, flag: bool) {
        self.flagged_for_delete = flag;
    }

    pub fn last_error(&self) -> Option<&SaveError> {
        self.last_error.as_ref()
    }

    pub fn set_last_error(&mut self, err: Option<SaveError>) {
        self.last_error = err;
    }

    /// Current primary key values.
    pub fn pk(&self) -> Vec<Value> {
        self.table
            .pk_indexes()
            .into_iter()
            .map(|i| self.values[i].clone())
            .collect()
    }

    /// Primary key as last committed; falls back to the current key for new rows.
    pub fn old_pk(&self) -> Vec<Value> {
        match &self.old_values {
            Some(old) => self.table.pk_indexes().into_iter().map(|i| old[i].clone()).collect(),
            None => self.pk(),
        }
    }

    pub fn pk_hash_key(&self) -> String {
        pk_hash_key(&self.pk())
    }

    /// New rows are always changed; existing rows compare against their snapshot.
    pub fn is_changed(&self) -> bool {
        if !self.exists {
            return true;
        }
        match &self.old_values {
            Some(old) => old != &self.values,
            None => true,
        }
    }

    /// Column indexes whose value differs from the snapshot.
    pub fn changed_columns(&self) -> Vec<usize> {
        match &self.old_values {
            Some(old) => (0..self.values.len())
                .filter(|i| old.get(*i) != self.values.get(*i))
                .collect(),
            None => (0..self.values.len()).collect(),
        }
    }

    /// Restores the last committed values and clears the delete flag and error.
    pub fn rollback_from_old_values(&mut self) {
        if let Some(old) = &self.old_values {
            self.values = old.clone();
        }
        self.flagged_for_delete = false;
        self.last_error = None;
    }

    /// Replaces both the values and the rollback snapshot.
    pub fn set_rollback_data(&mut self, data: Vec<Value>) {
        self.values = data.clone();
        self.old_values = Some(data);
    }

    /// Marks `written` as committed to the backend.
    ///
    /// `sent` is the row as it was when its statement was built. A slot whose
    /// local value moved away from `sent` since then keeps the local value and
    /// stays dirty. Identity placeholders resolved in the meantime take the
    /// resolved value in both the values and the snapshot.
    pub fn commit_written(&mut self, sent: &[Value], mut written: Vec<Value>) {
        written.resize(self.values.len(), Value::Null);
        let null = Value::Null;
        let values: Vec<Value> = written
            .iter_mut()
            .enumerate()
            .map(|(i, slot)| {
                let current = &self.values[i];
                let before = sent.get(i).unwrap_or(&null);
                let resolved = before.ident_row().is_some() && current.ident_row().is_none();
                if resolved && slot.ident_row().is_some() {
                    *slot = current.clone();
                }
                if current != before && !resolved {
                    current.clone()
                } else {
                    slot.clone()
                }
            })
            .collect();
        self.values = values;
        self.old_values = Some(written);
        self.exists = true;
        self.last_error = None;
    }

    /// Replaces every occurrence of `DbIdent(owner)` with `value`; returns whether any slot matched.
    pub fn resolve_ident(&mut self, owner: RowId, value: &Value) -> bool {
        let mut hit = false;
        let target = Value::DbIdent(owner);
        for slot in self.values.iter_mut() {
            if *slot == target {
                *slot = value.clone();
                hit = true;
            }
        }
        if let Some(old) = self.old_values.as_mut() {
            for slot in old.iter_mut() {
                if *slot == target {
                    *slot = value.clone();
                }
            }
        }
        hit
    }
}

/// Editable view over a [`Row`] for one consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Record identity.
    pub id: RecordId,
    /// Backing row.
    pub row: RowId,
    /// Owning collection.
    pub collection: CollectionId,
    /// Locked by another concurrent editor.
    pub locked: bool,
}

/// Ordered set of records over one table.
#[derive(Debug, Clone)]
pub struct Collection {
    /// Collection identity.
    pub id: CollectionId,
    /// Table of every row in this collection.
    pub table: Arc<TableMeta>,
    /// Read-only projections (summary rows) never enter edit.
    pub editable: bool,
    /// Records in display order.
    pub records: Vec<RecordId>,
}

impl Collection {
    pub fn datasource(&self) -> String {
        self.table.datasource()
    }

    pub fn contains(&self, record: RecordId) -> bool {
        self.records.contains(&record)
    }
}

/// Conjunctive equality filter used by a deletion-by-query intent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeleteQuery {
    /// `(column, value)` pairs that must all match.
    pub condition: Vec<(String, Value)>,
}

impl DeleteQuery {
    pub fn new(condition: Vec<(String, Value)>) -> Self {
        Self { condition }
    }

    /// True when `row` satisfies every pair of the condition.
    pub fn matches(&self, row: &Row) -> bool {
        self.condition.iter().all(|(name, value)| {
            row.table()
                .column_index(name)
                .and_then(|idx| row.value(idx))
                .is_some_and(|v| v == value)
        })
    }
}
