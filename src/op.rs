//! Abstract statement model and per-row pending update descriptors.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    persist::ExecError,
    row::{DeleteQuery, TableMeta},
    types::{CollectionId, DataType, RecordId, RowId, Value},
};

/// Kind of write a [`Statement`] performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqlAction {
    /// INSERT one or more rows.
    Insert,
    /// UPDATE one row by primary key.
    Update,
    /// DELETE by primary key or by condition.
    Delete,
}

/// One INSERT/UPDATE/DELETE, decoupled from concrete SQL text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    /// Write kind.
    pub action: SqlAction,
    /// Backend connection name.
    pub server: String,
    /// Target table.
    pub table: String,
    /// Columns written by `rows` (insert: all columns, update: changed columns).
    pub columns: Vec<String>,
    /// Value rows; more than one only for merged inserts.
    pub rows: Vec<Vec<Value>>,
    /// Primary key column names.
    pub pk_columns: Vec<String>,
    /// Primary key carrier, one entry per affected row.
    pub pks: Vec<Vec<Value>>,
    /// Equality condition of a delete-by-query.
    pub condition: Vec<(String, Value)>,
    /// Active table filters.
    pub filters: Vec<String>,
    /// Transaction the statement belongs to.
    pub transaction_id: Option<String>,
    /// Column the backend fills on insert.
    pub identity_column: Option<String>,
    /// Row must be re-read after the write.
    pub requery: bool,
    /// Write is recorded in the audit journal.
    pub tracking: bool,
    /// Logical row shape.
    pub data_type: DataType,
}

impl Statement {
    fn base(action: SqlAction, table: &TableMeta) -> Self {
        Self {
            action,
            server: table.server.clone(),
            table: table.name.clone(),
            columns: Vec::new(),
            rows: Vec::new(),
            pk_columns: table.pk_names(),
            pks: Vec::new(),
            condition: Vec::new(),
            filters: table.filters.clone(),
            transaction_id: None,
            identity_column: table
                .identity_index()
                .map(|i| table.columns[i].name.clone()),
            requery: false,
            tracking: false,
            data_type: table.data_type,
        }
    }

    /// INSERT of a full row.
    ///
    /// `values` is padded with `Null` (or cut) to the table's width. The PK
    /// carrier is omitted when the key is the row's own pending identity.
    pub fn insert(table: &TableMeta, row: RowId, mut values: Vec<Value>) -> Self {
        values.resize(table.columns.len(), Value::Null);
        let pk: Vec<Value> = table.pk_indexes().into_iter().map(|i| values[i].clone()).collect();
        let own_identity = pk.iter().any(|v| v.ident_row() == Some(row));
        let mut stmt = Self::base(SqlAction::Insert, table);
        stmt.columns = table.column_names();
        stmt.rows = vec![values];
        if !own_identity {
            stmt.pks = vec![pk];
        }
        stmt.requery = table.requery;
        stmt
    }

    /// UPDATE of the given columns, keyed by `pk`.
    pub fn update(table: &TableMeta, columns: Vec<String>, values: Vec<Value>, pk: Vec<Value>) -> Self {
        let mut stmt = Self::base(SqlAction::Update, table);
        stmt.columns = columns;
        stmt.rows = vec![values];
        stmt.pks = vec![pk];
        stmt.requery = table.requery;
        stmt
    }

    /// DELETE keyed by `pk`.
    pub fn delete(table: &TableMeta, pk: Vec<Value>) -> Self {
        let mut stmt = Self::base(SqlAction::Delete, table);
        stmt.pks = vec![pk];
        stmt
    }

    /// DELETE of every row matching `query`.
    pub fn delete_by_query(table: &TableMeta, query: &DeleteQuery) -> Self {
        let mut stmt = Self::base(SqlAction::Delete, table);
        stmt.condition = query.condition.clone();
        stmt
    }

    pub fn is_insert(&self) -> bool {
        self.action == SqlAction::Insert
    }

    /// True when every PK carrier value is known up front.
    pub fn has_explicit_pks(&self) -> bool {
        !self.pks.is_empty()
            && self
                .pks
                .iter()
                .all(|pk| !pk.is_empty() && pk.iter().all(|v| v.ident_row().is_none()))
    }
}

/// Per-statement outcome reported by a [`crate::persist::StatementExecutor`].
#[derive(Debug, Clone, PartialEq)]
pub enum StatementResult {
    /// Statement applied, nothing to propagate.
    Success,
    /// Value generated for the row's identity column.
    Generated(Value),
    /// Full row as stored by the backend.
    RowData(Vec<Value>),
    /// Statement failed; siblings are unaffected.
    Failed(ExecError),
}

/// One row's pending statement.
#[derive(Debug, Clone)]
pub struct RowUpdateInfo {
    /// Row being written.
    pub row: RowId,
    /// First record encountered for the row; owns event firing.
    pub record: RecordId,
    /// Collection of `record`.
    pub collection: CollectionId,
    /// Table of the row.
    pub table: Arc<TableMeta>,
    /// Row values at the time the statement was built.
    pub values: Vec<Value>,
    /// Row existed in the backend.
    pub exists: bool,
    /// Row is flagged for deletion.
    pub deleting: bool,
    /// Statement to execute.
    pub statement: Statement,
    /// Names of the columns changed since the snapshot.
    pub changed_columns: Vec<String>,
}

/// A delete-by-query's pending statement.
#[derive(Debug, Clone)]
pub struct TableUpdateInfo {
    /// Collection that requested the deletion.
    pub collection: CollectionId,
    /// Target table.
    pub table: Arc<TableMeta>,
    /// Deletion condition.
    pub query: DeleteQuery,
    /// Statement to execute.
    pub statement: Statement,
}

/// Row-backed or query-backed pending operation.
#[derive(Debug, Clone)]
pub enum UpdateInfo {
    /// Backed by one row.
    Row(RowUpdateInfo),
    /// Backed by a delete query.
    Table(TableUpdateInfo),
}

impl UpdateInfo {
    pub fn statement(&self) -> &Statement {
        match self {
            UpdateInfo::Row(info) => &info.statement,
            UpdateInfo::Table(info) => &info.statement,
        }
    }

    pub fn as_row(&self) -> Option<&RowUpdateInfo> {
        match self {
            UpdateInfo::Row(info) => Some(info),
            UpdateInfo::Table(_) => None,
        }
    }

    pub fn is_row(&self) -> bool {
        matches!(self, UpdateInfo::Row(_))
    }
}
