//! SQLite-backed [`StatementExecutor`] with an audit journal for tracked writes.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;
use parking_lot::Mutex;
use rusqlite::{Connection, params, params_from_iter, types::Value as SqlValue};

use crate::{
    op::{SqlAction, Statement, StatementResult},
    row::TableMeta,
    types::{RowId, Value},
};

use super::{ExecError, ExecResult, StatementExecutor};

/// SQLite implementation of [`crate::persist::StatementExecutor`].
///
/// Table columns must be declared in the same order as the [`TableMeta`] columns;
/// requeries read the row back with `SELECT *`.
pub struct SqliteExecutor {
    conn: Mutex<Option<Connection>>,
}

impl SqliteExecutor {
    /// Opens or creates a SQLite database at `path`.
    ///
    /// Enables WAL mode and sets `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>) -> ExecResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    /// Opens an in-memory SQLite database.
    pub fn open_in_memory() -> ExecResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> ExecResult<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Runs raw SQL, typically DDL for the application tables.
    pub fn execute_batch(&self, sql: &str) -> ExecResult<()> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(ExecError::ConnectionClosed)?;
        conn.execute_batch(sql)?;
        Ok(())
    }

    /// Reads every row of `table` in insertion order.
    pub fn select_all(&self, table: &TableMeta) -> ExecResult<Vec<Vec<Value>>> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(ExecError::ConnectionClosed)?;
        let sql = format!("SELECT * FROM {} ORDER BY rowid ASC", quote(&table.name));
        let mut stmt = conn.prepare(&sql)?;
        let width = stmt.column_count();
        let rows = stmt.query_map([], |row| {
            let mut out = Vec::with_capacity(width);
            for i in 0..width {
                out.push(from_sql(row.get::<_, SqlValue>(i)?));
            }
            Ok(out)
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Decodes the tracked statements recorded so far, oldest first.
    pub fn journal(&self) -> ExecResult<Vec<Statement>> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(ExecError::ConnectionClosed)?;
        let mut stmt = conn.prepare("SELECT payload FROM save_journal ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;

        let mut out = Vec::new();
        for payload in rows {
            out.push(serde_json::from_slice(&payload?)?);
        }
        Ok(out)
    }

    /// Drops the connection; later calls fail with [`ExecError::ConnectionClosed`].
    pub fn close(&self) {
        self.conn.lock().take();
    }
}

impl StatementExecutor for SqliteExecutor {
    fn perform_updates(&self, statements: &[Statement]) -> ExecResult<Vec<StatementResult>> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(ExecError::ConnectionClosed)?;
        let mut generated: HashMap<RowId, Value> = HashMap::new();

        Ok(statements
            .iter()
            .map(|stmt| match execute_one(conn, stmt, &mut generated) {
                Ok(result) => result,
                Err(err) => {
                    tracing::warn!(table = %stmt.table, action = ?stmt.action, %err, "statement failed");
                    StatementResult::Failed(err)
                }
            })
            .collect())
    }
}

fn execute_one(
    conn: &Connection,
    stmt: &Statement,
    generated: &mut HashMap<RowId, Value>,
) -> ExecResult<StatementResult> {
    let result = match stmt.action {
        SqlAction::Insert => execute_insert(conn, stmt, generated)?,
        SqlAction::Update => {
            let row = stmt.rows.first().map(Vec::as_slice).unwrap_or_default();
            let pk = stmt.pks.first().map(Vec::as_slice).unwrap_or_default();
            let set = stmt
                .columns
                .iter()
                .map(|c| format!("{} = ?", quote(c)))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "UPDATE {} SET {set} WHERE {}",
                quote(&stmt.table),
                where_clause(&stmt.pk_columns)
            );
            let params = to_sql_all(row.iter().chain(pk.iter()), generated)?;
            if conn.execute(&sql, params_from_iter(params.iter()))? == 0 {
                return Err(ExecError::StaleRow {
                    table: stmt.table.clone(),
                });
            }
            if stmt.requery {
                StatementResult::RowData(requery(conn, stmt, pk, generated)?)
            } else {
                StatementResult::Success
            }
        }
        SqlAction::Delete if stmt.pks.is_empty() => {
            let names: Vec<String> = stmt.condition.iter().map(|(c, _)| c.clone()).collect();
            let sql = if names.is_empty() {
                format!("DELETE FROM {}", quote(&stmt.table))
            } else {
                format!("DELETE FROM {} WHERE {}", quote(&stmt.table), where_clause(&names))
            };
            let params = to_sql_all(stmt.condition.iter().map(|(_, v)| v), generated)?;
            conn.execute(&sql, params_from_iter(params.iter()))?;
            StatementResult::Success
        }
        SqlAction::Delete => {
            let sql = format!(
                "DELETE FROM {} WHERE {}",
                quote(&stmt.table),
                where_clause(&stmt.pk_columns)
            );
            let params = to_sql_all(stmt.pks[0].iter(), generated)?;
            if conn.execute(&sql, params_from_iter(params.iter()))? == 0 {
                return Err(ExecError::StaleRow {
                    table: stmt.table.clone(),
                });
            }
            StatementResult::Success
        }
    };

    if stmt.tracking {
        append_journal(conn, stmt)?;
    }
    Ok(result)
}

fn execute_insert(
    conn: &Connection,
    stmt: &Statement,
    generated: &mut HashMap<RowId, Value>,
) -> ExecResult<StatementResult> {
    let ident_idx = stmt
        .identity_column
        .as_ref()
        .and_then(|name| stmt.columns.iter().position(|c| c == name));
    // Only a single-row insert can carry its own pending identity.
    let own_ident = match (ident_idx, stmt.rows.as_slice()) {
        (Some(idx), [row]) => row[idx].ident_row(),
        _ => None,
    };

    let keep: Vec<usize> = (0..stmt.columns.len())
        .filter(|i| own_ident.is_none() || Some(*i) != ident_idx)
        .collect();
    let cols = keep
        .iter()
        .map(|i| quote(&stmt.columns[*i]))
        .collect::<Vec<_>>()
        .join(", ");
    let tuple = format!("({})", vec!["?"; keep.len()].join(", "));
    let tuples = vec![tuple; stmt.rows.len()].join(", ");
    let sql = format!("INSERT INTO {} ({cols}) VALUES {tuples}", quote(&stmt.table));

    let params = to_sql_all(
        stmt.rows.iter().flat_map(|row| keep.iter().map(move |i| &row[*i])),
        generated,
    )?;
    conn.execute(&sql, params_from_iter(params.iter()))?;

    let generated_value = own_ident.map(|owner| {
        let value = Value::Int(conn.last_insert_rowid());
        generated.insert(owner, value.clone());
        value
    });

    if stmt.requery {
        let pk: Vec<Value> = match (&generated_value, stmt.pks.first()) {
            (Some(v), _) => vec![v.clone()],
            (None, Some(pk)) => pk.clone(),
            (None, None) => Vec::new(),
        };
        return Ok(StatementResult::RowData(requery(conn, stmt, &pk, generated)?));
    }
    Ok(match generated_value {
        Some(v) => StatementResult::Generated(v),
        None => StatementResult::Success,
    })
}

fn requery(
    conn: &Connection,
    stmt: &Statement,
    pk: &[Value],
    generated: &HashMap<RowId, Value>,
) -> ExecResult<Vec<Value>> {
    let sql = format!(
        "SELECT * FROM {} WHERE {}",
        quote(&stmt.table),
        where_clause(&stmt.pk_columns)
    );
    let params = to_sql_all(pk.iter(), generated)?;
    let mut select = conn.prepare(&sql)?;
    let width = select.column_count();
    let row = select.query_row(params_from_iter(params.iter()), |row| {
        let mut out = Vec::with_capacity(width);
        for i in 0..width {
            out.push(from_sql(row.get::<_, SqlValue>(i)?));
        }
        Ok(out)
    })?;
    Ok(row)
}

fn append_journal(conn: &Connection, stmt: &Statement) -> ExecResult<()> {
    let payload = serde_json::to_vec(stmt)?;
    conn.execute(
        "INSERT INTO save_journal(ts_ms, server, tbl, kind, payload) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            now_ms() as i64,
            stmt.server,
            stmt.table,
            action_kind(stmt.action),
            payload
        ],
    )?;
    Ok(())
}

fn action_kind(action: SqlAction) -> i64 {
    match action {
        SqlAction::Insert => 1,
        SqlAction::Update => 2,
        SqlAction::Delete => 3,
    }
}

fn where_clause(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| format!("{} = ?", quote(c)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn to_sql_all<'a>(
    values: impl Iterator<Item = &'a Value>,
    generated: &HashMap<RowId, Value>,
) -> ExecResult<Vec<SqlValue>> {
    values.map(|v| to_sql(v, generated)).collect()
}

fn to_sql(value: &Value, generated: &HashMap<RowId, Value>) -> ExecResult<SqlValue> {
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Int(v) => SqlValue::Integer(*v),
        Value::Real(v) => SqlValue::Real(*v),
        Value::Text(v) => SqlValue::Text(v.clone()),
        Value::Bool(v) => SqlValue::Integer(i64::from(*v)),
        Value::Uuid(v) => SqlValue::Text(v.to_string()),
        Value::Blob(v) => SqlValue::Blob(v.clone()),
        Value::DbIdent(owner) => {
            let resolved = generated
                .get(owner)
                .ok_or(ExecError::UnresolvedIdentity(*owner))?;
            to_sql(resolved, generated)?
        }
        Value::BlobMarker => {
            return Err(ExecError::Backend("blob marker cannot be written".to_string()));
        }
    })
}

fn from_sql(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(v) => Value::Int(v),
        SqlValue::Real(v) => Value::Real(v),
        SqlValue::Text(v) => Value::Text(v),
        SqlValue::Blob(v) => Value::Blob(v),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
