#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;

use editsave::{
    core::store::RowStore,
    engine::{
        coordinator::{SaveConfig, SaveCoordinator},
        traits::Collaborators,
    },
    op::{SqlAction, Statement, StatementResult},
    persist::{ExecError, ExecResult, StatementExecutor},
    row::{ColumnMeta, TableMeta},
    types::{CollectionId, RecordId, Value},
};

/// Executor double that records every call and answers per statement.
#[derive(Default)]
pub struct RecordingExecutor {
    calls: Mutex<Vec<Vec<Statement>>>,
    fail_tables: Mutex<Vec<String>>,
    fail_call: Mutex<Option<ExecError>>,
    next_ident: Mutex<i64>,
}

impl RecordingExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_ident: Mutex::new(100),
            ..Self::default()
        })
    }

    /// Every statement for `table` comes back as `Failed`.
    pub fn fail_table(&self, table: &str) {
        self.fail_tables.lock().push(table.to_string());
    }

    /// The next call fails as a whole.
    pub fn fail_next_call(&self, err: ExecError) {
        *self.fail_call.lock() = Some(err);
    }

    pub fn calls(&self) -> Vec<Vec<Statement>> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn statements(&self) -> Vec<Statement> {
        self.calls.lock().iter().flatten().cloned().collect()
    }
}

impl StatementExecutor for RecordingExecutor {
    fn perform_updates(&self, statements: &[Statement]) -> ExecResult<Vec<StatementResult>> {
        self.calls.lock().push(statements.to_vec());
        if let Some(err) = self.fail_call.lock().take() {
            return Err(err);
        }
        let fail_tables = self.fail_tables.lock().clone();
        Ok(statements
            .iter()
            .map(|stmt| {
                if fail_tables.contains(&stmt.table) {
                    return StatementResult::Failed(ExecError::Backend(format!(
                        "{} rejected",
                        stmt.table
                    )));
                }
                let own_ident = stmt.action == SqlAction::Insert
                    && stmt.pks.is_empty()
                    && stmt.identity_column.is_some();
                if own_ident {
                    let mut next = self.next_ident.lock();
                    *next += 1;
                    StatementResult::Generated(Value::Int(*next))
                } else {
                    StatementResult::Success
                }
            })
            .collect())
    }
}

pub fn customers() -> Arc<TableMeta> {
    Arc::new(TableMeta::new(
        "main",
        "customers",
        vec![ColumnMeta::pk("id"), ColumnMeta::plain("name")],
    ))
}

/// Table with a backend generated key.
pub fn orders() -> Arc<TableMeta> {
    Arc::new(TableMeta::new(
        "main",
        "orders",
        vec![
            ColumnMeta::identity("id"),
            ColumnMeta::foreign("customer_id", "customers"),
            ColumnMeta::plain("total"),
        ],
    ))
}

/// Child of `orders`.
pub fn order_lines() -> Arc<TableMeta> {
    Arc::new(TableMeta::new(
        "main",
        "order_lines",
        vec![
            ColumnMeta::identity("id"),
            ColumnMeta::foreign("order_id", "orders"),
            ColumnMeta::plain("qty"),
        ],
    ))
}

pub fn coordinator(executor: Arc<RecordingExecutor>) -> SaveCoordinator {
    SaveCoordinator::new(RowStore::new(), Collaborators::new(executor), SaveConfig::default())
}

pub fn coordinator_with(collaborators: Collaborators, config: SaveConfig) -> SaveCoordinator {
    SaveCoordinator::new(RowStore::new(), collaborators, config)
}

/// Loads `customers` rows `(id, name)`; returns the collection and the records.
pub fn load_customers(
    coordinator: &SaveCoordinator,
    rows: &[(i64, &str)],
) -> (CollectionId, Vec<RecordId>) {
    let collection = coordinator.add_collection(customers(), true);
    let records = rows
        .iter()
        .map(|(id, name)| {
            coordinator
                .load_row(collection, vec![Value::Int(*id), Value::from(*name)])
                .expect("load row")
                .1
        })
        .collect();
    (collection, records)
}
