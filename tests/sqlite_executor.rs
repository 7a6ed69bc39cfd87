mod common;

use std::sync::Arc;

use editsave::{
    core::store::RowStore,
    engine::{
        coordinator::{SaveConfig, SaveCoordinator, SaveError, SaveScope},
        traits::{AccessProvider, Collaborators, HookError},
    },
    op::SqlAction,
    persist::{ExecError, sqlite::SqliteExecutor},
    row::{ColumnMeta, TableMeta},
    types::{Access, SaveStatus, Value},
};

const DDL: &str = "
    CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT);
    CREATE TABLE orders (id INTEGER PRIMARY KEY, customer_id INTEGER, total INTEGER);
    CREATE TABLE order_lines (id INTEGER PRIMARY KEY, order_id INTEGER, qty INTEGER);
";

fn open() -> (tempfile::TempDir, Arc<SqliteExecutor>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let executor = SqliteExecutor::open(dir.path().join("save.db")).expect("open");
    executor.execute_batch(DDL).expect("ddl");
    (dir, Arc::new(executor))
}

fn coordinator(executor: Arc<SqliteExecutor>) -> SaveCoordinator {
    SaveCoordinator::new(RowStore::new(), Collaborators::new(executor), SaveConfig::default())
}

#[test_log::test]
fn generated_keys_flow_into_dependent_inserts() {
    let (_dir, executor) = open();
    let coordinator = coordinator(executor.clone());
    let orders = coordinator.add_collection(common::orders(), true);
    let lines = coordinator.add_collection(common::order_lines(), true);

    let order = coordinator
        .new_record(orders, vec![Value::Null, Value::Int(1), Value::Int(10)])
        .expect("order");
    let order_row = coordinator
        .with_store(|s| s.record(order).map(|r| r.row))
        .expect("order row");
    coordinator
        .new_record(lines, vec![Value::Null, Value::DbIdent(order_row), Value::Int(3)])
        .expect("line");

    assert_eq!(coordinator.stop_editing(true, SaveScope::all()), SaveStatus::Stopped);

    let order_id = coordinator.value(order, "id").expect("id");
    assert_eq!(order_id, Value::Int(1));
    assert_eq!(
        executor.select_all(&common::order_lines()).expect("lines"),
        vec![vec![Value::Int(1), order_id, Value::Int(3)]]
    );
}

#[test]
fn update_of_missing_row_is_stale() {
    let (_dir, executor) = open();
    let coordinator = coordinator(executor.clone());
    let (_, records) = common::load_customers(&coordinator, &[(99, "ghost")]);

    coordinator.set_value(records[0], "name", "still ghost".into()).expect("edit");
    assert_eq!(coordinator.stop_editing(true, SaveScope::all()), SaveStatus::SaveFailed);
    assert_eq!(coordinator.failed_records(None), records);
    assert_eq!(
        coordinator.last_save_error(),
        Some(SaveError::Execution(ExecError::StaleRow {
            table: "customers".to_string(),
        }))
    );
}

struct Tracked;

impl AccessProvider for Tracked {
    fn table_access(&self, _table: &TableMeta) -> Result<Option<Access>, HookError> {
        Ok(Some(Access::ALL | Access::TRACKING))
    }
}

#[test]
fn tracked_tables_are_journaled() {
    let (_dir, executor) = open();
    executor
        .execute_batch("INSERT INTO customers VALUES (1, 'a'), (2, 'b');")
        .expect("seed");
    let coordinator = SaveCoordinator::new(
        RowStore::new(),
        Collaborators::new(executor.clone()).with_access(Arc::new(Tracked)),
        SaveConfig::default(),
    );
    let (_, records) = common::load_customers(&coordinator, &[(1, "a"), (2, "b")]);

    coordinator.set_value(records[0], "name", "a2".into()).expect("edit");
    coordinator.add_deleted_record(records[1]).expect("delete");
    assert_eq!(coordinator.stop_editing(true, SaveScope::all()), SaveStatus::Stopped);

    let journal = executor.journal().expect("journal");
    let actions: Vec<SqlAction> = journal.iter().map(|s| s.action).collect();
    assert_eq!(actions, vec![SqlAction::Update, SqlAction::Delete]);
    assert!(journal.iter().all(|s| s.tracking && s.table == "customers"));
    assert_eq!(
        executor.select_all(&common::customers()).expect("rows"),
        vec![vec![Value::Int(1), Value::from("a2")]]
    );
}

#[test]
fn requeried_rows_replace_local_values() {
    let executor = Arc::new(SqliteExecutor::open_in_memory().expect("open"));
    executor
        .execute_batch(
            "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT, stamp TEXT);
             CREATE TRIGGER notes_stamp AFTER INSERT ON notes
             BEGIN UPDATE notes SET stamp = 'server' WHERE id = NEW.id; END;",
        )
        .expect("ddl");
    let mut notes = TableMeta::new(
        "main",
        "notes",
        vec![ColumnMeta::pk("id"), ColumnMeta::plain("body"), ColumnMeta::plain("stamp")],
    );
    notes.requery = true;

    let coordinator = coordinator(executor);
    let collection = coordinator.add_collection(Arc::new(notes), true);
    let record = coordinator
        .new_record(collection, vec![Value::Int(5), Value::from("hello"), Value::Null])
        .expect("note");

    assert_eq!(coordinator.stop_editing(true, SaveScope::all()), SaveStatus::Stopped);
    assert_eq!(coordinator.value(record, "stamp").expect("stamp"), Value::from("server"));
    let changed = coordinator.with_store(|s| s.record_row(record).map(|r| r.is_changed()));
    assert_eq!(changed, Some(false));
}

#[test]
fn closed_connection_keeps_edits_pending() {
    let (_dir, executor) = open();
    let coordinator = coordinator(executor.clone());
    let (customers, _) = common::load_customers(&coordinator, &[]);
    let record = coordinator
        .new_record(customers, vec![Value::Int(1), Value::from("a")])
        .expect("new");

    executor.close();
    assert_eq!(coordinator.stop_editing(true, SaveScope::all()), SaveStatus::SaveFailed);
    assert!(coordinator.is_editing_record(record));
    assert_eq!(
        coordinator.last_save_error(),
        Some(SaveError::Execution(ExecError::ConnectionClosed))
    );
}
