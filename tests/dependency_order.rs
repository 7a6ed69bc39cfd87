mod common;

use editsave::{
    core::store::RowStore,
    engine::order::{DependencyOrderer, references},
    op::{RowUpdateInfo, Statement, TableUpdateInfo, UpdateInfo},
    row::{ColumnMeta, DeleteQuery, TableMeta},
    types::{RecordId, Value},
};
use std::sync::Arc;

fn info(store: &RowStore, record: RecordId) -> RowUpdateInfo {
    store
        .build_update_info(record, false)
        .expect("build")
        .expect("row has a statement")
}

fn tables(infos: &[UpdateInfo]) -> Vec<String> {
    infos.iter().map(|i| i.statement().table.clone()).collect()
}

fn query_info(table: &Arc<TableMeta>) -> UpdateInfo {
    let query = DeleteQuery::new(vec![("name".to_string(), Value::from("gone"))]);
    UpdateInfo::Table(TableUpdateInfo {
        collection: 99,
        table: table.clone(),
        statement: Statement::delete_by_query(table, &query),
        query,
    })
}

#[test]
fn new_parent_moves_before_new_child() {
    let mut store = RowStore::new();
    let orders = store.add_collection(common::orders(), true);
    let lines = store.add_collection(common::order_lines(), true);
    let (order_row, order) = store
        .new_record(orders, vec![Value::Null, Value::Int(1), Value::Int(10)])
        .expect("order");
    let (_, line) = store
        .new_record(lines, vec![Value::Null, Value::DbIdent(order_row), Value::Int(2)])
        .expect("line");

    let line_info = info(&store, line);
    let order_info = info(&store, order);
    assert!(references(&line_info, &order_info));
    assert!(!references(&order_info, &line_info));

    let ordered = DependencyOrderer::order(
        vec![UpdateInfo::Row(line_info), UpdateInfo::Row(order_info)],
        false,
    );
    assert_eq!(tables(&ordered), vec!["orders", "order_lines"]);
}

#[test]
fn deleted_child_moves_before_deleted_parent() {
    let mut store = RowStore::new();
    let customers = store.add_collection(common::customers(), true);
    let orders = store.add_collection(common::orders(), true);
    let (_, customer) = store
        .load_row(customers, vec![Value::Int(1), Value::from("Acme")])
        .expect("customer");
    let (_, order) = store
        .load_row(orders, vec![Value::Int(10), Value::Int(1), Value::Int(5)])
        .expect("order");
    for record in [customer, order] {
        store.record_row_mut(record).expect("row").flag_for_delete(true);
    }

    let ordered = DependencyOrderer::order(
        vec![
            UpdateInfo::Row(info(&store, customer)),
            UpdateInfo::Row(info(&store, order)),
        ],
        false,
    );
    assert_eq!(tables(&ordered), vec!["orders", "customers"]);
}

#[test]
fn updates_of_existing_rows_keep_their_order() {
    let mut store = RowStore::new();
    let customers = store.add_collection(common::customers(), true);
    let orders = store.add_collection(common::orders(), true);
    let (_, order) = store
        .load_row(orders, vec![Value::Int(10), Value::Int(1), Value::Int(5)])
        .expect("order");
    let (_, customer) = store
        .load_row(customers, vec![Value::Int(1), Value::from("Acme")])
        .expect("customer");
    store.set_value(order, "total", Value::Int(6)).expect("edit order");
    store.set_value(customer, "name", Value::from("Beta")).expect("edit customer");

    let ordered = DependencyOrderer::order(
        vec![
            UpdateInfo::Row(info(&store, order)),
            UpdateInfo::Row(info(&store, customer)),
        ],
        false,
    );
    assert_eq!(tables(&ordered), vec!["orders", "customers"]);
}

#[test]
fn query_blocks_stay_in_place_and_rollback_reverses_blocks() {
    let mut store = RowStore::new();
    let customers_table = common::customers();
    let customers = store.add_collection(customers_table.clone(), true);
    let (_, a) = store
        .new_record(customers, vec![Value::Int(1), Value::from("a")])
        .expect("a");
    let (_, b) = store
        .new_record(customers, vec![Value::Int(2), Value::from("b")])
        .expect("b");

    let input = || {
        vec![
            UpdateInfo::Row(info(&store, a)),
            query_info(&customers_table),
            UpdateInfo::Row(info(&store, b)),
        ]
    };

    let forward = DependencyOrderer::order(input(), false);
    assert!(forward[0].is_row() && !forward[1].is_row() && forward[2].is_row());

    let rollback = DependencyOrderer::order(input(), true);
    let records: Vec<Option<RecordId>> = rollback
        .iter()
        .map(|i| i.as_row().map(|r| r.record))
        .collect();
    assert_eq!(records, vec![Some(b), None, Some(a)]);
}

#[test]
fn uuid_keys_match_across_representations() {
    let id = uuid::Uuid::new_v4();
    let parents = Arc::new(TableMeta::new(
        "main",
        "parents",
        vec![ColumnMeta::pk("id").uuid(), ColumnMeta::plain("name")],
    ));
    let children = Arc::new(TableMeta::new(
        "main",
        "children",
        vec![ColumnMeta::pk("id"), ColumnMeta::plain("parent")],
    ));
    let mut store = RowStore::new();
    let p = store.add_collection(parents, true);
    let c = store.add_collection(children, true);
    let (_, parent) = store
        .new_record(p, vec![Value::Uuid(id), Value::from("p")])
        .expect("parent");
    let (_, child) = store
        .new_record(c, vec![Value::Int(1), Value::Text(id.to_string())])
        .expect("child");

    assert!(references(&info(&store, child), &info(&store, parent)));
}

#[test]
fn mutual_references_terminate() {
    let a_table = Arc::new(TableMeta::new(
        "main",
        "a",
        vec![ColumnMeta::pk("id"), ColumnMeta::foreign("b_id", "b")],
    ));
    let b_table = Arc::new(TableMeta::new(
        "main",
        "b",
        vec![ColumnMeta::pk("id"), ColumnMeta::foreign("a_id", "a")],
    ));
    let mut store = RowStore::new();
    let ac = store.add_collection(a_table, true);
    let bc = store.add_collection(b_table, true);
    let (_, a) = store.new_record(ac, vec![Value::Int(1), Value::Int(2)]).expect("a");
    let (_, b) = store.new_record(bc, vec![Value::Int(2), Value::Int(1)]).expect("b");

    let ordered = DependencyOrderer::order(
        vec![UpdateInfo::Row(info(&store, a)), UpdateInfo::Row(info(&store, b))],
        false,
    );
    assert_eq!(ordered.len(), 2);
}
