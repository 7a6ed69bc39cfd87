mod common;

use hashbrown::HashSet;

use editsave::{
    engine::batch::{StatementBatcher, can_merge},
    op::Statement,
    types::{RowId, Value},
};

fn customer_insert(row: RowId, id: i64) -> Statement {
    Statement::insert(&common::customers(), row, vec![Value::Int(id), Value::from("c")])
}

#[test]
fn adjacent_inserts_into_one_table_merge() {
    let batched = StatementBatcher::batch(
        vec![customer_insert(1, 10), customer_insert(2, 11)],
        &HashSet::new(),
    );

    assert_eq!(batched.len(), 1);
    assert_eq!(batched[0].members, vec![0, 1]);
    assert_eq!(batched[0].statement.rows.len(), 2);
    assert_eq!(
        batched[0].statement.pks,
        vec![vec![Value::Int(10)], vec![Value::Int(11)]]
    );
}

#[test]
fn different_tables_never_merge() {
    let other = Statement::insert(
        &common::orders(),
        3,
        vec![Value::Int(5), Value::Int(10), Value::Int(1)],
    );
    let batched = StatementBatcher::batch(
        vec![customer_insert(1, 10), other, customer_insert(2, 11)],
        &HashSet::new(),
    );

    let members: Vec<Vec<usize>> = batched.iter().map(|b| b.members.clone()).collect();
    assert_eq!(members, vec![vec![0], vec![1], vec![2]]);
}

#[test]
fn pending_identities_block_merging() {
    let orders = common::orders();
    let a = Statement::insert(&orders, 1, vec![Value::DbIdent(1), Value::Int(10), Value::Int(1)]);
    let b = Statement::insert(&orders, 2, vec![Value::DbIdent(2), Value::Int(10), Value::Int(2)]);

    assert!(!can_merge(&a, &b, &HashSet::new()));
}

#[test]
fn per_statement_flags_block_merging() {
    let base = customer_insert(1, 10);

    let mut tracked = customer_insert(2, 11);
    tracked.tracking = true;
    assert!(!can_merge(&base, &tracked, &HashSet::new()));

    let mut requery = customer_insert(2, 11);
    requery.requery = true;
    assert!(!can_merge(&base, &requery, &HashSet::new()));

    let mut other_tx = customer_insert(2, 11);
    other_tx.transaction_id = Some("tx-1".to_string());
    assert!(!can_merge(&base, &other_tx, &HashSet::new()));

    let disallowed: HashSet<String> = ["main".to_string()].into_iter().collect();
    assert!(!can_merge(&base, &customer_insert(2, 11), &disallowed));
    assert!(can_merge(&base, &customer_insert(2, 11), &HashSet::new()));
}

#[test]
fn updates_are_never_merged() {
    let table = common::customers();
    let a = Statement::update(&table, vec!["name".into()], vec![Value::from("x")], vec![Value::Int(1)]);
    let b = Statement::update(&table, vec!["name".into()], vec![Value::from("y")], vec![Value::Int(2)]);

    assert_eq!(StatementBatcher::batch(vec![a, b], &HashSet::new()).len(), 2);
}

#[test]
fn short_insert_rows_are_padded_to_the_table() {
    let stmt = Statement::insert(&common::customers(), 1, vec![Value::Int(10)]);

    assert_eq!(stmt.rows, vec![vec![Value::Int(10), Value::Null]]);
    assert_eq!(stmt.pks, vec![vec![Value::Int(10)]]);

    let keyless = Statement::insert(&common::customers(), 2, Vec::new());
    assert_eq!(keyless.pks, vec![vec![Value::Null]]);
}
