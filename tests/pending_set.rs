use editsave::{
    core::pending::{EditKind, PendingEditSet, PendingEntry},
    row::DeleteQuery,
    types::Value,
};

const DS: &str = "db:/main/customers";

#[test]
fn edit_then_delete_keeps_single_delete_entry() {
    let mut set = PendingEditSet::new();
    assert!(set.add_edited(1, DS));
    set.add_deleted(1, DS);

    assert!(set.contains_deleted(1));
    assert!(!set.contains_edited(1));
    assert_eq!(set.all(), vec![1]);
    assert_eq!(set.len(), 1);
}

#[test]
fn add_edited_is_idempotent_and_skips_deleted_records() {
    let mut set = PendingEditSet::new();
    assert!(set.add_edited(1, DS));
    assert!(!set.add_edited(1, DS));
    set.add_deleted(2, DS);
    assert!(!set.add_edited(2, DS));

    assert_eq!(set.edited(), vec![1]);
    assert_eq!(set.deleted(), vec![2]);
}

#[test]
fn delete_queries_are_never_deduplicated() {
    let mut set = PendingEditSet::new();
    let query = DeleteQuery::new(vec![("name".to_string(), Value::from("x"))]);
    set.add_delete_query(1, DS, query.clone());
    set.add_delete_query(1, DS, query);

    assert_eq!(set.delete_queries().len(), 2);
    assert_eq!(set.len(), 2);
    assert!(set.all().is_empty());
}

#[test]
fn take_next_prefers_records_over_queries() {
    let mut set = PendingEditSet::new();
    set.add_delete_query(9, DS, DeleteQuery::default());
    set.add_edited(1, DS);
    set.add_edited(2, DS);

    assert_eq!(set.take_next(|_, _| true, |_| true), Some(PendingEntry::Edit(1)));
    assert_eq!(
        set.take_next(|r, kind| r == 2 && kind == EditKind::Edit, |_| true),
        Some(PendingEntry::Edit(2))
    );
    assert!(matches!(
        set.take_next(|_, _| true, |_| true),
        Some(PendingEntry::DeleteQuery(q)) if q.collection == 9
    ));
    assert_eq!(set.take_next(|_, _| true, |_| true), None);
}

#[test]
fn restore_puts_entries_back_in_front_in_order() {
    let mut set = PendingEditSet::new();
    set.add_edited(1, DS);
    set.add_deleted(2, DS);
    set.add_edited(3, DS);

    let first = set.take_next(|_, _| true, |_| true).expect("first");
    let second = set.take_next(|_, _| true, |_| true).expect("second");
    set.add_edited(4, DS);
    set.restore(vec![first, second], |_| DS.to_string());

    assert_eq!(set.all(), vec![1, 2, 3, 4]);
    assert!(set.contains_deleted(2));
}

#[test]
fn restore_keeps_newer_entry_of_same_record() {
    let mut set = PendingEditSet::new();
    set.add_edited(1, DS);
    let taken = set.take_next(|_, _| true, |_| true).expect("taken");
    set.add_deleted(1, DS);
    set.restore(vec![taken], |_| DS.to_string());

    assert_eq!(set.all(), vec![1]);
    assert!(set.contains_deleted(1));
}

#[test]
fn remove_for_datasource_drops_records_and_queries() {
    let mut set = PendingEditSet::new();
    set.add_edited(1, DS);
    set.add_edited(2, "db:/main/orders");
    set.add_delete_query(5, DS, DeleteQuery::default());

    assert!(set.remove_for_datasource(DS));
    assert_eq!(set.all(), vec![2]);
    assert!(set.delete_queries().is_empty());
    assert!(!set.remove_for_datasource(DS));
}

#[test]
fn remove_by_kind_only_touches_that_kind() {
    let mut set = PendingEditSet::new();
    set.add_deleted(1, DS);
    assert!(!set.remove_edited(1));
    assert!(set.remove_deleted(1));
    assert!(set.is_empty());
}
