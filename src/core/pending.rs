//! Ordered registry of edit, delete and delete-by-query intents.
//!
//! The registry does no locking of its own; the owning
//! [`crate::engine::coordinator::SaveCoordinator`] serializes access.

use crate::{
    row::DeleteQuery,
    types::{CollectionId, RecordId},
};

/// Kind of a record-level intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EditKind {
    /// Record has pending changes.
    Edit,
    /// Record's row is flagged for deletion.
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct EditingRecord {
    record: RecordId,
    datasource: String,
    kind: EditKind,
}

/// Deletion-by-query intent owned by a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteQueryEntry {
    /// Collection that asked for the deletion.
    pub collection: CollectionId,
    /// Datasource of the collection.
    pub datasource: String,
    /// Rows to delete.
    pub query: DeleteQuery,
}

/// One intent removed from the set by [`PendingEditSet::take_next`].
#[derive(Debug, Clone, PartialEq)]
pub enum PendingEntry {
    /// Edited record.
    Edit(RecordId),
    /// Record flagged for deletion.
    Delete(RecordId),
    /// Deletion by query.
    DeleteQuery(DeleteQueryEntry),
}

/// Edits and deletes share one ordered list; delete queries live beside it.
#[derive(Debug, Clone, Default)]
pub struct PendingEditSet {
    records: Vec<EditingRecord>,
    delete_queries: Vec<DeleteQueryEntry>,
}

impl PendingEditSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an edit unless the record already has any entry.
    pub fn add_edited(&mut self, record: RecordId, datasource: impl Into<String>) -> bool {
        if self.contains(record) {
            return false;
        }
        self.records.push(EditingRecord {
            record,
            datasource: datasource.into(),
            kind: EditKind::Edit,
        });
        true
    }

    /// Replaces whatever entry the record had with a delete entry.
    pub fn add_deleted(&mut self, record: RecordId, datasource: impl Into<String>) {
        self.remove(record);
        self.records.push(EditingRecord {
            record,
            datasource: datasource.into(),
            kind: EditKind::Delete,
        });
    }

    /// Appends a deletion-by-query; never deduplicated against record deletes.
    pub fn add_delete_query(
        &mut self,
        collection: CollectionId,
        datasource: impl Into<String>,
        query: DeleteQuery,
    ) {
        self.delete_queries.push(DeleteQueryEntry {
            collection,
            datasource: datasource.into(),
            query,
        });
    }

    /// Removes every entry of the record.
    pub fn remove(&mut self, record: RecordId) -> bool {
        let before = self.records.len();
        self.records.retain(|er| er.record != record);
        before != self.records.len()
    }

    pub fn remove_edited(&mut self, record: RecordId) -> bool {
        self.remove_kind(record, EditKind::Edit)
    }

    pub fn remove_deleted(&mut self, record: RecordId) -> bool {
        self.remove_kind(record, EditKind::Delete)
    }

    fn remove_kind(&mut self, record: RecordId, kind: EditKind) -> bool {
        let before = self.records.len();
        self.records
            .retain(|er| !(er.record == record && er.kind == kind));
        before != self.records.len()
    }

    pub fn contains(&self, record: RecordId) -> bool {
        self.records.iter().any(|er| er.record == record)
    }

    pub fn contains_edited(&self, record: RecordId) -> bool {
        self.contains_kind(record, EditKind::Edit)
    }

    pub fn contains_deleted(&self, record: RecordId) -> bool {
        self.contains_kind(record, EditKind::Delete)
    }

    fn contains_kind(&self, record: RecordId, kind: EditKind) -> bool {
        self.records
            .iter()
            .any(|er| er.record == record && er.kind == kind)
    }

    /// True when any record entry (edit or delete) satisfies `pred`.
    pub fn contains_where(&self, mut pred: impl FnMut(RecordId) -> bool) -> bool {
        self.records.iter().any(|er| pred(er.record))
    }

    pub fn edited(&self) -> Vec<RecordId> {
        self.of_kind(Some(EditKind::Edit))
    }

    pub fn deleted(&self) -> Vec<RecordId> {
        self.of_kind(Some(EditKind::Delete))
    }

    pub fn all(&self) -> Vec<RecordId> {
        self.of_kind(None)
    }

    fn of_kind(&self, kind: Option<EditKind>) -> Vec<RecordId> {
        self.records
            .iter()
            .filter(|er| kind.is_none_or(|k| er.kind == k))
            .map(|er| er.record)
            .collect()
    }

    pub fn delete_queries(&self) -> &[DeleteQueryEntry] {
        &self.delete_queries
    }

    /// Number of record entries plus delete queries.
    pub fn len(&self) -> usize {
        self.records.len() + self.delete_queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns the first record entry accepted by `record_pred`, else
    /// the first delete query accepted by `query_pred`.
    pub fn take_next(
        &mut self,
        mut record_pred: impl FnMut(RecordId, EditKind) -> bool,
        mut query_pred: impl FnMut(&DeleteQueryEntry) -> bool,
    ) -> Option<PendingEntry> {
        if let Some(pos) = self
            .records
            .iter()
            .position(|er| record_pred(er.record, er.kind))
        {
            let er = self.records.remove(pos);
            return Some(match er.kind {
                EditKind::Edit => PendingEntry::Edit(er.record),
                EditKind::Delete => PendingEntry::Delete(er.record),
            });
        }
        let pos = self.delete_queries.iter().position(|q| query_pred(q))?;
        Some(PendingEntry::DeleteQuery(self.delete_queries.remove(pos)))
    }

    /// Removes and returns the delete queries accepted by `pred`.
    pub fn take_delete_queries(
        &mut self,
        mut pred: impl FnMut(&DeleteQueryEntry) -> bool,
    ) -> Vec<DeleteQueryEntry> {
        let mut taken = Vec::new();
        let mut kept = Vec::with_capacity(self.delete_queries.len());
        for q in self.delete_queries.drain(..) {
            if pred(&q) {
                taken.push(q);
            } else {
                kept.push(q);
            }
        }
        self.delete_queries = kept;
        taken
    }

    /// Puts taken entries back in front, keeping their relative order.
    ///
    /// A record that meanwhile received a new entry keeps the new one.
    pub fn restore(
        &mut self,
        entries: Vec<PendingEntry>,
        mut datasource: impl FnMut(RecordId) -> String,
    ) {
        let mut records = Vec::new();
        let mut queries = Vec::new();
        for entry in entries {
            let (record, kind) = match entry {
                PendingEntry::Edit(record) => (record, EditKind::Edit),
                PendingEntry::Delete(record) => (record, EditKind::Delete),
                PendingEntry::DeleteQuery(q) => {
                    queries.push(q);
                    continue;
                }
            };
            if self.contains(record) || records.iter().any(|er: &EditingRecord| er.record == record) {
                continue;
            }
            records.push(EditingRecord {
                record,
                datasource: datasource(record),
                kind,
            });
        }
        records.append(&mut self.records);
        self.records = records;
        queries.append(&mut self.delete_queries);
        self.delete_queries = queries;
    }

    /// Drops every intent whose datasource matches; returns whether anything changed.
    pub fn remove_for_datasource(&mut self, datasource: &str) -> bool {
        let before = self.len();
        self.records.retain(|er| er.datasource != datasource);
        self.delete_queries.retain(|q| q.datasource != datasource);
        before != self.len()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.delete_queries.clear();
    }
}

