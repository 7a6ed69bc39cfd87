//! Session-scoped owner of the pending edits, the failed bucket and the rows.
//!
//! All bookkeeping lives behind one reentrant lock. The lock is taken per
//! bookkeeping step and never held while a collaborator runs, so callbacks may
//! call straight back into the coordinator.

use std::{cell::RefCell, sync::Arc};

use dashmap::DashMap;
use hashbrown::{HashMap, HashSet};
use parking_lot::{ReentrantMutex, RwLock};
use tokio::sync::broadcast;

use crate::{
    core::{
        pending::{DeleteQueryEntry, PendingEditSet, PendingEntry},
        store::{RowStore, StoreError, StoredCalculation},
    },
    engine::{
        order::DependencyOrderer,
        traits::{Collaborators, FieldError, PrepareForSave},
    },
    op::UpdateInfo,
    persist::ExecError,
    row::{DeleteQuery, TableMeta},
    runtime::events::SaveEvent,
    types::{Access, CollectionId, RecordId, RowId, SaveStatus, Value},
};

/// Application-level save failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SaveError {
    #[error("no update access to {0}")]
    NoModifyAccess(String),
    #[error("no insert access to {0}")]
    NoInsertAccess(String),
    #[error("no delete access to {0}")]
    NoDeleteAccess(String),
    #[error("record validation failed ({} field errors)", .0.len())]
    Validation(Vec<FieldError>),
    #[error("trigger failed: {0}")]
    Trigger(String),
    #[error(transparent)]
    Execution(#[from] ExecError),
    #[error("save recursion exceeded {0} passes")]
    RecursionLimit(usize),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct SaveConfig {
    /// Initial auto-save flag.
    pub auto_save: bool,
    /// Skip dependency ordering of inserts and deletes.
    pub disable_insert_reorder: bool,
    /// Merge compatible inserts into multi-row statements.
    pub batch_statements: bool,
    /// Bound on trigger-induced save passes.
    pub max_save_depth: usize,
    /// Servers that reject multi-row INSERT.
    pub multi_insert_disallowed: HashSet<String>,
    /// Broadcast buffer for [`SaveEvent`]s.
    pub event_capacity: usize,
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self {
            auto_save: true,
            disable_insert_reorder: false,
            batch_statements: true,
            max_save_depth: 50,
            multi_insert_disallowed: HashSet::new(),
            event_capacity: 1024,
        }
    }
}

/// Which pending entries a save request covers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveScope {
    /// Only records of this collection (and its delete queries).
    pub collection: Option<CollectionId>,
    /// Only these records; delete queries are skipped.
    pub records: Option<Vec<RecordId>>,
}

impl SaveScope {
    /// Every pending entry.
    pub fn all() -> Self {
        Self::default()
    }

    /// Only `records`.
    pub fn records(records: impl Into<Vec<RecordId>>) -> Self {
        Self {
            collection: None,
            records: Some(records.into()),
        }
    }

    /// Only `record`.
    pub fn record(record: RecordId) -> Self {
        Self::records(vec![record])
    }

    /// Only entries of `collection`.
    pub fn collection(collection: CollectionId) -> Self {
        Self {
            collection: Some(collection),
            records: None,
        }
    }

    pub fn is_all(&self) -> bool {
        self.collection.is_none() && self.records.is_none()
    }

    pub(crate) fn accepts(&self, record: RecordId, collection: CollectionId) -> bool {
        self.collection.is_none_or(|c| c == collection)
            && self.records.as_ref().is_none_or(|rs| rs.contains(&record))
    }

    pub(crate) fn accepts_query(&self, query: &DeleteQueryEntry) -> bool {
        self.records.is_none() && self.collection.is_none_or(|c| c == query.collection)
    }
}

pub(super) struct EditState {
    pub(super) store: RowStore,
    pub(super) pending: PendingEditSet,
    pub(super) failed: Vec<RecordId>,
    pub(super) tested: Vec<RecordId>,
    pub(super) saving_all: bool,
    pub(super) saving_records: Vec<RecordId>,
    pub(super) auto_save: bool,
    pub(super) ignore_save: bool,
    pub(super) preparing: bool,
    pub(super) last_error: Option<SaveError>,
}

impl EditState {
    pub(super) fn datasource_of(&self, record: RecordId) -> String {
        self.store
            .record_collection(record)
            .map(|c| c.datasource())
            .unwrap_or_default()
    }

    /// Moves the record to the failed bucket with `err` attached to its row.
    pub(super) fn mark_failed(&mut self, record: RecordId, err: SaveError) {
        if let Some(row) = self.store.record_row_mut(record) {
            row.set_last_error(Some(err.clone()));
        }
        self.pending.remove(record);
        if !self.failed.contains(&record) {
            self.failed.push(record);
        }
        self.tested.retain(|r| *r != record);
        self.last_error = Some(err);
    }

    /// Puts taken entries back in front of the pending set.
    pub(super) fn requeue(&mut self, entries: Vec<PendingEntry>) {
        let EditState { store, pending, .. } = self;
        pending.restore(entries, |record| {
            store
                .record_collection(record)
                .map(|c| c.datasource())
                .unwrap_or_default()
        });
    }

    /// Forgets records that no longer exist in the store.
    pub(super) fn forget(&mut self, records: &[RecordId]) {
        for record in records {
            self.pending.remove(*record);
            self.failed.retain(|r| r != record);
            self.tested.retain(|r| r != record);
        }
    }
}

/// Orchestrates edits, deletes and the save pipeline for one session.
pub struct SaveCoordinator {
    pub(super) state: ReentrantMutex<RefCell<EditState>>,
    access_cache: DashMap<String, Access>,
    prepare_hooks: RwLock<Vec<Arc<dyn PrepareForSave>>>,
    pub(super) collaborators: Collaborators,
    pub(super) config: SaveConfig,
    events: broadcast::Sender<SaveEvent>,
}

/// Restores the previous ignore-save flag on drop.
pub struct IgnoreSaveGuard<'a> {
    coordinator: &'a SaveCoordinator,
    previous: bool,
}

impl Drop for IgnoreSaveGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.ignore_save(self.previous);
    }
}

impl SaveCoordinator {
    pub fn new(store: RowStore, collaborators: Collaborators, config: SaveConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            state: ReentrantMutex::new(RefCell::new(EditState {
                store,
                pending: PendingEditSet::new(),
                failed: Vec::new(),
                tested: Vec::new(),
                saving_all: false,
                saving_records: Vec::new(),
                auto_save: config.auto_save,
                ignore_save: false,
                preparing: false,
                last_error: None,
            })),
            access_cache: DashMap::new(),
            prepare_hooks: RwLock::new(Vec::new()),
            collaborators,
            config,
            events,
        }
    }

    /// Runs `f` on the locked state. `f` must not call collaborators.
    pub(super) fn with_state<R>(&self, f: impl FnOnce(&mut EditState) -> R) -> R {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        f(&mut state)
    }

    pub(super) fn read_state<R>(&self, f: impl FnOnce(&EditState) -> R) -> R {
        let guard = self.state.lock();
        let state = guard.borrow();
        f(&state)
    }

    pub fn config(&self) -> &SaveConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SaveEvent> {
        self.events.subscribe()
    }

    pub(super) fn emit(&self, event: SaveEvent) {
        let _ = self.events.send(event);
    }

    pub(super) fn fire_edit_change(&self) {
        let editing = self.read_state(|s| !s.pending.is_empty() || !s.failed.is_empty());
        self.emit(SaveEvent::EditingStateChanged { editing });
    }

    /// Read access to the rows. Do not call back into the coordinator from `f`.
    pub fn with_store<R>(&self, f: impl FnOnce(&RowStore) -> R) -> R {
        self.read_state(|s| f(&s.store))
    }

    /// Write access to the rows, bypassing edit tracking.
    pub fn with_store_mut<R>(&self, f: impl FnOnce(&mut RowStore) -> R) -> R {
        self.with_state(|s| f(&mut s.store))
    }

    pub fn add_collection(&self, table: Arc<TableMeta>, editable: bool) -> CollectionId {
        self.with_state(|s| s.store.add_collection(table, editable))
    }

    /// Adds a row that already exists in the backend.
    pub fn load_row(&self, collection: CollectionId, values: Vec<Value>) -> Result<(RowId, RecordId), SaveError> {
        Ok(self.with_state(|s| s.store.load_row(collection, values))?)
    }

    /// Adds a row still to be inserted and starts editing it.
    pub fn new_record(&self, collection: CollectionId, values: Vec<Value>) -> Result<RecordId, SaveError> {
        let (_, record) = self.with_state(|s| s.store.new_record(collection, values))?;
        if !self.start_editing(record, true)? {
            tracing::debug!(record, collection, "new record created without entering edit");
        }
        Ok(record)
    }

    pub fn value(&self, record: RecordId, column: &str) -> Result<Value, SaveError> {
        Ok(self.read_state(|s| s.store.value(record, column))?)
    }

    pub fn add_stored_calculation(
        &self,
        table: &TableMeta,
        column: &str,
        calc: StoredCalculation,
    ) -> Result<(), SaveError> {
        Ok(self.with_state(|s| s.store.add_stored_calculation(table, column, calc))?)
    }

    /// Cached permission check; unspecified security denies only tracking.
    pub fn has_access(&self, table: &TableMeta, flag: Access) -> bool {
        let key = table.key();
        let cached = self.access_cache.get(&key).map(|a| *a);
        let access = match cached {
            Some(access) => access,
            None => match self.collaborators.access.table_access(table) {
                Ok(access) => {
                    let access = access.unwrap_or(Access::ALL);
                    self.access_cache.insert(key, access);
                    access
                }
                Err(err) => {
                    tracing::error!(table = %key, %err, "access lookup failed");
                    return false;
                }
            },
        };
        access.allows(flag)
    }

    pub fn clear_security_settings(&self) {
        self.access_cache.clear();
    }

    pub fn add_prepare_for_save(&self, hook: Arc<dyn PrepareForSave>) {
        self.prepare_hooks.write().push(hook);
    }

    pub(super) fn prepare_hooks(&self) -> Vec<Arc<dyn PrepareForSave>> {
        self.prepare_hooks.read().clone()
    }

    /// Registers `record` as edited.
    ///
    /// Read-only collections and records already in edit succeed without
    /// registering anything. Missing access, a lock held by another editor, a
    /// pending delete or a vetoing edit-start hook return `false`.
    pub fn start_editing(&self, record: RecordId, fire_edit_start: bool) -> Result<bool, SaveError> {
        let probe = self.with_state(|s| -> Result<_, SaveError> {
            let collection = s
                .store
                .record_collection(record)
                .ok_or(StoreError::MissingRecord(record))?;
            if !collection.editable {
                return Ok(None);
            }
            if s.pending.contains_edited(record) {
                s.tested.retain(|r| *r != record);
                return Ok(None);
            }
            let locked = s.store.record(record).is_some_and(|r| r.locked);
            let row = s
                .store
                .record_row(record)
                .ok_or(StoreError::MissingRecord(record))?;
            Ok(Some((
                row.table().clone(),
                row.exists(),
                locked,
                s.pending.contains_deleted(record),
            )))
        })?;
        let Some((table, exists, locked, deleting)) = probe else {
            return Ok(true);
        };
        if deleting {
            return Ok(false);
        }

        let flag = if exists { Access::UPDATE } else { Access::INSERT };
        if !self.has_access(&table, flag) {
            tracing::debug!(table = %table.key(), record, "edit refused: no access");
            return Ok(false);
        }
        if exists && locked {
            tracing::debug!(table = %table.key(), record, "edit refused: record locked");
            return Ok(false);
        }
        if fire_edit_start
            && !self
                .prepare_hooks()
                .iter()
                .all(|hook| hook.record_edit_start(self, record))
        {
            return Ok(false);
        }

        let first = self.with_state(|s| {
            s.tested.retain(|r| *r != record);
            let datasource = s.datasource_of(record);
            let added = s.pending.add_edited(record, datasource);
            s.failed.retain(|r| *r != record);
            if let Some(row) = s.store.record_row_mut(record) {
                row.set_last_error(None);
            }
            added && s.pending.len() == 1
        });
        if first {
            self.fire_edit_change();
        }
        Ok(true)
    }

    /// Starts editing and writes one column of the record's row.
    ///
    /// Returns `false` when the record could not enter edit.
    pub fn set_value(&self, record: RecordId, column: &str, value: Value) -> Result<bool, SaveError> {
        if !self.start_editing(record, true)? {
            return Ok(false);
        }
        self.with_state(|s| s.store.set_value(record, column, value))?;
        Ok(true)
    }

    /// Flags the record's row for deletion and queues a delete entry.
    pub fn add_deleted_record(&self, record: RecordId) -> Result<bool, SaveError> {
        let (table, locked, editable) = self.read_state(|s| -> Result<_, SaveError> {
            let collection = s
                .store
                .record_collection(record)
                .ok_or(StoreError::MissingRecord(record))?;
            let locked = s.store.record(record).is_some_and(|r| r.locked);
            Ok((collection.table.clone(), locked, collection.editable))
        })?;
        if !editable {
            return Ok(false);
        }
        if !self.has_access(&table, Access::DELETE) {
            tracing::debug!(table = %table.key(), record, "delete refused: no access");
            return Ok(false);
        }
        if locked {
            return Ok(false);
        }

        let first = self.with_state(|s| {
            let was_empty = s.pending.is_empty();
            if let Some(row) = s.store.record_row_mut(record) {
                row.flag_for_delete(true);
                row.set_last_error(None);
            }
            let datasource = s.datasource_of(record);
            s.pending.add_deleted(record, datasource);
            s.failed.retain(|r| *r != record);
            s.tested.retain(|r| *r != record);
            was_empty
        });
        if first {
            self.fire_edit_change();
        }
        Ok(true)
    }

    /// Queues a deletion of every row of the collection's table matching `query`.
    pub fn add_delete_query(&self, collection: CollectionId, query: DeleteQuery) -> Result<bool, SaveError> {
        let table = self
            .read_state(|s| s.store.collection(collection).map(|c| c.table.clone()))
            .ok_or(StoreError::MissingCollection(collection))?;
        if !self.has_access(&table, Access::DELETE) {
            return Ok(false);
        }
        let first = self.with_state(|s| {
            let was_empty = s.pending.is_empty();
            s.pending.add_delete_query(collection, table.datasource(), query);
            was_empty
        });
        if first {
            self.fire_edit_change();
        }
        Ok(true)
    }

    /// Discards pending edits and deletes of `records` (all when `None`).
    ///
    /// Rows return to their last committed values; rows that never reached the
    /// backend are dropped with their records.
    pub fn rollback_records(
        &self,
        records: Option<&[RecordId]>,
        rollback_delete_queries: bool,
        collection: Option<CollectionId>,
    ) {
        let mut updated: HashMap<CollectionId, Vec<RecordId>> = HashMap::new();
        let mut reloaded: Vec<CollectionId> = Vec::new();

        let touched = self.with_state(|s| {
            let candidates: Vec<RecordId> = match records {
                Some(records) => records.to_vec(),
                None => s.failed.iter().copied().chain(s.pending.all()).collect(),
            };
            let mut array: Vec<RecordId> = Vec::new();
            for record in candidates {
                let in_scope = collection.is_none_or(|c| {
                    s.store.record(record).is_some_and(|rec| rec.collection == c)
                });
                if !in_scope {
                    continue;
                }
                s.tested.retain(|r| *r != record);
                let was_failed = s.failed.contains(&record);
                s.failed.retain(|r| *r != record);
                if (was_failed || s.pending.contains(record)) && !array.contains(&record) {
                    array.push(record);
                }
            }

            let queries = if rollback_delete_queries && records.is_none() {
                s.pending
                    .take_delete_queries(|q| collection.is_none_or(|c| q.collection == c))
            } else {
                Vec::new()
            };
            for q in &queries {
                if !reloaded.contains(&q.collection) {
                    reloaded.push(q.collection);
                }
            }

            // Existence is memorized up front; rows shared by several records
            // may disappear while the array is processed.
            let exists: HashMap<RecordId, bool> = array
                .iter()
                .map(|r| (*r, s.store.record_row(*r).is_some_and(|row| row.exists())))
                .collect();

            let infos: Vec<UpdateInfo> = array
                .iter()
                .filter_map(|r| s.store.build_update_info(*r, false).ok().flatten())
                .map(UpdateInfo::Row)
                .collect();
            let mut sequence: Vec<RecordId> = DependencyOrderer::order(infos, true)
                .iter()
                .filter_map(|info| info.as_row().map(|row| row.record))
                .collect();
            for record in &array {
                if !sequence.contains(record) {
                    sequence.push(*record);
                }
            }

            for record in sequence {
                let collection_id = s.store.record(record).map(|r| r.collection);
                let row_id = s.store.record(record).map(|r| r.row);
                if let Some(row) = s.store.record_row_mut(record) {
                    row.rollback_from_old_values();
                }
                s.pending.remove(record);
                let (Some(collection_id), Some(row_id)) = (collection_id, row_id) else {
                    continue;
                };
                if exists.get(&record).copied().unwrap_or(false) {
                    updated.entry(collection_id).or_default().push(record);
                } else {
                    let removed = s.store.remove_row(row_id);
                    s.forget(&removed);
                    if !reloaded.contains(&collection_id) {
                        reloaded.push(collection_id);
                    }
                }
            }
            !array.is_empty() || !queries.is_empty()
        });

        if !touched {
            return;
        }
        for (collection, records) in updated {
            self.emit(SaveEvent::RecordsUpdated { collection, records });
        }
        for collection in reloaded {
            self.emit(SaveEvent::CollectionReloaded { collection });
        }
        self.fire_edit_change();
    }

    /// Purges edits whose rows did not actually change.
    ///
    /// `keep` lists records that must stay queued regardless.
    pub fn remove_unchanged_records(&self, check_calcs: bool, keep: Option<&[RecordId]>) {
        let emptied = self.with_state(|s| {
            if s.preparing {
                return false;
            }
            let mut removed = false;
            for record in s.pending.edited() {
                if keep.is_some_and(|k| k.contains(&record)) {
                    continue;
                }
                if check_calcs {
                    let _ = s.store.validate_stored_calculations(record);
                }
                let changed = s.store.record_row(record).is_some_and(|row| row.is_changed());
                if !changed {
                    s.pending.remove_edited(record);
                    s.tested.retain(|r| *r != record);
                    s.failed.retain(|r| *r != record);
                    removed = true;
                }
            }
            removed && s.pending.is_empty()
        });
        if emptied {
            self.fire_edit_change();
        }
    }

    /// True when the collection (or any collection) has pending or failed records.
    pub fn has_edited_records(&self, collection: Option<CollectionId>, test_for_removes: bool) -> bool {
        if test_for_removes {
            self.remove_unchanged_records(false, None);
        }
        self.read_state(|s| {
            let in_scope = |record: &RecordId| {
                collection.is_none_or(|c| {
                    s.store.record(*record).is_some_and(|rec| rec.collection == c)
                })
            };
            s.pending.all().iter().chain(s.failed.iter()).any(in_scope)
                || s.pending
                    .delete_queries()
                    .iter()
                    .any(|q| collection.is_none_or(|c| q.collection == c))
        })
    }

    /// Pending edited and deleted records, after purging unchanged edits.
    pub fn edited_records(&self, collection: Option<CollectionId>) -> Vec<RecordId> {
        self.remove_unchanged_records(true, None);
        self.read_state(|s| {
            s.pending
                .all()
                .into_iter()
                .filter(|r| {
                    collection.is_none_or(|c| s.store.record(*r).is_some_and(|rec| rec.collection == c))
                })
                .collect()
        })
    }

    pub fn failed_records(&self, collection: Option<CollectionId>) -> Vec<RecordId> {
        self.read_state(|s| {
            s.failed
                .iter()
                .copied()
                .filter(|r| {
                    collection.is_none_or(|c| s.store.record(*r).is_some_and(|rec| rec.collection == c))
                })
                .collect()
        })
    }

    pub fn is_editing(&self) -> bool {
        self.read_state(|s| !s.pending.is_empty())
    }

    pub fn is_editing_record(&self, record: RecordId) -> bool {
        self.read_state(|s| s.pending.contains(record))
    }

    /// Drops the record from the pending set, the failed bucket and the tested markers.
    pub fn remove_edited_record(&self, record: RecordId) {
        let empty = self.with_state(|s| {
            s.forget(&[record]);
            s.pending.is_empty()
        });
        if empty {
            self.fire_edit_change();
        }
    }

    pub fn remove_edited_records(&self, collection: CollectionId) {
        let records = self.read_state(|s| {
            s.pending
                .all()
                .into_iter()
                .filter(|r| s.store.record(*r).is_some_and(|rec| rec.collection == collection))
                .collect::<Vec<_>>()
        });
        for record in records {
            self.remove_edited_record(record);
        }
    }

    /// Drops every intent of `datasource`; returns whether anything changed.
    pub fn remove_for_datasource(&self, datasource: &str) -> bool {
        let changed = self.with_state(|s| {
            let changed = s.pending.remove_for_datasource(datasource);
            let EditState { store, failed, .. } = s;
            failed.retain(|r| {
                store
                    .record_collection(*r)
                    .is_none_or(|c| c.datasource() != datasource)
            });
            changed
        });
        if changed {
            self.fire_edit_change();
        }
        changed
    }

    /// Saves everything (implicitly) when the collection has pending records.
    pub fn stop_if_editing(&self, collection: CollectionId) -> SaveStatus {
        if self.has_edited_records(Some(collection), true) {
            return self.stop_editing(false, SaveScope::all());
        }
        SaveStatus::Stopped
    }

    /// Turning auto-save on first forces a save; returns `false` if that save fails.
    pub fn set_auto_save(&self, enabled: bool) -> bool {
        if self.auto_save() == enabled {
            return true;
        }
        if enabled && self.stop_editing(true, SaveScope::all()) != SaveStatus::Stopped {
            return false;
        }
        self.with_state(|s| s.auto_save = enabled);
        true
    }

    pub fn auto_save(&self) -> bool {
        self.read_state(|s| s.auto_save)
    }

    /// Sets the ignore-save flag; returns the previous value.
    pub fn ignore_save(&self, ignore: bool) -> bool {
        self.with_state(|s| std::mem::replace(&mut s.ignore_save, ignore))
    }

    /// Suppresses saves until the guard is dropped.
    pub fn ignore_save_scope(&self) -> IgnoreSaveGuard<'_> {
        let previous = self.ignore_save(true);
        IgnoreSaveGuard {
            coordinator: self,
            previous,
        }
    }

    pub fn mark_record_tested(&self, record: RecordId) {
        self.with_state(|s| {
            if !s.tested.contains(&record) {
                s.tested.push(record);
            }
        });
    }

    /// Edited records of `collection` whose edit-stop callback has not run yet.
    pub fn unmarked_edited_records(&self, collection: CollectionId) -> Vec<RecordId> {
        self.read_state(|s| {
            s.pending
                .edited()
                .into_iter()
                .filter(|r| {
                    !s.tested.contains(r)
                        && s.store.record(*r).is_some_and(|rec| rec.collection == collection)
                })
                .collect()
        })
    }

    pub fn last_save_error(&self) -> Option<SaveError> {
        self.read_state(|s| s.last_error.clone())
    }

    /// Resets the session: pending, failed and tested records, flags and access cache.
    pub fn init(&self) {
        self.with_state(|s| {
            s.pending.clear();
            s.failed.clear();
            s.tested.clear();
            s.auto_save = self.config.auto_save;
            s.ignore_save = false;
            s.preparing = false;
            s.saving_all = false;
            s.saving_records.clear();
            s.last_error = None;
        });
        self.access_cache.clear();
        self.fire_edit_change();
    }
}
