//! The save pipeline: drain the pending set, order and batch the statements,
//! execute them and apply the results.

use hashbrown::HashSet;

use crate::{
    core::{
        indices::pk_hash_key,
        pending::{DeleteQueryEntry, PendingEntry},
        store::StoreError,
    },
    engine::{
        batch::StatementBatcher,
        coordinator::{SaveCoordinator, SaveError, SaveScope},
        order::DependencyOrderer,
        traits::{DeferredStop, TriggerKind, ValidationOutcome},
    },
    op::{RowUpdateInfo, Statement, StatementResult, TableUpdateInfo, UpdateInfo},
    persist::ExecError,
    runtime::events::SaveEvent,
    types::{Access, CollectionId, RecordId, SaveStatus, Value},
};

enum Pass {
    Done(SaveStatus),
    Again,
}

#[derive(Default)]
struct Drained {
    infos: Vec<UpdateInfo>,
    validation_failures: usize,
    hard_failures: usize,
}

#[derive(Default)]
struct Applied {
    post_process: Vec<(TriggerKind, RowUpdateInfo)>,
    updated: Vec<(CollectionId, RecordId)>,
    reloaded: Vec<CollectionId>,
    failures: usize,
}

/// Marks the requested scope as in flight for the duration of one pass.
struct SavingMark<'a> {
    coordinator: &'a SaveCoordinator,
    all: bool,
    records: Vec<RecordId>,
}

impl<'a> SavingMark<'a> {
    fn enter(coordinator: &'a SaveCoordinator, scope: &SaveScope) -> Self {
        let all = scope.is_all();
        let records = scope.records.clone().unwrap_or_default();
        coordinator.with_state(|s| {
            if all {
                s.saving_all = true;
            }
            s.saving_records.extend(records.iter().copied());
        });
        Self {
            coordinator,
            all,
            records,
        }
    }
}

impl Drop for SavingMark<'_> {
    fn drop(&mut self) {
        let records = std::mem::take(&mut self.records);
        let all = self.all;
        self.coordinator.with_state(|s| {
            if all {
                s.saving_all = false;
            }
            s.saving_records.retain(|r| !records.contains(r));
        });
    }
}

/// Clears the prepare-for-save flag when the hooks return or unwind.
struct PreparingMark<'a> {
    coordinator: &'a SaveCoordinator,
}

impl Drop for PreparingMark<'_> {
    fn drop(&mut self) {
        self.coordinator.with_state(|s| s.preparing = false);
    }
}

fn entry_for(info: &UpdateInfo) -> PendingEntry {
    match info {
        UpdateInfo::Row(row) if row.deleting => PendingEntry::Delete(row.record),
        UpdateInfo::Row(row) => PendingEntry::Edit(row.record),
        UpdateInfo::Table(table) => PendingEntry::DeleteQuery(DeleteQueryEntry {
            collection: table.collection,
            datasource: table.table.datasource(),
            query: table.query.clone(),
        }),
    }
}

impl SaveCoordinator {
    /// Saves the pending entries covered by `scope`.
    ///
    /// `explicit` marks a user-initiated save: failures are returned to the
    /// caller instead of going to the auto-save-failed trigger, and it saves
    /// even with auto-save off. A full-scope save runs again while after-write
    /// triggers keep changing the pending set, up to `max_save_depth` passes.
    pub fn stop_editing(&self, explicit: bool, scope: SaveScope) -> SaveStatus {
        let max_depth = self.config.max_save_depth;
        for depth in 0..=max_depth {
            match self.save_pass(explicit, &scope, depth) {
                Pass::Done(status) => return status,
                Pass::Again => {
                    tracing::debug!(depth, "after-write triggers changed pending edits, saving again");
                }
            }
        }

        tracing::error!(max_depth, "stop editing exceeded the maximum save depth");
        self.with_state(|s| s.last_error = Some(SaveError::RecursionLimit(max_depth)));
        self.report_failure(explicit);
        SaveStatus::SaveFailed
    }

    /// Replays a stop that was posted from off the turn.
    ///
    /// Runs only when the single requested record is still the only pending entry.
    pub fn run_deferred(&self, stop: DeferredStop) -> Option<SaveStatus> {
        let proceed = self.read_state(|s| match stop.scope.records.as_deref() {
            Some([only]) => s.pending.len() == 1 && s.pending.all() == [*only],
            _ => false,
        });
        if !proceed {
            tracing::trace!("deferred stop skipped: other records are being edited");
            return None;
        }
        Some(self.stop_editing(stop.explicit, stop.scope))
    }

    /// Runs the prepare-for-save hooks; nested calls return `Stopped` at once.
    pub fn prepare_for_save(&self, loose_focus: bool) -> SaveStatus {
        let entered = self.with_state(|s| !std::mem::replace(&mut s.preparing, true));
        if !entered {
            return SaveStatus::Stopped;
        }
        let _mark = PreparingMark { coordinator: self };
        let ok = self
            .prepare_hooks()
            .iter()
            .all(|hook| hook.prepare_for_save(self, loose_focus));
        if ok {
            SaveStatus::Stopped
        } else {
            tracing::trace!("prepare for save refused the save");
            SaveStatus::ValidationFailed
        }
    }

    fn save_pass(&self, explicit: bool, scope: &SaveScope, depth: usize) -> Pass {
        let mut scope = scope.clone();
        let blocked = self.with_state(|s| {
            if s.ignore_save {
                return Some(SaveStatus::AutoSaveBlocked);
            }
            if scope.is_all() && s.saving_all {
                return Some(SaveStatus::Stopped);
            }
            if let Some(records) = scope.records.as_mut() {
                records.retain(|r| !s.saving_records.contains(r));
                if !records.iter().any(|r| s.pending.contains(*r)) {
                    return Some(SaveStatus::Stopped);
                }
            }
            None
        });
        if let Some(status) = blocked {
            return Pass::Done(status);
        }

        if !self.collaborators.turn.is_on_turn() {
            tracing::trace!(explicit, "stop editing postponed: not on the application turn");
            self.collaborators.turn.post(DeferredStop { explicit, scope });
            return Pass::Done(SaveStatus::AutoSaveBlocked);
        }

        let _saving = SavingMark::enter(self, &scope);
        let status = self.prepare_for_save(true);
        if status != SaveStatus::Stopped {
            return Pass::Done(status);
        }

        let failed_cleared = self.with_state(|s| {
            if s.failed.is_empty() {
                return false;
            }
            let store = &s.store;
            s.failed.retain(|r| store.is_live(*r));
            s.failed.is_empty()
        });
        if failed_cleared {
            self.fire_edit_change();
        }

        let check_calcs = self.auto_save() || explicit;
        self.remove_unchanged_records(check_calcs, scope.records.as_deref());

        let (empty, auto_save) = self.read_state(|s| (s.pending.is_empty(), s.auto_save));
        if empty {
            return Pass::Done(SaveStatus::Stopped);
        }
        if !auto_save && !explicit {
            return Pass::Done(SaveStatus::AutoSaveBlocked);
        }

        self.with_state(|s| s.last_error = None);
        let drained = match self.drain(&scope) {
            Ok(drained) => drained,
            Err(status) => {
                if status == SaveStatus::SaveFailed {
                    self.report_failure(explicit);
                }
                return Pass::Done(status);
            }
        };

        if drained.hard_failures > 0 {
            let entries = drained.infos.iter().map(entry_for).collect();
            self.with_state(|s| s.requeue(entries));
            self.report_failure(explicit);
            return Pass::Done(SaveStatus::SaveFailed);
        }

        let clean = if drained.validation_failures > 0 {
            SaveStatus::ValidationFailed
        } else {
            SaveStatus::Stopped
        };
        let mut infos = drained.infos;
        if infos.is_empty() {
            self.fire_edit_change();
            tracing::trace!("no records left to update");
            return Pass::Done(clean);
        }

        tracing::debug!(depth, statements = infos.len(), "saving pending edits");
        if infos.len() > 1 && !self.config.disable_insert_reorder {
            infos = DependencyOrderer::order(infos, false);
        }
        let statements: Vec<Statement> = infos.iter().map(|i| i.statement().clone()).collect();
        let batched = if self.config.batch_statements && statements.len() > 1 {
            StatementBatcher::batch(statements, &self.config.multi_insert_disallowed)
        } else {
            StatementBatcher::unbatched(statements)
        };
        let to_run: Vec<Statement> = batched.iter().map(|b| b.statement.clone()).collect();

        let results = match self.collaborators.executor.perform_updates(&to_run) {
            Ok(results) => results,
            Err(err) => {
                tracing::error!(%err, statements = to_run.len(), "executing statements failed");
                let entries = infos.iter().map(entry_for).collect();
                self.with_state(|s| {
                    s.requeue(entries);
                    s.last_error = Some(SaveError::Execution(err));
                });
                self.report_failure(explicit);
                return Pass::Done(SaveStatus::SaveFailed);
            }
        };
        if results.len() != batched.len() {
            tracing::error!(expected = batched.len(), got = results.len(), "executor result count mismatch");
        }

        let mut owner = vec![0usize; infos.len()];
        for (b, batch) in batched.iter().enumerate() {
            for member in &batch.members {
                owner[*member] = b;
            }
        }
        let per_info: Vec<StatementResult> = owner
            .iter()
            .map(|b| {
                results.get(*b).cloned().unwrap_or_else(|| {
                    StatementResult::Failed(ExecError::Backend("missing statement result".to_string()))
                })
            })
            .collect();

        let applied = self.apply_results(&infos, per_info);

        let size_before = self.read_state(|s| s.pending.len());
        for (kind, info) in &applied.post_process {
            if let Err(err) = self.collaborators.triggers.after_write(self, *kind, info) {
                tracing::error!(table = %info.table.key(), record = info.record, %err, "after-write trigger failed");
            }
        }

        let mut by_collection: Vec<(CollectionId, Vec<RecordId>)> = Vec::new();
        for (collection, record) in applied.updated.iter().rev() {
            match by_collection.iter_mut().find(|(c, _)| c == collection) {
                Some((_, records)) => records.push(*record),
                None => by_collection.push((*collection, vec![*record])),
            }
        }
        for (collection, records) in by_collection {
            self.emit(SaveEvent::RecordsUpdated { collection, records });
        }
        for collection in applied.reloaded {
            self.emit(SaveEvent::CollectionReloaded { collection });
        }

        let size_after = self.read_state(|s| s.pending.len());
        if size_after == 0 {
            self.fire_edit_change();
        }
        if applied.failures > 0 {
            self.report_failure(explicit);
            return Pass::Done(SaveStatus::SaveFailed);
        }
        if scope.is_all() && size_after != size_before {
            return Pass::Again;
        }
        Pass::Done(clean)
    }

    /// Takes matching entries one at a time and turns them into update infos.
    fn drain(&self, scope: &SaveScope) -> Result<Drained, SaveStatus> {
        let mut drained = Drained::default();
        let mut processed: HashSet<RecordId> = HashSet::new();
        let mut put_aside: Vec<PendingEntry> = Vec::new();

        loop {
            let next = self.with_state(|s| {
                let store = &s.store;
                s.pending.take_next(
                    |record, _| match store.record(record) {
                        Some(rec) => scope.accepts(record, rec.collection),
                        None => scope.is_all(),
                    },
                    |query| scope.accepts_query(query),
                )
            });
            let Some(entry) = next else {
                break;
            };

            let record = match &entry {
                PendingEntry::DeleteQuery(query) => {
                    match self.delete_query_info(query) {
                        Ok(info) => drained.infos.push(UpdateInfo::Table(info)),
                        Err(err) => {
                            tracing::error!(collection = query.collection, %err, "delete query could not be prepared");
                            self.abort_drain(&drained, entry, put_aside, Some(err));
                            return Err(SaveStatus::SaveFailed);
                        }
                    }
                    continue;
                }
                PendingEntry::Edit(record) | PendingEntry::Delete(record) => *record,
            };

            if !processed.insert(record) {
                put_aside.push(entry);
                continue;
            }
            let Some((row, exists)) = self.read_state(|s| {
                let row = s.store.record_row(record)?;
                Some((row.id(), row.exists()))
            }) else {
                tracing::trace!(record, "pending record no longer exists");
                continue;
            };
            // one statement per row; the first record over it owns the events
            if drained
                .infos
                .iter()
                .any(|i| i.as_row().is_some_and(|r| r.row == row))
            {
                self.with_state(|s| s.tested.retain(|r| *r != record));
                continue;
            }

            if matches!(entry, PendingEntry::Edit(_)) {
                let kind = if exists {
                    TriggerKind::Update
                } else {
                    TriggerKind::Insert
                };
                match self.collaborators.triggers.validate(self, record, kind) {
                    ValidationOutcome::Valid => {}
                    ValidationOutcome::Rejected => {
                        tracing::debug!(record, "validation trigger refused the save");
                        self.abort_drain(&drained, entry, put_aside, None);
                        return Err(SaveStatus::ValidationFailed);
                    }
                    ValidationOutcome::Invalid(errors) => {
                        tracing::warn!(record, errors = errors.len(), "record failed validation");
                        self.with_state(|s| s.mark_failed(record, SaveError::Validation(errors)));
                        drained.validation_failures += 1;
                        continue;
                    }
                    ValidationOutcome::Thrown(message) => {
                        tracing::warn!(record, %message, "validation trigger raised an error");
                        self.with_state(|s| s.mark_failed(record, SaveError::Trigger(message)));
                        drained.hard_failures += 1;
                        continue;
                    }
                }
            }

            match self.row_update_info(record) {
                Ok(Some(info)) => drained.infos.push(UpdateInfo::Row(info)),
                Ok(None) => {
                    let dropped = self.with_state(|s| {
                        s.tested.retain(|r| *r != record);
                        let local_delete = s
                            .store
                            .row(row)
                            .is_some_and(|r| r.is_flagged_for_delete() && !r.exists());
                        if !local_delete {
                            return None;
                        }
                        let collection = s.store.record(record).map(|r| r.collection);
                        let removed = s.store.remove_row(row);
                        s.forget(&removed);
                        collection
                    });
                    if let Some(collection) = dropped {
                        self.emit(SaveEvent::CollectionReloaded { collection });
                    }
                }
                Err(err) => {
                    tracing::warn!(record, %err, "record could not be prepared for saving");
                    self.with_state(|s| s.mark_failed(record, err));
                    drained.hard_failures += 1;
                }
            }
        }

        if !put_aside.is_empty() {
            self.with_state(|s| {
                for entry in put_aside {
                    match entry {
                        PendingEntry::Edit(record) => {
                            let datasource = s.datasource_of(record);
                            s.pending.add_edited(record, datasource);
                        }
                        PendingEntry::Delete(record) => {
                            let datasource = s.datasource_of(record);
                            s.pending.add_deleted(record, datasource);
                        }
                        PendingEntry::DeleteQuery(q) => {
                            s.pending.add_delete_query(q.collection, q.datasource, q.query);
                        }
                    }
                }
            });
        }
        Ok(drained)
    }

    fn abort_drain(
        &self,
        drained: &Drained,
        current: PendingEntry,
        put_aside: Vec<PendingEntry>,
        err: Option<SaveError>,
    ) {
        let mut entries: Vec<PendingEntry> = drained.infos.iter().map(entry_for).collect();
        entries.push(current);
        entries.extend(put_aside);
        self.with_state(|s| {
            s.requeue(entries);
            if let Some(err) = err {
                s.last_error = Some(err);
            }
        });
    }

    fn row_update_info(&self, record: RecordId) -> Result<Option<RowUpdateInfo>, SaveError> {
        let (table, exists, deleting) = self
            .read_state(|s| {
                s.store
                    .record_row(record)
                    .map(|row| (row.table().clone(), row.exists(), row.is_flagged_for_delete()))
            })
            .ok_or(StoreError::MissingRecord(record))?;

        if deleting {
            if exists && !self.has_access(&table, Access::DELETE) {
                return Err(SaveError::NoDeleteAccess(table.key()));
            }
        } else if exists {
            if !self.has_access(&table, Access::UPDATE) {
                return Err(SaveError::NoModifyAccess(table.key()));
            }
        } else if !self.has_access(&table, Access::INSERT) {
            return Err(SaveError::NoInsertAccess(table.key()));
        }
        let tracking = self.has_access(&table, Access::TRACKING);
        Ok(self.read_state(|s| s.store.build_update_info(record, tracking))?)
    }

    fn delete_query_info(&self, query: &DeleteQueryEntry) -> Result<TableUpdateInfo, SaveError> {
        let table = self
            .read_state(|s| s.store.collection(query.collection).map(|c| c.table.clone()))
            .ok_or(StoreError::MissingCollection(query.collection))?;
        if !self.has_access(&table, Access::DELETE) {
            return Err(SaveError::NoDeleteAccess(table.key()));
        }
        let mut statement = Statement::delete_by_query(&table, &query.query);
        statement.tracking = self.has_access(&table, Access::TRACKING);
        Ok(TableUpdateInfo {
            collection: query.collection,
            table,
            query: query.query.clone(),
            statement,
        })
    }

    /// Walks the results in reverse so dependent rows are settled before the rows they point at.
    fn apply_results(&self, infos: &[UpdateInfo], results: Vec<StatementResult>) -> Applied {
        let mut applied = Applied::default();
        for (info, result) in infos.iter().zip(results).rev() {
            match info {
                UpdateInfo::Row(row) => self.apply_row_result(row, result, &mut applied),
                UpdateInfo::Table(table) => self.apply_table_result(table, result, &mut applied),
            }
        }
        applied.post_process.reverse();
        applied
    }

    fn apply_row_result(&self, info: &RowUpdateInfo, result: StatementResult, applied: &mut Applied) {
        if let StatementResult::Failed(err) = result {
            tracing::warn!(table = %info.table.key(), record = info.record, %err, "statement failed");
            self.with_state(|s| s.mark_failed(info.record, SaveError::Execution(err)));
            applied.failures += 1;
            return;
        }

        let committed = self.with_state(|s| {
            let old_key = pk_hash_key(&s.store.row(info.row)?.old_pk());
            // the image the backend now holds; later local edits stay dirty on top of it
            let written = match result {
                StatementResult::RowData(mut data) if data.len() == info.values.len() => {
                    let mut ident: Option<Value> = None;
                    for (slot, sent) in data.iter_mut().zip(&info.values) {
                        if *slot == Value::BlobMarker {
                            *slot = sent.clone();
                        }
                        if sent.ident_row() == Some(info.row) {
                            ident = Some(slot.clone());
                        }
                    }
                    if let Some(value) = ident {
                        s.store.resolve_ident(info.row, &value);
                    }
                    data
                }
                StatementResult::RowData(data) => {
                    tracing::error!(
                        table = %info.table.key(),
                        expected = info.values.len(),
                        got = data.len(),
                        "requeried row has a different width"
                    );
                    info.values.clone()
                }
                StatementResult::Generated(value) => {
                    s.store.resolve_ident(info.row, &value);
                    info.values.clone()
                }
                StatementResult::Success | StatementResult::Failed(_) => info.values.clone(),
            };

            let snapshot = if info.deleting {
                let snapshot = s.store.row(info.row)?.clone();
                let removed = s.store.remove_row(info.row);
                s.forget(&removed);
                snapshot
            } else {
                let row = s.store.row_mut(info.row)?;
                row.commit_written(&info.values, written);
                let snapshot = row.clone();
                s.store.row_updated(info.row, &old_key);
                snapshot
            };
            s.tested.retain(|r| *r != info.record);
            s.failed.retain(|r| *r != info.record);
            Some((snapshot, old_key))
        });
        let Some((row, old_key)) = committed else {
            tracing::warn!(record = info.record, "row disappeared before its result was applied");
            return;
        };

        if let Err(err) = self.collaborators.row_manager.row_updated(
            &row,
            &old_key,
            info.collection,
            &info.changed_columns,
        ) {
            tracing::error!(table = %info.table.key(), record = info.record, %err, "row manager failed");
            self.with_state(|s| s.mark_failed(info.record, SaveError::Trigger(err.message)));
            applied.failures += 1;
        }

        let kind = if info.deleting {
            TriggerKind::Delete
        } else if info.exists {
            TriggerKind::Update
        } else {
            TriggerKind::Insert
        };
        applied.post_process.push((kind, info.clone()));
        applied.updated.push((info.collection, info.record));
    }

    fn apply_table_result(&self, info: &TableUpdateInfo, result: StatementResult, applied: &mut Applied) {
        if let StatementResult::Failed(err) = result {
            tracing::warn!(table = %info.table.key(), collection = info.collection, %err, "delete query failed");
            let entry = entry_for(&UpdateInfo::Table(info.clone()));
            self.with_state(|s| {
                s.requeue(vec![entry]);
                s.last_error = Some(SaveError::Execution(err));
            });
            applied.failures += 1;
            return;
        }
        self.with_state(|s| {
            let removed = s.store.remove_rows_matching(&info.table, &info.query);
            s.forget(&removed);
        });
        if !applied.reloaded.contains(&info.collection) {
            applied.reloaded.push(info.collection);
        }
    }

    pub(super) fn report_failure(&self, explicit: bool) {
        let failed = self.read_state(|s| s.failed.clone());
        self.emit(SaveEvent::SaveFailed {
            explicit,
            failed: failed.clone(),
        });
        if !explicit {
            self.collaborators.triggers.on_auto_save_failed(self, &failed);
        }
    }
}
