//! Collaborator seams called by the save pipeline.
//!
//! Every callback receives the coordinator so it may start new edits, request
//! deletes or call `stop_editing` again while a save pass is running.

use std::sync::Arc;

use crate::{
    engine::coordinator::{SaveCoordinator, SaveScope},
    op::RowUpdateInfo,
    persist::StatementExecutor,
    row::{Row, TableMeta},
    types::{Access, CollectionId, RecordId},
};

/// Failure raised by a solution-defined callback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HookError {
    /// Message reported by the callback.
    pub message: String,
}

impl HookError {
    /// Wraps a callback message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// One field-level validation problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// Column the problem belongs to.
    pub column: String,
    /// Human readable message.
    pub message: String,
}

impl FieldError {
    /// Creates a field error for `column`.
    pub fn new(column: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            message: message.into(),
        }
    }
}

/// Result of the per-record validation callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// No problems.
    Valid,
    /// Callback refused the save; the record stays pending.
    Rejected,
    /// Field-level errors; the record moves to the failed bucket.
    Invalid(Vec<FieldError>),
    /// Callback raised an error; counts as a save failure.
    Thrown(String),
}

/// Which statement kind a trigger is fired for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    /// Row is inserted.
    Insert,
    /// Row is updated.
    Update,
    /// Row is deleted.
    Delete,
}

/// Permission lookup for a table.
pub trait AccessProvider: Send + Sync {
    /// Permission bits of the current user, `None` when security is unspecified.
    ///
    /// Unspecified security grants everything except tracking.
    fn table_access(&self, table: &TableMeta) -> Result<Option<Access>, HookError>;
}

/// Grants every permission; tracking stays off.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessProvider for AllowAll {
    fn table_access(&self, _table: &TableMeta) -> Result<Option<Access>, HookError> {
        Ok(None)
    }
}

/// Table-level callbacks defined by the solution.
pub trait TableTriggers: Send + Sync {
    /// Runs before an edited record's statement is built.
    fn validate(
        &self,
        _coordinator: &SaveCoordinator,
        _record: RecordId,
        _kind: TriggerKind,
    ) -> ValidationOutcome {
        ValidationOutcome::Valid
    }

    /// Runs after the statement was applied and every row was committed locally.
    fn after_write(
        &self,
        _coordinator: &SaveCoordinator,
        _kind: TriggerKind,
        _info: &RowUpdateInfo,
    ) -> Result<(), HookError> {
        Ok(())
    }

    /// Runs when an implicit save failed.
    fn on_auto_save_failed(&self, _coordinator: &SaveCoordinator, _failed: &[RecordId]) {}
}

/// No triggers configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTriggers;

impl TableTriggers for NoTriggers {}

/// Hook run before a save (stop UI editing) and before a record enters edit.
pub trait PrepareForSave: Send + Sync {
    /// Returning `false` aborts the save with `ValidationFailed`.
    fn prepare_for_save(&self, _coordinator: &SaveCoordinator, _loose_focus: bool) -> bool {
        true
    }

    /// Returning `false` vetoes the edit start.
    fn record_edit_start(&self, _coordinator: &SaveCoordinator, _record: RecordId) -> bool {
        true
    }
}

/// Bookkeeping notified after each committed row.
pub trait RowManager: Send + Sync {
    /// `old_pk_key` is the primary-key hash key before the write.
    fn row_updated(
        &self,
        row: &Row,
        old_pk_key: &str,
        collection: CollectionId,
        changed_columns: &[String],
    ) -> Result<(), HookError>;
}

/// Row manager that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRowManager;

impl RowManager for NoopRowManager {
    fn row_updated(&self, _: &Row, _: &str, _: CollectionId, _: &[String]) -> Result<(), HookError> {
        Ok(())
    }
}

/// A save requested off the application turn, replayed later on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredStop {
    /// Whether the original request was explicit.
    pub explicit: bool,
    /// Records and collection the request was limited to.
    pub scope: SaveScope,
}

/// The single logical application turn.
pub trait TurnDispatcher: Send + Sync {
    /// True when the caller runs on the turn.
    fn is_on_turn(&self) -> bool;
    /// Queues a stop to run later on the turn.
    fn post(&self, stop: DeferredStop);
}

/// Every caller is on the turn.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineTurn;

impl TurnDispatcher for InlineTurn {
    fn is_on_turn(&self) -> bool {
        true
    }

    fn post(&self, stop: DeferredStop) {
        tracing::trace!(?stop, "inline turn dropped deferred stop");
    }
}

/// External services the coordinator depends on.
#[derive(Clone)]
pub struct Collaborators {
    /// Runs statements against the backend.
    pub executor: Arc<dyn StatementExecutor>,
    /// Permission lookup.
    pub access: Arc<dyn AccessProvider>,
    /// Validation and after-write callbacks.
    pub triggers: Arc<dyn TableTriggers>,
    /// Post-commit bookkeeping.
    pub row_manager: Arc<dyn RowManager>,
    /// Turn affinity.
    pub turn: Arc<dyn TurnDispatcher>,
}

impl Collaborators {
    /// Defaults around `executor`: allow-all access, no triggers, inline turn.
    pub fn new(executor: Arc<dyn StatementExecutor>) -> Self {
        Self {
            executor,
            access: Arc::new(AllowAll),
            triggers: Arc::new(NoTriggers),
            row_manager: Arc::new(NoopRowManager),
            turn: Arc::new(InlineTurn),
        }
    }

    pub fn with_access(mut self, access: Arc<dyn AccessProvider>) -> Self {
        self.access = access;
        self
    }

    pub fn with_triggers(mut self, triggers: Arc<dyn TableTriggers>) -> Self {
        self.triggers = triggers;
        self
    }

    pub fn with_row_manager(mut self, row_manager: Arc<dyn RowManager>) -> Self {
        self.row_manager = row_manager;
        self
    }

    pub fn with_turn(mut self, turn: Arc<dyn TurnDispatcher>) -> Self {
        self.turn = turn;
        self
    }
}
