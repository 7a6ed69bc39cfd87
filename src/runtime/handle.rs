use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::{
    core::store::RowStore,
    engine::{
        coordinator::{SaveConfig, SaveCoordinator, SaveError, SaveScope},
        traits::{Collaborators, DeferredStop, TurnDispatcher},
    },
    types::{CollectionId, RecordId, SaveStatus, Value},
};

use super::events::SaveEvent;

tokio::task_local! {
    static TURN: u64;
}

static NEXT_TURN: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Save(#[from] SaveError),
    #[error("session loop is gone")]
    ChannelClosed,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub save: SaveConfig,
    pub command_queue_bound: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            save: SaveConfig::default(),
            command_queue_bound: 256,
        }
    }
}

/// The session loop's turn: code inside the loop's scope is on it, everything
/// else posts back into the loop.
struct LoopTurn {
    id: u64,
    deferred_tx: mpsc::UnboundedSender<DeferredStop>,
}

impl TurnDispatcher for LoopTurn {
    fn is_on_turn(&self) -> bool {
        TURN.try_with(|turn| *turn == self.id).unwrap_or(false)
    }

    fn post(&self, stop: DeferredStop) {
        if self.deferred_tx.send(stop).is_err() {
            tracing::warn!(turn = self.id, "session loop closed, deferred stop dropped");
        }
    }
}

#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<Command>,
    coordinator: Arc<SaveCoordinator>,
}

enum Command {
    StartEditing {
        record: RecordId,
        resp: oneshot::Sender<Result<bool, RuntimeError>>,
    },
    SetValue {
        record: RecordId,
        column: String,
        value: Value,
        resp: oneshot::Sender<Result<bool, RuntimeError>>,
    },
    Delete {
        record: RecordId,
        resp: oneshot::Sender<Result<bool, RuntimeError>>,
    },
    Stop {
        explicit: bool,
        scope: SaveScope,
        resp: oneshot::Sender<SaveStatus>,
    },
    Rollback {
        records: Option<Vec<RecordId>>,
        resp: oneshot::Sender<()>,
    },
    Edited {
        collection: Option<CollectionId>,
        resp: oneshot::Sender<Vec<RecordId>>,
    },
    Failed {
        collection: Option<CollectionId>,
        resp: oneshot::Sender<Vec<RecordId>>,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

/// Starts a session whose coordinator runs on its own loop task.
///
/// The turn dispatcher of `collaborators` is replaced by the loop's turn.
pub fn spawn_session(store: RowStore, collaborators: Collaborators, config: RuntimeConfig) -> SessionHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(config.command_queue_bound.max(1));
    let (deferred_tx, mut deferred_rx) = mpsc::unbounded_channel::<DeferredStop>();

    let turn_id = NEXT_TURN.fetch_add(1, Ordering::Relaxed);
    let turn = Arc::new(LoopTurn {
        id: turn_id,
        deferred_tx,
    });
    let coordinator = Arc::new(SaveCoordinator::new(
        store,
        collaborators.with_turn(turn),
        config.save,
    ));
    let coordinator_loop = Arc::clone(&coordinator);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break; };
                    let done = TURN.sync_scope(turn_id, || handle_command(cmd, &coordinator_loop));
                    if done {
                        break;
                    }
                }
                Some(stop) = deferred_rx.recv() => {
                    let status = TURN.sync_scope(turn_id, || coordinator_loop.run_deferred(stop));
                    tracing::trace!(?status, "deferred stop ran");
                }
            }
        }
        tracing::debug!(turn = turn_id, "session loop stopped");
    });

    SessionHandle {
        cmd_tx,
        coordinator,
    }
}

impl SessionHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<SaveEvent> {
        self.coordinator.subscribe()
    }

    /// Shared coordinator for direct calls; calls made from outside the loop
    /// are off the turn and saves from them are deferred.
    pub fn coordinator(&self) -> &Arc<SaveCoordinator> {
        &self.coordinator
    }

    pub async fn start_editing(&self, record: RecordId) -> Result<bool, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::StartEditing { record, resp: tx }).await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    pub async fn set_value(
        &self,
        record: RecordId,
        column: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<bool, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::SetValue {
            record,
            column: column.into(),
            value: value.into(),
            resp: tx,
        })
        .await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    pub async fn delete_record(&self, record: RecordId) -> Result<bool, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Delete { record, resp: tx }).await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    pub async fn stop_editing(&self, explicit: bool, scope: SaveScope) -> Result<SaveStatus, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Stop {
            explicit,
            scope,
            resp: tx,
        })
        .await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    pub async fn rollback(&self, records: Option<Vec<RecordId>>) -> Result<(), RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Rollback { records, resp: tx }).await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    pub async fn edited_records(&self, collection: Option<CollectionId>) -> Result<Vec<RecordId>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Edited { collection, resp: tx }).await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    pub async fn failed_records(&self, collection: Option<CollectionId>) -> Result<Vec<RecordId>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Failed { collection, resp: tx }).await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shutdown { resp: tx }).await?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    async fn send(&self, cmd: Command) -> Result<(), RuntimeError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| RuntimeError::ChannelClosed)
    }
}

fn handle_command(cmd: Command, coordinator: &SaveCoordinator) -> bool {
    match cmd {
        Command::StartEditing { record, resp } => {
            let _ = resp.send(coordinator.start_editing(record, true).map_err(RuntimeError::from));
        }
        Command::SetValue {
            record,
            column,
            value,
            resp,
        } => {
            let res = coordinator
                .set_value(record, &column, value)
                .map_err(RuntimeError::from);
            let _ = resp.send(res);
        }
        Command::Delete { record, resp } => {
            let _ = resp.send(coordinator.add_deleted_record(record).map_err(RuntimeError::from));
        }
        Command::Stop {
            explicit,
            scope,
            resp,
        } => {
            let _ = resp.send(coordinator.stop_editing(explicit, scope));
        }
        Command::Rollback { records, resp } => {
            coordinator.rollback_records(records.as_deref(), true, None);
            let _ = resp.send(());
        }
        Command::Edited { collection, resp } => {
            let _ = resp.send(coordinator.edited_records(collection));
        }
        Command::Failed { collection, resp } => {
            let _ = resp.send(coordinator.failed_records(collection));
        }
        Command::Shutdown { resp } => {
            let _ = resp.send(());
            return true;
        }
    }

    false
}
