pub mod sqlite;

use crate::op::{Statement, StatementResult};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    #[error("backend error: {0}")]
    Backend(String),
    #[error("stale row in {table}: no row matched the primary key")]
    StaleRow { table: String },
    #[error("identity of row {0} was not generated before it was referenced")]
    UnresolvedIdentity(u64),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("sqlite: {0}")]
    Sqlite(String),
    #[error("serde: {0}")]
    Serde(String),
}

impl From<rusqlite::Error> for ExecError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value.to_string())
    }
}

impl From<serde_json::Error> for ExecError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serde(value.to_string())
    }
}

pub type ExecResult<T> = Result<T, ExecError>;

/// Backend that runs an ordered batch of statements in one round trip.
///
/// `Err` means the whole call failed (connectivity); per-statement problems come
/// back as [`StatementResult::Failed`] in the parallel result vector.
pub trait StatementExecutor: Send + Sync {
    fn perform_updates(&self, statements: &[Statement]) -> ExecResult<Vec<StatementResult>>;
}
