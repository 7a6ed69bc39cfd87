//! Shared primitive IDs, column values and save outcomes.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable arena identity of a [`crate::row::Row`].
pub type RowId = u64;
/// Identity of a [`crate::row::Record`] view.
pub type RecordId = u64;
/// Identity of a [`crate::row::Collection`] (foundset).
pub type CollectionId = u64;

/// One raw column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Value {
    /// SQL NULL.
    #[default]
    Null,
    /// Integer.
    Int(i64),
    /// Floating point.
    Real(f64),
    /// Text.
    Text(String),
    /// Boolean.
    Bool(bool),
    /// Native UUID.
    Uuid(Uuid),
    /// Binary payload.
    Blob(Vec<u8>),
    /// Generated identity of the given row, unknown until that row is inserted.
    DbIdent(RowId),
    /// Placeholder in returned row data meaning "keep the local value".
    BlobMarker,
}

impl Value {
    /// True for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns the owning row when this is an unresolved identity.
    pub fn ident_row(&self) -> Option<RowId> {
        match self {
            Value::DbIdent(row) => Some(*row),
            _ => None,
        }
    }

    /// Logical UUID view: native UUIDs and parseable text both qualify.
    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Value::Uuid(u) => Some(*u),
            Value::Text(s) => Uuid::parse_str(s).ok(),
            Value::Blob(b) => Uuid::from_slice(b).ok(),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Real(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Uuid(v) => write!(f, "{v}"),
            Value::Blob(v) => write!(f, "blob[{}]", v.len()),
            Value::DbIdent(row) => write!(f, "ident#{row}"),
            Value::BlobMarker => write!(f, "blob-marker"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Uuid(v)
    }
}

/// Per-table permission bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Access(pub u32);

impl Access {
    /// No permissions.
    pub const NONE: Access = Access(0);
    /// May read rows.
    pub const READ: Access = Access(1);
    /// May insert rows.
    pub const INSERT: Access = Access(2);
    /// May update rows.
    pub const UPDATE: Access = Access(4);
    /// May delete rows.
    pub const DELETE: Access = Access(8);
    /// Changes are tracked in the audit journal.
    pub const TRACKING: Access = Access(16);
    /// Every permission except tracking.
    pub const ALL: Access = Access(1 | 2 | 4 | 8);

    /// True when every bit of `flag` is granted.
    pub fn allows(self, flag: Access) -> bool {
        flag.0 != 0 && self.0 & flag.0 == flag.0
    }
}

impl std::ops::BitOr for Access {
    type Output = Access;

    fn bitor(self, rhs: Self) -> Self::Output {
        Access(self.0 | rhs.0)
    }
}

/// Outcome of one save request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SaveStatus {
    /// Nothing left to save, or everything was saved.
    Stopped,
    /// A validation callback or prepare-for-save hook refused the save.
    ValidationFailed,
    /// At least one record could not be saved.
    SaveFailed,
    /// Saving is suppressed (auto-save off, ignore scope, or postponed off-turn).
    AutoSaveBlocked,
}

/// Logical row shape carried by a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DataType {
    /// Regular table data.
    #[default]
    Regular,
    /// Translation (i18n) table data.
    I18n,
}
