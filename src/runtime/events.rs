//! Notifications emitted by the coordinator.

use crate::types::{CollectionId, RecordId};

/// Events broadcast to subscribers of a [`crate::engine::coordinator::SaveCoordinator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveEvent {
    /// The global editing state may have flipped.
    EditingStateChanged {
        /// True while records are pending or failed.
        editing: bool,
    },
    /// Records of a collection were written to the backend.
    RecordsUpdated {
        /// Owning collection.
        collection: CollectionId,
        /// Saved records, in statement order.
        records: Vec<RecordId>,
    },
    /// Rows of a collection were removed locally and its contents must be re-read.
    CollectionReloaded {
        /// Affected collection.
        collection: CollectionId,
    },
    /// A save pass ended with `SaveFailed`.
    SaveFailed {
        /// Whether the failing request was explicit.
        explicit: bool,
        /// Failed bucket after the pass.
        failed: Vec<RecordId>,
    },
}
