//! In-memory row arena and pending-edit bookkeeping.

/// Helper index aliases.
pub mod indices;
/// Registry of outstanding edit/delete intents.
pub mod pending;
/// Row/record/collection arena with primary-key index.
pub mod store;
