//! Save orchestration.

/// Adjacent-insert merging.
pub mod batch;
/// Coordinator state and the edit/read API.
pub mod coordinator;
/// Foreign-key aware statement ordering.
pub mod order;
/// Save pipeline state machine.
pub mod pipeline;
/// Collaborator traits and defaults.
pub mod traits;
