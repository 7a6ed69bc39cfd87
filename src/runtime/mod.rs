//! Session loop that provides the single application turn, plus its events.

/// Notifications broadcast by the coordinator.
pub mod events;
/// Session handle and turn loop.
pub mod handle;
