//! Pending-edit tracking and save orchestration for shared database rows.
//!
//! Records are edited in memory, registered in a pending set and written back
//! by [`engine::coordinator::SaveCoordinator::stop_editing`], which orders the
//! statements by foreign-key dependency, merges compatible inserts and applies
//! the backend's results (generated keys, requeried rows, per-statement
//! failures) to the local rows.
//!
//! # Examples
//!
//! Saving one edit through the SQLite executor:
//! ```
//! use std::sync::Arc;
//!
//! use editsave::{
//!     core::store::RowStore,
//!     engine::{
//!         coordinator::{SaveConfig, SaveCoordinator, SaveScope},
//!         traits::Collaborators,
//!     },
//!     persist::sqlite::SqliteExecutor,
//!     row::{ColumnMeta, TableMeta},
//!     types::{SaveStatus, Value},
//! };
//!
//! let executor = Arc::new(SqliteExecutor::open_in_memory().expect("open sqlite"));
//! executor
//!     .execute_batch("CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT);
//!                     INSERT INTO customers VALUES (7, 'Old');")
//!     .expect("ddl");
//!
//! let table = Arc::new(TableMeta::new(
//!     "main",
//!     "customers",
//!     vec![ColumnMeta::pk("id"), ColumnMeta::plain("name")],
//! ));
//! let coordinator = SaveCoordinator::new(
//!     RowStore::new(),
//!     Collaborators::new(executor.clone()),
//!     SaveConfig::default(),
//! );
//! let customers = coordinator.add_collection(table.clone(), true);
//! let (_, record) = coordinator
//!     .load_row(customers, vec![Value::Int(7), "Old".into()])
//!     .expect("load");
//!
//! assert!(coordinator.set_value(record, "name", "Acme".into()).expect("edit"));
//! assert_eq!(coordinator.stop_editing(true, SaveScope::all()), SaveStatus::Stopped);
//! assert_eq!(
//!     executor.select_all(&table).expect("select"),
//!     vec![vec![Value::Int(7), Value::Text("Acme".into())]]
//! );
//! ```
//!
//! Running a session on its own loop task:
//! ```no_run
//! use std::sync::Arc;
//!
//! use editsave::{
//!     core::store::RowStore,
//!     engine::{coordinator::SaveScope, traits::Collaborators},
//!     persist::sqlite::SqliteExecutor,
//!     runtime::handle::{RuntimeConfig, spawn_session},
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let executor = Arc::new(SqliteExecutor::open("app.db").expect("open sqlite"));
//! let handle = spawn_session(RowStore::new(), Collaborators::new(executor), RuntimeConfig::default());
//! let status = handle.stop_editing(true, SaveScope::all()).await.expect("stop");
//! println!("{status:?}");
//! handle.shutdown().await.expect("shutdown");
//! # }
//! ```
#![warn(missing_docs)]

/// Row arena, pending-edit registry and index helpers.
pub mod core;
/// Save coordinator, statement ordering and batching, collaborator traits.
pub mod engine;
/// Statement model and per-row update descriptors.
pub mod op;
/// Statement executor abstraction and SQLite implementation.
pub mod persist;
/// Table metadata, rows, records and collections.
pub mod row;
/// Session loop and events.
pub mod runtime;
/// Shared primitive types and enums.
pub mod types;
