//! # Realtime Database client core
//!
//! The client half of the Firebase Realtime Database: an immutable snapshot
//! tree, optimistic local writes layered over server data, per-query views
//! and the ordered events listeners receive.
//!
//! The connection is abstracted behind [`ServerActions`]. The crate ships an
//! [`InMemoryServer`] that behaves like a database living in the same
//! process, which is what the examples and tests use.
//!
//! ## Features
//!
//! - References with `set`/`update`/`remove`, priorities and push ids
//! - Value and child listeners (`child_added`, `child_changed`, `child_removed`, `child_moved`)
//! - Queries ordered by key, value, priority or child with range and limit windows
//! - Server value placeholders resolved locally for optimistic values
//! - On-disconnect writes
//! - Compare-and-set transactions, rerun until they commit
//!
//! ## Example
//!
//! ```
//! use firebase_rtdb_core::database::*;
//! use serde_json::json;
//!
//! let (database, _server) = Database::in_memory();
//! let scores = database.reference("scores").unwrap();
//! scores.child("ada").unwrap().set(json!(90)).unwrap();
//! scores.child("bob").unwrap().set(json!(75)).unwrap();
//!
//! let top = query(scores, vec![order_by_value(), limit_to_last(1)]).unwrap();
//! let snapshot = top.get().unwrap();
//! assert_eq!(snapshot.value(), json!({ "ada": 90 }));
//! ```

use std::sync::LazyLock;

use crate::logger::Logger;

mod api;
mod backend;
pub mod core;
pub mod error;
mod on_disconnect;
mod push_id;
mod server_value;
mod settings;

pub use api::{
    end_at, end_at_with_key, end_before, end_before_with_key, equal_to, equal_to_with_key,
    limit_to_first, limit_to_last, on_child_added, on_child_changed, on_child_moved,
    on_child_removed, on_value, order_by_child, order_by_key, order_by_priority, order_by_value,
    push, push_with_value, query, run_transaction, set_priority, set_with_priority, start_after,
    start_after_with_key, start_at, start_at_with_key, ChildEvent, DataSnapshot, Database,
    DatabaseQuery, DatabaseReference, ListenerRegistration, QueryConstraint, TransactionOptions,
    TransactionResult,
};
pub use backend::InMemoryServer;
pub use self::core::{ServerActions, ServerMessage, ServerStatus};
pub use error::{DatabaseError, DatabaseErrorCode, DatabaseResult};
pub use on_disconnect::OnDisconnect;
pub use server_value::{increment, server_timestamp};
pub use settings::DatabaseSettings;

pub(crate) static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@firebase/database"));
