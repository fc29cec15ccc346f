//! Client-side synchronization engine.
//!
//! Local writes are layered over a cache of server data; every registered
//! query gets a view whose changes are turned into ordered events. Nothing in
//! here performs I/O: the connection is reached through [`ServerActions`].

pub mod compound_write;
pub mod operation;
pub mod path;
pub mod repo;
pub mod server_actions;
pub mod snap;
pub mod snapshot_holder;
pub mod sync_tree;
pub mod util;
pub mod view;
pub mod write_tree;

pub use path::Path;
pub use repo::{Repo, WriteCompletion};
pub use server_actions::{
    ListenRequest, MessageSink, ServerActions, ServerMessage, ServerStatus, StatusCallback,
};
pub use snap::{Index, Node};
pub use sync_tree::{ListenInstruction, SyncOutcome, SyncTree};
