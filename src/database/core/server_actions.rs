use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::database::core::path::Path;
use crate::database::core::snap::Node;
use crate::database::core::view::QuerySpec;
use crate::database::error::{invalid_argument, DatabaseError, DatabaseResult};

pub use crate::database::core::sync_tree::ListenRequest;

/// Outcome the server reported for a listen or a write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerStatus {
    Ok,
    Error { code: String, reason: Option<String> },
}

impl ServerStatus {
    pub fn error(code: impl Into<String>) -> Self {
        ServerStatus::Error {
            code: code.into(),
            reason: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ServerStatus::Ok)
    }

    pub fn into_result(self) -> DatabaseResult<()> {
        match self {
            ServerStatus::Ok => Ok(()),
            ServerStatus::Error { code, reason } => {
                Err(DatabaseError::from_server_status(&code, reason.as_deref()))
            }
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerStatus::Ok => f.write_str("ok"),
            ServerStatus::Error { code, .. } => f.write_str(code),
        }
    }
}

pub type StatusCallback = Box<dyn FnOnce(ServerStatus) + Send>;

/// Receives data pushed by the server.
pub type MessageSink = Arc<dyn Fn(ServerMessage) + Send + Sync>;

/// What the client needs from the connection to the database server.
///
/// Calls are made outside the client's locks, so implementations may invoke
/// `on_complete` (or push messages) before returning.
pub trait ServerActions: Send + Sync {
    fn listen(&self, request: ListenRequest, on_complete: StatusCallback);

    fn unlisten(&self, query: &QuerySpec, tag: Option<u64>);

    /// Replaces the value at `path`. `hash` is set for compare-and-set writes.
    fn put(&self, path: &Path, data: Value, hash: Option<String>, on_complete: StatusCallback);

    /// Updates the children of `path`; keys of `data` are relative paths.
    fn merge(&self, path: &Path, data: Value, on_complete: StatusCallback);

    fn on_disconnect_put(&self, path: &Path, data: Value, on_complete: StatusCallback);

    fn on_disconnect_merge(&self, path: &Path, data: Value, on_complete: StatusCallback);

    fn on_disconnect_cancel(&self, path: &Path, on_complete: StatusCallback);
}

/// Data pushed by the server.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Overwrite of `path`.
    #[serde(rename = "d")]
    Data {
        path: String,
        data: Value,
        #[serde(default)]
        tag: Option<u64>,
    },
    /// Multi-location update below `path`.
    #[serde(rename = "m")]
    Merge {
        path: String,
        data: Value,
        #[serde(default)]
        tag: Option<u64>,
    },
    #[serde(rename = "listen_complete")]
    ListenComplete {
        path: String,
        #[serde(default)]
        tag: Option<u64>,
    },
}

impl ServerMessage {
    pub fn overwrite(path: &Path, data: Value, tag: Option<u64>) -> Self {
        ServerMessage::Data {
            path: path.to_string(),
            data,
            tag,
        }
    }

    pub fn merge(path: &Path, data: Value, tag: Option<u64>) -> Self {
        ServerMessage::Merge {
            path: path.to_string(),
            data,
            tag,
        }
    }

    pub fn listen_complete(path: &Path, tag: Option<u64>) -> Self {
        ServerMessage::ListenComplete {
            path: path.to_string(),
            tag,
        }
    }

    pub fn from_json(raw: &str) -> DatabaseResult<Self> {
        serde_json::from_str(raw)
            .map_err(|err| invalid_argument(format!("Malformed server message: {err}")))
    }

    pub fn tag(&self) -> Option<u64> {
        match self {
            ServerMessage::Data { tag, .. }
            | ServerMessage::Merge { tag, .. }
            | ServerMessage::ListenComplete { tag, .. } => *tag,
        }
    }

    pub fn path(&self) -> DatabaseResult<Path> {
        match self {
            ServerMessage::Data { path, .. }
            | ServerMessage::Merge { path, .. }
            | ServerMessage::ListenComplete { path, .. } => Path::parse(path),
        }
    }
}

/// Splits a merge payload into nodes keyed by relative path.
pub fn merge_children(data: &Value) -> DatabaseResult<BTreeMap<Path, Node>> {
    let Value::Object(entries) = data else {
        return Err(invalid_argument("Merge payload must be an object"));
    };
    entries
        .iter()
        .map(|(key, value)| Ok((Path::parse(key)?, Node::from_json(value)?)))
        .collect()
}
