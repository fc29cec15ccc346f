use std::sync::{Mutex, MutexGuard};

use serde_json::{Map, Value};

use crate::database::core::path::Path;
use crate::database::core::repo::{forget, remember};
use crate::database::core::server_actions::{
    merge_children, ListenRequest, MessageSink, ServerActions, ServerMessage, ServerStatus,
    StatusCallback,
};
use crate::database::core::snap::Node;
use crate::database::core::util::ImmutableTree;
use crate::database::core::view::QuerySpec;
use crate::database::error::DatabaseResult;
use crate::database::server_value::resolve_deferred_value;
use crate::database::LOGGER;

enum Delivery {
    Message(ServerMessage),
    Ack(StatusCallback, ServerStatus),
}

struct ServerState {
    data: Node,
    listens: Vec<ListenRequest>,
    on_disconnect: ImmutableTree<Value>,
    sink: Option<MessageSink>,
    holding: bool,
    held: Vec<Delivery>,
}

/// A database server living in the same process.
///
/// It keeps the whole tree in memory, answers listens with the current data
/// and echoes every accepted write to the listens it touches before
/// acknowledging it. Acks and messages can be held back to observe the
/// client between a local write and its acknowledgement.
pub struct InMemoryServer {
    state: Mutex<ServerState>,
}

impl Default for InMemoryServer {
    fn default() -> Self {
        Self {
            state: Mutex::new(ServerState {
                data: Node::empty(),
                listens: Vec::new(),
                on_disconnect: ImmutableTree::new(),
                sink: None,
                holding: false,
                held: Vec::new(),
            }),
        }
    }
}

impl std::fmt::Debug for InMemoryServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("InMemoryServer")
            .field("listens", &state.listens.len())
            .field("held", &state.held.len())
            .finish()
    }
}

impl InMemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Routes pushed data to `sink` (normally [`Repo::message_sink`](crate::database::core::Repo::message_sink)).
    pub fn attach(&self, sink: MessageSink) {
        self.state().sink = Some(sink);
    }

    /// The value stored at `path`, priorities included.
    pub fn value(&self, path: &Path) -> Value {
        self.state().data.child(path).export_val()
    }

    /// Number of queries currently listened to.
    pub fn active_listens(&self) -> usize {
        self.state().listens.len()
    }

    /// Holds back acks and messages until [`release`](Self::release).
    pub fn hold(&self) {
        self.state().holding = true;
    }

    /// Delivers everything held, in order, and stops holding.
    pub fn release(&self) {
        let (sink, held) = {
            let mut state = self.state();
            state.holding = false;
            (state.sink.clone(), std::mem::take(&mut state.held))
        };
        LOGGER.debug(format!("releasing {} held deliveries", held.len()));
        deliver(sink, held);
    }

    /// Writes `value` as another client would: listeners are told, nobody is acked.
    pub fn set_remote(&self, path: &Path, value: Value) -> DatabaseResult<()> {
        let mut state = self.state();
        let node = resolve(&state.data, path, &value)?;
        state.data = state.data.update_child(path, node.clone());
        let deliveries = overwrite_notifications(&state, path, &node);
        self.dispatch(state, deliveries);
        Ok(())
    }

    /// Runs the recorded on-disconnect writes and forgets the client's listens.
    pub fn disconnect(&self) {
        let mut state = self.state();
        let pending = std::mem::take(&mut state.on_disconnect);
        let mut writes = Vec::new();
        pending.foreach(|path, value| writes.push((path.clone(), value.clone())));
        for (path, value) in writes {
            match resolve(&state.data, &path, &value) {
                Ok(node) => state.data = state.data.update_child(&path, node),
                Err(err) => LOGGER.warn(format!("dropping on-disconnect write at {path}: {err}")),
            }
        }
        state.listens.clear();
        LOGGER.debug("client disconnected");
    }

    fn dispatch(&self, mut state: MutexGuard<'_, ServerState>, deliveries: Vec<Delivery>) {
        if state.holding {
            state.held.extend(deliveries);
            return;
        }
        let sink = state.sink.clone();
        drop(state);
        deliver(sink, deliveries);
    }

    fn ack(&self, on_complete: StatusCallback, status: ServerStatus) {
        let state = self.state();
        self.dispatch(state, vec![Delivery::Ack(on_complete, status)]);
    }
}

fn deliver(sink: Option<MessageSink>, deliveries: Vec<Delivery>) {
    for delivery in deliveries {
        match delivery {
            Delivery::Message(message) => match &sink {
                Some(sink) => sink(message),
                None => LOGGER.debug("no client attached, message dropped"),
            },
            Delivery::Ack(on_complete, status) => on_complete(status),
        }
    }
}

fn server_now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn resolve(data: &Node, path: &Path, value: &Value) -> DatabaseResult<Node> {
    let resolved = resolve_deferred_value(value, &data.child(path), server_now())?;
    Node::from_json(&resolved)
}

fn rejected(err: impl std::fmt::Display) -> ServerStatus {
    ServerStatus::Error {
        code: "invalid_argument".into(),
        reason: Some(err.to_string()),
    }
}

/// Messages telling each affected listen about a new value at `path`.
fn overwrite_notifications(state: &ServerState, path: &Path, node: &Node) -> Vec<Delivery> {
    state
        .listens
        .iter()
        .filter_map(|listen| {
            let at = &listen.query.path;
            if at.contains(path) {
                Some(ServerMessage::overwrite(path, node.export_val(), listen.tag))
            } else if path.contains(at) {
                Some(ServerMessage::overwrite(at, state.data.child(at).export_val(), listen.tag))
            } else {
                None
            }
        })
        .map(Delivery::Message)
        .collect()
}

fn merge_notifications(state: &ServerState, path: &Path, children: &[(Path, Node)]) -> Vec<Delivery> {
    let mut payload = Map::new();
    for (relative, node) in children {
        payload.insert(relative.segments().join("/"), node.export_val());
    }
    let payload = Value::Object(payload);
    state
        .listens
        .iter()
        .filter_map(|listen| {
            let at = &listen.query.path;
            if at.contains(path) {
                Some(ServerMessage::merge(path, payload.clone(), listen.tag))
            } else if path.contains(at) {
                Some(ServerMessage::overwrite(at, state.data.child(at).export_val(), listen.tag))
            } else {
                None
            }
        })
        .map(Delivery::Message)
        .collect()
}

impl ServerActions for InMemoryServer {
    fn listen(&self, request: ListenRequest, on_complete: StatusCallback) {
        let mut state = self.state();
        LOGGER.debug(format!("server listen {} tag {:?}", request.query, request.tag));
        let at = request.query.path.clone();
        let tag = request.tag;
        let data = state.data.child(&at).export_val();
        state.listens.push(request);
        self.dispatch(
            state,
            vec![
                Delivery::Message(ServerMessage::overwrite(&at, data, tag)),
                Delivery::Ack(on_complete, ServerStatus::Ok),
            ],
        );
    }

    fn unlisten(&self, query: &QuerySpec, tag: Option<u64>) {
        let mut state = self.state();
        let query_id = query.query_id();
        state
            .listens
            .retain(|listen| !(listen.query.path == query.path && listen.query.query_id() == query_id && listen.tag == tag));
    }

    fn put(&self, path: &Path, data: Value, hash: Option<String>, on_complete: StatusCallback) {
        let mut state = self.state();
        if let Some(expected) = hash {
            if state.data.child(path).hash() != expected {
                drop(state);
                self.ack(on_complete, ServerStatus::error("datastale"));
                return;
            }
        }
        let node = match resolve(&state.data, path, &data) {
            Ok(node) => node,
            Err(err) => {
                drop(state);
                self.ack(on_complete, rejected(err));
                return;
            }
        };
        state.data = state.data.update_child(path, node.clone());
        // Clients cannot address `.priority` in a message path; send the owner instead.
        let (changed, node) = match path.parent() {
            Some(parent) if path.back() == Some(".priority") => {
                let owner = state.data.child(&parent);
                (parent, owner)
            }
            _ => (path.clone(), node),
        };
        let mut deliveries = overwrite_notifications(&state, &changed, &node);
        deliveries.push(Delivery::Ack(on_complete, ServerStatus::Ok));
        self.dispatch(state, deliveries);
    }

    fn merge(&self, path: &Path, data: Value, on_complete: StatusCallback) {
        let mut state = self.state();
        let parsed = match merge_children(&data) {
            Ok(parsed) => parsed,
            Err(err) => {
                drop(state);
                self.ack(on_complete, rejected(err));
                return;
            }
        };
        let Value::Object(raw) = data else {
            drop(state);
            self.ack(on_complete, rejected("merge payload must be an object"));
            return;
        };
        let mut children = Vec::with_capacity(parsed.len());
        for (key, value) in &raw {
            let Ok(relative) = Path::parse(key) else {
                continue;
            };
            let target = path.child_path(&relative);
            match resolve(&state.data, &target, value) {
                Ok(node) => children.push((relative, node)),
                Err(err) => {
                    drop(state);
                    self.ack(on_complete, rejected(err));
                    return;
                }
            }
        }
        for (relative, node) in &children {
            state.data = state.data.update_child(&path.child_path(relative), node.clone());
        }
        let mut deliveries = merge_notifications(&state, path, &children);
        deliveries.push(Delivery::Ack(on_complete, ServerStatus::Ok));
        self.dispatch(state, deliveries);
    }

    fn on_disconnect_put(&self, path: &Path, data: Value, on_complete: StatusCallback) {
        {
            let mut state = self.state();
            state.on_disconnect = remember(&state.on_disconnect, path, data);
        }
        self.ack(on_complete, ServerStatus::Ok);
    }

    fn on_disconnect_merge(&self, path: &Path, data: Value, on_complete: StatusCallback) {
        let Value::Object(entries) = data else {
            self.ack(on_complete, rejected("merge payload must be an object"));
            return;
        };
        let mut parsed = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            match Path::parse(&key) {
                Ok(relative) => parsed.push((path.child_path(&relative), value)),
                Err(err) => {
                    self.ack(on_complete, rejected(err));
                    return;
                }
            }
        }
        {
            let mut state = self.state();
            for (target, value) in parsed {
                state.on_disconnect = remember(&state.on_disconnect, &target, value);
            }
        }
        self.ack(on_complete, ServerStatus::Ok);
    }

    fn on_disconnect_cancel(&self, path: &Path, on_complete: StatusCallback) {
        {
            let mut state = self.state();
            state.on_disconnect = forget(&state.on_disconnect, path);
        }
        self.ack(on_complete, ServerStatus::Ok);
    }
}
