use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::{Map, Value};

use crate::database::core::path::Path;
use crate::database::core::server_actions::{
    merge_children, MessageSink, ServerActions, ServerMessage, ServerStatus,
};
use crate::database::core::snap::Node;
use crate::database::core::sync_tree::{ListenInstruction, SyncOutcome, SyncTree};
use crate::database::core::util::ImmutableTree;
use crate::database::core::view::{
    CancelCallback, DataCallback, EventQueue, EventRegistration, EventType, QueuedEvent, QuerySpec,
};
use crate::database::error::{DatabaseError, DatabaseResult};
use crate::database::push_id::PushIdGenerator;
use crate::database::server_value::resolve_deferred_value;
use crate::database::LOGGER;

mod transaction;

pub use transaction::{
    TransactionCompletion, TransactionOutcome, TransactionUpdate, MAX_TRANSACTION_RETRIES,
};
use transaction::{Transaction, TransactionEffects};

/// Called once with the outcome of a write after the server answered.
pub type WriteCompletion = Box<dyn FnOnce(DatabaseResult<()>) + Send>;

struct RepoState {
    sync_tree: SyncTree,
    next_write_id: u64,
    /// Raw values (placeholders unresolved) to write when the connection drops.
    on_disconnect: ImmutableTree<Value>,
    push_ids: PushIdGenerator,
    server_time_offset_ms: i64,
    /// Pending transactions in creation order.
    transactions: Vec<Transaction>,
    next_transaction_order: u64,
    effects: TransactionEffects,
}

struct RepoInner {
    server: Arc<dyn ServerActions>,
    state: Mutex<RepoState>,
    events: EventQueue,
    next_registration_id: AtomicU64,
}

/// The client side of one database: local writes, server data and listeners
/// all pass through here.
///
/// Engine state is guarded by one lock. Events are queued while it is held,
/// so batches reach listeners in the order the changes were applied; they
/// are raised and server calls are made only after it has been released.
#[derive(Clone)]
pub struct Repo {
    inner: Arc<RepoInner>,
}

impl fmt::Debug for Repo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repo")
            .field("server", &"dynamic")
            .field("registrations", &self.inner.next_registration_id)
            .finish()
    }
}

impl Repo {
    pub fn new(server: Arc<dyn ServerActions>, server_time_offset_ms: i64) -> Self {
        Self {
            inner: Arc::new(RepoInner {
                server,
                state: Mutex::new(RepoState {
                    sync_tree: SyncTree::new(),
                    next_write_id: 1,
                    on_disconnect: ImmutableTree::new(),
                    push_ids: PushIdGenerator::new(),
                    server_time_offset_ms,
                    transactions: Vec::new(),
                    next_transaction_order: 0,
                    effects: TransactionEffects::default(),
                }),
                events: EventQueue::new(),
                next_registration_id: AtomicU64::new(1),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, RepoState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    fn downgrade(&self) -> Weak<RepoInner> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(weak: &Weak<RepoInner>) -> Option<Repo> {
        weak.upgrade().map(|inner| Repo { inner })
    }

    /// Applies `change` under the state lock, queues its events before
    /// unlocking and raises them afterwards.
    fn apply<F>(&self, change: F)
    where
        F: FnOnce(&mut RepoState) -> Vec<QueuedEvent>,
    {
        let mut state = self.state();
        let events = change(&mut state);
        self.inner.events.queue(events);
        self.release(state);
    }

    /// Like [`apply`](Self::apply) for registration changes, then forwards
    /// the resulting listens to the server.
    fn reconcile<F>(&self, change: F)
    where
        F: FnOnce(&mut SyncTree) -> SyncOutcome,
    {
        let mut state = self.state();
        let outcome = change(&mut state.sync_tree);
        self.inner.events.queue(outcome.events);
        self.release(state);
        self.send_listens(outcome.listens);
    }

    /// Estimated server clock in milliseconds since the epoch.
    pub fn server_time(&self) -> i64 {
        server_time(self.state().server_time_offset_ms)
    }

    pub fn set_server_time_offset(&self, offset_ms: i64) {
        LOGGER.debug(format!("server time offset set to {offset_ms}ms"));
        self.state().server_time_offset_ms = offset_ms;
    }

    pub fn generate_push_id(&self) -> String {
        let mut state = self.state();
        let now = server_time(state.server_time_offset_ms);
        state.push_ids.next_id(now)
    }

    /// The value currently visible at `path`, if it is fully known.
    pub fn cached_value(&self, path: &Path) -> Option<Node> {
        self.state().sync_tree.calc_complete_event_cache(path)
    }

    // ---- writes --------------------------------------------------------------

    /// Writes `value` (which may carry `.priority` and server value
    /// placeholders) at `path`. Listeners see the new value before this
    /// returns; `on_complete` runs once the server answered.
    pub fn set(&self, path: &Path, value: Value, on_complete: WriteCompletion) -> DatabaseResult<()> {
        LOGGER.debug(format!("set at {path}"));
        let mut state = self.state();
        let existing = state
            .sync_tree
            .calc_complete_event_cache(path)
            .unwrap_or_else(Node::empty);
        let now = server_time(state.server_time_offset_ms);
        let resolved = resolve_deferred_value(&value, &existing, now)?;
        let node = Node::from_json(&resolved)?;
        let write_id = state.next_write_id;
        state.next_write_id += 1;
        let events = state
            .sync_tree
            .apply_user_overwrite(path.clone(), node, write_id, true);
        self.inner.events.queue(events);
        let affected = state.abort_transactions(path);
        state.rerun_transactions(&affected);
        self.release(state);

        let weak = self.downgrade();
        let write_path = path.clone();
        self.inner.server.put(
            path,
            value,
            None,
            Box::new(move |status| {
                if let Some(repo) = Repo::upgrade(&weak) {
                    repo.complete_write("set", &write_path, write_id, status, on_complete);
                }
            }),
        );
        Ok(())
    }

    /// Writes each entry of `children` (keyed by path relative to `path`).
    pub fn update(
        &self,
        path: &Path,
        children: BTreeMap<Path, Value>,
        on_complete: WriteCompletion,
    ) -> DatabaseResult<()> {
        if children.is_empty() {
            LOGGER.debug(format!("update at {path} has nothing to write"));
            on_complete(Ok(()));
            return Ok(());
        }
        LOGGER.debug(format!("update at {path}"));
        let mut state = self.state();
        let now = server_time(state.server_time_offset_ms);
        let mut nodes = BTreeMap::new();
        for (relative, value) in &children {
            let absolute = path.child_path(relative);
            let existing = state
                .sync_tree
                .calc_complete_event_cache(&absolute)
                .unwrap_or_else(Node::empty);
            let resolved = resolve_deferred_value(value, &existing, now)?;
            nodes.insert(relative.clone(), Node::from_json(&resolved)?);
        }
        let write_id = state.next_write_id;
        state.next_write_id += 1;
        let events = state
            .sync_tree
            .apply_user_merge(path.clone(), nodes, write_id);
        self.inner.events.queue(events);
        for relative in children.keys() {
            let affected = state.abort_transactions(&path.child_path(relative));
            state.rerun_transactions(&affected);
        }
        self.release(state);

        let weak = self.downgrade();
        let write_path = path.clone();
        self.inner.server.merge(
            path,
            merge_payload(children),
            Box::new(move |status| {
                if let Some(repo) = Repo::upgrade(&weak) {
                    repo.complete_write("update", &write_path, write_id, status, on_complete);
                }
            }),
        );
        Ok(())
    }

    fn complete_write(
        &self,
        action: &str,
        path: &Path,
        write_id: u64,
        status: ServerStatus,
        on_complete: WriteCompletion,
    ) {
        let success = status.is_ok();
        if !success {
            LOGGER.warn(format!("{action} at {path} failed: {status}"));
        }
        self.apply(|state| {
            let events = state.sync_tree.ack_user_write(write_id, !success);
            if !events.is_empty() {
                state.rerun_transactions(path);
            }
            events
        });
        on_complete(status.into_result());
    }

    // ---- server data ---------------------------------------------------------

    /// Applies data pushed by the server. Any change it causes reruns the
    /// transactions depending on it.
    pub fn handle_server_message(&self, message: ServerMessage) -> DatabaseResult<()> {
        let path = message.path()?;
        let changed = path.clone();
        let rerun = move |state: &mut RepoState, events: Vec<QueuedEvent>| {
            if !events.is_empty() {
                state.rerun_transactions(&changed);
            }
            events
        };
        match message {
            ServerMessage::Data { data, tag, .. } => {
                let node = Node::from_json(&data)?;
                self.apply(|state| {
                    let events = match tag {
                        Some(tag) => state.sync_tree.apply_tagged_query_overwrite(path, node, tag),
                        None => state.sync_tree.apply_server_overwrite(path, node),
                    };
                    rerun(state, events)
                });
            }
            ServerMessage::Merge { data, tag, .. } => {
                let children = merge_children(&data)?;
                self.apply(|state| {
                    let events = match tag {
                        Some(tag) => state.sync_tree.apply_tagged_query_merge(path, children, tag),
                        None => state.sync_tree.apply_server_merge(path, children),
                    };
                    rerun(state, events)
                });
            }
            ServerMessage::ListenComplete { tag, .. } => {
                self.apply(|state| {
                    let events = match tag {
                        Some(tag) => state.sync_tree.apply_tagged_listen_complete(path, tag),
                        None => state.sync_tree.apply_listen_complete(path),
                    };
                    rerun(state, events)
                });
            }
        }
        Ok(())
    }

    /// A sink that feeds server messages into this repo without keeping it alive.
    pub fn message_sink(&self) -> MessageSink {
        let weak = self.downgrade();
        Arc::new(move |message: ServerMessage| {
            if let Some(repo) = Repo::upgrade(&weak) {
                if let Err(err) = repo.handle_server_message(message) {
                    LOGGER.warn(format!("ignoring server message: {err}"));
                }
            }
        })
    }

    // ---- listeners -----------------------------------------------------------

    /// Registers `callback` for `event_type` events of `query` and returns the
    /// registration id used to remove it.
    pub fn add_event_callback(
        &self,
        query: QuerySpec,
        event_type: EventType,
        callback: DataCallback,
        cancel: Option<CancelCallback>,
    ) -> u64 {
        let id = self.inner.next_registration_id.fetch_add(1, Ordering::SeqCst);
        LOGGER.debug(format!("adding {event_type} listener {id} for {query}"));
        let registration = EventRegistration::new(id, event_type, callback, cancel);
        self.reconcile(|tree| tree.add_event_registration(query, registration));
        id
    }

    pub fn remove_event_callback(&self, query: &QuerySpec, id: u64) {
        LOGGER.debug(format!("removing listener {id} for {query}"));
        self.reconcile(|tree| tree.remove_event_registration(query, Some(id), None));
    }

    fn send_listens(&self, listens: Vec<ListenInstruction>) {
        for listen in listens {
            match listen {
                ListenInstruction::Start(request) => {
                    LOGGER.debug(format!("listen {} tag {:?}", request.query, request.tag));
                    let weak = self.downgrade();
                    let query = request.query.clone();
                    let tag = request.tag;
                    self.inner.server.listen(
                        request,
                        Box::new(move |status| {
                            if let Some(repo) = Repo::upgrade(&weak) {
                                repo.on_listen_status(query, tag, status);
                            }
                        }),
                    );
                }
                ListenInstruction::Stop { query, tag } => {
                    LOGGER.debug(format!("unlisten {query} tag {tag:?}"));
                    self.inner.server.unlisten(&query, tag);
                }
            }
        }
    }

    fn on_listen_status(&self, query: QuerySpec, tag: Option<u64>, status: ServerStatus) {
        match status.into_result() {
            Ok(()) => self.apply(|state| match tag {
                Some(tag) => state
                    .sync_tree
                    .apply_tagged_listen_complete(query.path.clone(), tag),
                None => state.sync_tree.apply_listen_complete(query.path.clone()),
            }),
            Err(error) => {
                LOGGER.warn(format!("listen at {query} failed: {error}"));
                self.reconcile(|tree| tree.remove_event_registration(&query, None, Some(error)));
            }
        }
    }

    // ---- on disconnect -------------------------------------------------------

    pub fn on_disconnect_set(&self, path: &Path, value: Value, on_complete: WriteCompletion) -> DatabaseResult<()> {
        // Reject values that could never be applied.
        resolve_deferred_value(&value, &Node::empty(), 0).and_then(|resolved| Node::from_json(&resolved))?;
        let weak = self.downgrade();
        let remembered = value.clone();
        let target = path.clone();
        self.inner.server.on_disconnect_put(
            path,
            value,
            Box::new(move |status| {
                if status.is_ok() {
                    if let Some(repo) = Repo::upgrade(&weak) {
                        let mut state = repo.state();
                        state.on_disconnect = remember(&state.on_disconnect, &target, remembered);
                    }
                }
                on_complete(status.into_result());
            }),
        );
        Ok(())
    }

    pub fn on_disconnect_update(
        &self,
        path: &Path,
        children: BTreeMap<Path, Value>,
        on_complete: WriteCompletion,
    ) -> DatabaseResult<()> {
        if children.is_empty() {
            on_complete(Ok(()));
            return Ok(());
        }
        for value in children.values() {
            resolve_deferred_value(value, &Node::empty(), 0).and_then(|resolved| Node::from_json(&resolved))?;
        }
        let weak = self.downgrade();
        let base = path.clone();
        let payload = merge_payload(children.clone());
        self.inner.server.on_disconnect_merge(
            path,
            payload,
            Box::new(move |status| {
                if status.is_ok() {
                    if let Some(repo) = Repo::upgrade(&weak) {
                        let mut state = repo.state();
                        for (relative, value) in children {
                            state.on_disconnect =
                                remember(&state.on_disconnect, &base.child_path(&relative), value);
                        }
                    }
                }
                on_complete(status.into_result());
            }),
        );
        Ok(())
    }

    pub fn on_disconnect_cancel(&self, path: &Path, on_complete: WriteCompletion) {
        let weak = self.downgrade();
        let target = path.clone();
        self.inner.server.on_disconnect_cancel(
            path,
            Box::new(move |status| {
                if status.is_ok() {
                    if let Some(repo) = Repo::upgrade(&weak) {
                        let mut state = repo.state();
                        state.on_disconnect = forget(&state.on_disconnect, &target);
                    }
                }
                on_complete(status.into_result());
            }),
        );
    }

    /// Applies the recorded on-disconnect writes locally, as the server would
    /// once it notices the connection is gone, and clears them.
    pub fn on_connection_lost(&self) {
        self.apply(|state| {
            let pending = std::mem::take(&mut state.on_disconnect);
            let now = server_time(state.server_time_offset_ms);
            let mut writes = Vec::new();
            pending.foreach(|path, value| writes.push((path.clone(), value.clone())));
            let mut events = Vec::new();
            for (path, value) in writes {
                let existing = state
                    .sync_tree
                    .calc_complete_event_cache(&path)
                    .unwrap_or_else(Node::empty);
                match resolve_deferred_value(&value, &existing, now).and_then(|resolved| Node::from_json(&resolved)) {
                    Ok(node) => {
                        events.extend(state.sync_tree.apply_server_overwrite(path.clone(), node));
                        let affected = state.abort_transactions(&path);
                        state.rerun_transactions(&affected);
                    }
                    Err(err) => LOGGER.warn(format!("dropping on-disconnect write at {path}: {err}")),
                }
            }
            LOGGER.debug(format!("connection lost, {} events from on-disconnect writes", events.len()));
            events
        });
    }
}

fn server_time(offset_ms: i64) -> i64 {
    chrono::Utc::now().timestamp_millis() + offset_ms
}

fn merge_payload(children: BTreeMap<Path, Value>) -> Value {
    let mut payload = Map::with_capacity(children.len());
    for (relative, value) in children {
        payload.insert(relative.segments().join("/"), value);
    }
    Value::Object(payload)
}

/// Records a write at `path`, folding it into a write recorded above it.
pub(crate) fn remember(tree: &ImmutableTree<Value>, path: &Path, value: Value) -> ImmutableTree<Value> {
    if let Some((ancestor, existing)) = tree.find_rootmost_value_and_path(path) {
        if ancestor != *path {
            let merged = with_child(existing, &Path::relative(&ancestor, path), value);
            return tree.set(&ancestor, merged);
        }
    }
    tree.set(path, value)
}

fn with_child(value: &Value, relative: &Path, child: Value) -> Value {
    let Some(front) = relative.front() else {
        return child;
    };
    let mut map = match value {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    let current = map.get(front).cloned().unwrap_or(Value::Null);
    let updated = with_child(&current, &relative.pop_front(), child);
    if updated.is_null() {
        map.remove(front);
    } else {
        map.insert(front.to_string(), updated);
    }
    Value::Object(map)
}

/// Drops every recorded on-disconnect write at or below `path`. A write above
/// `path` loses the part of its value that lives at `path`.
pub(crate) fn forget(tree: &ImmutableTree<Value>, path: &Path) -> ImmutableTree<Value> {
    if let Some((ancestor, value)) = tree.find_rootmost_value_and_path(path) {
        if ancestor != *path {
            let trimmed = without_child(value, &Path::relative(&ancestor, path));
            return tree.set(&ancestor, trimmed);
        }
    }
    tree.remove(path)
}

fn without_child(value: &Value, relative: &Path) -> Value {
    let Some(front) = relative.front() else {
        return Value::Null;
    };
    match value {
        Value::Object(map) if map.contains_key(front) => {
            let mut trimmed = map.clone();
            let rest = relative.pop_front();
            if rest.is_empty() {
                trimmed.remove(front);
            } else if let Some(child) = map.get(front) {
                trimmed.insert(front.to_string(), without_child(child, &rest));
            }
            Value::Object(trimmed)
        }
        other => other.clone(),
    }
}
