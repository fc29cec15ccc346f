use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use futures::channel::oneshot;
use futures::executor::block_on;
use serde_json::{Map, Value};

use crate::database::backend::InMemoryServer;
use crate::database::core::path::Path;
use crate::database::core::repo::{Repo, TransactionOutcome, WriteCompletion};
use crate::database::core::server_actions::{ServerActions, ServerMessage};
use crate::database::core::snap::{Index, Node};
use crate::database::core::view::{
    CancelCallback, DataCallback, DataEvent, EventType, QueryLimit, QueryParams, QuerySpec,
};
use crate::database::error::{internal_error, invalid_argument, DatabaseError, DatabaseResult};
use crate::database::on_disconnect::OnDisconnect;
use crate::database::settings::DatabaseSettings;
use crate::database::LOGGER;

/// Handle to one database. Clones share the same client state.
#[derive(Clone, Debug)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    repo: Repo,
    settings: DatabaseSettings,
}

impl fmt::Debug for DatabaseInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseInner")
            .field("repo", &self.repo)
            .field("settings", &self.settings)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct DatabaseReference {
    database: Database,
    path: Path,
}

/// A location plus ordering, range and limit constraints, analogous to the
/// JS `QueryImpl`.
#[derive(Clone, Debug)]
pub struct DatabaseQuery {
    reference: DatabaseReference,
    params: QueryParams,
}

/// A single constraint applied by [`query`].
#[derive(Clone, Debug)]
pub struct QueryConstraint {
    kind: QueryConstraintKind,
}

#[derive(Clone, Debug)]
enum QueryConstraintKind {
    OrderByChild(String),
    OrderByKey,
    OrderByValue,
    OrderByPriority,
    Start {
        value: Value,
        name: Option<String>,
        inclusive: bool,
    },
    End {
        value: Value,
        name: Option<String>,
        inclusive: bool,
    },
    LimitFirst(u32),
    LimitLast(u32),
    EqualTo {
        value: Value,
        name: Option<String>,
    },
}

type EventHandler = Arc<dyn Fn(DatabaseResult<DataEvent>) + Send + Sync>;

/// Immutable copy of the data at a location, as delivered to listeners.
#[derive(Clone, Debug)]
pub struct DataSnapshot {
    reference: DatabaseReference,
    node: Node,
    index: Index,
}

/// How [`DatabaseReference::run_transaction`] ended. `snapshot` holds the
/// committed value, or the value the update function declined to change.
#[derive(Clone, Debug)]
pub struct TransactionResult {
    pub committed: bool,
    pub snapshot: DataSnapshot,
}

/// Options for [`DatabaseReference::run_transaction_with_options`].
#[derive(Clone, Copy, Debug)]
pub struct TransactionOptions {
    /// Show each attempt to local listeners before the server accepted it.
    pub apply_locally: bool,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            apply_locally: true,
        }
    }
}

/// A `child_*` event: the child's snapshot and the key of the child sorted
/// before it (`None` for the first child).
#[derive(Clone, Debug)]
pub struct ChildEvent {
    pub snapshot: DataSnapshot,
    pub previous_name: Option<String>,
}

/// Keeps a listener attached; dropping the handle detaches it.
pub struct ListenerRegistration {
    database: Database,
    query: QuerySpec,
    id: Option<u64>,
}

impl fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("query", &self.query.to_string())
            .field("id", &self.id)
            .finish()
    }
}

impl DataSnapshot {
    fn from_event(database: Database, event: DataEvent) -> Self {
        DataSnapshot {
            reference: DatabaseReference {
                database,
                path: event.path,
            },
            node: event.node,
            index: event.index,
        }
    }

    pub fn reference(&self) -> &DatabaseReference {
        &self.reference
    }

    pub fn key(&self) -> Option<&str> {
        self.reference.key()
    }

    /// The plain JSON value; `Null` when nothing is stored here.
    pub fn value(&self) -> Value {
        self.node.val()
    }

    pub fn into_value(self) -> Value {
        self.node.val()
    }

    /// The JSON value with `.priority` (and `.value` for leaves) included.
    pub fn to_json(&self) -> Value {
        self.node.export_val()
    }

    pub fn exists(&self) -> bool {
        !self.node.is_empty()
    }

    pub fn priority(&self) -> Value {
        self.node.priority().val()
    }

    pub fn child(&self, relative_path: &str) -> DatabaseResult<DataSnapshot> {
        let relative = Path::parse(relative_path)?;
        Ok(DataSnapshot {
            reference: self.reference.child_at(&relative),
            node: self.node.child(&relative),
            index: Index::Priority,
        })
    }

    pub fn has_child(&self, relative_path: &str) -> DatabaseResult<bool> {
        let relative = Path::parse(relative_path)?;
        Ok(!self.node.child(&relative).is_empty())
    }

    pub fn has_children(&self) -> bool {
        self.node.num_children() > 0
    }

    pub fn size(&self) -> usize {
        self.node.num_children()
    }

    /// Direct children in the order of the query that produced this snapshot.
    pub fn children(&self) -> Vec<DataSnapshot> {
        self.node
            .ordered_children(&self.index)
            .into_iter()
            .map(|named| DataSnapshot {
                reference: self.reference.child_at(&Path::from_trusted(vec![named.name])),
                node: named.node,
                index: Index::Priority,
            })
            .collect()
    }
}

impl ListenerRegistration {
    fn new(database: Database, query: QuerySpec, id: u64) -> Self {
        Self {
            database,
            query,
            id: Some(id),
        }
    }

    pub fn detach(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if let Some(id) = self.id.take() {
            self.database.repo().remove_event_callback(&self.query, id);
        }
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.remove();
    }
}

impl QueryConstraint {
    fn new(kind: QueryConstraintKind) -> Self {
        Self { kind }
    }

    fn apply(self, query: DatabaseQuery) -> DatabaseResult<DatabaseQuery> {
        match self.kind {
            QueryConstraintKind::OrderByChild(path) => query.order_by_child(&path),
            QueryConstraintKind::OrderByKey => query.order_by_key(),
            QueryConstraintKind::OrderByValue => query.order_by_value(),
            QueryConstraintKind::OrderByPriority => query.order_by_priority(),
            QueryConstraintKind::Start {
                value,
                name,
                inclusive: true,
            } => query.start_at_with_key(value, name),
            QueryConstraintKind::Start { value, name, .. } => query.start_after_with_key(value, name),
            QueryConstraintKind::End {
                value,
                name,
                inclusive: true,
            } => query.end_at_with_key(value, name),
            QueryConstraintKind::End { value, name, .. } => query.end_before_with_key(value, name),
            QueryConstraintKind::LimitFirst(limit) => query.limit_to_first(limit),
            QueryConstraintKind::LimitLast(limit) => query.limit_to_last(limit),
            QueryConstraintKind::EqualTo { value, name } => query.equal_to_with_key(value, name),
        }
    }
}

/// Builds a query from `reference` by applying `constraints` in order.
pub fn query(
    reference: DatabaseReference,
    constraints: impl IntoIterator<Item = QueryConstraint>,
) -> DatabaseResult<DatabaseQuery> {
    let mut current = reference.query();
    for constraint in constraints {
        current = constraint.apply(current)?;
    }
    Ok(current)
}

pub fn order_by_child(path: impl Into<String>) -> QueryConstraint {
    QueryConstraint::new(QueryConstraintKind::OrderByChild(path.into()))
}

pub fn order_by_key() -> QueryConstraint {
    QueryConstraint::new(QueryConstraintKind::OrderByKey)
}

pub fn order_by_priority() -> QueryConstraint {
    QueryConstraint::new(QueryConstraintKind::OrderByPriority)
}

pub fn order_by_value() -> QueryConstraint {
    QueryConstraint::new(QueryConstraintKind::OrderByValue)
}

pub fn start_at<V>(value: V) -> QueryConstraint
where
    V: Into<Value>,
{
    QueryConstraint::new(QueryConstraintKind::Start {
        value: value.into(),
        name: None,
        inclusive: true,
    })
}

pub fn start_at_with_key<V, S>(value: V, name: S) -> QueryConstraint
where
    V: Into<Value>,
    S: Into<String>,
{
    QueryConstraint::new(QueryConstraintKind::Start {
        value: value.into(),
        name: Some(name.into()),
        inclusive: true,
    })
}

pub fn start_after<V>(value: V) -> QueryConstraint
where
    V: Into<Value>,
{
    QueryConstraint::new(QueryConstraintKind::Start {
        value: value.into(),
        name: None,
        inclusive: false,
    })
}

pub fn start_after_with_key<V, S>(value: V, name: S) -> QueryConstraint
where
    V: Into<Value>,
    S: Into<String>,
{
    QueryConstraint::new(QueryConstraintKind::Start {
        value: value.into(),
        name: Some(name.into()),
        inclusive: false,
    })
}

pub fn end_at<V>(value: V) -> QueryConstraint
where
    V: Into<Value>,
{
    QueryConstraint::new(QueryConstraintKind::End {
        value: value.into(),
        name: None,
        inclusive: true,
    })
}

pub fn end_at_with_key<V, S>(value: V, name: S) -> QueryConstraint
where
    V: Into<Value>,
    S: Into<String>,
{
    QueryConstraint::new(QueryConstraintKind::End {
        value: value.into(),
        name: Some(name.into()),
        inclusive: true,
    })
}

pub fn end_before<V>(value: V) -> QueryConstraint
where
    V: Into<Value>,
{
    QueryConstraint::new(QueryConstraintKind::End {
        value: value.into(),
        name: None,
        inclusive: false,
    })
}

pub fn end_before_with_key<V, S>(value: V, name: S) -> QueryConstraint
where
    V: Into<Value>,
    S: Into<String>,
{
    QueryConstraint::new(QueryConstraintKind::End {
        value: value.into(),
        name: Some(name.into()),
        inclusive: false,
    })
}

pub fn limit_to_first(limit: u32) -> QueryConstraint {
    QueryConstraint::new(QueryConstraintKind::LimitFirst(limit))
}

pub fn limit_to_last(limit: u32) -> QueryConstraint {
    QueryConstraint::new(QueryConstraintKind::LimitLast(limit))
}

pub fn equal_to<V>(value: V) -> QueryConstraint
where
    V: Into<Value>,
{
    QueryConstraint::new(QueryConstraintKind::EqualTo {
        value: value.into(),
        name: None,
    })
}

pub fn equal_to_with_key<V, S>(value: V, name: S) -> QueryConstraint
where
    V: Into<Value>,
    S: Into<String>,
{
    QueryConstraint::new(QueryConstraintKind::EqualTo {
        value: value.into(),
        name: Some(name.into()),
    })
}

/// Generates a child location keyed by a new push id. Nothing is written.
pub fn push(reference: &DatabaseReference) -> DatabaseReference {
    reference.push()
}

/// Writes `value` under a new push id and returns its location.
pub fn push_with_value<V>(reference: &DatabaseReference, value: V) -> DatabaseResult<DatabaseReference>
where
    V: Into<Value>,
{
    reference.push_with_value(value)
}

pub fn on_value<F>(reference: &DatabaseReference, callback: F) -> ListenerRegistration
where
    F: Fn(DatabaseResult<DataSnapshot>) + Send + Sync + 'static,
{
    reference.on_value(callback)
}

pub fn on_child_added<F>(reference: &DatabaseReference, callback: F) -> ListenerRegistration
where
    F: Fn(DatabaseResult<ChildEvent>) + Send + Sync + 'static,
{
    reference.on_child_added(callback)
}

pub fn on_child_changed<F>(reference: &DatabaseReference, callback: F) -> ListenerRegistration
where
    F: Fn(DatabaseResult<ChildEvent>) + Send + Sync + 'static,
{
    reference.on_child_changed(callback)
}

pub fn on_child_removed<F>(reference: &DatabaseReference, callback: F) -> ListenerRegistration
where
    F: Fn(DatabaseResult<ChildEvent>) + Send + Sync + 'static,
{
    reference.on_child_removed(callback)
}

pub fn on_child_moved<F>(reference: &DatabaseReference, callback: F) -> ListenerRegistration
where
    F: Fn(DatabaseResult<ChildEvent>) + Send + Sync + 'static,
{
    reference.on_child_moved(callback)
}

pub fn set_with_priority<V, P>(reference: &DatabaseReference, value: V, priority: P) -> DatabaseResult<()>
where
    V: Into<Value>,
    P: Into<Value>,
{
    reference.set_with_priority(value, priority)
}

pub fn set_priority<P>(reference: &DatabaseReference, priority: P) -> DatabaseResult<()>
where
    P: Into<Value>,
{
    reference.set_priority(priority)
}

pub fn run_transaction<F>(reference: &DatabaseReference, update: F) -> DatabaseResult<TransactionResult>
where
    F: FnMut(Value) -> Option<Value> + Send + 'static,
{
    reference.run_transaction(update)
}

impl Database {
    /// Creates a client that talks to the database through `server`.
    ///
    /// Data pushed by the server must be fed back with
    /// [`handle_server_message`](Self::handle_server_message).
    pub fn new(server: Arc<dyn ServerActions>) -> Self {
        Self::with_settings(server, DatabaseSettings::default())
    }

    pub fn with_settings(server: Arc<dyn ServerActions>, settings: DatabaseSettings) -> Self {
        if let Some(level) = settings.log_level {
            if let Err(err) = LOGGER.set_log_level(level) {
                LOGGER.warn(format!("ignoring log level from settings: {err}"));
            }
        }
        let repo = Repo::new(server, settings.server_time_offset_ms);
        Self {
            inner: Arc::new(DatabaseInner { repo, settings }),
        }
    }

    /// A client wired to a fresh [`InMemoryServer`].
    pub fn in_memory() -> (Self, Arc<InMemoryServer>) {
        Self::in_memory_with_settings(DatabaseSettings::default())
    }

    pub fn in_memory_with_settings(settings: DatabaseSettings) -> (Self, Arc<InMemoryServer>) {
        let server = Arc::new(InMemoryServer::new());
        let database = Self::with_settings(server.clone(), settings);
        server.attach(database.repo().message_sink());
        (database, server)
    }

    pub(crate) fn repo(&self) -> &Repo {
        &self.inner.repo
    }

    pub fn settings(&self) -> &DatabaseSettings {
        &self.inner.settings
    }

    pub fn reference(&self, path: &str) -> DatabaseResult<DatabaseReference> {
        Ok(DatabaseReference {
            database: self.clone(),
            path: Path::parse(path)?,
        })
    }

    pub fn root(&self) -> DatabaseReference {
        DatabaseReference {
            database: self.clone(),
            path: Path::empty(),
        }
    }

    /// Applies data pushed by the server.
    pub fn handle_server_message(&self, message: ServerMessage) -> DatabaseResult<()> {
        self.repo().handle_server_message(message)
    }

    /// Estimated server clock in milliseconds since the epoch.
    pub fn server_time(&self) -> i64 {
        self.repo().server_time()
    }

    pub fn set_server_time_offset(&self, offset_ms: i64) {
        self.repo().set_server_time_offset(offset_ms);
    }

    /// Runs the on-disconnect writes registered by this client against its
    /// local state, as the server does when the connection drops.
    pub fn connection_lost(&self) {
        self.repo().on_connection_lost();
    }

    fn add_listener(&self, query: QuerySpec, event_type: EventType, handler: EventHandler) -> ListenerRegistration {
        let on_data = Arc::clone(&handler);
        let data: DataCallback = Arc::new(move |event: DataEvent| on_data(Ok(event)));
        let cancel: CancelCallback = Arc::new(move |error: DatabaseError| handler(Err(error)));
        let id = self
            .repo()
            .add_event_callback(query.clone(), event_type, data, Some(cancel));
        ListenerRegistration::new(self.clone(), query, id)
    }

    fn downgrade(&self) -> Weak<DatabaseInner> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(weak: &Weak<DatabaseInner>) -> Option<Database> {
        weak.upgrade().map(|inner| Database { inner })
    }

    fn on_value_at<F>(&self, query: QuerySpec, callback: F) -> ListenerRegistration
    where
        F: Fn(DatabaseResult<DataSnapshot>) + Send + Sync + 'static,
    {
        let weak = self.downgrade();
        self.add_listener(
            query,
            EventType::Value,
            Arc::new(move |result: DatabaseResult<DataEvent>| {
                let Some(database) = Database::upgrade(&weak) else {
                    return;
                };
                callback(result.map(|event| DataSnapshot::from_event(database, event)));
            }),
        )
    }

    fn on_child_at<F>(&self, query: QuerySpec, event_type: EventType, callback: F) -> ListenerRegistration
    where
        F: Fn(DatabaseResult<ChildEvent>) + Send + Sync + 'static,
    {
        let weak = self.downgrade();
        self.add_listener(
            query,
            event_type,
            Arc::new(move |result: DatabaseResult<DataEvent>| {
                let Some(database) = Database::upgrade(&weak) else {
                    return;
                };
                callback(result.map(|event| {
                    let previous_name = event.previous_name.clone();
                    ChildEvent {
                        snapshot: DataSnapshot::from_event(database, event),
                        previous_name,
                    }
                }));
            }),
        )
    }

    /// Starts a one-shot read of `query`. Cached data is used when it is
    /// fully known; otherwise a temporary value listener waits for the server.
    fn begin_get(&self, query: QuerySpec) -> PendingRead {
        if query.loads_all_data() {
            if let Some(node) = self.repo().cached_value(&query.path) {
                return PendingRead::Ready(DataSnapshot {
                    reference: DatabaseReference {
                        database: self.clone(),
                        path: query.path.clone(),
                    },
                    node,
                    index: query.params.index.clone(),
                });
            }
        }
        let (sender, receiver) = oneshot::channel();
        let sender = Mutex::new(Some(sender));
        let registration = self.add_listener(
            query,
            EventType::Value,
            Arc::new(move |result: DatabaseResult<DataEvent>| {
                let pending = sender
                    .lock()
                    .unwrap_or_else(|poison| poison.into_inner())
                    .take();
                if let Some(sender) = pending {
                    let _ = sender.send(result);
                }
            }),
        );
        PendingRead::Waiting {
            registration,
            receiver,
        }
    }

    fn settle_get(
        &self,
        registration: ListenerRegistration,
        received: Result<DatabaseResult<DataEvent>, oneshot::Canceled>,
    ) -> DatabaseResult<DataSnapshot> {
        drop(registration);
        let event = received.map_err(|_| internal_error("listener removed before a value arrived"))??;
        Ok(DataSnapshot::from_event(self.clone(), event))
    }

    async fn get_once(&self, query: QuerySpec) -> DatabaseResult<DataSnapshot> {
        match self.begin_get(query) {
            PendingRead::Ready(snapshot) => Ok(snapshot),
            PendingRead::Waiting {
                registration,
                receiver,
            } => {
                let received = receiver.await;
                self.settle_get(registration, received)
            }
        }
    }

    fn get_once_blocking(&self, query: QuerySpec) -> DatabaseResult<DataSnapshot> {
        match self.begin_get(query) {
            PendingRead::Ready(snapshot) => Ok(snapshot),
            PendingRead::Waiting {
                registration,
                receiver,
            } => {
                let received = block_on(receiver);
                self.settle_get(registration, received)
            }
        }
    }
}

enum PendingRead {
    Ready(DataSnapshot),
    Waiting {
        registration: ListenerRegistration,
        receiver: oneshot::Receiver<DatabaseResult<DataEvent>>,
    },
}

type PendingTransaction = oneshot::Receiver<DatabaseResult<TransactionOutcome>>;

/// Answer to a write the repo has already applied locally.
pub(crate) type PendingWrite = oneshot::Receiver<DatabaseResult<()>>;

pub(crate) fn completion_channel() -> (WriteCompletion, PendingWrite) {
    let (sender, receiver) = oneshot::channel();
    let on_complete: WriteCompletion = Box::new(move |result| {
        let _ = sender.send(result);
    });
    (on_complete, receiver)
}

pub(crate) async fn await_completion(receiver: PendingWrite) -> DatabaseResult<()> {
    receiver
        .await
        .map_err(|_| internal_error("database closed before the server answered"))?
}

/// Blocks until the server answered. Only the wait runs inside the executor,
/// so listeners fired by the write itself may call blocking methods too.
pub(crate) fn wait_for_completion(receiver: PendingWrite) -> DatabaseResult<()> {
    block_on(await_completion(receiver))
}

impl DatabaseReference {
    pub(crate) fn path_ref(&self) -> &Path {
        &self.path
    }

    pub(crate) fn database(&self) -> &Database {
        &self.database
    }

    fn child_at(&self, relative: &Path) -> DatabaseReference {
        DatabaseReference {
            database: self.database.clone(),
            path: self.path.child_path(relative),
        }
    }

    pub fn child(&self, relative: &str) -> DatabaseResult<DatabaseReference> {
        Ok(self.child_at(&Path::parse(relative)?))
    }

    pub fn parent(&self) -> Option<DatabaseReference> {
        self.path.parent().map(|path| DatabaseReference {
            database: self.database.clone(),
            path,
        })
    }

    pub fn root(&self) -> DatabaseReference {
        self.database.root()
    }

    /// Last path segment; `None` at the root.
    pub fn key(&self) -> Option<&str> {
        self.path.back()
    }

    /// Slash separated location, `/` for the root.
    pub fn path(&self) -> String {
        self.path.to_string()
    }

    fn begin_set(&self, path: &Path, value: Value) -> DatabaseResult<PendingWrite> {
        let (on_complete, receiver) = completion_channel();
        self.database.repo().set(path, value, on_complete)?;
        Ok(receiver)
    }

    fn begin_update(&self, updates: Map<String, Value>) -> DatabaseResult<PendingWrite> {
        let children = relative_updates(updates)?;
        let (on_complete, receiver) = completion_channel();
        self.database
            .repo()
            .update(&self.path, children, on_complete)?;
        Ok(receiver)
    }

    fn begin_set_priority(&self, priority: Value) -> DatabaseResult<PendingWrite> {
        validate_priority_value(&priority)?;
        self.begin_set(&self.path.child(".priority"), priority)
    }

    /// Writes `value` here. Listeners see it immediately; the future resolves
    /// once the server accepted or rejected it.
    pub async fn set_async(&self, value: Value) -> DatabaseResult<()> {
        await_completion(self.begin_set(&self.path, value)?).await
    }

    pub fn set(&self, value: Value) -> DatabaseResult<()> {
        wait_for_completion(self.begin_set(&self.path, value)?)
    }

    /// Writes several children at once. Keys are paths relative to this
    /// location; `null` values delete.
    pub async fn update_async(&self, updates: Map<String, Value>) -> DatabaseResult<()> {
        await_completion(self.begin_update(updates)?).await
    }

    pub fn update(&self, updates: Map<String, Value>) -> DatabaseResult<()> {
        wait_for_completion(self.begin_update(updates)?)
    }

    pub async fn remove_async(&self) -> DatabaseResult<()> {
        self.set_async(Value::Null).await
    }

    pub fn remove(&self) -> DatabaseResult<()> {
        self.set(Value::Null)
    }

    pub async fn set_with_priority_async<V, P>(&self, value: V, priority: P) -> DatabaseResult<()>
    where
        V: Into<Value>,
        P: Into<Value>,
    {
        let priority = priority.into();
        validate_priority_value(&priority)?;
        self.set_async(pack_with_priority(value.into(), priority)).await
    }

    pub fn set_with_priority<V, P>(&self, value: V, priority: P) -> DatabaseResult<()>
    where
        V: Into<Value>,
        P: Into<Value>,
    {
        let priority = priority.into();
        validate_priority_value(&priority)?;
        self.set(pack_with_priority(value.into(), priority))
    }

    /// Changes the priority of the existing data here.
    pub async fn set_priority_async<P>(&self, priority: P) -> DatabaseResult<()>
    where
        P: Into<Value>,
    {
        await_completion(self.begin_set_priority(priority.into())?).await
    }

    pub fn set_priority<P>(&self, priority: P) -> DatabaseResult<()>
    where
        P: Into<Value>,
    {
        wait_for_completion(self.begin_set_priority(priority.into())?)
    }

    pub fn push(&self) -> DatabaseReference {
        let key = self.database.repo().generate_push_id();
        DatabaseReference {
            database: self.database.clone(),
            path: self.path.child(&key),
        }
    }

    pub async fn push_with_value_async<V>(&self, value: V) -> DatabaseResult<DatabaseReference>
    where
        V: Into<Value>,
    {
        let reference = self.push();
        reference.set_async(value.into()).await?;
        Ok(reference)
    }

    pub fn push_with_value<V>(&self, value: V) -> DatabaseResult<DatabaseReference>
    where
        V: Into<Value>,
    {
        let reference = self.push();
        reference.set(value.into())?;
        Ok(reference)
    }

    fn begin_transaction<F>(&self, update: F, options: TransactionOptions) -> PendingTransaction
    where
        F: FnMut(Value) -> Option<Value> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        self.database.repo().start_transaction(
            &self.path,
            Box::new(update),
            options.apply_locally,
            Box::new(move |result| {
                let _ = sender.send(result);
            }),
        );
        receiver
    }

    fn settle_transaction(
        &self,
        received: Result<DatabaseResult<TransactionOutcome>, oneshot::Canceled>,
    ) -> DatabaseResult<TransactionResult> {
        let outcome = received
            .map_err(|_| internal_error("database closed before the transaction finished"))??;
        Ok(TransactionResult {
            committed: outcome.committed,
            snapshot: DataSnapshot {
                reference: self.clone(),
                node: outcome.node,
                index: Index::Priority,
            },
        })
    }

    /// Atomically replaces the data here with what `update` computes from
    /// the current value.
    ///
    /// `update` may run several times: whenever the server holds a different
    /// value than the one it was given, it is called again with the newer
    /// one. Returning `None` leaves the data untouched. A `set` or `update`
    /// touching this location while the transaction is pending aborts it.
    /// `update` must not call back into the database.
    pub async fn run_transaction_async<F>(&self, update: F) -> DatabaseResult<TransactionResult>
    where
        F: FnMut(Value) -> Option<Value> + Send + 'static,
    {
        self.run_transaction_with_options_async(update, TransactionOptions::default())
            .await
    }

    pub fn run_transaction<F>(&self, update: F) -> DatabaseResult<TransactionResult>
    where
        F: FnMut(Value) -> Option<Value> + Send + 'static,
    {
        self.run_transaction_with_options(update, TransactionOptions::default())
    }

    pub async fn run_transaction_with_options_async<F>(
        &self,
        update: F,
        options: TransactionOptions,
    ) -> DatabaseResult<TransactionResult>
    where
        F: FnMut(Value) -> Option<Value> + Send + 'static,
    {
        let received = self.begin_transaction(update, options).await;
        self.settle_transaction(received)
    }

    pub fn run_transaction_with_options<F>(
        &self,
        update: F,
        options: TransactionOptions,
    ) -> DatabaseResult<TransactionResult>
    where
        F: FnMut(Value) -> Option<Value> + Send + 'static,
    {
        let received = block_on(self.begin_transaction(update, options));
        self.settle_transaction(received)
    }

    /// Reads the current value, from the local cache when it is complete and
    /// from the server otherwise.
    pub async fn get_async(&self) -> DatabaseResult<DataSnapshot> {
        self.database.get_once(self.spec()).await
    }

    /// Blocking form of [`get_async`](Self::get_async).
    ///
    /// Events raised while a listener runs are delivered after it returns, so
    /// a listener must not block on data that is not cached yet.
    pub fn get(&self) -> DatabaseResult<DataSnapshot> {
        self.database.get_once_blocking(self.spec())
    }

    pub fn query(&self) -> DatabaseQuery {
        DatabaseQuery {
            reference: self.clone(),
            params: QueryParams::default(),
        }
    }

    fn spec(&self) -> QuerySpec {
        QuerySpec::default_at(self.path.clone())
    }

    pub fn order_by_child(&self, path: &str) -> DatabaseResult<DatabaseQuery> {
        self.query().order_by_child(path)
    }

    pub fn order_by_key(&self) -> DatabaseResult<DatabaseQuery> {
        self.query().order_by_key()
    }

    pub fn order_by_value(&self) -> DatabaseResult<DatabaseQuery> {
        self.query().order_by_value()
    }

    pub fn order_by_priority(&self) -> DatabaseResult<DatabaseQuery> {
        self.query().order_by_priority()
    }

    /// Calls `callback` with the whole value now (once known) and after every change.
    pub fn on_value<F>(&self, callback: F) -> ListenerRegistration
    where
        F: Fn(DatabaseResult<DataSnapshot>) + Send + Sync + 'static,
    {
        self.database.on_value_at(self.spec(), callback)
    }

    pub fn on_child_added<F>(&self, callback: F) -> ListenerRegistration
    where
        F: Fn(DatabaseResult<ChildEvent>) + Send + Sync + 'static,
    {
        self.database
            .on_child_at(self.spec(), EventType::ChildAdded, callback)
    }

    pub fn on_child_changed<F>(&self, callback: F) -> ListenerRegistration
    where
        F: Fn(DatabaseResult<ChildEvent>) + Send + Sync + 'static,
    {
        self.database
            .on_child_at(self.spec(), EventType::ChildChanged, callback)
    }

    pub fn on_child_removed<F>(&self, callback: F) -> ListenerRegistration
    where
        F: Fn(DatabaseResult<ChildEvent>) + Send + Sync + 'static,
    {
        self.database
            .on_child_at(self.spec(), EventType::ChildRemoved, callback)
    }

    pub fn on_child_moved<F>(&self, callback: F) -> ListenerRegistration
    where
        F: Fn(DatabaseResult<ChildEvent>) + Send + Sync + 'static,
    {
        self.database
            .on_child_at(self.spec(), EventType::ChildMoved, callback)
    }

    /// Writes to run when this client disconnects.
    pub fn on_disconnect(&self) -> OnDisconnect {
        OnDisconnect::new(self.clone())
    }
}

impl DatabaseQuery {
    pub fn reference(&self) -> &DatabaseReference {
        &self.reference
    }

    pub fn spec(&self) -> QuerySpec {
        QuerySpec::new(self.reference.path.clone(), self.params.clone())
    }

    pub fn order_by_child(mut self, path: &str) -> DatabaseResult<Self> {
        let child = Path::parse(path)?;
        if child.is_empty() {
            return Err(invalid_argument("orderByChild path cannot be empty"));
        }
        self.params.set_index(Index::Child(child))?;
        self.validated()
    }

    pub fn order_by_key(mut self) -> DatabaseResult<Self> {
        self.params.set_index(Index::Key)?;
        self.validated()
    }

    pub fn order_by_value(mut self) -> DatabaseResult<Self> {
        self.params.set_index(Index::Value)?;
        self.validated()
    }

    pub fn order_by_priority(mut self) -> DatabaseResult<Self> {
        self.params.set_index(Index::Priority)?;
        self.validated()
    }

    pub fn start_at(self, value: Value) -> DatabaseResult<Self> {
        self.start_at_with_key(value, None)
    }

    pub fn start_at_with_key(mut self, value: Value, name: Option<String>) -> DatabaseResult<Self> {
        self.params.set_start(bound_node(&value)?, name, true)?;
        self.validated()
    }

    pub fn start_after(self, value: Value) -> DatabaseResult<Self> {
        self.start_after_with_key(value, None)
    }

    pub fn start_after_with_key(mut self, value: Value, name: Option<String>) -> DatabaseResult<Self> {
        self.params.set_start(bound_node(&value)?, name, false)?;
        self.validated()
    }

    pub fn end_at(self, value: Value) -> DatabaseResult<Self> {
        self.end_at_with_key(value, None)
    }

    pub fn end_at_with_key(mut self, value: Value, name: Option<String>) -> DatabaseResult<Self> {
        self.params.set_end(bound_node(&value)?, name, true)?;
        self.validated()
    }

    pub fn end_before(self, value: Value) -> DatabaseResult<Self> {
        self.end_before_with_key(value, None)
    }

    pub fn end_before_with_key(mut self, value: Value, name: Option<String>) -> DatabaseResult<Self> {
        self.params.set_end(bound_node(&value)?, name, false)?;
        self.validated()
    }

    pub fn limit_to_first(mut self, limit: u32) -> DatabaseResult<Self> {
        self.params.set_limit(QueryLimit::First(limit))?;
        Ok(self)
    }

    pub fn limit_to_last(mut self, limit: u32) -> DatabaseResult<Self> {
        self.params.set_limit(QueryLimit::Last(limit))?;
        Ok(self)
    }

    pub fn equal_to(self, value: Value) -> DatabaseResult<Self> {
        self.equal_to_with_key(value, None)
    }

    pub fn equal_to_with_key(mut self, value: Value, name: Option<String>) -> DatabaseResult<Self> {
        let node = bound_node(&value)?;
        self.params.set_start(node.clone(), name.clone(), true)?;
        self.params.set_end(node, name, true)?;
        self.validated()
    }

    /// Bounds must fit the ordering: keys are strings, priorities are never booleans.
    fn validated(self) -> DatabaseResult<Self> {
        let bounds = [self.params.start.as_ref(), self.params.end.as_ref()];
        match self.params.index {
            Index::Key => {
                for bound in bounds.into_iter().flatten() {
                    if bound.name.is_some() {
                        return Err(invalid_argument(
                            "When ordering by key, only one argument may be passed to startAt(), endAt() or equalTo()",
                        ));
                    }
                    if !matches!(bound.value.val(), Value::String(_)) {
                        return Err(invalid_argument(
                            "When ordering by key, the value of startAt(), endAt() or equalTo() must be a string",
                        ));
                    }
                }
            }
            Index::Priority => {
                for bound in bounds.into_iter().flatten() {
                    if matches!(bound.value.val(), Value::Bool(_)) {
                        return Err(invalid_argument(
                            "When ordering by priority, query bounds must be a string, number, or null",
                        ));
                    }
                }
            }
            _ => {}
        }
        Ok(self)
    }

    pub async fn get_async(&self) -> DatabaseResult<DataSnapshot> {
        self.reference.database.get_once(self.spec()).await
    }

    pub fn get(&self) -> DatabaseResult<DataSnapshot> {
        self.reference.database.get_once_blocking(self.spec())
    }

    pub fn on_value<F>(&self, callback: F) -> ListenerRegistration
    where
        F: Fn(DatabaseResult<DataSnapshot>) + Send + Sync + 'static,
    {
        self.reference.database.on_value_at(self.spec(), callback)
    }

    pub fn on_child_added<F>(&self, callback: F) -> ListenerRegistration
    where
        F: Fn(DatabaseResult<ChildEvent>) + Send + Sync + 'static,
    {
        self.reference
            .database
            .on_child_at(self.spec(), EventType::ChildAdded, callback)
    }

    pub fn on_child_changed<F>(&self, callback: F) -> ListenerRegistration
    where
        F: Fn(DatabaseResult<ChildEvent>) + Send + Sync + 'static,
    {
        self.reference
            .database
            .on_child_at(self.spec(), EventType::ChildChanged, callback)
    }

    pub fn on_child_removed<F>(&self, callback: F) -> ListenerRegistration
    where
        F: Fn(DatabaseResult<ChildEvent>) + Send + Sync + 'static,
    {
        self.reference
            .database
            .on_child_at(self.spec(), EventType::ChildRemoved, callback)
    }

    pub fn on_child_moved<F>(&self, callback: F) -> ListenerRegistration
    where
        F: Fn(DatabaseResult<ChildEvent>) + Send + Sync + 'static,
    {
        self.reference
            .database
            .on_child_at(self.spec(), EventType::ChildMoved, callback)
    }
}

fn bound_node(value: &Value) -> DatabaseResult<Node> {
    let node = Node::from_json(value)?;
    if node.is_leaf() || node.is_empty() {
        Ok(node)
    } else {
        Err(invalid_argument(
            "Query bounds must be a string, number, boolean, or null",
        ))
    }
}

/// Parses update keys and rejects keys that overlap each other.
pub(crate) fn relative_updates(updates: Map<String, Value>) -> DatabaseResult<BTreeMap<Path, Value>> {
    let mut children = BTreeMap::new();
    for (key, value) in updates {
        let relative = Path::parse(&key)?;
        if relative.is_empty() {
            return Err(invalid_argument(
                "Database update path cannot reference the current location",
            ));
        }
        children.insert(relative, value);
    }
    let mut previous: Option<&Path> = None;
    for path in children.keys() {
        if let Some(ancestor) = previous.filter(|previous| previous.contains(path)) {
            return Err(invalid_argument(format!(
                "Update path '{ancestor}' is an ancestor of '{path}'"
            )));
        }
        previous = Some(path);
    }
    Ok(children)
}

pub(crate) fn validate_priority_value(priority: &Value) -> DatabaseResult<()> {
    match priority {
        Value::Null | Value::Number(_) | Value::String(_) => Ok(()),
        _ => Err(invalid_argument("Priority must be a string, number, or null")),
    }
}

pub(crate) fn pack_with_priority(value: Value, priority: Value) -> Value {
    let mut map = Map::with_capacity(2);
    map.insert(".value".to_string(), value);
    map.insert(".priority".to_string(), priority);
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::error::DatabaseErrorCode;
    use serde_json::json;

    fn database() -> (Database, Arc<InMemoryServer>) {
        Database::in_memory()
    }

    #[test]
    fn reference_navigation() {
        let (db, _server) = database();
        let reference = db.reference("/users/alice/").unwrap();
        assert_eq!(reference.key(), Some("alice"));
        assert_eq!(reference.path(), "/users/alice");
        assert_eq!(reference.parent().unwrap().key(), Some("users"));
        assert!(reference.root().key().is_none());
        assert!(db.root().parent().is_none());
        assert_eq!(
            reference.child("posts/1").unwrap().path(),
            "/users/alice/posts/1"
        );
        let err = db.reference("a/b.c").unwrap_err();
        assert_eq!(err.code, DatabaseErrorCode::InvalidPath);
    }

    #[test]
    fn set_and_get_round_trip_through_server() {
        let (db, server) = database();
        let reference = db.reference("items/one").unwrap();
        reference.set(json!({ "name": "one", "count": 1 })).unwrap();
        assert_eq!(server.value(&Path::parse("items/one").unwrap()), json!({ "name": "one", "count": 1 }));
        let snapshot = db.reference("items").unwrap().get().unwrap();
        assert_eq!(snapshot.value(), json!({ "one": { "name": "one", "count": 1 } }));
        assert_eq!(snapshot.size(), 1);
        assert!(snapshot.has_child("one/name").unwrap());
        assert_eq!(snapshot.child("one/count").unwrap().value(), json!(1));
    }

    #[test]
    fn update_rejects_overlapping_paths() {
        let (db, _server) = database();
        let reference = db.reference("a").unwrap();
        let mut updates = Map::new();
        updates.insert("b".into(), json!(1));
        updates.insert("b/c".into(), json!(2));
        let err = reference.update(updates).unwrap_err();
        assert_eq!(err.code, DatabaseErrorCode::InvalidArgument);

        let mut empty_key = Map::new();
        empty_key.insert("/".into(), json!(1));
        assert!(reference.update(empty_key).is_err());
    }

    #[test]
    fn priority_round_trips() {
        let (db, _server) = database();
        let reference = db.reference("ranked").unwrap();
        reference.set_with_priority(json!({ "x": 1 }), 10).unwrap();
        let snapshot = reference.get().unwrap();
        assert_eq!(snapshot.priority(), json!(10));
        assert_eq!(snapshot.to_json(), json!({ "x": 1, ".priority": 10 }));

        reference.set_priority("top").unwrap();
        assert_eq!(reference.get().unwrap().priority(), json!("top"));
        assert!(reference.set_priority(json!(true)).is_err());
    }

    #[test]
    fn push_keys_are_ordered() {
        let (db, _server) = database();
        let list = db.reference("list").unwrap();
        let first = list.push_with_value(json!("a")).unwrap();
        let second = list.push_with_value(json!("b")).unwrap();
        assert!(first.key().unwrap() < second.key().unwrap());
        let values: Vec<Value> = list
            .get()
            .unwrap()
            .children()
            .into_iter()
            .map(|child| child.value())
            .collect();
        assert_eq!(values, vec![json!("a"), json!("b")]);
    }

    #[test]
    fn query_validation() {
        let (db, _server) = database();
        let reference = db.reference("scores").unwrap();
        assert!(reference.order_by_key().unwrap().start_at(json!(1)).is_err());
        assert!(reference
            .order_by_priority()
            .unwrap()
            .equal_to(json!(true))
            .is_err());
        assert!(reference
            .order_by_value()
            .unwrap()
            .order_by_key()
            .is_err());
        assert!(reference.query().start_at(json!({ "a": 1 })).is_err());
        assert!(reference.query().limit_to_first(0).is_err());
        assert!(query(
            reference,
            [order_by_child("score"), start_at(10), limit_to_last(3)]
        )
        .is_ok());
    }

    #[test]
    fn listener_handles_detach() {
        let (db, server) = database();
        let reference = db.reference("counter").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let registration = reference.on_value(move |result| {
            sink.lock().unwrap().push(result.unwrap().value());
        });
        reference.set(json!(1)).unwrap();
        assert_eq!(server.active_listens(), 1);
        registration.detach();
        assert_eq!(server.active_listens(), 0);
        reference.set(json!(2)).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![Value::Null, json!(1)]);
    }
}
