use firebase_rtdb_core::database::core::server_actions::{ListenRequest, StatusCallback};
use firebase_rtdb_core::database::core::view::QuerySpec;
use firebase_rtdb_core::database::core::Path;
use firebase_rtdb_core::database::{
    increment, server_timestamp, Database, DatabaseErrorCode, DatabaseReference, ListenerRegistration,
    ServerActions, ServerMessage, ServerStatus,
};
use futures::FutureExt;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

type Log = Arc<Mutex<Vec<(&'static str, String, Value)>>>;

fn record_children(reference: &DatabaseReference, log: &Log) -> Vec<ListenerRegistration> {
    let added = Arc::clone(log);
    let changed = Arc::clone(log);
    let removed = Arc::clone(log);
    vec![
        reference.on_child_added(move |result| {
            let event = result.unwrap();
            let key = event.snapshot.key().unwrap().to_string();
            added.lock().unwrap().push(("added", key, event.snapshot.value()));
        }),
        reference.on_child_changed(move |result| {
            let event = result.unwrap();
            let key = event.snapshot.key().unwrap().to_string();
            changed.lock().unwrap().push(("changed", key, event.snapshot.value()));
        }),
        reference.on_child_removed(move |result| {
            let event = result.unwrap();
            let key = event.snapshot.key().unwrap().to_string();
            removed.lock().unwrap().push(("removed", key, event.snapshot.value()));
        }),
    ]
}

fn entry(kind: &'static str, key: &str, value: Value) -> (&'static str, String, Value) {
    (kind, key.to_string(), value)
}

#[test]
fn changing_one_child_only_reports_that_child() {
    let (database, server) = Database::in_memory();
    server
        .set_remote(&Path::empty(), json!({ "a": 1, "b": 2 }))
        .unwrap();

    let log: Log = Arc::default();
    let _registrations = record_children(&database.root(), &log);
    log.lock().unwrap().clear();

    database.reference("a").unwrap().set(json!(3)).unwrap();
    assert_eq!(*log.lock().unwrap(), vec![entry("changed", "a", json!(3))]);

    database.reference("a").unwrap().set(json!(3)).unwrap();
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[test]
fn limited_window_evicts_the_last_child() {
    let (database, server) = Database::in_memory();
    server
        .set_remote(&Path::parse("list").unwrap(), json!({ "x": 1, "y": 2 }))
        .unwrap();

    let list = database.reference("list").unwrap();
    let window = list.query().limit_to_first(2).unwrap();

    let log: Arc<Mutex<Vec<(&'static str, String, Option<String>)>>> = Arc::default();
    let added_log = Arc::clone(&log);
    let _added = window.on_child_added(move |result| {
        let event = result.unwrap();
        added_log.lock().unwrap().push((
            "added",
            event.snapshot.key().unwrap().to_string(),
            event.previous_name,
        ));
    });
    let removed_log = Arc::clone(&log);
    let _removed = window.on_child_removed(move |result| {
        let event = result.unwrap();
        removed_log
            .lock()
            .unwrap()
            .push(("removed", event.snapshot.key().unwrap().to_string(), None));
    });

    list.child("w").unwrap().set(json!(0)).unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            ("added", "x".to_string(), None),
            ("added", "y".to_string(), Some("x".to_string())),
            ("removed", "y".to_string(), None),
            ("added", "w".to_string(), None),
        ]
    );
    assert_eq!(
        window.get().unwrap().value(),
        json!({ "w": 0, "x": 1 })
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn matching_ack_raises_no_further_events() {
    let (database, server) = Database::in_memory();
    let reference = database.reference("a").unwrap();

    let values: Arc<Mutex<Vec<Value>>> = Arc::default();
    let captured = Arc::clone(&values);
    let _registration = reference.on_value(move |result| {
        captured.lock().unwrap().push(result.unwrap().value());
    });

    server.hold();
    let mut write = Box::pin(reference.set_async(json!(5)));
    assert!(write.as_mut().now_or_never().is_none());
    assert_eq!(*values.lock().unwrap(), vec![Value::Null, json!(5)]);

    server.release();
    write.await.unwrap();
    assert_eq!(*values.lock().unwrap(), vec![Value::Null, json!(5)]);
    assert_eq!(server.value(&Path::parse("a").unwrap()), json!(5));
}

#[tokio::test(flavor = "multi_thread")]
async fn pending_write_shadows_stale_server_data() {
    let (database, server) = Database::in_memory();
    server.set_remote(&Path::empty(), json!({ "a": 1 })).unwrap();

    let log: Log = Arc::default();
    let _registrations = record_children(&database.root(), &log);

    server.hold();
    let a = database.reference("a").unwrap();
    let mut write = Box::pin(a.set_async(json!(5)));
    assert!(write.as_mut().now_or_never().is_none());

    database
        .handle_server_message(ServerMessage::overwrite(
            &Path::empty(),
            json!({ "a": 1, "b": 9 }),
            None,
        ))
        .unwrap();

    assert_eq!(a.get().unwrap().value(), json!(5));

    server.release();
    write.await.unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            entry("added", "a", json!(1)),
            entry("changed", "a", json!(5)),
            entry("added", "b", json!(9)),
        ]
    );
}

#[derive(Default)]
struct RejectingServer {
    fail_listens: bool,
    unlistens: Mutex<Vec<QuerySpec>>,
}

impl ServerActions for RejectingServer {
    fn listen(&self, _request: ListenRequest, on_complete: StatusCallback) {
        if self.fail_listens {
            on_complete(ServerStatus::error("permission_denied"));
        } else {
            on_complete(ServerStatus::Ok);
        }
    }

    fn unlisten(&self, query: &QuerySpec, _tag: Option<u64>) {
        self.unlistens.lock().unwrap().push(query.clone());
    }

    fn put(&self, _path: &Path, _data: Value, _hash: Option<String>, on_complete: StatusCallback) {
        on_complete(ServerStatus::error("permission_denied"));
    }

    fn merge(&self, _path: &Path, _data: Value, on_complete: StatusCallback) {
        on_complete(ServerStatus::error("permission_denied"));
    }

    fn on_disconnect_put(&self, _path: &Path, _data: Value, on_complete: StatusCallback) {
        on_complete(ServerStatus::error("permission_denied"));
    }

    fn on_disconnect_merge(&self, _path: &Path, _data: Value, on_complete: StatusCallback) {
        on_complete(ServerStatus::error("permission_denied"));
    }

    fn on_disconnect_cancel(&self, _path: &Path, on_complete: StatusCallback) {
        on_complete(ServerStatus::Ok);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_write_is_rolled_back() {
    let database = Database::new(Arc::new(RejectingServer::default()));
    let reference = database.reference("secret").unwrap();

    let values: Arc<Mutex<Vec<Value>>> = Arc::default();
    let captured = Arc::clone(&values);
    let _registration = reference.on_value(move |result| {
        captured.lock().unwrap().push(result.unwrap().value());
    });

    let err = reference.set_async(json!(5)).await.unwrap_err();
    assert_eq!(err.code, DatabaseErrorCode::PermissionDenied);
    assert_eq!(*values.lock().unwrap(), vec![Value::Null, json!(5), Value::Null]);

    let mut updates = serde_json::Map::new();
    updates.insert("x".to_string(), json!(1));
    let err = reference.update_async(updates).await.unwrap_err();
    assert_eq!(err.code, DatabaseErrorCode::PermissionDenied);
    assert_eq!(reference.get().unwrap().value(), Value::Null);
}

#[test]
fn failed_listen_cancels_the_listener() {
    let server = Arc::new(RejectingServer {
        fail_listens: true,
        ..Default::default()
    });
    let database = Database::new(server.clone());
    let reference = database.reference("private").unwrap();

    let outcomes: Arc<Mutex<Vec<Result<Value, DatabaseErrorCode>>>> = Arc::default();
    let captured = Arc::clone(&outcomes);
    let registration = reference.on_value(move |result| {
        captured
            .lock()
            .unwrap()
            .push(result.map(|snapshot| snapshot.value()).map_err(|err| err.code));
    });

    assert_eq!(
        *outcomes.lock().unwrap(),
        vec![Err(DatabaseErrorCode::PermissionDenied)]
    );
    registration.detach();
    assert!(server.unlistens.lock().unwrap().is_empty());
}

#[test]
fn server_values_resolve_locally_and_on_the_server() {
    let (database, server) = Database::in_memory();
    let before = database.server_time();

    let stamp = database.reference("meta/updated").unwrap();
    stamp.set(server_timestamp()).unwrap();
    let stored = server.value(&Path::parse("meta/updated").unwrap());
    assert!(stored.as_i64().unwrap() >= before);
    assert_eq!(stamp.get().unwrap().value(), stored);

    let counter = database.reference("meta/count").unwrap();
    counter.set(json!(5)).unwrap();
    counter.set(increment(2.0)).unwrap();
    assert_eq!(counter.get().unwrap().value(), json!(7));
    assert_eq!(server.value(&Path::parse("meta/count").unwrap()), json!(7));
}

#[test]
fn on_disconnect_writes_reach_listeners_when_the_connection_drops() {
    let (database, server) = Database::in_memory();
    let presence = database.reference("presence/ada").unwrap();
    presence.set(json!("online")).unwrap();

    let values: Arc<Mutex<Vec<Value>>> = Arc::default();
    let captured = Arc::clone(&values);
    let _registration = presence.on_value(move |result| {
        captured.lock().unwrap().push(result.unwrap().value());
    });

    presence.on_disconnect().set(json!("offline")).unwrap();
    assert_eq!(*values.lock().unwrap(), vec![json!("online")]);

    server.disconnect();
    database.connection_lost();

    assert_eq!(*values.lock().unwrap(), vec![json!("online"), json!("offline")]);
    assert_eq!(
        server.value(&Path::parse("presence/ada").unwrap()),
        json!("offline")
    );
}
