use firebase_rtdb_core::database::{Database, ListenerRegistration};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

#[tokio::test(flavor = "multi_thread")]
async fn value_listener_emits_initial_and_updates() {
    let (database, _server) = Database::in_memory();
    let reference = database.reference("counters/main").unwrap();

    let events: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let captured = events.clone();

    let registration = reference.on_value(move |result| {
        if let Ok(snapshot) = result {
            captured.lock().unwrap().push(snapshot.value());
        }
    });

    reference.set_async(json!(1)).await.unwrap();
    reference.set_async(json!(2)).await.unwrap();

    {
        let events = events.lock().unwrap();
        assert_eq!(events.as_slice(), &[Value::Null, json!(1), json!(2)]);
    }

    registration.detach();
}

#[tokio::test(flavor = "multi_thread")]
async fn child_added_listener_reports_new_children() {
    let (database, _server) = Database::in_memory();
    let list = database.reference("lists/default").unwrap();

    let events: Arc<Mutex<Vec<(Value, Option<String>)>>> = Arc::new(Mutex::new(Vec::new()));
    let captured = events.clone();

    let registration = list.on_child_added(move |result| {
        if let Ok(event) = result {
            captured
                .lock()
                .unwrap()
                .push((event.snapshot.into_value(), event.previous_name));
        }
    });

    list.child("first").unwrap().set_async(json!("alpha")).await.unwrap();
    list.child("second").unwrap().set_async(json!("beta")).await.unwrap();

    let events = events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            (json!("alpha"), None),
            (json!("beta"), Some("first".to_string())),
        ]
    );

    registration.detach();
}

#[test]
fn child_changed_and_removed_carry_the_child_snapshot() {
    let (database, _server) = Database::in_memory();
    let tasks = database.reference("tasks").unwrap();
    tasks
        .set(json!({ "one": { "done": false }, "two": { "done": false } }))
        .unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    let changed_log = Arc::clone(&log);
    let _changed = tasks.on_child_changed(move |result| {
        let event = result.unwrap();
        changed_log.lock().unwrap().push((
            "changed",
            event.snapshot.key().unwrap().to_string(),
            event.snapshot.value(),
        ));
    });
    let removed_log = Arc::clone(&log);
    let _removed = tasks.on_child_removed(move |result| {
        let event = result.unwrap();
        removed_log.lock().unwrap().push((
            "removed",
            event.snapshot.key().unwrap().to_string(),
            event.snapshot.value(),
        ));
    });

    tasks.child("one/done").unwrap().set(json!(true)).unwrap();
    tasks.child("two").unwrap().remove().unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            ("changed", "one".to_string(), json!({ "done": true })),
            ("removed", "two".to_string(), json!({ "done": false })),
        ]
    );
}

#[test]
fn listener_can_detach_itself_while_events_are_raised() {
    let (database, _server) = Database::in_memory();
    let reference = database.reference("ticks").unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let slot: Arc<Mutex<Option<ListenerRegistration>>> = Arc::new(Mutex::new(None));
    let captured = Arc::clone(&seen);
    let own_slot = Arc::clone(&slot);
    let registration = reference.on_value(move |result| {
        let value = result.unwrap().value();
        captured.lock().unwrap().push(value.clone());
        if value == json!(2) {
            if let Some(registration) = own_slot.lock().unwrap().take() {
                registration.detach();
            }
        }
    });
    *slot.lock().unwrap() = Some(registration);

    for tick in 1..=3 {
        reference.set(json!(tick)).unwrap();
    }
    assert_eq!(*seen.lock().unwrap(), vec![Value::Null, json!(1), json!(2)]);
}

#[test]
fn writes_made_from_a_listener_are_delivered_after_it_returns() {
    let (database, _server) = Database::in_memory();
    let inbox = database.reference("inbox").unwrap();
    let audit = database.reference("audit").unwrap();

    let audit_values = Arc::new(Mutex::new(Vec::new()));
    let captured = Arc::clone(&audit_values);
    let _audit = audit.on_value(move |result| {
        captured.lock().unwrap().push(result.unwrap().value());
    });

    let writer = audit.clone();
    let _inbox = inbox.on_child_added(move |result| {
        let event = result.unwrap();
        let key = event.snapshot.key().unwrap().to_string();
        writer.child(&key).unwrap().set(json!("seen")).unwrap();
    });

    inbox.child("m1").unwrap().set(json!("hello")).unwrap();

    assert_eq!(
        *audit_values.lock().unwrap(),
        vec![Value::Null, json!({ "m1": "seen" })]
    );
}

#[test]
fn dropping_the_registration_stops_the_listen() {
    let (database, server) = Database::in_memory();
    let reference = database.reference("watched").unwrap();
    {
        let _first = reference.on_value(|_| {});
        let _second = reference.on_value(|_| {});
        assert_eq!(server.active_listens(), 1);
    }
    assert_eq!(server.active_listens(), 0);
}

#[test]
fn concurrent_writers_leave_listeners_on_the_current_value() {
    let (database, _server) = Database::in_memory();
    let counter = database.reference("counter").unwrap();

    let seen: Arc<Mutex<Vec<Value>>> = Arc::default();
    let captured = Arc::clone(&seen);
    let _registration = counter.on_value(move |result| {
        captured.lock().unwrap().push(result.unwrap().value());
    });

    let writers: Vec<_> = (0..8)
        .map(|writer| {
            let counter = counter.clone();
            std::thread::spawn(move || {
                for round in 0..50 {
                    counter.set(json!(writer * 1000 + round)).unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let last = seen.lock().unwrap().last().cloned();
    let current: Arc<Mutex<Option<Value>>> = Arc::default();
    let captured = Arc::clone(&current);
    let latest = counter.on_value(move |result| {
        *captured.lock().unwrap() = Some(result.unwrap().value());
    });
    assert!(last.as_ref().is_some_and(Value::is_i64));
    assert_eq!(*current.lock().unwrap(), last);
    latest.detach();
}

#[test]
fn panicking_listener_does_not_silence_others() {
    let (database, _server) = Database::in_memory();
    let faulty = database.reference("faulty").unwrap();
    let healthy = database.reference("healthy").unwrap();

    let _faulty = faulty.on_value(|result| {
        if !result.unwrap().value().is_null() {
            panic!("listener failure");
        }
    });
    let seen: Arc<Mutex<Vec<Value>>> = Arc::default();
    let captured = Arc::clone(&seen);
    let _healthy = healthy.on_value(move |result| {
        captured.lock().unwrap().push(result.unwrap().value());
    });

    faulty.set(json!(1)).unwrap();
    healthy.set(json!("ok")).unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![Value::Null, json!("ok")]);
}
