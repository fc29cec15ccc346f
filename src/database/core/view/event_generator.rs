use std::collections::HashMap;

use crate::database::core::path::Path;
use crate::database::core::snap::{Index, NamedNode, Node};
use crate::database::core::view::event::{DataEvent, EventRegistration, EventType, QueuedEvent};

/// A single difference between two materialized values of a view.
#[derive(Clone, Debug, PartialEq)]
pub enum Change {
    ChildAdded { name: String, node: Node },
    ChildRemoved { name: String, node: Node },
    ChildChanged { name: String, node: Node, old: Node },
    ChildMoved { name: String, node: Node },
    Value(Node),
}

impl Change {
    pub fn event_type(&self) -> EventType {
        match self {
            Change::ChildAdded { .. } => EventType::ChildAdded,
            Change::ChildRemoved { .. } => EventType::ChildRemoved,
            Change::ChildChanged { .. } => EventType::ChildChanged,
            Change::ChildMoved { .. } => EventType::ChildMoved,
            Change::Value(_) => EventType::Value,
        }
    }

    fn named(&self) -> Option<NamedNode> {
        match self {
            Change::ChildAdded { name, node }
            | Change::ChildRemoved { name, node }
            | Change::ChildChanged { name, node, .. }
            | Change::ChildMoved { name, node } => Some(NamedNode::new(name.clone(), node.clone())),
            Change::Value(_) => None,
        }
    }
}

/// Child level differences between `old` and `new`.
///
/// A changed child whose indexed value changed also yields a move.
pub fn child_changes(old: &Node, new: &Node, index: &Index) -> Vec<Change> {
    let mut changes = Vec::new();
    for (name, old_child) in old.children() {
        if !new.has_child(name) {
            changes.push(Change::ChildRemoved {
                name: name.to_string(),
                node: old_child.clone(),
            });
        }
    }
    for (name, new_child) in new.children() {
        let old_child = old.immediate_child(name);
        if old_child.is_empty() {
            changes.push(Change::ChildAdded {
                name: name.to_string(),
                node: new_child.clone(),
            });
        } else if !Node::ptr_eq(&old_child, new_child) && old_child != *new_child {
            if index.indexed_value_changed(&old_child, new_child) {
                changes.push(Change::ChildMoved {
                    name: name.to_string(),
                    node: new_child.clone(),
                });
            }
            changes.push(Change::ChildChanged {
                name: name.to_string(),
                node: new_child.clone(),
                old: old_child,
            });
        }
    }
    changes
}

/// Turns changes into events for `registrations`.
///
/// Events are grouped by type (removed, added, moved, changed, value), sorted
/// by `index` within a type, and fanned out to every registration listening
/// for that type. `event_cache` is the view's new value; it supplies the
/// previous sibling names.
pub fn generate_events(
    view_path: &Path,
    index: &Index,
    changes: &[Change],
    event_cache: &Node,
    registrations: &[EventRegistration],
) -> Vec<QueuedEvent> {
    let predecessors: HashMap<String, Option<String>> = {
        let ordered = event_cache.ordered_children(index);
        let mut previous: Option<String> = None;
        let mut map = HashMap::with_capacity(ordered.len());
        for child in ordered {
            map.insert(child.name.clone(), previous.replace(child.name));
        }
        map
    };

    let mut events = Vec::new();
    for event_type in EventType::RAISE_ORDER {
        let mut of_type: Vec<&Change> = changes
            .iter()
            .filter(|change| change.event_type() == event_type)
            .collect();
        if of_type.is_empty() {
            continue;
        }
        of_type.sort_by(|a, b| match (a.named(), b.named()) {
            (Some(a), Some(b)) => index.compare(&a, &b),
            _ => std::cmp::Ordering::Equal,
        });
        for change in of_type {
            let event = materialize(view_path, index, change, &predecessors);
            for registration in registrations {
                if registration.responds_to(event_type) {
                    events.push(QueuedEvent::data(registration, event.clone()));
                }
            }
        }
    }
    events
}

fn materialize(
    view_path: &Path,
    index: &Index,
    change: &Change,
    predecessors: &HashMap<String, Option<String>>,
) -> DataEvent {
    let event_type = change.event_type();
    match change {
        Change::Value(node) => DataEvent {
            event_type,
            path: view_path.clone(),
            node: node.clone(),
            index: index.clone(),
            previous_name: None,
        },
        Change::ChildRemoved { name, node } => DataEvent {
            event_type,
            path: view_path.child(name),
            node: node.clone(),
            index: index.clone(),
            previous_name: None,
        },
        Change::ChildAdded { name, node }
        | Change::ChildChanged { name, node, .. }
        | Change::ChildMoved { name, node } => DataEvent {
            event_type,
            path: view_path.child(name),
            node: node.clone(),
            index: index.clone(),
            previous_name: predecessors.get(name).cloned().flatten(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use serde_json::{json, Value};

    fn node(value: Value) -> Node {
        Node::from_json(&value).unwrap()
    }

    fn recorder(
        id: u64,
        event_type: EventType,
        log: &Arc<Mutex<Vec<(u64, EventType, String, Option<String>)>>>,
    ) -> EventRegistration {
        let log = Arc::clone(log);
        EventRegistration::new(
            id,
            event_type,
            Arc::new(move |event: DataEvent| {
                let key = event.path.back().unwrap_or("").to_string();
                log.lock()
                    .unwrap()
                    .push((id, event.event_type, key, event.previous_name));
            }),
            None,
        )
    }

    #[test]
    fn unchanged_children_produce_no_changes() {
        let old = node(json!({ "a": { "b": 1 }, "c": 2 }));
        let new = old.update_child(&Path::parse("a/b").unwrap(), Node::leaf(1.0));
        assert!(child_changes(&old, &new, &Index::Priority).is_empty());
    }

    #[test]
    fn changed_child_with_new_order_is_moved() {
        let old = node(json!({ "a": 1, "b": 2 }));
        let new = node(json!({ "a": 3, "b": 2 }));
        let changes = child_changes(&old, &new, &Index::Value);
        assert_eq!(changes.len(), 2);
        assert!(matches!(changes[0], Change::ChildMoved { .. }));
        assert!(child_changes(&old, &new, &Index::Priority)
            .iter()
            .all(|change| change.event_type() == EventType::ChildChanged));
    }

    #[test]
    fn events_follow_type_order_then_index_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registrations = vec![
            recorder(1, EventType::ChildAdded, &log),
            recorder(2, EventType::ChildRemoved, &log),
            recorder(3, EventType::ChildAdded, &log),
        ];
        let old = node(json!({ "y": 2 }));
        let new = node(json!({ "w": 0, "x": 1 }));
        let changes = child_changes(&old, &new, &Index::Key);
        let view_path = Path::parse("list").unwrap();
        for event in generate_events(&view_path, &Index::Key, &changes, &new, &registrations) {
            event.raise();
        }
        let log = log.lock().unwrap();
        let seen: Vec<(u64, EventType, &str, Option<&str>)> = log
            .iter()
            .map(|(id, kind, key, prev)| (*id, *kind, key.as_str(), prev.as_deref()))
            .collect();
        assert_eq!(
            seen,
            vec![
                (2, EventType::ChildRemoved, "y", None),
                (1, EventType::ChildAdded, "w", None),
                (3, EventType::ChildAdded, "w", None),
                (1, EventType::ChildAdded, "x", Some("w")),
                (3, EventType::ChildAdded, "x", Some("w")),
            ]
        );
    }

    #[test]
    fn moves_follow_additions_they_may_point_at() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registrations = vec![
            recorder(1, EventType::ChildMoved, &log),
            recorder(2, EventType::ChildAdded, &log),
        ];
        let old = node(json!({ "a": 1, "b": 2 }));
        let new = node(json!({ "a": 3, "b": 2, "c": 0 }));
        let changes = child_changes(&old, &new, &Index::Value);
        let view_path = Path::parse("scores").unwrap();
        for event in generate_events(&view_path, &Index::Value, &changes, &new, &registrations) {
            event.raise();
        }
        let log = log.lock().unwrap();
        let seen: Vec<(u64, EventType, &str, Option<&str>)> = log
            .iter()
            .map(|(id, kind, key, prev)| (*id, *kind, key.as_str(), prev.as_deref()))
            .collect();
        assert_eq!(
            seen,
            vec![
                (2, EventType::ChildAdded, "c", None),
                (1, EventType::ChildMoved, "a", Some("b")),
            ]
        );
    }
}
