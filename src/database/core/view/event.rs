use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::database::core::path::Path;
use crate::database::core::snap::{Index, Node};
use crate::database::error::DatabaseError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    ChildRemoved,
    ChildAdded,
    ChildMoved,
    ChildChanged,
    Value,
}

impl EventType {
    /// Order in which event types of one operation are raised.
    pub const RAISE_ORDER: [EventType; 5] = [
        EventType::ChildRemoved,
        EventType::ChildAdded,
        EventType::ChildMoved,
        EventType::ChildChanged,
        EventType::Value,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ChildRemoved => "child_removed",
            EventType::ChildAdded => "child_added",
            EventType::ChildMoved => "child_moved",
            EventType::ChildChanged => "child_changed",
            EventType::Value => "value",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change delivered to a registration.
#[derive(Clone, Debug)]
pub struct DataEvent {
    pub event_type: EventType,
    /// Location of `node`: the view path for value events, the child path otherwise.
    pub path: Path,
    pub node: Node,
    /// Ordering of the query the event was produced for.
    pub index: Index,
    pub previous_name: Option<String>,
}

pub type DataCallback = Arc<dyn Fn(DataEvent) + Send + Sync>;
pub type CancelCallback = Arc<dyn Fn(DatabaseError) + Send + Sync>;

/// A listener attached to a view.
///
/// Clones share the same liveness flag, so a registration removed while
/// events for it are still queued never fires again.
#[derive(Clone)]
pub struct EventRegistration {
    id: u64,
    event_type: EventType,
    callback: DataCallback,
    cancel: Option<CancelCallback>,
    live: Arc<AtomicBool>,
}

impl EventRegistration {
    pub fn new(
        id: u64,
        event_type: EventType,
        callback: DataCallback,
        cancel: Option<CancelCallback>,
    ) -> Self {
        Self {
            id,
            event_type,
            callback,
            cancel,
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn responds_to(&self, event_type: EventType) -> bool {
        self.event_type == event_type
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn deactivate(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    pub(crate) fn fire(&self, event: DataEvent) {
        if self.is_live() {
            (self.callback)(event);
        }
    }

    pub(crate) fn fire_cancel(&self, error: DatabaseError) {
        if let Some(cancel) = &self.cancel {
            cancel(error);
        }
    }
}

impl fmt::Debug for EventRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRegistration")
            .field("id", &self.id)
            .field("event_type", &self.event_type)
            .field("live", &self.is_live())
            .finish()
    }
}

#[derive(Clone, Debug)]
pub enum EventPayload {
    Data(DataEvent),
    Cancel(DatabaseError),
}

/// An event bound to the registration it must be delivered to.
#[derive(Clone, Debug)]
pub struct QueuedEvent {
    pub registration: EventRegistration,
    pub payload: EventPayload,
}

impl QueuedEvent {
    pub fn data(registration: &EventRegistration, event: DataEvent) -> Self {
        Self {
            registration: registration.clone(),
            payload: EventPayload::Data(event),
        }
    }

    pub fn cancel(registration: &EventRegistration, error: DatabaseError) -> Self {
        Self {
            registration: registration.clone(),
            payload: EventPayload::Cancel(error),
        }
    }

    /// Location the event refers to.
    pub fn path(&self) -> Option<&Path> {
        match &self.payload {
            EventPayload::Data(event) => Some(&event.path),
            EventPayload::Cancel(_) => None,
        }
    }

    pub fn raise(self) {
        match self.payload {
            EventPayload::Data(event) => self.registration.fire(event),
            EventPayload::Cancel(error) => self.registration.fire_cancel(error),
        }
    }
}
