//! Per-query materialized views and the events derived from them.

mod event;
mod event_generator;
mod event_queue;
mod filter;
mod query_params;

pub use event::{
    CancelCallback, DataCallback, DataEvent, EventPayload, EventRegistration, EventType,
    QueuedEvent,
};
pub use event_generator::{child_changes, generate_events, Change};
pub use event_queue::EventQueue;
pub use filter::NodeFilter;
pub use query_params::{QueryBound, QueryLimit, QueryParams, QuerySpec};

use crate::database::core::snap::Node;
use crate::database::error::DatabaseError;

/// What is currently known about the value under a view.
#[derive(Clone, Debug)]
pub enum ViewInput {
    /// The complete visible value.
    Complete(Node),
    /// Only these children are known; the value as a whole is not.
    Partial(Node),
}

/// The last value delivered for one query, plus the registrations listening to it.
#[derive(Debug)]
pub struct View {
    query: QuerySpec,
    filter: NodeFilter,
    registrations: Vec<EventRegistration>,
    event_cache: Node,
    complete: bool,
    /// Server data received for this query's own (tagged) listen.
    pub(crate) own_cache: Option<Node>,
    pub(crate) own_cache_complete: bool,
}

impl View {
    pub fn new(query: QuerySpec, input: ViewInput) -> Self {
        let filter = NodeFilter::new(&query.params);
        let (event_cache, complete) = match &input {
            ViewInput::Complete(node) => (filter.apply(node), true),
            ViewInput::Partial(node) => (filter.apply(node), false),
        };
        Self {
            query,
            filter,
            registrations: Vec::new(),
            event_cache,
            complete,
            own_cache: None,
            own_cache_complete: false,
        }
    }

    pub fn query(&self) -> &QuerySpec {
        &self.query
    }

    pub fn event_cache(&self) -> &Node {
        &self.event_cache
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn registrations(&self) -> &[EventRegistration] {
        &self.registrations
    }

    /// Server data this view should be built from when it has its own cache.
    pub(crate) fn own_server_cache(&self) -> Option<Option<&Node>> {
        self.own_cache
            .as_ref()
            .map(|cache| self.own_cache_complete.then_some(cache))
    }

    /// Adds `registration` and returns the events that bring it up to date:
    /// a `child_added` per child, then `value` if the view is complete.
    pub fn add_registration(&mut self, registration: EventRegistration) -> Vec<QueuedEvent> {
        let mut changes = Vec::new();
        if !self.event_cache.is_leaf() {
            for (name, node) in self.event_cache.children() {
                changes.push(Change::ChildAdded {
                    name: name.to_string(),
                    node: node.clone(),
                });
            }
        }
        if self.complete {
            changes.push(Change::Value(self.event_cache.clone()));
        }
        let events = generate_events(
            &self.query.path,
            &self.query.params.index,
            &changes,
            &self.event_cache,
            std::slice::from_ref(&registration),
        );
        self.registrations.push(registration);
        events
    }

    /// Removes one registration (or all of them when `id` is `None`).
    ///
    /// With a `cancel_error` every removed registration receives a cancel
    /// event. Removed registrations are deactivated immediately.
    pub fn remove_registration(
        &mut self,
        id: Option<u64>,
        cancel_error: Option<&DatabaseError>,
    ) -> Vec<QueuedEvent> {
        let (removed, kept): (Vec<_>, Vec<_>) = self
            .registrations
            .drain(..)
            .partition(|registration| id.map_or(true, |id| registration.id() == id));
        self.registrations = kept;
        let mut events = Vec::new();
        for registration in removed {
            if let Some(error) = cancel_error {
                events.push(QueuedEvent::cancel(&registration, error.clone()));
            }
            registration.deactivate();
        }
        events
    }

    pub fn has_registration(&self, id: u64) -> bool {
        self.registrations
            .iter()
            .any(|registration| registration.id() == id)
    }

    /// Re-materializes the view from `input` and returns the resulting events.
    pub fn update(&mut self, input: ViewInput) -> Vec<QueuedEvent> {
        let (node, complete) = match input {
            ViewInput::Complete(node) => (node, true),
            ViewInput::Partial(node) => (node, false),
        };
        let filtered = self.filter.apply(&node);
        let old = std::mem::replace(&mut self.event_cache, filtered);
        let was_complete = std::mem::replace(&mut self.complete, complete);

        let index = &self.query.params.index;
        let mut changes = if Node::ptr_eq(&old, &self.event_cache) {
            Vec::new()
        } else {
            child_changes(&old, &self.event_cache, index)
        };
        if complete {
            let new = &self.event_cache;
            let leaf_or_empty = new.is_leaf() || new.is_empty();
            let raise_value = !changes.is_empty()
                || !was_complete
                || (leaf_or_empty && *new != old)
                || new.priority() != old.priority();
            if raise_value {
                changes.push(Change::Value(new.clone()));
            }
        }
        if changes.is_empty() {
            return Vec::new();
        }
        generate_events(
            &self.query.path,
            index,
            &changes,
            &self.event_cache,
            &self.registrations,
        )
    }
}
