use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;

use crate::database::core::view::event::QueuedEvent;
use crate::database::LOGGER;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueuedEvent>,
    draining: bool,
}

/// Serializes event delivery.
///
/// Producers [`queue`](Self::queue) events while they still hold the lock
/// that ordered the change, then call [`raise_queued`](Self::raise_queued)
/// once it is released. Batches are delivered in the order they were queued,
/// by whichever caller is draining. Events caused by callbacks are appended
/// behind the ones already queued. A panicking callback is logged and does
/// not stop delivery of the rest.
#[derive(Default)]
pub struct EventQueue {
    state: Mutex<QueueState>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self, events: Vec<QueuedEvent>) {
        if events.is_empty() {
            return;
        }
        self.lock().pending.extend(events);
    }

    /// Delivers everything queued, unless another caller already is.
    pub fn raise_queued(&self) {
        {
            let mut state = self.lock();
            if state.draining || state.pending.is_empty() {
                return;
            }
            state.draining = true;
        }
        loop {
            let next = {
                let mut state = self.lock();
                match state.pending.pop_front() {
                    Some(event) => event,
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };
            let location = next.path().map(|path| path.to_string());
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| next.raise())) {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|text| text.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                LOGGER.error(format!(
                    "event callback for {} panicked: {reason}",
                    location.as_deref().unwrap_or("a cancelled listener")
                ));
            }
        }
    }

    pub fn raise(&self, events: Vec<QueuedEvent>) {
        self.queue(events);
        self.raise_queued();
    }

    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        !state.draining && state.pending.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::core::path::Path;
    use crate::database::core::snap::{Index, Node};
    use crate::database::core::view::event::{DataEvent, EventRegistration, EventType};
    use std::sync::{Arc, OnceLock};

    fn value_event(path: &str) -> DataEvent {
        DataEvent {
            event_type: EventType::Value,
            path: Path::parse(path).unwrap(),
            node: Node::empty(),
            index: Index::Priority,
            previous_name: None,
        }
    }

    #[test]
    fn events_raised_from_callbacks_run_after_current_batch() {
        let queue = Arc::new(EventQueue::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let follow_up: Arc<OnceLock<EventRegistration>> = Arc::new(OnceLock::new());

        let follow_log = Arc::clone(&log);
        let follower = EventRegistration::new(
            2,
            EventType::Value,
            Arc::new(move |event: DataEvent| follow_log.lock().unwrap().push(event.path.to_string())),
            None,
        );
        follow_up.set(follower).unwrap();

        let leader_log = Arc::clone(&log);
        let leader_queue = Arc::clone(&queue);
        let leader_follow = Arc::clone(&follow_up);
        let leader = EventRegistration::new(
            1,
            EventType::Value,
            Arc::new(move |event: DataEvent| {
                leader_log.lock().unwrap().push(event.path.to_string());
                if event.path.to_string() == "/first" {
                    let follower = leader_follow.get().unwrap();
                    leader_queue.raise(vec![QueuedEvent::data(follower, value_event("nested"))]);
                }
            }),
            None,
        );

        queue.raise(vec![
            QueuedEvent::data(&leader, value_event("first")),
            QueuedEvent::data(&leader, value_event("second")),
        ]);
        assert_eq!(*log.lock().unwrap(), vec!["/first", "/second", "/nested"]);
        assert!(queue.is_idle());
    }

    #[test]
    fn deactivated_registrations_are_skipped() {
        let queue = EventQueue::new();
        let hits = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&hits);
        let registration = EventRegistration::new(
            7,
            EventType::Value,
            Arc::new(move |_: DataEvent| *counter.lock().unwrap() += 1),
            None,
        );
        let pending = QueuedEvent::data(&registration, value_event("a"));
        registration.deactivate();
        queue.raise(vec![pending]);
        assert_eq!(*hits.lock().unwrap(), 0);
    }

    #[test]
    fn panicking_callback_does_not_stall_the_queue() {
        let queue = EventQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let faulty = EventRegistration::new(
            1,
            EventType::Value,
            Arc::new(|_: DataEvent| panic!("listener failed")),
            None,
        );
        let sink = Arc::clone(&log);
        let healthy = EventRegistration::new(
            2,
            EventType::Value,
            Arc::new(move |event: DataEvent| sink.lock().unwrap().push(event.path.to_string())),
            None,
        );

        queue.raise(vec![
            QueuedEvent::data(&faulty, value_event("a")),
            QueuedEvent::data(&healthy, value_event("b")),
        ]);
        assert!(queue.is_idle());
        queue.raise(vec![QueuedEvent::data(&healthy, value_event("c"))]);
        assert_eq!(*log.lock().unwrap(), vec!["/b", "/c"]);
    }

    #[test]
    fn queued_batches_wait_for_raise() {
        let queue = EventQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let registration = EventRegistration::new(
            3,
            EventType::Value,
            Arc::new(move |event: DataEvent| sink.lock().unwrap().push(event.path.to_string())),
            None,
        );
        queue.queue(vec![QueuedEvent::data(&registration, value_event("one"))]);
        queue.queue(vec![QueuedEvent::data(&registration, value_event("two"))]);
        assert!(log.lock().unwrap().is_empty());
        queue.raise_queued();
        assert_eq!(*log.lock().unwrap(), vec!["/one", "/two"]);
    }
}
