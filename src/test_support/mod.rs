//! Test utilities shared across crate-level unit tests.

use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

use crate::database::core::path::Path;
use crate::database::core::server_actions::{ListenRequest, ServerActions, ServerStatus, StatusCallback};
use crate::database::core::view::QuerySpec;

/// A call that is answered later by the test.
struct Pending<T> {
    call: T,
    on_complete: Option<StatusCallback>,
}

impl<T> Pending<T> {
    fn new(call: T, on_complete: StatusCallback) -> Self {
        Self {
            call,
            on_complete: Some(on_complete),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum OnDisconnectCall {
    Put(Path, Value),
    Merge(Path, Value),
    Cancel(Path),
}

/// Server stand-in that records every call and answers only when told to.
///
/// Replies run the stored callback after the recorder's lock is released,
/// so a callback may call back into the server.
#[derive(Default)]
pub struct RecordingServer {
    listens: Mutex<Vec<Pending<ListenRequest>>>,
    unlistens: Mutex<Vec<(QuerySpec, Option<u64>)>>,
    puts: Mutex<Vec<Pending<(Path, Value, Option<String>)>>>,
    merges: Mutex<Vec<Pending<(Path, Value)>>>,
    on_disconnect: Mutex<Vec<Pending<OnDisconnectCall>>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}

fn take_callback<T>(calls: &Mutex<Vec<Pending<T>>>, index: usize) -> StatusCallback {
    let mut calls = locked(calls);
    let pending = calls
        .get_mut(index)
        .unwrap_or_else(|| panic!("no recorded call #{index}"));
    pending
        .on_complete
        .take()
        .unwrap_or_else(|| panic!("call #{index} was already answered"))
}

impl RecordingServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn listens(&self) -> Vec<ListenRequest> {
        locked(&self.listens).iter().map(|p| p.call.clone()).collect()
    }

    pub fn unlistens(&self) -> Vec<(QuerySpec, Option<u64>)> {
        locked(&self.unlistens).clone()
    }

    pub fn puts(&self) -> Vec<(Path, Value, Option<String>)> {
        locked(&self.puts).iter().map(|p| p.call.clone()).collect()
    }

    pub fn merges(&self) -> Vec<(Path, Value)> {
        locked(&self.merges).iter().map(|p| p.call.clone()).collect()
    }

    pub fn on_disconnect_calls(&self) -> Vec<OnDisconnectCall> {
        locked(&self.on_disconnect).iter().map(|p| p.call.clone()).collect()
    }

    pub fn reply_listen(&self, index: usize, status: ServerStatus) {
        take_callback(&self.listens, index)(status);
    }

    pub fn reply_put(&self, index: usize, status: ServerStatus) {
        take_callback(&self.puts, index)(status);
    }

    pub fn reply_merge(&self, index: usize, status: ServerStatus) {
        take_callback(&self.merges, index)(status);
    }

    /// Answers the `index`th on-disconnect call, counting puts, merges and
    /// cancels together.
    pub fn reply_on_disconnect(&self, index: usize, status: ServerStatus) {
        take_callback(&self.on_disconnect, index)(status);
    }
}

impl ServerActions for RecordingServer {
    fn listen(&self, request: ListenRequest, on_complete: StatusCallback) {
        locked(&self.listens).push(Pending::new(request, on_complete));
    }

    fn unlisten(&self, query: &QuerySpec, tag: Option<u64>) {
        locked(&self.unlistens).push((query.clone(), tag));
    }

    fn put(&self, path: &Path, data: Value, hash: Option<String>, on_complete: StatusCallback) {
        locked(&self.puts).push(Pending::new((path.clone(), data, hash), on_complete));
    }

    fn merge(&self, path: &Path, data: Value, on_complete: StatusCallback) {
        locked(&self.merges).push(Pending::new((path.clone(), data), on_complete));
    }

    fn on_disconnect_put(&self, path: &Path, data: Value, on_complete: StatusCallback) {
        locked(&self.on_disconnect).push(Pending::new(OnDisconnectCall::Put(path.clone(), data), on_complete));
    }

    fn on_disconnect_merge(&self, path: &Path, data: Value, on_complete: StatusCallback) {
        locked(&self.on_disconnect).push(Pending::new(OnDisconnectCall::Merge(path.clone(), data), on_complete));
    }

    fn on_disconnect_cancel(&self, path: &Path, on_complete: StatusCallback) {
        locked(&self.on_disconnect).push(Pending::new(OnDisconnectCall::Cancel(path.clone()), on_complete));
    }
}
