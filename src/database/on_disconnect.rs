use serde_json::{Map, Value};

use crate::database::api::{
    await_completion, completion_channel, pack_with_priority, relative_updates, validate_priority_value,
    wait_for_completion, PendingWrite,
};
use crate::database::error::DatabaseResult;
use crate::database::DatabaseReference;

/// Writes the server performs at a location once this client disconnects.
///
/// Each call resolves when the server has recorded the write; the client
/// keeps its own copy so local listeners see the same result when
/// [`Database::connection_lost`](crate::database::Database::connection_lost) runs.
#[derive(Clone, Debug)]
pub struct OnDisconnect {
    reference: DatabaseReference,
}

impl OnDisconnect {
    pub(crate) fn new(reference: DatabaseReference) -> Self {
        Self { reference }
    }

    fn begin_set(&self, value: Value) -> DatabaseResult<PendingWrite> {
        let (on_complete, receiver) = completion_channel();
        self.reference
            .database()
            .repo()
            .on_disconnect_set(self.reference.path_ref(), value, on_complete)?;
        Ok(receiver)
    }

    fn begin_update(&self, updates: Map<String, Value>) -> DatabaseResult<PendingWrite> {
        let children = relative_updates(updates)?;
        let (on_complete, receiver) = completion_channel();
        self.reference
            .database()
            .repo()
            .on_disconnect_update(self.reference.path_ref(), children, on_complete)?;
        Ok(receiver)
    }

    fn begin_cancel(&self) -> PendingWrite {
        let (on_complete, receiver) = completion_channel();
        self.reference
            .database()
            .repo()
            .on_disconnect_cancel(self.reference.path_ref(), on_complete);
        receiver
    }

    pub async fn set_async(&self, value: Value) -> DatabaseResult<()> {
        await_completion(self.begin_set(value)?).await
    }

    pub fn set(&self, value: Value) -> DatabaseResult<()> {
        wait_for_completion(self.begin_set(value)?)
    }

    pub async fn set_with_priority_async(&self, value: Value, priority: Value) -> DatabaseResult<()> {
        validate_priority_value(&priority)?;
        self.set_async(pack_with_priority(value, priority)).await
    }

    pub fn set_with_priority(&self, value: Value, priority: Value) -> DatabaseResult<()> {
        validate_priority_value(&priority)?;
        self.set(pack_with_priority(value, priority))
    }

    /// Keys are paths relative to this location.
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

    /// Drops every on-disconnect write at or below this location.
    pub async fn cancel_async(&self) -> DatabaseResult<()> {
        await_completion(self.begin_cancel()).await
    }

    pub fn cancel(&self) -> DatabaseResult<()> {
        wait_for_completion(self.begin_cancel())
    }
}

#[cfg(test)]
mod tests {
    use crate::database::core::path::Path;
    use crate::database::Database;
    use serde_json::{json, Map, Value};
    use std::sync::{Arc, Mutex};

    #[test]
    fn server_and_client_agree_after_disconnect() {
        let (db, server) = Database::in_memory();
        let presence = db.reference("presence/me").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _registration = presence.on_value(move |result| {
            sink.lock().unwrap().push(result.unwrap().value());
        });
        presence.set(json!({ "online": true })).unwrap();

        let hook = presence.on_disconnect();
        hook.set(json!({ "online": false, "since": 1 })).unwrap();
        let mut updates = Map::new();
        updates.insert("device".into(), json!("laptop"));
        hook.update(updates).unwrap();
        presence.child("since").unwrap().on_disconnect().cancel().unwrap();

        server.disconnect();
        db.connection_lost();

        let expected = json!({ "online": false, "device": "laptop" });
        assert_eq!(server.value(&Path::parse("presence/me").unwrap()), expected);
        assert_eq!(seen.lock().unwrap().last(), Some(&expected));
    }

    #[test]
    fn remove_and_cancel() {
        let (db, server) = Database::in_memory();
        let reference = db.reference("temp").unwrap();
        reference.set(json!("here")).unwrap();
        reference.on_disconnect().remove().unwrap();
        server.disconnect();
        assert_eq!(server.value(&Path::parse("temp").unwrap()), Value::Null);

        let other = db.reference("kept").unwrap();
        other.set(json!(1)).unwrap();
        other.on_disconnect().set(json!(2)).unwrap();
        other.on_disconnect().cancel().unwrap();
        server.disconnect();
        assert_eq!(server.value(&Path::parse("kept").unwrap()), json!(1));
    }
}
