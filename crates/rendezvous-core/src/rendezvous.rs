//! Rendezvous trait abstraction over an append-only, subscribe-by-path store.
//!
//! Implementations:
//! - `InMemoryRendezvous` - in-process store for tests and the demo
//! - Any hosted key-value broadcast service (external)
//!
//! Ordering contract for `subscribe_added` + `subscribe_initial_snapshot` on
//! the same path: every record existing when the subscription is made is
//! delivered (in any order among themselves) before the snapshot callback,
//! which itself fires before any record added later.

use crate::{ParticipantId, SharedKey};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RendezvousError {
    #[error("Invalid path: {0:?}")]
    InvalidPath(String),
}

pub type Result<T> = std::result::Result<T, RendezvousError>;

/// Identifier the store assigns to a published record.
pub type RecordId = String;

/// Invoked once per record added at a path, starting with the replay.
pub type RecordCallback = Box<dyn Fn(Value) + Send + Sync>;

/// Invoked once when the initial replay at a path is complete.
pub type SnapshotCallback = Box<dyn FnOnce() + Send>;

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving records,
/// drop it (or call `cancel`) to unsubscribe.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription with nothing to release (e.g. an already-fired one-shot).
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Broadcast store used to find the peer and carry negotiation messages.
#[async_trait]
pub trait Rendezvous: Send + Sync {
    /// Append a record at `path`. Returns the identifier of the new record.
    async fn publish(&self, path: &str, record: Value) -> Result<RecordId>;

    /// Subscribe to records added at `path`, replaying existing records first.
    fn subscribe_added(&self, path: &str, callback: RecordCallback) -> Result<Subscription>;

    /// Fire `callback` once, after the existing records at `path` have been
    /// delivered to subscribers and before any later record.
    fn subscribe_initial_snapshot(
        &self,
        path: &str,
        callback: SnapshotCallback,
    ) -> Result<Subscription>;

    /// Remove every record at `path`.
    async fn clear(&self, path: &str) -> Result<()>;

    /// Remove a single record. Removing an unknown record is not an error.
    async fn remove(&self, path: &str, id: &str) -> Result<()>;
}

/// Announcement path for a shared key: `<root>/<key>` or `<key>`.
pub fn announcement_path(root: Option<&str>, key: &SharedKey) -> String {
    match root {
        Some(root) if !root.is_empty() => format!("{}/{}", root.trim_end_matches('/'), key),
        _ => key.to_string(),
    }
}

/// Private signal path of a participant: `<root>/<id>`.
pub fn signal_path(root: &str, id: &ParticipantId) -> String {
    format!("{}/{}", root.trim_end_matches('/'), id)
}

fn check_path(path: &str) -> Result<()> {
    if path.is_empty() || path.split('/').any(str::is_empty) {
        return Err(RendezvousError::InvalidPath(path.to_string()));
    }
    Ok(())
}

type SharedCallback = Arc<dyn Fn(Value) + Send + Sync>;

#[derive(Default)]
struct PathEntry {
    records: Vec<(RecordId, Value)>,
    subscribers: Vec<(usize, SharedCallback)>,
}

#[derive(Default)]
struct Inner {
    paths: Mutex<HashMap<String, PathEntry>>,
    /// Held while a mutation and its deliveries run, so callbacks observe
    /// records in store order. Callbacks must not call back into the store.
    delivery: Mutex<()>,
    next_subscriber: AtomicUsize,
}

impl Inner {
    fn unsubscribe(&self, path: &str, id: usize) {
        let mut paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = paths.get_mut(path) {
            entry.subscribers.retain(|(i, _)| *i != id);
        }
    }
}

/// In-memory rendezvous store.
///
/// Cheap to clone; clones share the same records and subscribers, so one
/// instance can be handed to several participants in the same process.
#[derive(Clone, Default)]
pub struct InMemoryRendezvous {
    inner: Arc<Inner>,
}

impl InMemoryRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records currently stored at `path`, in insertion order.
    pub fn records(&self, path: &str) -> Vec<Value> {
        let paths = self.inner.paths.lock().unwrap_or_else(|e| e.into_inner());
        paths
            .get(path)
            .map(|entry| entry.records.iter().map(|(_, v)| v.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of live `subscribe_added` subscriptions at `path`.
    pub fn subscriber_count(&self, path: &str) -> usize {
        let paths = self.inner.paths.lock().unwrap_or_else(|e| e.into_inner());
        paths.get(path).map(|e| e.subscribers.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Rendezvous for InMemoryRendezvous {
    async fn publish(&self, path: &str, record: Value) -> Result<RecordId> {
        check_path(path)?;
        let _delivery = self.inner.delivery.lock().unwrap_or_else(|e| e.into_inner());

        let id = uuid::Uuid::new_v4().to_string();
        let subscribers: Vec<SharedCallback> = {
            let mut paths = self.inner.paths.lock().unwrap_or_else(|e| e.into_inner());
            let entry = paths.entry(path.to_string()).or_default();
            entry.records.push((id.clone(), record.clone()));
            entry.subscribers.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };

        for callback in subscribers {
            callback(record.clone());
        }
        Ok(id)
    }

    fn subscribe_added(&self, path: &str, callback: RecordCallback) -> Result<Subscription> {
        check_path(path)?;
        let _delivery = self.inner.delivery.lock().unwrap_or_else(|e| e.into_inner());

        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let callback: SharedCallback = Arc::from(callback);
        let existing: Vec<Value> = {
            let mut paths = self.inner.paths.lock().unwrap_or_else(|e| e.into_inner());
            let entry = paths.entry(path.to_string()).or_default();
            entry.subscribers.push((id, Arc::clone(&callback)));
            entry.records.iter().map(|(_, v)| v.clone()).collect()
        };

        for record in existing {
            callback(record);
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let path = path.to_string();
        Ok(Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.unsubscribe(&path, id);
            }
        }))
    }

    fn subscribe_initial_snapshot(
        &self,
        path: &str,
        callback: SnapshotCallback,
    ) -> Result<Subscription> {
        check_path(path)?;
        // Replays happen synchronously inside `subscribe_added`, so the
        // snapshot is complete as soon as we hold the delivery lock.
        let _delivery = self.inner.delivery.lock().unwrap_or_else(|e| e.into_inner());
        callback();
        Ok(Subscription::noop())
    }

    async fn clear(&self, path: &str) -> Result<()> {
        check_path(path)?;
        let mut paths = self.inner.paths.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = paths.get_mut(path) {
            entry.records.clear();
        }
        Ok(())
    }

    async fn remove(&self, path: &str, id: &str) -> Result<()> {
        check_path(path)?;
        let mut paths = self.inner.paths.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = paths.get_mut(path) {
            entry.records.retain(|(record_id, _)| record_id != id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collector() -> (Arc<Mutex<Vec<Value>>>, RecordCallback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: RecordCallback = Box::new(move |v| sink.lock().unwrap().push(v));
        (seen, callback)
    }

    #[test]
    fn test_paths() {
        let key = SharedKey::new("K").unwrap();
        assert_eq!(announcement_path(None, &key), "K");
        assert_eq!(announcement_path(Some("rooms/"), &key), "rooms/K");
        assert_eq!(announcement_path(Some(""), &key), "K");

        let id: ParticipantId = "A".parse().unwrap();
        assert_eq!(signal_path("messages", &id), "messages/A");
    }

    #[tokio::test]
    async fn test_invalid_path() {
        let store = InMemoryRendezvous::new();
        assert!(matches!(
            store.publish("", json!(1)).await,
            Err(RendezvousError::InvalidPath(_))
        ));
        assert!(store.publish("a//b", json!(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_replay_then_live() {
        let store = InMemoryRendezvous::new();
        store.publish("room", json!({ "id": "A" })).await.unwrap();

        let (seen, callback) = collector();
        let _sub = store.subscribe_added("room", callback).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![json!({ "id": "A" })]);

        store.publish("room", json!({ "id": "B" })).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_fires_after_replay() {
        let store = InMemoryRendezvous::new();
        store.publish("room", json!({ "id": "A" })).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let added = Arc::clone(&order);
        let _sub = store
            .subscribe_added(
                "room",
                Box::new(move |v| added.lock().unwrap().push(v["id"].to_string())),
            )
            .unwrap();
        let snapshot = Arc::clone(&order);
        let _once = store
            .subscribe_initial_snapshot(
                "room",
                Box::new(move || snapshot.lock().unwrap().push("snapshot".into())),
            )
            .unwrap();
        store.publish("room", json!({ "id": "B" })).await.unwrap();

        assert_eq!(
            *order.lock().unwrap(),
            vec!["\"A\"".to_string(), "snapshot".into(), "\"B\"".into()]
        );
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let store = InMemoryRendezvous::new();
        let (seen, callback) = collector();
        let sub = store.subscribe_added("room", callback).unwrap();
        assert_eq!(store.subscriber_count("room"), 1);

        drop(sub);
        assert_eq!(store.subscriber_count("room"), 0);

        store.publish("room", json!(1)).await.unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_removes_records_but_keeps_subscribers() {
        let store = InMemoryRendezvous::new();
        let (seen, callback) = collector();
        let _sub = store.subscribe_added("room", callback).unwrap();

        store.publish("room", json!(1)).await.unwrap();
        store.clear("room").await.unwrap();
        assert!(store.records("room").is_empty());

        store.publish("room", json!(2)).await.unwrap();
        assert_eq!(store.records("room"), vec![json!(2)]);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_remove_single_record() {
        let store = InMemoryRendezvous::new();
        let first = store.publish("room", json!(1)).await.unwrap();
        store.publish("room", json!(2)).await.unwrap();

        store.remove("room", &first).await.unwrap();
        assert_eq!(store.records("room"), vec![json!(2)]);

        // Unknown ids are ignored
        store.remove("room", "missing").await.unwrap();
        assert_eq!(store.records("room").len(), 1);
    }

    #[test]
    fn test_subscription_cancel_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let sub = Subscription::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        sub.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
