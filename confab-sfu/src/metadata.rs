//! Observable key/value attributes attachable to rooms and clients
//!
//! Listeners are bound to a [`CancellationToken`] scope. Every dispatch
//! re-checks the scope right before each call, so no call starts once the
//! cancellation is observed. A call that already started when another thread
//! cancels the scope runs to completion; cancelling does not wait for it.
//! A watcher task removes the entry from the listener list, and it also exits
//! when the store itself is dropped, so no task outlives either side.

use crate::error::{Result, SfuError};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Handle returned by [`Metadata::on_changed`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type ChangeCallback = Box<dyn Fn(&str, Option<&Value>) + Send + Sync>;

struct ListenerEntry {
    id: ListenerId,
    scope: CancellationToken,
    callback: ChangeCallback,
}

struct Inner {
    values: RwLock<HashMap<String, Value>>,
    listeners: RwLock<Vec<Arc<ListenerEntry>>>,
    next_listener_id: AtomicU64,
    /// Cancelled when the store is dropped, stopping all watcher tasks
    shutdown: CancellationToken,
}

impl Inner {
    fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|entry| entry.id != id);
        before != listeners.len()
    }

    fn prune_cancelled(&self) {
        let mut listeners = self.listeners.write();
        listeners.retain(|entry| !entry.scope.is_cancelled());
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Generic observable attribute store. Cloning shares the same store.
#[derive(Clone)]
pub struct Metadata {
    inner: Arc<Inner>,
}

impl Metadata {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                values: RwLock::new(HashMap::new()),
                listeners: RwLock::new(Vec::new()),
                next_listener_id: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Store `value` under `key`, then notify every live listener with it
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        self.inner.values.write().insert(key.clone(), value.clone());
        self.notify(&key, Some(&value));
    }

    pub fn get(&self, key: &str) -> Result<Value> {
        self.inner
            .values
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| SfuError::MetaNotFound(key.to_string()))
    }

    /// Remove `key` and notify listeners with `None`
    pub fn delete(&self, key: &str) -> Result<()> {
        let removed = self.inner.values.write().remove(key);
        if removed.is_none() {
            return Err(SfuError::MetaNotFound(key.to_string()));
        }
        self.notify(key, None);
        Ok(())
    }

    /// Visit a snapshot of all entries. The store is not locked while `f` runs.
    pub fn for_each(&self, mut f: impl FnMut(&str, &Value)) {
        let snapshot: Vec<(String, Value)> = self
            .inner
            .values
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, value) in &snapshot {
            f(key, value);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.values.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.values.read().is_empty()
    }

    /// Register `listener` for as long as `scope` is not cancelled.
    ///
    /// Registering against an already cancelled scope is a no-op.
    pub fn on_changed<F>(&self, scope: &CancellationToken, listener: F) -> ListenerId
    where
        F: Fn(&str, Option<&Value>) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed));
        if scope.is_cancelled() {
            return id;
        }

        self.inner.listeners.write().push(Arc::new(ListenerEntry {
            id,
            scope: scope.clone(),
            callback: Box::new(listener),
        }));

        // Without a runtime, cancelled entries are pruned on the next dispatch.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let weak: Weak<Inner> = Arc::downgrade(&self.inner);
            let scope = scope.clone();
            let shutdown = self.inner.shutdown.clone();
            handle.spawn(async move {
                tokio::select! {
                    () = scope.cancelled() => {
                        if let Some(inner) = weak.upgrade() {
                            inner.remove_listener(id);
                            debug!(listener = id.0, "Metadata listener scope ended");
                        }
                    }
                    () = shutdown.cancelled() => {}
                }
            });
        }

        id
    }

    /// Remove a listener before its scope ends. Returns false if already gone.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.remove_listener(id)
    }

    /// Number of listeners whose scope is still live
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.prune_cancelled();
        self.inner.listeners.read().len()
    }

    fn notify(&self, key: &str, value: Option<&Value>) {
        let snapshot: Vec<Arc<ListenerEntry>> = self.inner.listeners.read().clone();
        let mut saw_cancelled = false;

        for entry in snapshot {
            // Checked per entry so a listener cancelled earlier in this
            // dispatch, even by another listener, is skipped.
            if entry.scope.is_cancelled() {
                saw_cancelled = true;
                continue;
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| (entry.callback)(key, value)));
            if outcome.is_err() {
                error!(listener = entry.id.0, key, "Metadata listener panicked");
            }
        }

        if saw_cancelled {
            self.inner.prune_cancelled();
        }
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Metadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metadata")
            .field("values", &*self.inner.values.read())
            .field("listeners", &self.inner.listeners.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    type Events = Arc<Mutex<Vec<(String, Option<Value>)>>>;

    fn recorder() -> (Events, impl Fn(&str, Option<&Value>) + Send + Sync) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        (events, move |key: &str, value: Option<&Value>| {
            sink.lock().push((key.to_string(), value.cloned()));
        })
    }

    #[test]
    fn test_get_missing_key() {
        let meta = Metadata::new();
        assert!(matches!(meta.get("nope"), Err(SfuError::MetaNotFound(_))));
        assert!(matches!(meta.delete("nope"), Err(SfuError::MetaNotFound(_))));
    }

    #[test]
    fn test_set_and_delete_notify_once() {
        let meta = Metadata::new();
        let scope = CancellationToken::new();
        let (first, listener_a) = recorder();
        let (second, listener_b) = recorder();
        meta.on_changed(&scope, listener_a);
        meta.on_changed(&scope, listener_b);

        meta.set("muted", true);
        meta.delete("muted").unwrap();

        for events in [&first, &second] {
            let events = events.lock();
            assert_eq!(events.len(), 2);
            assert_eq!(events[0], ("muted".to_string(), Some(json!(true))));
            assert_eq!(events[1], ("muted".to_string(), None));
        }
        assert!(meta.get("muted").is_err());
    }

    #[test]
    fn test_cancelled_scope_stops_notifications_without_runtime() {
        let meta = Metadata::new();
        let scope = CancellationToken::new();
        let (events, listener) = recorder();
        meta.on_changed(&scope, listener);

        meta.set("a", 1);
        scope.cancel();
        meta.set("a", 2);

        assert_eq!(events.lock().len(), 1);
        assert_eq!(meta.listener_count(), 0);
    }

    #[test]
    fn test_scope_cancelled_mid_dispatch_skips_later_listener() {
        let meta = Metadata::new();
        let first_scope = CancellationToken::new();
        let second_scope = CancellationToken::new();
        {
            let second_scope = second_scope.clone();
            meta.on_changed(&first_scope, move |_, _| second_scope.cancel());
        }
        let (events, listener) = recorder();
        meta.on_changed(&second_scope, listener);

        meta.set("a", 1);

        assert!(events.lock().is_empty());
        assert_eq!(meta.listener_count(), 1);
    }

    #[test]
    fn test_register_on_cancelled_scope_is_noop() {
        let meta = Metadata::new();
        let scope = CancellationToken::new();
        scope.cancel();
        let (events, listener) = recorder();
        meta.on_changed(&scope, listener);
        meta.set("a", 1);
        assert!(events.lock().is_empty());
        assert_eq!(meta.listener_count(), 0);
    }

    #[test]
    fn test_removing_one_listener_keeps_others() {
        let meta = Metadata::new();
        let scope = CancellationToken::new();
        let (first, listener_a) = recorder();
        let (second, listener_b) = recorder();
        let id_a = meta.on_changed(&scope, listener_a);
        meta.on_changed(&scope, listener_b);

        assert!(meta.remove_listener(id_a));
        assert!(!meta.remove_listener(id_a));
        meta.set("k", "v");

        assert!(first.lock().is_empty());
        assert_eq!(second.lock().len(), 1);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let meta = Metadata::new();
        let scope = CancellationToken::new();
        meta.on_changed(&scope, |_, _| panic!("listener failure"));
        let (events, listener) = recorder();
        meta.on_changed(&scope, listener);

        meta.set("k", 1);
        meta.set("k", 2);

        assert_eq!(events.lock().len(), 2);
        assert_eq!(meta.get("k").unwrap(), json!(2));
    }

    #[test]
    fn test_for_each_visits_snapshot() {
        let meta = Metadata::new();
        meta.set("a", 1);
        meta.set("b", 2);
        let mut total = 0;
        meta.for_each(|_, v| total += v.as_i64().unwrap_or_default());
        assert_eq!(total, 3);
        assert_eq!(meta.len(), 2);
    }

    #[tokio::test]
    async fn test_watcher_removes_listener_on_cancel() {
        let meta = Metadata::new();
        let scope = CancellationToken::new();
        meta.on_changed(&scope, |_, _| {});
        assert_eq!(meta.listener_count(), 1);

        scope.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(meta.inner.listeners.read().is_empty());
    }

    #[tokio::test]
    async fn test_watcher_exits_when_store_dropped() {
        let scope = CancellationToken::new();
        let meta = Metadata::new();
        let weak = Arc::downgrade(&meta.inner);
        meta.on_changed(&scope, |_, _| {});
        drop(meta);
        tokio::task::yield_now().await;

        assert!(weak.upgrade().is_none());
        assert!(!scope.is_cancelled());
    }
}
