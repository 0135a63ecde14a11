//! Binding cache — the single source of truth for the current value of each
//! bound status variable, fanned out to any number of independent listeners.
//!
//! New listeners receive the current value immediately (replay-latest), not
//! just the next notify; a per-entry delivery lock keeps that replay ordered
//! against concurrent notify fan-outs.  Entries are created lazily and never
//! evicted:
//! `unbind` is a protocol-level courtesy to the server and does not clear
//! the last known value.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use serde_json::Value;
use strata_protocol::Target;

type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

struct BindingEntry {
    last_value: Value,
    /// Registration order is delivery order.
    listeners: Vec<(u64, Listener)>,
    /// Held across the initial replay and every notify fan-out, so a new
    /// listener can never deliver a stale value after a newer notify has
    /// already fanned out.  Reentrant: callbacks may re-enter the cache.
    delivery: Arc<ReentrantMutex<()>>,
}

impl Default for BindingEntry {
    fn default() -> Self {
        Self {
            last_value: Value::Null,
            listeners: Vec::new(),
            delivery: Arc::new(ReentrantMutex::new(())),
        }
    }
}

struct CacheInner {
    entries: Mutex<HashMap<Target, BindingEntry>>,
    next_listener: AtomicU64,
}

/// Map from binding target to its multicast value cell.
#[derive(Clone)]
pub(crate) struct BindingCache {
    inner: Arc<CacheInner>,
}

impl BindingCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: Mutex::new(HashMap::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    /// Register a listener for `target` and deliver the current value to it
    /// immediately.  The returned handle removes only this listener.
    pub fn listen(
        &self,
        target: Target,
        callback: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Subscription {
        let callback: Listener = Arc::new(callback);
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let delivery = {
            let mut entries = self.inner.entries.lock();
            let entry = entries.entry(target.clone()).or_default();
            entry.listeners.push((id, callback.clone()));
            entry.delivery.clone()
        };
        // Initial replay ordered by the delivery lock, not the map lock:
        // the value is read under it so no notify can land in between, and
        // the callback may still re-enter the cache.
        {
            let _order = delivery.lock();
            let current = self
                .inner
                .entries
                .lock()
                .get(&target)
                .map(|e| e.last_value.clone())
                .unwrap_or(Value::Null);
            callback(&current);
        }
        Subscription {
            inner: self.inner.clone(),
            target,
            id,
        }
    }

    /// Synchronous read of the last known value.  `None` only if no entry
    /// was ever created for `target`.
    pub fn value(&self, target: &Target) -> Option<Value> {
        self.inner
            .entries
            .lock()
            .get(target)
            .map(|e| e.last_value.clone())
    }

    /// The only path that mutates a binding's value: store it, then invoke
    /// every listener in registration order.
    pub fn handle_notify(&self, target: &Target, value: Value) {
        let delivery = {
            let mut entries = self.inner.entries.lock();
            entries.entry(target.clone()).or_default().delivery.clone()
        };
        let _order = delivery.lock();
        let listeners: Vec<Listener> = {
            let mut entries = self.inner.entries.lock();
            let entry = entries.entry(target.clone()).or_default();
            entry.last_value = value.clone();
            entry.listeners.iter().map(|(_, l)| l.clone()).collect()
        };
        tracing::debug!(target = %target, listeners = listeners.len(), "notify");
        for listener in listeners {
            listener(&value);
        }
    }

    /// Targets that currently have at least one listener; these are
    /// re-bound after a reconnect so the server resumes pushing notifies.
    pub fn listened_targets(&self) -> Vec<Target> {
        self.inner
            .entries
            .lock()
            .iter()
            .filter(|(_, e)| !e.listeners.is_empty())
            .map(|(t, _)| t.clone())
            .collect()
    }
}

/// Handle for one registered listener.  Cancelling removes only this
/// listener; the shared entry and its cached value stay.
pub struct Subscription {
    inner: Arc<CacheInner>,
    target: Target,
    id: u64,
}

impl Subscription {
    pub fn cancel(self) {
        let mut entries = self.inner.entries.lock();
        if let Some(entry) = entries.get_mut(&self.target) {
            entry.listeners.retain(|(id, _)| *id != self.id);
        }
    }
}
