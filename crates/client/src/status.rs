//! Connection status feed: the current [`ConnectionState`] plus an ordered
//! listener list that observes the derived boolean.
//!
//! Every state transition is pushed to every listener — transitions are
//! never coalesced, so a quick `false → true → false` delivers all three.
//! A `tokio::sync::watch` channel would collapse those, which is why this
//! is a listener list instead.  A delivery lock orders the initial delivery
//! to a new subscriber against concurrent transitions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};

/// Lifecycle of the single engine connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    /// The observable boolean: `true` only when fully connected.
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

type StatusListener = Arc<dyn Fn(bool) + Send + Sync>;

struct FeedState {
    state: ConnectionState,
    listeners: Vec<(u64, StatusListener)>,
}

struct FeedInner {
    state: Mutex<FeedState>,
    next_listener: AtomicU64,
    /// Held across transition fan-out and the initial delivery to a new
    /// subscriber, so a subscriber can never observe a stale boolean after
    /// a newer transition has already fanned out.
    delivery: ReentrantMutex<()>,
}

#[derive(Clone)]
pub(crate) struct StatusFeed {
    inner: Arc<FeedInner>,
}

impl StatusFeed {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FeedInner {
                state: Mutex::new(FeedState {
                    state: ConnectionState::Disconnected,
                    listeners: Vec::new(),
                }),
                next_listener: AtomicU64::new(1),
                delivery: ReentrantMutex::new(()),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Transition to `state` and push the derived boolean to every listener.
    pub fn set(&self, state: ConnectionState) {
        let _order = self.inner.delivery.lock();
        let (connected, listeners) = {
            let mut feed = self.inner.state.lock();
            feed.state = state;
            (
                state.is_connected(),
                feed.listeners
                    .iter()
                    .map(|(_, l)| l.clone())
                    .collect::<Vec<_>>(),
            )
        };
        tracing::debug!(?state, connected, "connection state");
        for listener in listeners {
            listener(connected);
        }
    }

    /// Register a listener.  It is invoked synchronously with the current
    /// boolean before this returns, then again on every transition.
    pub fn subscribe(&self, callback: impl Fn(bool) + Send + Sync + 'static) -> StatusSubscription {
        let callback: StatusListener = Arc::new(callback);
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner.state.lock().listeners.push((id, callback.clone()));
        // Initial delivery ordered by the delivery lock: the boolean is
        // read under it, so no transition can land in between.
        {
            let _order = self.inner.delivery.lock();
            let current = self.inner.state.lock().state.is_connected();
            callback(current);
        }
        StatusSubscription {
            inner: self.inner.clone(),
            id,
        }
    }
}

/// Handle for one status listener.
pub struct StatusSubscription {
    inner: Arc<FeedInner>,
    id: u64,
}

impl StatusSubscription {
    pub fn cancel(self) {
        let mut feed = self.inner.state.lock();
        feed.listeners.retain(|(id, _)| *id != self.id);
    }
}
