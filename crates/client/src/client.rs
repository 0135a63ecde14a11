//! Core realtime client — owns the engine WebSocket lifecycle, multiplexes
//! commands over it, and dispatches inbound frames to the request registry
//! and binding cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use futures_util::{FutureExt, SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use strata_protocol::{
    Command, CommandRequest, EngineError, ServerFrame, ServerResponse, Target, PING,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::builder::RealtimeClientBuilder;
use crate::cache::{BindingCache, Subscription};
use crate::registry::{PendingWait, RequestKey, RequestRegistry};
use crate::reconnect::RetryPolicy;
use crate::status::{ConnectionState, StatusFeed, StatusSubscription};
use crate::types::CommandError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client for the engine's realtime channel.
///
/// Create via [`RealtimeClientBuilder`](crate::builder::RealtimeClientBuilder).
/// Cloning is cheap and all clones share one connection.
///
/// Connection churn is invisible to command callers: a request issued while
/// offline is queued, and a request that was in flight when the transport
/// dropped is replayed (with its original id) once the connection is back.
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    host: String,
    secure: bool,
    fixed_device: bool,
    token: Mutex<String>,
    keep_alive_interval: Duration,
    connect_retry: RetryPolicy,
    send_retry: RetryPolicy,
    reconnect_delay: Duration,
    /// Instance-owned request counter, reset at construction.
    next_id: AtomicU64,
    registry: RequestRegistry,
    cache: BindingCache,
    status: StatusFeed,
    /// Sender side of the writer task for the current connection, if any.
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    /// Signalled by `update_token` to force a reconnect.
    rotate: Notify,
    shutdown: CancellationToken,
}

impl RealtimeClient {
    /// Start a new builder.
    pub fn builder() -> RealtimeClientBuilder {
        RealtimeClientBuilder::new()
    }

    pub(crate) fn start(cfg: RealtimeClientBuilder) -> Self {
        let inner = Arc::new(Inner {
            host: cfg.host,
            secure: cfg.secure,
            fixed_device: cfg.fixed_device,
            token: Mutex::new(cfg.token),
            keep_alive_interval: cfg.keep_alive_interval,
            connect_retry: cfg.connect_retry,
            send_retry: cfg.send_retry,
            reconnect_delay: cfg.reconnect_delay,
            next_id: AtomicU64::new(1),
            registry: RequestRegistry::new(),
            cache: BindingCache::new(),
            status: StatusFeed::new(),
            outbound: Mutex::new(None),
            rotate: Notify::new(),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(driver(inner.clone()));
        Self { inner }
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Bind to a status variable so the server starts pushing notifies.
    pub async fn bind(&self, target: Target) -> Result<(), CommandError> {
        self.command(Command::Bind, target, None).await.map(|_| ())
    }

    /// Unbind from a status variable.  The local cache entry and its last
    /// known value are kept; only the server stops pushing updates.
    pub async fn unbind(&self, target: Target) -> Result<(), CommandError> {
        self.command(Command::Unbind, target, None).await.map(|_| ())
    }

    /// Execute a method on a module and return its result, if any.
    pub async fn exec(
        &self,
        target: Target,
        args: Vec<Value>,
    ) -> Result<Option<Value>, CommandError> {
        self.command(Command::Exec, target, Some(args)).await
    }

    /// Start receiving debug log output for a module.
    pub async fn debug(&self, target: Target) -> Result<(), CommandError> {
        self.command(Command::Debug, target, None).await.map(|_| ())
    }

    /// Stop receiving debug log output for a module.
    pub async fn ignore(&self, target: Target) -> Result<(), CommandError> {
        self.command(Command::Ignore, target, None).await.map(|_| ())
    }

    async fn command(
        &self,
        cmd: Command,
        target: Target,
        args: Option<Vec<Value>>,
    ) -> Result<Option<Value>, CommandError> {
        let wait = issue(&self.inner, cmd, target, args);
        match wait.await {
            Some(Ok(value)) => Ok(value),
            Some(Err(err)) => Err(CommandError::Engine(err)),
            None => Err(CommandError::Closed),
        }
    }

    // ── Bindings ─────────────────────────────────────────────────────

    /// Listen to value changes for a binding.  Does NOT send a `bind`
    /// command — call [`bind`](Self::bind) separately, so one bound
    /// variable can serve any number of listeners.
    ///
    /// The callback fires immediately with the current value (Null if
    /// nothing is known yet), then on every notify, in frame order.
    pub fn listen(
        &self,
        target: Target,
        callback: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.cache.listen(target, callback)
    }

    /// Synchronous read of a binding's last known value.  `None` if the
    /// variable was never listened to, bound, or notified.
    pub fn value(&self, target: &Target) -> Option<Value> {
        self.inner.cache.value(target)
    }

    // ── Connection ───────────────────────────────────────────────────

    /// Observe the connection status.  The callback is invoked once
    /// synchronously with the current boolean and again on every
    /// transition, with no coalescing.
    pub fn status(&self, callback: impl Fn(bool) + Send + Sync + 'static) -> StatusSubscription {
        self.inner.status.subscribe(callback)
    }

    /// Whether the websocket is currently connected.
    pub fn is_connected(&self) -> bool {
        self.inner.status.is_connected()
    }

    /// Current connection lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.status.state()
    }

    /// Replace the bearer token and force a reconnect.  Live bindings and
    /// outstanding requests survive the cycle: pending frames are replayed
    /// and every listened-to variable is re-bound on the new connection.
    pub fn update_token(&self, token: impl Into<String>) {
        *self.inner.token.lock() = token.into();
        tracing::info!("token updated, forcing reconnect");
        self.inner.rotate.notify_one();
    }

    /// Shut the client down.  Terminal: the connection driver exits and no
    /// further frames are sent or received.  Outstanding command futures
    /// settle with [`CommandError::Closed`] once every clone of the client
    /// has been dropped.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    /// Build the connection URL from the current token and options.
    fn build_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        let token = self.token.lock().clone();
        let mut url = format!("{scheme}://{}/control/websocket?bearer={token}", self.host);
        if self.fixed_device {
            url.push_str("&fixed_device=true");
        }
        url
    }
}

// ── Send path ────────────────────────────────────────────────────────

/// Get-or-create the in-flight entry for this command and make sure its
/// frame gets transmitted: immediately when connected, otherwise via the
/// bounded offline retry task.
fn issue(inner: &Arc<Inner>, cmd: Command, target: Target, args: Option<Vec<Value>>) -> PendingWait {
    let key: RequestKey = (cmd, target);
    let (wait, created) = inner.registry.enqueue(key.clone(), || {
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(cmd = %cmd, target = %key.1, id, "sending command");
        CommandRequest {
            id,
            cmd,
            target: key.1.clone(),
            args,
        }
    });
    if created {
        match try_transmit(inner, &key) {
            Transmit::Done | Transmit::Gone => {}
            Transmit::Offline => {
                tokio::spawn(queue_retry(inner.clone(), key));
            }
        }
    }
    wait
}

enum Transmit {
    /// Frame handed to the writer.
    Done,
    /// Entry settled or already transmitted elsewhere; nothing to do.
    Gone,
    /// Not connected; try again later.
    Offline,
}

fn try_transmit(inner: &Inner, key: &RequestKey) -> Transmit {
    if !inner.status.is_connected() {
        return Transmit::Offline;
    }
    let Some(tx) = inner.outbound.lock().clone() else {
        return Transmit::Offline;
    };
    let Some(frame) = inner.registry.take_for_transmit(key) else {
        return Transmit::Gone;
    };
    match frame.to_text() {
        Ok(text) => {
            let _ = tx.send(text);
            Transmit::Done
        }
        Err(e) => {
            // Leaves the entry marked sent; reconnect replay will not fare
            // better with the same frame, so just surface the bug.
            tracing::error!(error = %e, cmd = %key.0, "failed to serialize command frame");
            Transmit::Gone
        }
    }
}

/// Bounded retry loop for a request issued while disconnected.  Exhaustion
/// is terminal for this timer only — the entry stays queued and reconnect
/// replay still transmits it.
async fn queue_retry(inner: Arc<Inner>, key: RequestKey) {
    let policy = inner.send_retry.clone();
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        if policy.should_give_up(attempt) {
            tracing::warn!(
                cmd = %key.0,
                target = %key.1,
                attempts = attempt - 1,
                "giving up queued transmission; frame will be replayed on reconnect"
            );
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(policy.delay_for_attempt(attempt)) => {}
            _ = inner.shutdown.cancelled() => return,
        }
        if !inner.registry.contains(&key) {
            return;
        }
        match try_transmit(&inner, &key) {
            Transmit::Done | Transmit::Gone => return,
            Transmit::Offline => {}
        }
    }
}

// ── Connection driver ────────────────────────────────────────────────

enum CloseReason {
    Shutdown,
    Rotate,
    Transport,
}

/// Owns the connection lifecycle for the life of the client: connect with
/// bounded linear backoff, run the frame loop, reconnect after a fixed
/// delay once a session has existed.
async fn driver(inner: Arc<Inner>) {
    let mut established_once = false;
    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }

        let state = if established_once {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        };
        inner.status.set(state);

        let Some(socket) = connect_with_retry(&inner).await else {
            if inner.shutdown.is_cancelled() {
                break;
            }
            if !established_once {
                // Initial connect exhausted: a misconfigured client must
                // not retry forever.  A token update can revive it.
                tracing::error!(host = %inner.host, "initial connect attempts exhausted, giving up");
                inner.status.set(ConnectionState::Disconnected);
                tokio::select! {
                    _ = inner.rotate.notified() => continue,
                    _ = inner.shutdown.cancelled() => break,
                }
            }
            // An established session exists to heal; keep cycling.
            tokio::select! {
                _ = tokio::time::sleep(inner.reconnect_delay) => continue,
                _ = inner.shutdown.cancelled() => break,
            }
        };

        established_once = true;
        let reason = run_connection(&inner, socket).await;
        inner.status.set(ConnectionState::Disconnected);

        match reason {
            CloseReason::Shutdown => break,
            CloseReason::Rotate => {
                // Prompt reconnect with the new token.
                continue;
            }
            CloseReason::Transport => {
                tracing::info!(
                    delay_ms = inner.reconnect_delay.as_millis() as u64,
                    "connection lost, reconnecting"
                );
                tokio::select! {
                    _ = tokio::time::sleep(inner.reconnect_delay) => {}
                    _ = inner.shutdown.cancelled() => break,
                }
            }
        }
    }
    inner.status.set(ConnectionState::Disconnected);
}

/// One bounded connect cycle: up to `connect_retry.max_attempts` attempts
/// with linear backoff between them.
async fn connect_with_retry(inner: &Arc<Inner>) -> Option<WsStream> {
    let policy = &inner.connect_retry;
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        if policy.should_give_up(attempt) {
            tracing::warn!(attempts = attempt - 1, "connect attempts exhausted");
            return None;
        }
        if attempt > 1 {
            let delay = policy.delay_for_attempt(attempt - 1);
            tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "retrying connect");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = inner.shutdown.cancelled() => return None,
            }
        }
        // A token rotated before this attempt is satisfied by it: the URL
        // below reads the current token.
        let _ = inner.rotate.notified().now_or_never();
        match connect_once(inner).await {
            Ok(ws) => return Some(ws),
            Err(e) => tracing::warn!(attempt, error = %e, "websocket connect failed"),
        }
    }
}

async fn connect_once(inner: &Inner) -> anyhow::Result<WsStream> {
    let url = inner.build_url();
    tracing::debug!(host = %inner.host, "connecting to engine websocket");
    let (ws, _response) = tokio_tungstenite::connect_async(&url)
        .await
        .context("websocket connect")?;
    Ok(ws)
}

/// Single connection lifecycle: writer task, outstanding-frame replay,
/// keep-alive, then the read/dispatch loop until the transport drops or a
/// reconnect is forced.
async fn run_connection(inner: &Arc<Inner>, ws: WsStream) -> CloseReason {
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    // Writer task: owns the sink; drains queued frames then closes the
    // socket gracefully when the sender side is dropped.
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Replay outstanding requests (original ids) BEFORE publishing the
    // sender: a command issued concurrently still sees the client as
    // offline and lands in the retry queue, where the once-only hand-out
    // in take_for_transmit keeps its frame from going out twice.
    let frames = inner.registry.outstanding_frames();
    if !frames.is_empty() {
        tracing::info!(count = frames.len(), "replaying outstanding requests");
    }
    for frame in frames {
        match frame.to_text() {
            Ok(text) => {
                let _ = tx.send(text);
            }
            Err(e) => tracing::error!(error = %e, id = frame.id, "failed to serialize replay frame"),
        }
    }

    *inner.outbound.lock() = Some(tx);
    inner.status.set(ConnectionState::Connected);
    tracing::info!(host = %inner.host, "engine websocket connected");

    // Fresh binds for every variable that still has listeners, deduped
    // against any bind frame just replayed for the same target.
    for target in inner.cache.listened_targets() {
        let _ = issue(inner, Command::Bind, target, None);
    }

    let mut keep_alive = tokio::time::interval(inner.keep_alive_interval);
    keep_alive.tick().await; // first tick completes immediately

    let reason = loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break CloseReason::Shutdown,
            _ = inner.rotate.notified() => {
                tracing::info!("reconnecting with rotated token");
                break CloseReason::Rotate;
            }
            _ = keep_alive.tick() => {
                if let Some(tx) = inner.outbound.lock().clone() {
                    let _ = tx.send(PING.to_string());
                }
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => dispatch(inner, &text),
                Some(Ok(Message::Close(_))) => {
                    tracing::info!("engine closed the connection");
                    break CloseReason::Transport;
                }
                Some(Ok(_)) => {} // binary/ws-level ping frames: not ours
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "websocket error");
                    break CloseReason::Transport;
                }
                None => {
                    tracing::info!("websocket stream ended");
                    break CloseReason::Transport;
                }
            }
        }
    };

    // Dropping the sender stops the keep-alive's outlet and lets the
    // writer drain and close the socket.
    *inner.outbound.lock() = None;
    let _ = writer.await;
    reason
}

// ── Inbound dispatch ─────────────────────────────────────────────────

/// Route one inbound text frame.  Runs synchronously per frame, so
/// registry and cache mutations never interleave within a frame.
fn dispatch(inner: &Arc<Inner>, text: &str) {
    let frame = match ServerFrame::parse(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(error = %e, "unparseable frame, dropping");
            return;
        }
    };
    match frame {
        ServerFrame::Pong => tracing::trace!("received pong"),
        ServerFrame::Response(ServerResponse::Success { id, value }) => match id.as_u64() {
            Some(id) => inner.registry.resolve(id, value),
            None => tracing::warn!(?id, "success frame with non-numeric id, dropping"),
        },
        ServerFrame::Response(ServerResponse::Error { id, code, msg }) => {
            let err = EngineError::new(code, msg);
            tracing::warn!(code = err.code.code(), kind = %err.code, msg = %err.message, "engine error");
            match id.as_u64() {
                Some(id) => inner.registry.reject(id, err),
                None => tracing::warn!(?id, "error frame with non-numeric id, dropping"),
            }
        }
        ServerFrame::Response(ServerResponse::Notify { meta, value }) => {
            inner.cache.handle_notify(&meta, value);
        }
        ServerFrame::Response(ServerResponse::Debug { module, klass, level, msg }) => {
            let module = module.unwrap_or_default();
            let klass = klass.unwrap_or_default();
            let msg = msg.unwrap_or_default();
            match level.as_deref() {
                Some("error") => tracing::error!(module = %module, klass = %klass, "engine debug: {msg}"),
                Some("warn") => tracing::warn!(module = %module, klass = %klass, "engine debug: {msg}"),
                _ => tracing::debug!(module = %module, klass = %klass, "engine debug: {msg}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_inner() -> Inner {
        Inner {
            host: "aca.test".into(),
            secure: false,
            fixed_device: false,
            token: Mutex::new("test".into()),
            keep_alive_interval: Duration::from_secs(20),
            connect_retry: RetryPolicy::connect(),
            send_retry: RetryPolicy::offline_send(),
            reconnect_delay: Duration::from_secs(1),
            next_id: AtomicU64::new(1),
            registry: RequestRegistry::new(),
            cache: BindingCache::new(),
            status: StatusFeed::new(),
            outbound: Mutex::new(None),
            rotate: Notify::new(),
            shutdown: CancellationToken::new(),
        }
    }

    #[test]
    fn build_url_plain() {
        let inner = test_inner();
        assert_eq!(
            inner.build_url(),
            "ws://aca.test/control/websocket?bearer=test"
        );
    }

    #[test]
    fn build_url_secure_fixed_device() {
        let mut inner = test_inner();
        inner.secure = true;
        inner.fixed_device = true;
        assert_eq!(
            inner.build_url(),
            "wss://aca.test/control/websocket?bearer=test&fixed_device=true"
        );
    }

    #[test]
    fn build_url_reads_the_current_token() {
        let inner = test_inner();
        *inner.token.lock() = "rotated".into();
        assert_eq!(
            inner.build_url(),
            "ws://aca.test/control/websocket?bearer=rotated"
        );
    }
}
