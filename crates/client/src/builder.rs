//! Builder pattern for constructing a [`RealtimeClient`].

use std::time::Duration;

use crate::client::RealtimeClient;
use crate::reconnect::{RetryPolicy, KEEP_ALIVE_INTERVAL, RECONNECT_DELAY};
use crate::types::ClientError;

/// Fluent builder for [`RealtimeClient`].
///
/// # Example
///
/// ```rust,no_run
/// # use strata_client::RealtimeClientBuilder;
/// # async fn example() -> Result<(), strata_client::ClientError> {
/// let client = RealtimeClientBuilder::new()
///     .host("engine.example.com")
///     .token("bearer-token")
///     .secure(true)
///     .fixed_device(true)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RealtimeClientBuilder {
    pub(crate) host: String,
    pub(crate) token: String,
    pub(crate) secure: bool,
    pub(crate) fixed_device: bool,
    pub(crate) keep_alive_interval: Duration,
    pub(crate) connect_retry: RetryPolicy,
    pub(crate) send_retry: RetryPolicy,
    pub(crate) reconnect_delay: Duration,
}

impl RealtimeClientBuilder {
    pub fn new() -> Self {
        Self {
            host: "localhost".into(),
            token: String::new(),
            secure: false,
            fixed_device: false,
            keep_alive_interval: KEEP_ALIVE_INTERVAL,
            connect_retry: RetryPolicy::connect(),
            send_retry: RetryPolicy::offline_send(),
            reconnect_delay: RECONNECT_DELAY,
        }
    }

    // ── Required ─────────────────────────────────────────────────────

    /// Domain and port of the engine server (e.g. `"engine.example.com"`).
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Bearer token for the engine websocket endpoint.  Required; an empty
    /// token is a configuration error and `build` fails.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    // ── Connection options ───────────────────────────────────────────

    /// Use `wss://` instead of `ws://` (enable when the hosting context is
    /// served over TLS).
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Mark this endpoint as a fixed, statically located device
    /// (`&fixed_device=true` on the connection URL).
    pub fn fixed_device(mut self, fixed: bool) -> Self {
        self.fixed_device = fixed;
        self
    }

    // ── Behavior ─────────────────────────────────────────────────────

    /// Override the keep-alive ping interval (default 20 s).
    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Override the connect retry policy (default 5 × 300 ms linear).
    pub fn connect_retry(mut self, policy: RetryPolicy) -> Self {
        self.connect_retry = policy;
        self
    }

    /// Override the offline-send retry policy (default 20 × 300 ms linear).
    pub fn send_retry(mut self, policy: RetryPolicy) -> Self {
        self.send_retry = policy;
        self
    }

    /// Override the delay between losing a session and reconnecting
    /// (default 1 s).
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Validate the configuration and start the client.  The connection
    /// driver is spawned onto the current Tokio runtime, so this must be
    /// called from within one.
    ///
    /// Fails (without touching the network) if no token is configured.
    pub fn build(self) -> Result<RealtimeClient, ClientError> {
        if self.token.is_empty() {
            return Err(ClientError::Config(
                "no auth token is set for the engine websocket".into(),
            ));
        }
        Ok(RealtimeClient::start(self))
    }
}

impl Default for RealtimeClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
