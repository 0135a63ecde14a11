//! Public error types for the realtime client.

use strata_protocol::EngineError;

/// Outcome of one command, shared between deduplicated callers.
///
/// `Ok(None)` is a success frame with no return value (`bind`, `unbind`,
/// `debug`, `ignore`); `Ok(Some(_))` carries an `exec` return value.
pub(crate) type CommandOutcome = Result<Option<serde_json::Value>, EngineError>;

/// Construction-time failures.
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("config: {0}")]
    Config(String),
}

/// How a command's future can settle.
///
/// Connection churn never settles a command — a dropped transport leaves the
/// future pending until the request is replayed and answered.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    /// The engine rejected the request with a protocol error code.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// The client was closed before the request settled.
    #[error("client closed before the request settled")]
    Closed,
}
