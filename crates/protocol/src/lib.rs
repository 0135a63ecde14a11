//! Engine realtime protocol: command frames, response frames, and error codes.
//!
//! The realtime channel speaks JSON text frames over a WebSocket, plus two
//! literal keep-alive frames (`"ping"` outbound, `"pong"` inbound) that are
//! not JSON-wrapped.  This crate holds the wire types and the stateless
//! codec; it performs no I/O.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outbound keep-alive frame.  Sent as a literal text frame, not JSON.
pub const PING: &str = "ping";
/// Inbound keep-alive acknowledgement.  Never routed through the JSON codec.
pub const PONG: &str = "pong";

/// Command verbs understood by the engine's realtime channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    /// Subscribe to a status variable.
    Bind,
    /// Unsubscribe from a status variable.
    Unbind,
    /// Invoke a method on a module.
    Exec,
    /// Start receiving debug log output for a module.
    Debug,
    /// Stop receiving debug log output for a module.
    Ignore,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Bind => "bind",
            Command::Unbind => "unbind",
            Command::Exec => "exec",
            Command::Debug => "debug",
            Command::Ignore => "ignore",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of one status variable or method on the engine: system, module,
/// module instance index, and variable/method name.
///
/// `Target` is compared and hashed by value, so two callers addressing the
/// same variable always land on the same cache/registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    /// System ID the command addresses.
    pub sys: String,
    /// Module name on the system.
    #[serde(rename = "mod")]
    pub module: String,
    /// Index of the module instance in the system.
    pub index: u32,
    /// Status variable to bind or method to exec.
    pub name: String,
}

impl Target {
    pub fn new(
        sys: impl Into<String>,
        module: impl Into<String>,
        index: u32,
        name: impl Into<String>,
    ) -> Self {
        Self {
            sys: sys.into(),
            module: module.into(),
            index,
            name: name.into(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}_{}, {}", self.sys, self.module, self.index, self.name)
    }
}

/// One outbound command frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Correlation ID.  Monotonic per client instance, never reused while
    /// the request is outstanding.
    pub id: u64,
    pub cmd: Command,
    #[serde(flatten)]
    pub target: Target,
    /// Arguments for `exec`; omitted from the frame for other commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,
}

impl CommandRequest {
    /// Serialize to the wire text frame.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Response correlation ID.  The engine emits integers, but older server
/// builds echo the id back as a string; accept both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseId {
    Num(u64),
    Text(String),
}

impl ResponseId {
    /// Normalize to the numeric id the client issued, if possible.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ResponseId::Num(n) => Some(*n),
            ResponseId::Text(s) => s.parse().ok(),
        }
    }
}

impl From<u64> for ResponseId {
    fn from(n: u64) -> Self {
        ResponseId::Num(n)
    }
}

/// Inbound response frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerResponse {
    /// A command completed; `value` carries an `exec` return value.
    Success {
        id: ResponseId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
    },
    /// A command failed.
    Error {
        id: ResponseId,
        /// Wider than the defined code range on purpose: an out-of-range
        /// code must still deserialize so the caller gets rejected rather
        /// than left pending.
        code: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msg: Option<String>,
    },
    /// Server push: a bound status variable changed.
    Notify { meta: Target, value: Value },
    /// Server push: debug log output requested via the `debug` command.
    Debug {
        #[serde(default, rename = "mod", skip_serializing_if = "Option::is_none")]
        module: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        klass: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        level: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msg: Option<String>,
    },
}

/// One inbound text frame, with keep-alive acknowledgements routed away
/// from the JSON codec.
#[derive(Debug, Clone)]
pub enum ServerFrame {
    Pong,
    Response(ServerResponse),
}

impl ServerFrame {
    pub fn parse(text: &str) -> Result<ServerFrame, serde_json::Error> {
        if text == PONG {
            return Ok(ServerFrame::Pong);
        }
        Ok(ServerFrame::Response(serde_json::from_str(text)?))
    }
}

/// Protocol error codes, mirrored from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ParseError,
    BadRequest,
    AccessDenied,
    RequestFailed,
    UnknownCmd,
    SysNotFound,
    ModNotFound,
    UnexpectedFailure,
}

impl ErrorCode {
    /// Map a wire code onto the taxonomy.  Codes the client does not know,
    /// however large, collapse into [`ErrorCode::UnexpectedFailure`].
    pub fn from_code(code: u64) -> Self {
        match code {
            0 => ErrorCode::ParseError,
            1 => ErrorCode::BadRequest,
            2 => ErrorCode::AccessDenied,
            3 => ErrorCode::RequestFailed,
            4 => ErrorCode::UnknownCmd,
            5 => ErrorCode::SysNotFound,
            6 => ErrorCode::ModNotFound,
            _ => ErrorCode::UnexpectedFailure,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            ErrorCode::ParseError => 0,
            ErrorCode::BadRequest => 1,
            ErrorCode::AccessDenied => 2,
            ErrorCode::RequestFailed => 3,
            ErrorCode::UnknownCmd => 4,
            ErrorCode::SysNotFound => 5,
            ErrorCode::ModNotFound => 6,
            ErrorCode::UnexpectedFailure => 7,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ParseError => "parse error",
            ErrorCode::BadRequest => "bad request",
            ErrorCode::AccessDenied => "access denied",
            ErrorCode::RequestFailed => "request failed",
            ErrorCode::UnknownCmd => "unknown command",
            ErrorCode::SysNotFound => "system not found",
            ErrorCode::ModNotFound => "module not found",
            ErrorCode::UnexpectedFailure => "unexpected failure",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol-level command failure, delivered to the caller whose request
/// produced it.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("{code}: {message}")]
pub struct EngineError {
    pub code: ErrorCode,
    pub message: String,
}

impl EngineError {
    pub fn new(code: u64, msg: Option<String>) -> Self {
        Self {
            code: ErrorCode::from_code(code),
            message: msg.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bind_frame_shape() {
        let req = CommandRequest {
            id: 1,
            cmd: Command::Bind,
            target: Target::new("sys-A0", "Display", 1, "power"),
            args: None,
        };
        let frame: Value = serde_json::from_str(&req.to_text().unwrap()).unwrap();
        assert_eq!(
            frame,
            json!({
                "id": 1,
                "cmd": "bind",
                "sys": "sys-A0",
                "mod": "Display",
                "index": 1,
                "name": "power",
            })
        );
    }

    #[test]
    fn exec_frame_carries_args() {
        let req = CommandRequest {
            id: 7,
            cmd: Command::Exec,
            target: Target::new("sys-A0", "Display", 2, "switch_input"),
            args: Some(vec![json!("hdmi"), json!(2)]),
        };
        let frame: Value = serde_json::from_str(&req.to_text().unwrap()).unwrap();
        assert_eq!(frame["cmd"], "exec");
        assert_eq!(frame["args"], json!(["hdmi", 2]));
    }

    #[test]
    fn parse_success_with_value() {
        let frame = ServerFrame::parse(r#"{"id":3,"type":"success","value":42}"#).unwrap();
        match frame {
            ServerFrame::Response(ServerResponse::Success { id, value }) => {
                assert_eq!(id.as_u64(), Some(3));
                assert_eq!(value, Some(json!(42)));
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn parse_success_without_value() {
        let frame = ServerFrame::parse(r#"{"id":3,"type":"success"}"#).unwrap();
        match frame {
            ServerFrame::Response(ServerResponse::Success { value, .. }) => {
                assert_eq!(value, None);
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn parse_error_frame() {
        let frame =
            ServerFrame::parse(r#"{"id":2,"type":"error","code":2,"msg":"denied"}"#).unwrap();
        match frame {
            ServerFrame::Response(ServerResponse::Error { id, code, msg }) => {
                assert_eq!(id.as_u64(), Some(2));
                assert_eq!(ErrorCode::from_code(code), ErrorCode::AccessDenied);
                assert_eq!(msg.as_deref(), Some("denied"));
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn parse_notify_frame() {
        let text = r#"{"type":"notify","meta":{"sys":"sys-A0","mod":"Display","index":1,"name":"power"},"value":true}"#;
        let frame = ServerFrame::parse(text).unwrap();
        match frame {
            ServerFrame::Response(ServerResponse::Notify { meta, value }) => {
                assert_eq!(meta, Target::new("sys-A0", "Display", 1, "power"));
                assert_eq!(value, json!(true));
            }
            other => panic!("expected notify, got {other:?}"),
        }
    }

    #[test]
    fn parse_debug_frame() {
        let text = r#"{"id":0,"type":"debug","mod":"Display","klass":"::Sony","level":"warn","msg":"lamp hours high"}"#;
        let frame = ServerFrame::parse(text).unwrap();
        match frame {
            ServerFrame::Response(ServerResponse::Debug { module, klass, level, msg }) => {
                assert_eq!(module.as_deref(), Some("Display"));
                assert_eq!(klass.as_deref(), Some("::Sony"));
                assert_eq!(level.as_deref(), Some("warn"));
                assert_eq!(msg.as_deref(), Some("lamp hours high"));
            }
            other => panic!("expected debug, got {other:?}"),
        }
    }

    #[test]
    fn pong_routed_away_from_codec() {
        assert!(matches!(ServerFrame::parse(PONG).unwrap(), ServerFrame::Pong));
    }

    #[test]
    fn string_ids_normalize() {
        let frame = ServerFrame::parse(r#"{"id":"12","type":"success"}"#).unwrap();
        match frame {
            ServerFrame::Response(ServerResponse::Success { id, .. }) => {
                assert_eq!(id.as_u64(), Some(12));
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn unknown_codes_collapse_to_unexpected_failure() {
        assert_eq!(ErrorCode::from_code(7), ErrorCode::UnexpectedFailure);
        assert_eq!(ErrorCode::from_code(99), ErrorCode::UnexpectedFailure);
        assert_eq!(ErrorCode::from_code(u64::MAX), ErrorCode::UnexpectedFailure);
    }

    #[test]
    fn oversized_error_codes_still_deserialize() {
        // A code past the defined range must reject the caller, not fail
        // the whole frame and leave the request pending.
        let frame =
            ServerFrame::parse(r#"{"id":4,"type":"error","code":70000,"msg":"boom"}"#).unwrap();
        match frame {
            ServerFrame::Response(ServerResponse::Error { code, .. }) => {
                assert_eq!(ErrorCode::from_code(code), ErrorCode::UnexpectedFailure);
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn error_code_round_trip() {
        for code in 0..=7u64 {
            assert_eq!(u64::from(ErrorCode::from_code(code).code()), code);
        }
    }
}
