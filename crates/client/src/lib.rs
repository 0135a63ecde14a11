//! `strata-client` — realtime protocol client for the Strata engine.
//!
//! The client owns a single duplex WebSocket to the engine's control
//! channel, multiplexes any number of concurrent `bind` / `unbind` /
//! `exec` / `debug` / `ignore` commands over it, correlates asynchronous
//! server responses back to the issuing caller, caches and fans out
//! `notify` events to many independent listeners per status variable, and
//! transparently survives connection loss.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Your app                                                    │
//! │                                                              │
//! │   let client = RealtimeClientBuilder::new()                  │
//! │       .host("engine.example.com")                            │
//! │       .token(bearer)                                         │
//! │       .secure(true)                                          │
//! │       .build()?;                                             │
//! │                                                              │
//! │   let power = Target::new("sys-A0", "Display", 1, "power");  │
//! │   let sub = client.listen(power.clone(), |v| { ... });       │
//! │   client.bind(power).await?;                                 │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Connection flow (hard-coded by the client)
//!
//! 1. Connect `ws[s]://<host>/control/websocket?bearer=<token>` (bounded
//!    linear retry on failure)
//! 2. Replay requests still awaiting a response, re-`bind` every variable
//!    with a live listener
//! 3. Main loop:
//!    - dispatch `success`/`error` frames to the issuing caller
//!    - dispatch `notify` frames to the binding cache and its listeners
//!    - emit the literal `"ping"` every 20 s; ignore `"pong"`
//! 4. On disconnect: status goes `false`, reconnect after a fixed delay;
//!    callers' pending futures stay pending across the outage
//!
//! # Guarantees and non-guarantees
//!
//! - Identical concurrent commands (same verb + target) share one frame
//!   and one outcome.
//! - Notifies for one variable reach listeners in frame arrival order.
//! - Notifies generated while disconnected are NOT replayed; only the
//!   current value becomes available again after reconnect + re-bind.

pub mod builder;
pub mod cache;
pub mod client;
pub mod reconnect;
pub(crate) mod registry;
pub mod status;
pub mod types;

// ── Re-exports for ergonomic imports ─────────────────────────────────

pub use builder::RealtimeClientBuilder;
pub use cache::Subscription;
pub use client::RealtimeClient;
pub use reconnect::RetryPolicy;
pub use status::{ConnectionState, StatusSubscription};
pub use types::{ClientError, CommandError};

// Re-export protocol types so callers never need strata-protocol directly.
pub use strata_protocol::{Command, CommandRequest, EngineError, ErrorCode, Target};
