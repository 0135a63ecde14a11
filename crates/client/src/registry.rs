//! Request registry — exactly-once-in-flight semantics per request key,
//! response correlation by id, and replay across reconnects.

use std::collections::HashMap;

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use strata_protocol::{Command, CommandRequest, EngineError, Target};
use tokio::sync::oneshot;

use crate::types::CommandOutcome;

/// Deduplication key: command verb plus target.  Excludes `args` and `id`,
/// so identical concurrent requests share one in-flight entry.
pub(crate) type RequestKey = (Command, Target);

/// Future handed to every caller of a deduplicated request.  Resolves to
/// `None` only if the client shuts down with the request still open.
pub(crate) type PendingWait = Shared<BoxFuture<'static, Option<CommandOutcome>>>;

struct Pending {
    id: u64,
    frame: CommandRequest,
    /// Whether the frame has been handed to the writer at least once.
    /// Reset never — reconnect replay retransmits regardless.
    sent: bool,
    tx: Option<oneshot::Sender<CommandOutcome>>,
    wait: PendingWait,
}

/// Outstanding requests, keyed for dedup, settled by response id.
#[derive(Default)]
pub(crate) struct RequestRegistry {
    pending: Mutex<HashMap<RequestKey, Pending>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get-or-create the in-flight entry for `key`.  `make_frame` runs only
    /// when a new entry is created (allocating a fresh id); joining callers
    /// share the existing outcome.  Returns the shared future and whether
    /// the entry was newly created (i.e. the frame still needs transmitting).
    pub fn enqueue(
        &self,
        key: RequestKey,
        make_frame: impl FnOnce() -> CommandRequest,
    ) -> (PendingWait, bool) {
        let mut pending = self.pending.lock();
        if let Some(p) = pending.get(&key) {
            tracing::debug!(cmd = %key.0, target = %key.1, id = p.id, "joining in-flight request");
            return (p.wait.clone(), false);
        }
        let frame = make_frame();
        let (tx, rx) = oneshot::channel::<CommandOutcome>();
        let wait: PendingWait = rx.map(|res| res.ok()).boxed().shared();
        pending.insert(
            key,
            Pending {
                id: frame.id,
                frame,
                sent: false,
                tx: Some(tx),
                wait: wait.clone(),
            },
        );
        (wait, true)
    }

    /// Hand the frame out for its first transmission, marking it sent.
    /// Returns `None` if the entry is gone (already settled) or was already
    /// transmitted by another path (e.g. reconnect replay).
    pub fn take_for_transmit(&self, key: &RequestKey) -> Option<CommandRequest> {
        let mut pending = self.pending.lock();
        let p = pending.get_mut(key)?;
        if p.sent {
            return None;
        }
        p.sent = true;
        Some(p.frame.clone())
    }

    /// Whether an entry for `key` is still outstanding.
    pub fn contains(&self, key: &RequestKey) -> bool {
        self.pending.lock().contains_key(key)
    }

    /// Snapshot every outstanding frame for retransmission after a
    /// reconnect.  Ids are NOT reissued — the original frame is replayed
    /// as-is so the eventual response still correlates.
    pub fn outstanding_frames(&self) -> Vec<CommandRequest> {
        let mut pending = self.pending.lock();
        pending
            .values_mut()
            .map(|p| {
                p.sent = true;
                p.frame.clone()
            })
            .collect()
    }

    /// Settle the request with id `id` successfully.
    pub fn resolve(&self, id: u64, value: Option<Value>) {
        self.settle(id, Ok(value));
    }

    /// Reject the request with id `id` with a protocol error.
    pub fn reject(&self, id: u64, err: EngineError) {
        self.settle(id, Err(err));
    }

    fn settle(&self, id: u64, outcome: CommandOutcome) {
        let mut pending = self.pending.lock();
        // Linear scan: ids are sparse and the outstanding set is small.
        let key = pending
            .iter()
            .find(|(_, p)| p.id == id)
            .map(|(k, _)| k.clone());
        let Some(key) = key else {
            // Stale or duplicate response; the entry was already consumed.
            tracing::debug!(id, "response for unknown request id, dropping");
            return;
        };
        if let Some(mut p) = pending.remove(&key) {
            tracing::debug!(cmd = %key.0, target = %key.1, id, ok = outcome.is_ok(), "request settled");
            if let Some(tx) = p.tx.take() {
                let _ = tx.send(outcome);
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strata_protocol::ErrorCode;

    fn frame(id: u64, cmd: Command) -> CommandRequest {
        CommandRequest {
            id,
            cmd,
            target: Target::new("sys-A0", "Display", 1, "power"),
            args: None,
        }
    }

    fn key(cmd: Command) -> RequestKey {
        (cmd, Target::new("sys-A0", "Display", 1, "power"))
    }

    #[tokio::test]
    async fn identical_requests_share_one_entry() {
        let reg = RequestRegistry::new();
        let (first, created) = reg.enqueue(key(Command::Bind), || frame(1, Command::Bind));
        assert!(created);
        let (second, created) = reg.enqueue(key(Command::Bind), || frame(2, Command::Bind));
        assert!(!created, "second caller must join, not create");
        assert_eq!(reg.len(), 1);

        reg.resolve(1, Some(json!("ok")));
        assert_eq!(first.await, Some(Ok(Some(json!("ok")))));
        assert_eq!(second.await, Some(Ok(Some(json!("ok")))));
        assert_eq!(reg.len(), 0);
    }

    #[tokio::test]
    async fn different_commands_do_not_dedup() {
        let reg = RequestRegistry::new();
        let (_, created) = reg.enqueue(key(Command::Bind), || frame(1, Command::Bind));
        assert!(created);
        let (_, created) = reg.enqueue(key(Command::Unbind), || frame(2, Command::Unbind));
        assert!(created, "unbind must not share the bind entry");
        assert_eq!(reg.len(), 2);
    }

    #[tokio::test]
    async fn reject_carries_the_engine_error() {
        let reg = RequestRegistry::new();
        let (wait, _) = reg.enqueue(key(Command::Exec), || frame(1, Command::Exec));
        reg.reject(
            1,
            EngineError::new(2, Some("denied".into())),
        );
        let outcome = wait.await.unwrap();
        let err = outcome.unwrap_err();
        assert_eq!(err.code, ErrorCode::AccessDenied);
        assert_eq!(err.message, "denied");
    }

    #[tokio::test]
    async fn duplicate_response_is_a_no_op() {
        let reg = RequestRegistry::new();
        let (wait, _) = reg.enqueue(key(Command::Exec), || frame(1, Command::Exec));
        reg.reject(1, EngineError::new(2, Some("denied".into())));
        // Second response with the same id: entry already consumed.
        reg.resolve(1, Some(json!("late")));
        let outcome = wait.await.unwrap();
        assert!(outcome.is_err());
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn take_for_transmit_hands_out_each_frame_once() {
        let reg = RequestRegistry::new();
        let k = key(Command::Bind);
        reg.enqueue(k.clone(), || frame(1, Command::Bind));
        assert!(reg.take_for_transmit(&k).is_some());
        assert!(reg.take_for_transmit(&k).is_none(), "already handed out");
    }

    #[test]
    fn outstanding_frames_keep_original_ids() {
        let reg = RequestRegistry::new();
        let k = key(Command::Bind);
        reg.enqueue(k.clone(), || frame(7, Command::Bind));
        reg.take_for_transmit(&k);

        let frames = reg.outstanding_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id, 7, "replay must reuse the original id");
        // Replay marks sent; the offline retry path must now back off.
        assert!(reg.take_for_transmit(&k).is_none());
    }
}
