use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tracing::debug;

/// How a wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// The next inbound message on the conversation.
    Answer(String),
    /// A newer wait on the same conversation replaced this one.
    Superseded,
    /// The deadline passed with no message.
    TimedOut,
}

struct Pending {
    seq: u64,
    tx: oneshot::Sender<ReplyOutcome>,
}

/// Keyed single-slot rendezvous between an outstanding question and the next
/// inbound message on the same conversation.
///
/// At most one pending slot exists per conversation key. Registering a new
/// wait supersedes the old one. A wait that reaches its deadline resolves as
/// timed out; interpreting that (denial, "no change") is the caller's job.
/// Check-and-clear is atomic under one mutex, so a reply and a timeout can
/// never both resolve the same wait.
#[derive(Default)]
pub struct ReplyBroker {
    pending: Mutex<HashMap<String, Pending>>,
    seq: std::sync::atomic::AtomicU64,
}

impl ReplyBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the next inbound message on `conversation`, up to `deadline`.
    pub async fn await_reply(&self, conversation: &str, deadline: Duration) -> ReplyOutcome {
        let (tx, rx) = oneshot::channel();
        let seq = self
            .seq
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        {
            let mut pending = self.pending.lock().await;
            if let Some(stale) = pending.insert(conversation.to_string(), Pending { seq, tx }) {
                debug!("Superseding stale pending reply for {conversation}");
                let _ = stale.tx.send(ReplyOutcome::Superseded);
            }
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without resolving; nothing arrived.
            Ok(Err(_)) => ReplyOutcome::TimedOut,
            Err(_) => {
                // Deadline hit. Clear our own slot, but only if it is still
                // ours; a newer wait may have superseded it meanwhile.
                let mut pending = self.pending.lock().await;
                if pending.get(conversation).is_some_and(|p| p.seq == seq) {
                    pending.remove(conversation);
                }
                ReplyOutcome::TimedOut
            }
        }
    }

    /// Hand an inbound message to the pending wait for this conversation.
    ///
    /// Returns true if a wait consumed it; the caller must then not process
    /// the message as a new user turn.
    pub async fn resolve(&self, conversation: &str, text: &str) -> bool {
        let slot = self.pending.lock().await.remove(conversation);
        match slot {
            Some(p) => {
                let _ = p.tx.send(ReplyOutcome::Answer(text.to_string()));
                true
            }
            None => false,
        }
    }

    /// Drop a pending wait whose waiter is gone (its future was cancelled
    /// mid-await), so the next inbound message is not silently consumed by
    /// a dead slot. A live wait is left untouched.
    pub async fn withdraw(&self, conversation: &str) {
        let mut pending = self.pending.lock().await;
        if pending.get(conversation).is_some_and(|p| p.tx.is_closed()) {
            pending.remove(conversation);
        }
    }

    pub async fn has_pending(&self, conversation: &str) -> bool {
        self.pending.lock().await.contains_key(conversation)
    }
}
