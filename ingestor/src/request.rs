use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tracing::trace;

type Waiters = HashMap<String, Vec<(u64, oneshot::Sender<Vec<u8>>)>>;

/// Single-shot waiters keyed by reply topic. Inbound messages that satisfy a
/// waiter are not routed any further.
#[derive(Debug, Default)]
pub struct PendingReplies {
    waiters: RwLock<Waiters>,
    next_id: AtomicU64,
}

impl PendingReplies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for the next message on `topic`.
    pub async fn register(&self, topic: &str) -> (u64, oneshot::Receiver<Vec<u8>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push((id, tx));
        (id, rx)
    }

    /// Deliver `payload` to every waiter on `topic`. Returns whether any
    /// waiter was registered for it.
    pub async fn complete(&self, topic: &str, payload: &[u8]) -> bool {
        let waiters = {
            let mut guard = self.waiters.write().await;
            guard.remove(topic)
        };
        let Some(waiters) = waiters else {
            return false;
        };
        for (id, tx) in waiters {
            if tx.send(payload.to_vec()).is_err() {
                trace!("Reply waiter {} on {} already gone", id, topic);
            }
        }
        true
    }

    /// Drop a waiter. A no-op if it was already completed.
    pub async fn remove(&self, topic: &str, id: u64) {
        let mut guard = self.waiters.write().await;
        if let Some(waiters) = guard.get_mut(topic) {
            waiters.retain(|(waiter, _)| *waiter != id);
            if waiters.is_empty() {
                guard.remove(topic);
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.waiters.read().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Wait for a reply, giving up after `timeout`.
pub async fn wait_for_reply(
    rx: oneshot::Receiver<Vec<u8>>,
    timeout: Duration,
) -> Option<Vec<u8>> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(payload)) => Some(payload),
        // Sender dropped without replying, or timed out
        Ok(Err(_)) | Err(_) => None,
    }
}
