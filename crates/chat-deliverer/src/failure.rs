//! One-shot subscriptions to the next batch of terminally failed records.

use chat_outbox::OutboxRecord;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

/// Identifies a subscription for [`FailureRegistry::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FailureToken(u64);

/// Receives the next failed batch, at most once.
#[derive(Debug)]
pub struct FailureSubscription {
    pub token: FailureToken,
    pub receiver: oneshot::Receiver<Vec<OutboxRecord>>,
}

impl FailureSubscription {
    /// Wait for the next failure. `None` if the subscription was dropped
    /// without firing.
    pub async fn recv(self) -> Option<Vec<OutboxRecord>> {
        self.receiver.await.ok()
    }
}

#[derive(Debug, Default)]
pub struct FailureRegistry {
    next_token: AtomicU64,
    subscribers: Mutex<HashMap<FailureToken, oneshot::Sender<Vec<OutboxRecord>>>>,
}

impl FailureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> FailureSubscription {
        let token = FailureToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.subscribers.lock().insert(token, tx);
        FailureSubscription {
            token,
            receiver: rx,
        }
    }

    pub fn unsubscribe(&self, token: FailureToken) {
        self.subscribers.lock().remove(&token);
    }

    /// Deliver `records` to every subscriber and clear the registry.
    pub fn alert(&self, records: &[OutboxRecord]) {
        let subscribers = std::mem::take(&mut *self.subscribers.lock());
        for (_, tx) in subscribers {
            // Receiver may already be gone.
            let _ = tx.send(records.to_vec());
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
