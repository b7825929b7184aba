//! In-memory outbox storage, used in tests and for ephemeral sessions.

use crate::clock::Clock;
use crate::error::OutboxResult;
use crate::store::{Outbox, OutboxProvider, OutboxStorage, StoredOutbox};
use crate::types::{OutboxRecord, Uid};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct MemoryStorage {
    records: Mutex<Vec<OutboxRecord>>,
}

impl OutboxStorage for MemoryStorage {
    fn read_records(&self) -> OutboxResult<Vec<OutboxRecord>> {
        Ok(self.records.lock().clone())
    }

    fn write_records(&self, records: &[OutboxRecord]) -> OutboxResult<()> {
        *self.records.lock() = records.to_vec();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

pub type MemoryOutbox = StoredOutbox<MemoryStorage>;

impl MemoryOutbox {
    pub fn in_memory(uid: Uid, clock: Arc<dyn Clock>) -> Self {
        StoredOutbox::new(uid, MemoryStorage::default(), clock)
    }
}

/// Hands out one shared in-memory outbox per identity.
pub struct MemoryOutboxProvider {
    clock: Arc<dyn Clock>,
    outboxes: Mutex<HashMap<Uid, Arc<MemoryOutbox>>>,
}

impl MemoryOutboxProvider {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            outboxes: Mutex::new(HashMap::new()),
        }
    }
}

impl OutboxProvider for MemoryOutboxProvider {
    fn open(&self, uid: &Uid) -> OutboxResult<Arc<dyn Outbox>> {
        let mut outboxes = self.outboxes.lock();
        let outbox = outboxes
            .entry(uid.clone())
            .or_insert_with(|| Arc::new(MemoryOutbox::in_memory(uid.clone(), self.clock.clone())))
            .clone();
        Ok(outbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::{ConversationId, MessageBody, MessagePlaintext, NewOutboxMessage};

    #[test]
    fn provider_returns_the_same_outbox_per_uid() {
        let provider = MemoryOutboxProvider::new(Arc::new(ManualClock::default()));
        let alice = Uid::from("alice");

        let first = provider.open(&alice).unwrap();
        first
            .push_message(NewOutboxMessage {
                conv_id: ConversationId::from("c1"),
                msg: MessagePlaintext::new(
                    alice.clone(),
                    MessageBody::Text {
                        body: "hi".to_string(),
                    },
                ),
                outbox_id: None,
                send_opts: None,
                prepare_opts: None,
                identify_behavior: Default::default(),
            })
            .unwrap();

        let again = provider.open(&alice).unwrap();
        assert_eq!(again.pull_all_conversations(true, false).unwrap().len(), 1);

        let bob = provider.open(&Uid::from("bob")).unwrap();
        assert!(bob.pull_all_conversations(true, false).unwrap().is_empty());
    }
}
