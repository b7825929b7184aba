//! Behavioral tests for the outbox, run against both storage engines.
//!
//! - `ordering.rs` - creation order, ordinals, supplied IDs
//! - `state.rs`    - attempts, errors, updates, removal, retry
//! - `purge.rs`    - stale error cleanup

mod state;

use crate::clock::ManualClock;
use crate::memory::MemoryOutbox;
use crate::sqlite::SqliteStorage;
use crate::store::{Outbox, StoredOutbox};
use crate::types::{
    ConversationId, MessageBody, MessagePlaintext, NewOutboxMessage, OutboxErrorKind,
    OutboxStateError, Uid,
};
use std::sync::Arc;

pub(crate) fn uid() -> Uid {
    Uid::from("alice")
}

/// One outbox per engine, sharing a manual clock.
pub(crate) fn outboxes(clock: &ManualClock) -> Vec<Arc<dyn Outbox>> {
    vec![
        Arc::new(MemoryOutbox::in_memory(uid(), Arc::new(clock.clone()))),
        Arc::new(StoredOutbox::new(
            uid(),
            SqliteStorage::in_memory().unwrap(),
            Arc::new(clock.clone()),
        )),
    ]
}

pub(crate) fn text(conv: &str, body: &str) -> NewOutboxMessage {
    NewOutboxMessage {
        conv_id: ConversationId::from(conv),
        msg: MessagePlaintext::new(
            uid(),
            MessageBody::Text {
                body: body.to_string(),
            },
        ),
        outbox_id: None,
        send_opts: None,
        prepare_opts: None,
        identify_behavior: Default::default(),
    }
}

pub(crate) fn misc_error(message: &str) -> OutboxStateError {
    OutboxStateError {
        kind: OutboxErrorKind::Misc,
        message: message.to_string(),
    }
}
