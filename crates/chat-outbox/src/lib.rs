//! # Chat Outbox
//!
//! Durable, per-identity queue of outgoing chat messages that have not yet
//! been confirmed by the server.
//!
//! ## Architecture
//!
//! ```text
//! Outbox (trait)
//!   └── StoredOutbox<S>   read → edit → write, under one lock
//!         ├── MemoryStorage
//!         └── SqliteStorage   one database file per identity
//! ```
//!
//! Records carry the message, its send options, a creation time, a
//! predicted thread ordinal, and a delivery state that is either
//! `Sending { attempts }` or a terminal `Error`.
//!
//! ## Example
//!
//! ```rust
//! use chat_outbox::{
//!     ConversationId, ManualClock, MemoryOutbox, MessageBody, MessagePlaintext,
//!     NewOutboxMessage, Outbox, Uid,
//! };
//! use std::sync::Arc;
//!
//! let uid = Uid::from("alice");
//! let outbox = MemoryOutbox::in_memory(uid.clone(), Arc::new(ManualClock::default()));
//!
//! let record = outbox
//!     .push_message(NewOutboxMessage {
//!         conv_id: ConversationId::from("general"),
//!         msg: MessagePlaintext::new(uid, MessageBody::Text { body: "hi".into() }),
//!         outbox_id: None,
//!         send_opts: None,
//!         prepare_opts: None,
//!         identify_behavior: Default::default(),
//!     })
//!     .unwrap();
//!
//! assert_eq!(record.attempts(), 0);
//! assert_eq!(outbox.pull_all_conversations(false, false).unwrap().len(), 1);
//! ```

pub mod clock;
mod error;
pub mod memory;
pub mod sqlite;
pub mod store;
pub mod types;

#[cfg(test)]
mod tests;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{OutboxError, OutboxResult};
pub use memory::{MemoryOutbox, MemoryOutboxProvider, MemoryStorage};
pub use sqlite::{SqliteOutbox, SqliteOutboxProvider, SqliteStorage};
pub use store::{
    Outbox, OutboxProvider, OutboxStorage, StoredOutbox, EPHEMERAL_PURGE_CUTOFF_SECS,
    ERROR_PURGE_CUTOFF_SECS, OUTBOX_ORDINAL_START,
};
pub use types::{
    Asset, ClientHeader, ConversationId, IdentifyBehavior, MessageAttachment, MessageBody,
    MessageFlip, MessageId, MessagePlaintext, MessageReaction, MessageType, MessageUnfurl,
    NewOutboxMessage, OutboxErrorKind, OutboxId, OutboxRecord, OutboxState, OutboxStateError,
    PrepareOptions, SendOptions, TopicType, UnfurlResult, Uid,
};
