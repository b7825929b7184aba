//! # Chat Deliverer
//!
//! Background engine that guarantees locally composed chat messages reach
//! the chat server, despite flaky networks, restarts, and prerequisite work
//! (attachment uploads, link unfurls, coin-flip setup) that has to finish
//! first.
//!
//! ## Architecture
//!
//! ```text
//! queue() ──▶ Outbox ──▶ deliver loop ──▶ one worker per conversation
//!                ▲            ▲                  │
//!                │     timer / reconnect /       ├─ background-task gate
//!                │       new-message wake        ├─ duplicate reaction collapse
//!                │                               ├─ Sender::send
//!                └───── remove / record attempt ◀┴─ classify failure
//!                        / mark error
//! ```
//!
//! Delivery is at-least-once and ordered within a conversation. Transient
//! failures bump the record's attempt counter and are retried on the next
//! wake; permanent failures leave the record in an `Error` state and are
//! surfaced through activity notifications and one-shot failure
//! subscriptions.
//!
//! ## Crate Structure
//!
//! - [`engine`] - The [`Deliverer`] and its loops
//! - [`classify`] - Failure classification
//! - [`gates`] - Background-task gates
//! - [`reactions`] - Duplicate reaction collapse
//! - [`failure`] - Failure subscriptions
//! - [`collaborators`] - Interfaces the engine consumes
//! - [`bootstrap`] - On-disk wiring for hosts

pub mod bootstrap;
pub mod classify;
pub mod collaborators;
pub mod config;
pub mod engine;
mod error;
pub mod failure;
pub mod gates;
pub mod reactions;

#[cfg(test)]
mod tests;

pub use bootstrap::open_deliverer;
pub use classify::{classify, Classification, ConnectivitySnapshot};
pub use collaborators::{
    ActivityNotifier, AttachmentUploadResult, AttachmentUploadStatus, AttachmentUploader,
    BackgroundTask, BadgeRefresher, ChatActivity, Collaborators, ConversationInfo,
    FlipManager, FlipSendStatus, InboxSource, LocalInboxSource, LocalMtimeUpdate,
    NullActivityNotifier, NullBadgeRefresher, RecordingActivityNotifier, SendContext, Sender,
    ServerConnection, UnfurlStatus, Unfurler,
};
pub use config::DelivererConfig;
pub use engine::{Deliverer, StopHandle};
pub use error::{DelivererError, DelivererResult, SendError};
pub use failure::{FailureRegistry, FailureSubscription, FailureToken};
