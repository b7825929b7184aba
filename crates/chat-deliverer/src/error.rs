//! Deliverer error types.

use crate::collaborators::BackgroundTask;
use chat_outbox::{OutboxError, OutboxErrorKind};
use deliverer_config_and_utils::CoreError;
use thiserror::Error;

/// Errors returned by the deliverer's public API and its collaborators.
#[derive(Error, Debug)]
pub enum DelivererError {
    /// Outbox storage error
    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),

    /// Configuration or filesystem error while wiring the engine
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// An operation needs an outbox but `start` has not bound one yet
    #[error("Deliverer not started")]
    NotStarted,

    /// A collaborator (uploader, inbox, badger, ...) failed
    #[error("Collaborator error: {0}")]
    Collaborator(String),
}

/// Result type alias using DelivererError.
pub type DelivererResult<T> = Result<T, DelivererError>;

/// Why a single delivery attempt failed.
///
/// Classified into a taxonomy code and a permanent/transient verdict by
/// [`crate::classify::classify`].
#[derive(Error, Debug)]
pub enum SendError {
    /// Generic sender failure that states its own permanence.
    #[error("senderError: {message}, permanent: {permanent}")]
    Sender { message: String, permanent: bool },

    /// The record sat in the outbox for too long.
    #[error("message failed to send")]
    Expired,

    /// The server rejected the message outright.
    #[error("{message}")]
    Rejected {
        kind: OutboxErrorKind,
        message: String,
    },

    /// A prerequisite background task failed.
    #[error("{task} error: {message}")]
    BackgroundTask {
        task: BackgroundTask,
        message: String,
        permanent: bool,
    },

    /// The message could not be unboxed.
    #[error("unboxing error: {message}")]
    Unboxing { message: String, permanent: bool },

    /// Transport-level failure.
    #[error("network error: {message}")]
    Network { message: String, temporary: bool },

    #[error("chat server timeout")]
    ChatServerTimeout,

    /// Another connection attempt raced this one.
    #[error("duplicate connection")]
    DuplicateConnection,

    #[error("key server timeout")]
    KeyServerTimeout,

    #[error("outbox error: {0}")]
    Outbox(#[from] OutboxError),

    /// Anything else. Treated as permanent.
    #[error("{0}")]
    Other(String),
}

impl SendError {
    /// Synthesized for every attempt made while offline.
    pub fn disconnected() -> Self {
        SendError::Sender {
            message: "disconnected from chat server".to_string(),
            permanent: false,
        }
    }
}
