//! Failure classification.
//!
//! Maps a failed attempt to a taxonomy code and a permanent/transient
//! verdict. Checks run in precedence order: attempt ceiling, offline
//! window, then the error's own shape. Unknown errors are permanent.

use crate::config::DelivererConfig;
use crate::error::SendError;
use chat_outbox::{MessageType, OutboxErrorKind, OutboxRecord, OutboxStateError};

/// Connectivity as seen at the moment of classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivitySnapshot {
    pub connected: bool,
    /// Zero while connected.
    pub disconnected_for: chrono::Duration,
}

impl ConnectivitySnapshot {
    pub fn online() -> Self {
        Self {
            connected: true,
            disconnected_for: chrono::Duration::zero(),
        }
    }

    pub fn offline_for(duration: chrono::Duration) -> Self {
        Self {
            connected: false,
            disconnected_for: duration,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: OutboxErrorKind,
    pub permanent: bool,
    /// The connection looks broken and should be re-established.
    pub reconnect: bool,
    /// Text stored on the record if the failure is terminal.
    pub message: String,
}

impl Classification {
    fn new(kind: OutboxErrorKind, permanent: bool, message: String) -> Self {
        Self {
            kind,
            permanent,
            reconnect: false,
            message,
        }
    }

    pub fn state_error(&self) -> OutboxStateError {
        OutboxStateError {
            kind: self.kind,
            message: self.message.clone(),
        }
    }
}

pub fn classify(
    record: &OutboxRecord,
    err: &SendError,
    connectivity: &ConnectivitySnapshot,
    config: &DelivererConfig,
) -> Classification {
    if record.attempts() >= config.max_attempts {
        return Classification::new(
            OutboxErrorKind::TooManyAttempts,
            true,
            "max send attempts reached".to_string(),
        );
    }

    let message = err.to_string();
    if !connectivity.connected && connectivity.disconnected_for > config.disconnect_limit {
        return Classification::new(OutboxErrorKind::Offline, true, message);
    }

    match err {
        SendError::Unboxing { permanent, .. } => {
            Classification::new(OutboxErrorKind::Misc, *permanent, message)
        }
        SendError::Sender { permanent, .. } => {
            Classification::new(OutboxErrorKind::Misc, *permanent, message)
        }
        SendError::Expired => Classification::new(OutboxErrorKind::Expired, true, message),
        SendError::Rejected { kind, .. } => Classification::new(*kind, true, message),
        SendError::BackgroundTask { permanent, .. } => {
            Classification::new(OutboxErrorKind::Misc, *permanent, message)
        }
        SendError::Network { temporary, .. } => Classification {
            reconnect: true,
            ..Classification::new(OutboxErrorKind::Offline, !*temporary, message)
        },
        SendError::ChatServerTimeout
        | SendError::DuplicateConnection
        | SendError::KeyServerTimeout => {
            Classification::new(OutboxErrorKind::Misc, false, message)
        }
        SendError::Outbox(_) | SendError::Other(_) => {
            Classification::new(OutboxErrorKind::Misc, true, message)
        }
    }
}

/// Racing reconnects are not the message's fault.
pub fn should_record_error(err: &SendError) -> bool {
    !matches!(err, SendError::DuplicateConnection)
}

/// Unfurls decorate other messages, so a stuck unfurl must not hold up
/// the rest of its conversation.
pub fn should_break_loop(record: &OutboxRecord) -> bool {
    record.message_type() != MessageType::Unfurl
}
