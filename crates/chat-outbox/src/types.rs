//! Outbox data model: identifiers, message payloads, and record state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Identity that owns an outbox.
    Uid
);
string_id!(
    /// Conversation a record is sent to.
    ConversationId
);
string_id!(
    /// Unique identifier of a pending outbound message.
    OutboxId
);

impl OutboxId {
    /// Generate a random 16-hex-character outbox ID.
    pub fn generate() -> Self {
        let mut id = uuid::Uuid::new_v4().simple().to_string();
        id.truncate(16);
        Self(id)
    }
}

/// Server-assigned message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Topic a conversation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TopicType {
    #[default]
    Chat,
    Dev,
    /// File-edit notifications; delivered best-effort outside the outbox.
    KbfsFileEdit,
}

/// How strictly the sender should verify participant identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IdentifyBehavior {
    #[default]
    Default,
    ChatCli,
    ChatGui,
    ChatSkip,
}

/// Message kind, derived from the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Attachment,
    Unfurl,
    Flip,
    Reaction,
    Edit,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Asset {
    pub filename: String,
    pub path: String,
    pub size: u64,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MessageAttachment {
    pub object: Asset,
    pub preview: Option<Asset>,
    #[serde(default)]
    pub previews: Vec<Asset>,
    #[serde(default)]
    pub metadata: Vec<u8>,
    pub uploaded: bool,
}

/// Result of a link unfurl.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UnfurlResult {
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageUnfurl {
    /// Message the unfurl decorates.
    pub message_id: Option<MessageId>,
    pub unfurl: Option<UnfurlResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFlip {
    pub text: String,
    pub game_id: String,
    /// Conversation hosting the flip game, known once the game is set up.
    pub flip_conv_id: Option<ConversationId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReaction {
    pub message_id: MessageId,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    Text { body: String },
    Attachment(MessageAttachment),
    Unfurl(MessageUnfurl),
    Flip(MessageFlip),
    Reaction(MessageReaction),
    Edit { message_id: MessageId, body: String },
    Delete { message_ids: Vec<MessageId> },
}

impl MessageBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageBody::Text { .. } => MessageType::Text,
            MessageBody::Attachment(_) => MessageType::Attachment,
            MessageBody::Unfurl(_) => MessageType::Unfurl,
            MessageBody::Flip(_) => MessageType::Flip,
            MessageBody::Reaction(_) => MessageType::Reaction,
            MessageBody::Edit { .. } => MessageType::Edit,
            MessageBody::Delete { .. } => MessageType::Delete,
        }
    }

    pub fn reaction(&self) -> Option<&MessageReaction> {
        match self {
            MessageBody::Reaction(reaction) => Some(reaction),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHeader {
    pub sender: Uid,
    #[serde(default)]
    pub topic_type: TopicType,
    /// Message this one edits, deletes, or decorates.
    pub supersedes: Option<MessageId>,
    /// Set by the outbox when the message is pushed.
    pub outbox_id: Option<OutboxId>,
    pub ephemeral_lifetime_secs: Option<u64>,
}

/// A message as composed locally, before boxing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePlaintext {
    pub header: ClientHeader,
    pub body: MessageBody,
}

impl MessagePlaintext {
    pub fn new(sender: Uid, body: MessageBody) -> Self {
        Self {
            header: ClientHeader {
                sender,
                topic_type: TopicType::Chat,
                supersedes: None,
                outbox_id: None,
                ephemeral_lifetime_secs: None,
            },
            body,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    pub fn is_ephemeral(&self) -> bool {
        self.header.ephemeral_lifetime_secs.is_some()
    }

    /// Whether queueing this message should bump its conversation in the inbox.
    pub fn is_badgable(&self) -> bool {
        matches!(
            self.message_type(),
            MessageType::Text | MessageType::Attachment
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SendOptions {
    /// Membership status to join mentioned users as.
    pub join_mentions_as: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PrepareOptions {
    pub skip_topic_name_state: bool,
    pub reply_to: Option<MessageId>,
}

/// Terminal failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxErrorKind {
    Misc,
    Expired,
    TooManyAttempts,
    Offline,
    Duplicate,
    AlreadyDeleted,
}

impl fmt::Display for OutboxErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutboxErrorKind::Misc => "MISC",
            OutboxErrorKind::Expired => "EXPIRED",
            OutboxErrorKind::TooManyAttempts => "TOO_MANY_ATTEMPTS",
            OutboxErrorKind::Offline => "OFFLINE",
            OutboxErrorKind::Duplicate => "DUPLICATE",
            OutboxErrorKind::AlreadyDeleted => "ALREADY_DELETED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxStateError {
    pub kind: OutboxErrorKind,
    pub message: String,
}

/// Delivery state of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OutboxState {
    Sending { attempts: u32 },
    Error(OutboxStateError),
}

impl OutboxState {
    pub fn is_sending(&self) -> bool {
        matches!(self, OutboxState::Sending { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, OutboxState::Error(_))
    }

    pub fn error(&self) -> Option<&OutboxStateError> {
        match self {
            OutboxState::Error(err) => Some(err),
            OutboxState::Sending { .. } => None,
        }
    }
}

/// One queued message plus its delivery state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub conv_id: ConversationId,
    pub outbox_id: OutboxId,
    pub msg: MessagePlaintext,
    pub send_opts: Option<SendOptions>,
    pub prepare_opts: Option<PrepareOptions>,
    pub identify_behavior: IdentifyBehavior,
    pub ctime: DateTime<Utc>,
    /// Predicted position in the conversation thread.
    pub ordinal: i64,
    pub state: OutboxState,
}

impl OutboxRecord {
    pub fn message_type(&self) -> MessageType {
        self.msg.message_type()
    }

    /// Number of failed attempts so far; zero once errored.
    pub fn attempts(&self) -> u32 {
        match self.state {
            OutboxState::Sending { attempts } => attempts,
            OutboxState::Error(_) => 0,
        }
    }
}

/// Everything needed to push a new message onto an outbox.
#[derive(Debug, Clone)]
pub struct NewOutboxMessage {
    pub conv_id: ConversationId,
    pub msg: MessagePlaintext,
    /// Caller-supplied ID; generated when absent.
    pub outbox_id: Option<OutboxId>,
    pub send_opts: Option<SendOptions>,
    pub prepare_opts: Option<PrepareOptions>,
    pub identify_behavior: IdentifyBehavior,
}
