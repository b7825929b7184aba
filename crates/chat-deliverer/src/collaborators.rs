//! Interfaces the deliverer consumes, plus the default implementations
//! used when a host does not provide one.

use crate::error::{DelivererResult, SendError};
use async_trait::async_trait;
use chat_outbox::{
    Asset, ConversationId, IdentifyBehavior, MessagePlaintext, OutboxId, OutboxRecord,
    PrepareOptions, SendOptions, Uid, UnfurlResult,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Per-attempt context handed to the [`Sender`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendContext {
    pub uid: Uid,
    pub identify_behavior: IdentifyBehavior,
    /// Absent for fire-and-forget sends that never touch the outbox.
    pub outbox_id: Option<OutboxId>,
}

/// Boxes and transmits one message to the chat server.
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(
        &self,
        conv_id: &ConversationId,
        msg: &MessagePlaintext,
        send_opts: Option<&SendOptions>,
        prepare_opts: Option<&PrepareOptions>,
        ctx: &SendContext,
    ) -> Result<(), SendError>;
}

/// Connection to the chat server.
#[async_trait]
pub trait ServerConnection: Send + Sync {
    /// Force a reconnect. Returns whether a new connection was made.
    async fn reconnect(&self) -> DelivererResult<bool>;
}

/// Prerequisite work some message types wait on before sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundTask {
    AttachmentUpload,
    Unfurl,
    Flip,
}

impl fmt::Display for BackgroundTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackgroundTask::AttachmentUpload => "attachment upload",
            BackgroundTask::Unfurl => "unfurl",
            BackgroundTask::Flip => "flip",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AttachmentUploadResult {
    pub object: Asset,
    pub preview: Option<Asset>,
    pub metadata: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentUploadStatus {
    Uploading,
    Success(AttachmentUploadResult),
    Failed { error: Option<String> },
}

#[async_trait]
pub trait AttachmentUploader: Send + Sync {
    async fn status(&self, outbox_id: &OutboxId) -> DelivererResult<AttachmentUploadStatus>;

    /// Restart (or keep running) the upload for an outbox record.
    async fn retry(&self, outbox_id: &OutboxId) -> DelivererResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnfurlStatus {
    Unfurling,
    /// Finished; `None` means the unfurler lost its result.
    Success(Option<UnfurlResult>),
    Failed,
    PermFailed,
}

#[async_trait]
pub trait Unfurler: Send + Sync {
    async fn status(&self, outbox_id: &OutboxId) -> DelivererResult<UnfurlStatus>;
    async fn retry(&self, outbox_id: &OutboxId);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlipSendStatus {
    InProgress,
    /// Game conversation is ready.
    Sent(ConversationId),
    Error,
}

#[async_trait]
pub trait FlipManager: Send + Sync {
    async fn flip_conversation_status(&self, outbox_id: &OutboxId) -> FlipSendStatus;
}

/// Local view of a conversation after its version was bumped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationInfo {
    pub conv_id: ConversationId,
    pub local_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatActivity {
    /// A message was pushed onto the outbox and can be rendered as pending.
    LocalMessage(OutboxRecord),
    /// Records reached a terminal error.
    FailedMessage {
        records: Vec<OutboxRecord>,
        conversation: Option<ConversationInfo>,
    },
}

/// Fan-out of chat activity to UI listeners.
pub trait ActivityNotifier: Send + Sync {
    fn activity(&self, uid: &Uid, activity: ChatActivity);
}

/// Discards all activity.
#[derive(Debug, Default)]
pub struct NullActivityNotifier;

impl ActivityNotifier for NullActivityNotifier {
    fn activity(&self, _uid: &Uid, _activity: ChatActivity) {}
}

/// Keeps every activity for later inspection.
#[derive(Debug, Default)]
pub struct RecordingActivityNotifier {
    activities: Mutex<Vec<ChatActivity>>,
}

impl RecordingActivityNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activities(&self) -> Vec<ChatActivity> {
        self.activities.lock().clone()
    }

    /// Records from every `FailedMessage` activity, in emission order.
    pub fn failed_records(&self) -> Vec<OutboxRecord> {
        self.activities
            .lock()
            .iter()
            .filter_map(|a| match a {
                ChatActivity::FailedMessage { records, .. } => Some(records.clone()),
                ChatActivity::LocalMessage(_) => None,
            })
            .flatten()
            .collect()
    }
}

impl ActivityNotifier for RecordingActivityNotifier {
    fn activity(&self, _uid: &Uid, activity: ChatActivity) {
        self.activities.lock().push(activity);
    }
}

/// Recomputes unread badges.
#[async_trait]
pub trait BadgeRefresher: Send + Sync {
    async fn send(&self) -> DelivererResult<()>;
}

#[derive(Debug, Default)]
pub struct NullBadgeRefresher;

#[async_trait]
impl BadgeRefresher for NullBadgeRefresher {
    async fn send(&self) -> DelivererResult<()> {
        Ok(())
    }
}

/// New local modification time for one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMtimeUpdate {
    pub conv_id: ConversationId,
    pub mtime: DateTime<Utc>,
}

/// Local inbox cache.
#[async_trait]
pub trait InboxSource: Send + Sync {
    async fn increment_local_conv_version(
        &self,
        uid: &Uid,
        conv_id: &ConversationId,
    ) -> DelivererResult<ConversationInfo>;

    /// Move conversations up the local inbox ahead of the server's view.
    async fn update_local_mtime(
        &self,
        uid: &Uid,
        updates: &[LocalMtimeUpdate],
    ) -> DelivererResult<()>;

    /// Tell inbox listeners that a conversation changed locally.
    async fn notify_update(&self, uid: &Uid, conv_id: &ConversationId);
}

/// In-memory per-conversation version counters and mtimes.
#[derive(Debug, Default)]
pub struct LocalInboxSource {
    versions: Mutex<HashMap<(Uid, ConversationId), u64>>,
    mtimes: Mutex<HashMap<(Uid, ConversationId), DateTime<Utc>>>,
    updates: Mutex<Vec<(Uid, ConversationId)>>,
}

impl LocalInboxSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self, uid: &Uid, conv_id: &ConversationId) -> u64 {
        self.versions
            .lock()
            .get(&(uid.clone(), conv_id.clone()))
            .copied()
            .unwrap_or(0)
    }

    pub fn local_mtime(&self, uid: &Uid, conv_id: &ConversationId) -> Option<DateTime<Utc>> {
        self.mtimes
            .lock()
            .get(&(uid.clone(), conv_id.clone()))
            .copied()
    }

    /// Conversations announced through `notify_update`, oldest first.
    pub fn notified_updates(&self) -> Vec<(Uid, ConversationId)> {
        self.updates.lock().clone()
    }
}

#[async_trait]
impl InboxSource for LocalInboxSource {
    async fn increment_local_conv_version(
        &self,
        uid: &Uid,
        conv_id: &ConversationId,
    ) -> DelivererResult<ConversationInfo> {
        let mut versions = self.versions.lock();
        let version = versions.entry((uid.clone(), conv_id.clone())).or_insert(0);
        *version += 1;
        Ok(ConversationInfo {
            conv_id: conv_id.clone(),
            local_version: *version,
        })
    }

    async fn update_local_mtime(
        &self,
        uid: &Uid,
        updates: &[LocalMtimeUpdate],
    ) -> DelivererResult<()> {
        let mut mtimes = self.mtimes.lock();
        for update in updates {
            mtimes.insert((uid.clone(), update.conv_id.clone()), update.mtime);
        }
        Ok(())
    }

    async fn notify_update(&self, uid: &Uid, conv_id: &ConversationId) {
        self.updates.lock().push((uid.clone(), conv_id.clone()));
    }
}

/// Everything the engine talks to besides its outbox.
///
/// Background-task providers are optional; a record that needs a missing
/// provider fails permanently.
#[derive(Clone)]
pub struct Collaborators {
    pub sender: Arc<dyn Sender>,
    pub server: Arc<dyn ServerConnection>,
    pub attachments: Option<Arc<dyn AttachmentUploader>>,
    pub unfurler: Option<Arc<dyn Unfurler>>,
    pub flips: Option<Arc<dyn FlipManager>>,
    pub notifier: Arc<dyn ActivityNotifier>,
    pub badger: Arc<dyn BadgeRefresher>,
    pub inbox: Arc<dyn InboxSource>,
}

impl Collaborators {
    pub fn new(sender: Arc<dyn Sender>, server: Arc<dyn ServerConnection>) -> Self {
        Self {
            sender,
            server,
            attachments: None,
            unfurler: None,
            flips: None,
            notifier: Arc::new(NullActivityNotifier),
            badger: Arc::new(NullBadgeRefresher),
            inbox: Arc::new(LocalInboxSource::new()),
        }
    }

    pub fn with_attachment_uploader(mut self, uploader: Arc<dyn AttachmentUploader>) -> Self {
        self.attachments = Some(uploader);
        self
    }

    pub fn with_unfurler(mut self, unfurler: Arc<dyn Unfurler>) -> Self {
        self.unfurler = Some(unfurler);
        self
    }

    pub fn with_flip_manager(mut self, flips: Arc<dyn FlipManager>) -> Self {
        self.flips = Some(flips);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ActivityNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_badger(mut self, badger: Arc<dyn BadgeRefresher>) -> Self {
        self.badger = badger;
        self
    }

    pub fn with_inbox(mut self, inbox: Arc<dyn InboxSource>) -> Self {
        self.inbox = inbox;
        self
    }
}
