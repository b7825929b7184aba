//! Engine-level tests for the deliverer.
//!
//! - `lifecycle.rs` - start/stop, wake signals, bypass queue, active deliveries
//! - `attempts.rs`  - attempt counting, ceilings, expiry, pass ordering
//! - `offline.rs`   - connectivity gate and offline failure window
//! - `gating.rs`    - attachment, unfurl, and flip gates
//! - `reactions.rs` - duplicate reaction collapse inside a pass
//! - `failures.rs`  - terminal handling, subscriptions, retry/cancel/purge
//!
//! Most tests drive single passes with a manual clock; lifecycle tests run
//! the real loops with a short interval.

mod reactions;

use crate::collaborators::{
    AttachmentUploadStatus, AttachmentUploader, BadgeRefresher, Collaborators, FlipManager,
    FlipSendStatus, LocalInboxSource, RecordingActivityNotifier, SendContext, Sender,
    ServerConnection, UnfurlStatus, Unfurler,
};
use crate::config::DelivererConfig;
use crate::engine::Deliverer;
use crate::error::{DelivererError, DelivererResult, SendError};
use async_trait::async_trait;
use chat_outbox::{
    ConversationId, ManualClock, MemoryOutboxProvider, MessageBody, MessageId, MessagePlaintext,
    MessageReaction, NewOutboxMessage, Outbox, OutboxId, OutboxRecord, PrepareOptions,
    SendOptions, Uid,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub(crate) fn uid() -> Uid {
    Uid::from("alice")
}

pub(crate) fn text(conv: &str, body: &str) -> NewOutboxMessage {
    message(
        conv,
        MessageBody::Text {
            body: body.to_string(),
        },
    )
}

pub(crate) fn reaction(conv: &str, emoji: &str) -> NewOutboxMessage {
    message(
        conv,
        MessageBody::Reaction(MessageReaction {
            message_id: MessageId(7),
            body: emoji.to_string(),
        }),
    )
}

pub(crate) fn message(conv: &str, body: MessageBody) -> NewOutboxMessage {
    NewOutboxMessage {
        conv_id: ConversationId::from(conv),
        msg: MessagePlaintext::new(uid(), body),
        outbox_id: None,
        send_opts: None,
        prepare_opts: None,
        identify_behavior: Default::default(),
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SentMessage {
    pub conv_id: ConversationId,
    pub body: MessageBody,
    pub ctx: SendContext,
}

type SendFn = dyn Fn(&ConversationId, &MessagePlaintext) -> Result<(), SendError> + Send + Sync;

/// Sender whose outcome is decided per call by a closure.
pub(crate) struct MockSender {
    respond: Box<SendFn>,
    sent: Mutex<Vec<SentMessage>>,
    calls: AtomicUsize,
}

impl MockSender {
    pub fn new(
        respond: impl Fn(&ConversationId, &MessagePlaintext) -> Result<(), SendError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            respond: Box::new(respond),
            sent: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn ok() -> Self {
        Self::new(|_, _| Ok(()))
    }

    /// Messages that went out successfully.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sender for MockSender {
    async fn send(
        &self,
        conv_id: &ConversationId,
        msg: &MessagePlaintext,
        _send_opts: Option<&SendOptions>,
        _prepare_opts: Option<&PrepareOptions>,
        ctx: &SendContext,
    ) -> Result<(), SendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.respond)(conv_id, msg)?;
        self.sent.lock().push(SentMessage {
            conv_id: conv_id.clone(),
            body: msg.body.clone(),
            ctx: ctx.clone(),
        });
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MockServer {
    reconnects: AtomicUsize,
}

impl MockServer {
    pub fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServerConnection for MockServer {
    async fn reconnect(&self) -> DelivererResult<bool> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

#[derive(Default)]
pub(crate) struct CountingBadger {
    sends: AtomicUsize,
}

impl CountingBadger {
    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BadgeRefresher for CountingBadger {
    async fn send(&self) -> DelivererResult<()> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) struct MockUploader {
    pub status: Mutex<AttachmentUploadStatus>,
    pub retry_fails: Mutex<bool>,
    retries: AtomicUsize,
}

impl MockUploader {
    pub fn new(status: AttachmentUploadStatus) -> Self {
        Self {
            status: Mutex::new(status),
            retry_fails: Mutex::new(false),
            retries: AtomicUsize::new(0),
        }
    }

    pub fn retries(&self) -> usize {
        self.retries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AttachmentUploader for MockUploader {
    async fn status(&self, _outbox_id: &OutboxId) -> DelivererResult<AttachmentUploadStatus> {
        Ok(self.status.lock().clone())
    }

    async fn retry(&self, _outbox_id: &OutboxId) -> DelivererResult<()> {
        self.retries.fetch_add(1, Ordering::SeqCst);
        if *self.retry_fails.lock() {
            return Err(DelivererError::Collaborator("upload task missing".to_string()));
        }
        Ok(())
    }
}

pub(crate) struct MockUnfurler {
    pub status: Mutex<UnfurlStatus>,
    retries: AtomicUsize,
}

impl MockUnfurler {
    pub fn new(status: UnfurlStatus) -> Self {
        Self {
            status: Mutex::new(status),
            retries: AtomicUsize::new(0),
        }
    }

    pub fn retries(&self) -> usize {
        self.retries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Unfurler for MockUnfurler {
    async fn status(&self, _outbox_id: &OutboxId) -> DelivererResult<UnfurlStatus> {
        Ok(self.status.lock().clone())
    }

    async fn retry(&self, _outbox_id: &OutboxId) {
        self.retries.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) struct MockFlips {
    pub status: Mutex<FlipSendStatus>,
}

#[async_trait]
impl FlipManager for MockFlips {
    async fn flip_conversation_status(&self, _outbox_id: &OutboxId) -> FlipSendStatus {
        self.status.lock().clone()
    }
}

/// A deliverer bound to alice's in-memory outbox, plus handles to every mock.
pub(crate) struct Harness {
    pub deliverer: Deliverer,
    pub clock: ManualClock,
    pub outbox: Arc<dyn Outbox>,
    pub sender: Arc<MockSender>,
    pub server: Arc<MockServer>,
    pub notifier: Arc<RecordingActivityNotifier>,
    pub badger: Arc<CountingBadger>,
    pub inbox: Arc<LocalInboxSource>,
}

impl Harness {
    /// Bound but not started, and connected.
    pub fn new(sender: MockSender) -> Self {
        Self::build(sender, DelivererConfig::default(), |c| c)
    }

    pub fn build(
        sender: MockSender,
        config: DelivererConfig,
        extend: impl FnOnce(Collaborators) -> Collaborators,
    ) -> Self {
        let clock = ManualClock::default();
        let sender = Arc::new(sender);
        let server = Arc::new(MockServer::default());
        let notifier = Arc::new(RecordingActivityNotifier::new());
        let badger = Arc::new(CountingBadger::default());
        let inbox = Arc::new(LocalInboxSource::new());

        let collab = Collaborators::new(sender.clone(), server.clone())
            .with_notifier(notifier.clone())
            .with_badger(badger.clone())
            .with_inbox(inbox.clone());
        let provider = Arc::new(MemoryOutboxProvider::new(Arc::new(clock.clone())));

        let deliverer = Deliverer::new(config, Arc::new(clock.clone()), provider, extend(collab));
        let outbox = deliverer.bind_outbox(&uid()).unwrap();
        deliverer.connected();

        Self {
            deliverer,
            clock,
            outbox,
            sender,
            server,
            notifier,
            badger,
            inbox,
        }
    }

    pub fn queue(&self, message: NewOutboxMessage) -> OutboxRecord {
        self.deliverer.queue(message).unwrap()
    }

    pub async fn pass(&self) {
        self.deliverer.run_pass().await.unwrap();
    }

    pub fn record(&self, outbox_id: &OutboxId) -> OutboxRecord {
        self.outbox.get_record(outbox_id).unwrap()
    }

    pub fn pending(&self) -> Vec<OutboxRecord> {
        self.outbox.pull_all_conversations(true, false).unwrap()
    }
}

/// Config for tests that run the real loops.
pub(crate) fn fast_config() -> DelivererConfig {
    DelivererConfig {
        interval: Duration::from_millis(20),
        ..DelivererConfig::default()
    }
}

/// Poll `check` until it holds or two seconds pass.
pub(crate) async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
