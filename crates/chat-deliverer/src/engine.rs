//! The delivery engine.
//!
//! Two tasks run while the engine is started:
//!
//! - the deliver loop, which wakes on a timer, a reconnect, or a new
//!   message, pulls every pending record, and runs one worker per
//!   conversation;
//! - the bypass loop, which sends fire-and-forget messages that never
//!   touch the outbox.

use crate::classify::{classify, should_break_loop, should_record_error, ConnectivitySnapshot};
use crate::collaborators::{ChatActivity, Collaborators, LocalMtimeUpdate, SendContext};
use crate::config::DelivererConfig;
use crate::error::{DelivererError, DelivererResult, SendError};
use crate::failure::{FailureRegistry, FailureSubscription, FailureToken};
use crate::gates::{process_background_task, GateOutcome};
use crate::reactions::cancel_pending_duplicate_reactions;
use chat_outbox::{
    Clock, ConversationId, IdentifyBehavior, NewOutboxMessage, Outbox, OutboxError,
    OutboxErrorKind, OutboxId, OutboxProvider, OutboxRecord, OutboxState, OutboxStateError,
    TopicType, Uid,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Completes once every loop of a stopped engine has exited.
#[derive(Debug)]
pub struct StopHandle {
    done: oneshot::Receiver<()>,
}

impl StopHandle {
    fn completed() -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(());
        Self { done: rx }
    }

    pub async fn wait(self) {
        let _ = self.done.await;
    }

    /// Non-blocking check. Consumes the completion signal once observed.
    pub fn is_complete(&mut self) -> bool {
        !matches!(
            self.done.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        )
    }
}

/// State shared between the public handle and the loop tasks.
pub(crate) struct Shared {
    config: DelivererConfig,
    clock: Arc<dyn Clock>,
    collab: Collaborators,
    outbox: parking_lot::RwLock<Option<Arc<dyn Outbox>>>,
    delivering: AtomicBool,
    connected: AtomicBool,
    disconnected_since: parking_lot::Mutex<DateTime<Utc>>,
    msg_sent_tx: mpsc::Sender<()>,
    msg_sent_rx: AsyncMutex<mpsc::Receiver<()>>,
    reconnect_tx: mpsc::Sender<()>,
    reconnect_rx: AsyncMutex<mpsc::Receiver<()>>,
    bypass_tx: mpsc::Sender<OutboxRecord>,
    bypass_rx: AsyncMutex<mpsc::Receiver<OutboxRecord>>,
    failures: FailureRegistry,
}

impl Shared {
    fn outbox(&self) -> DelivererResult<Arc<dyn Outbox>> {
        self.outbox.read().clone().ok_or(DelivererError::NotStarted)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connectivity(&self) -> ConnectivitySnapshot {
        if self.is_connected() {
            return ConnectivitySnapshot::online();
        }
        let since = *self.disconnected_since.lock();
        ConnectivitySnapshot::offline_for(self.clock.now() - since)
    }

    fn signal_msg_sent(&self) {
        if let Err(e) = self.msg_sent_tx.try_send(()) {
            debug!(error = %e, "Deliver loop already has a pending wake");
        }
    }
}

#[derive(Default)]
struct Lifecycle {
    shutdown: Option<broadcast::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

/// Reliable outbound message delivery engine.
///
/// # Lifecycle
///
/// 1. Create with [`Deliverer::new()`]
/// 2. [`Deliverer::start()`] binds the user's outbox and spawns the loops
/// 3. [`Deliverer::queue()`] persists messages and wakes the loop
/// 4. [`Deliverer::stop()`] shuts the loops down
///
/// The engine starts out disconnected; hosts call [`Deliverer::connected()`]
/// once the chat server connection is up.
pub struct Deliverer {
    shared: Arc<Shared>,
    provider: Arc<dyn OutboxProvider>,
    lifecycle: AsyncMutex<Lifecycle>,
}

impl Deliverer {
    pub fn new(
        config: DelivererConfig,
        clock: Arc<dyn Clock>,
        provider: Arc<dyn OutboxProvider>,
        collab: Collaborators,
    ) -> Self {
        let (msg_sent_tx, msg_sent_rx) = mpsc::channel(config.signal_capacity);
        let (reconnect_tx, reconnect_rx) = mpsc::channel(config.signal_capacity);
        let (bypass_tx, bypass_rx) = mpsc::channel(config.bypass_queue_capacity);
        let disconnected_since = clock.now();

        let shared = Shared {
            config,
            clock,
            collab,
            outbox: parking_lot::RwLock::new(None),
            delivering: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            disconnected_since: parking_lot::Mutex::new(disconnected_since),
            msg_sent_tx,
            msg_sent_rx: AsyncMutex::new(msg_sent_rx),
            reconnect_tx,
            reconnect_rx: AsyncMutex::new(reconnect_rx),
            bypass_tx,
            bypass_rx: AsyncMutex::new(bypass_rx),
            failures: FailureRegistry::new(),
        };

        Self {
            shared: Arc::new(shared),
            provider,
            lifecycle: AsyncMutex::new(Lifecycle::default()),
        }
    }

    /// Stop any previous run, bind `uid`'s outbox, and spawn the loops.
    pub async fn start(&self, uid: &Uid) -> DelivererResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        self.stop_locked(&mut lifecycle).wait().await;

        let outbox = self.bind_outbox(uid)?;
        let (shutdown_tx, _) = broadcast::channel(1);
        let main = tokio::spawn(deliver_loop(
            Arc::clone(&self.shared),
            Arc::clone(&outbox),
            shutdown_tx.subscribe(),
        ));
        let bypass = tokio::spawn(bypass_loop(
            Arc::clone(&self.shared),
            outbox,
            shutdown_tx.subscribe(),
        ));

        lifecycle.shutdown = Some(shutdown_tx);
        lifecycle.tasks = vec![main, bypass];
        self.shared.delivering.store(true, Ordering::SeqCst);
        info!(uid = %uid, "Deliverer started");
        Ok(())
    }

    /// Signal shutdown. The returned handle completes once both loops exit,
    /// and is already complete if the engine was not running.
    pub async fn stop(&self) -> StopHandle {
        let mut lifecycle = self.lifecycle.lock().await;
        self.stop_locked(&mut lifecycle)
    }

    fn stop_locked(&self, lifecycle: &mut Lifecycle) -> StopHandle {
        let Some(shutdown) = lifecycle.shutdown.take() else {
            return StopHandle::completed();
        };

        info!("Stopping deliverer");
        self.shared.delivering.store(false, Ordering::SeqCst);
        let _ = shutdown.send(());

        let tasks = std::mem::take(&mut lifecycle.tasks);
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            for task in tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "Deliverer loop exited abnormally");
                }
            }
            let _ = done_tx.send(());
        });
        StopHandle { done: done_rx }
    }

    pub(crate) fn bind_outbox(&self, uid: &Uid) -> DelivererResult<Arc<dyn Outbox>> {
        let outbox = self.provider.open(uid)?;
        *self.shared.outbox.write() = Some(Arc::clone(&outbox));
        Ok(outbox)
    }

    /// Persist a message for delivery and wake the loop.
    ///
    /// File-edit notifications skip the outbox: they go to a bounded
    /// best-effort queue and are dropped (with a log line) when it is full.
    pub fn queue(&self, message: NewOutboxMessage) -> DelivererResult<OutboxRecord> {
        if message.msg.header.topic_type == TopicType::KbfsFileEdit {
            return Ok(self.queue_bypass(message));
        }

        let outbox = self.shared.outbox()?;
        let record = outbox.push_message(message)?;
        debug!(
            uid = %outbox.uid(),
            conv_id = %record.conv_id,
            outbox_id = %record.outbox_id,
            identify_behavior = ?record.identify_behavior,
            "Queued new message"
        );

        self.shared
            .collab
            .notifier
            .activity(outbox.uid(), ChatActivity::LocalMessage(record.clone()));
        self.shared.signal_msg_sent();
        if record.msg.is_badgable() {
            self.bump_local_mtime(outbox.uid(), &record);
        }
        Ok(record)
    }

    /// Move the record's conversation to the top of the local inbox in the
    /// background. Failures are only logged.
    fn bump_local_mtime(&self, uid: &Uid, record: &OutboxRecord) {
        let Ok(runtime) = Handle::try_current() else {
            debug!(conv_id = %record.conv_id, "No runtime, skipping local mtime update");
            return;
        };
        let inbox = Arc::clone(&self.shared.collab.inbox);
        let uid = uid.clone();
        let update = LocalMtimeUpdate {
            conv_id: record.conv_id.clone(),
            mtime: record.ctime,
        };
        runtime.spawn(async move {
            if let Err(e) = inbox.update_local_mtime(&uid, std::slice::from_ref(&update)).await {
                debug!(
                    conv_id = %update.conv_id,
                    mtime = %update.mtime,
                    error = %e,
                    "Unable to update local mtime"
                );
            }
            inbox.notify_update(&uid, &update.conv_id).await;
        });
    }

    fn queue_bypass(&self, message: NewOutboxMessage) -> OutboxRecord {
        let record = OutboxRecord {
            conv_id: message.conv_id,
            outbox_id: message.outbox_id.unwrap_or_else(OutboxId::generate),
            msg: message.msg,
            send_opts: message.send_opts,
            prepare_opts: message.prepare_opts,
            identify_behavior: message.identify_behavior,
            ctime: self.shared.clock.now(),
            ordinal: 0,
            state: OutboxState::Sending { attempts: 0 },
        };
        if let Err(e) = self.shared.bypass_tx.try_send(record.clone()) {
            debug!(conv_id = %record.conv_id, error = %e, "Unable to deliver, bypass queue full");
        }
        record
    }

    /// Wake the deliver loop. Never blocks.
    pub fn force_deliver_loop(&self) {
        debug!("Force deliver loop invoked");
        self.shared.signal_msg_sent();
    }

    pub fn connected(&self) {
        self.shared.connected.store(true, Ordering::SeqCst);
        debug!("Reconnected, forcing deliver loop run");
        if let Err(e) = self.shared.reconnect_tx.try_send(()) {
            debug!(error = %e, "Deliver loop already has a pending reconnect");
        }
    }

    /// Starts the offline clock. Failures become permanent once it passes
    /// the configured limit.
    pub fn disconnected(&self) {
        debug!("Disconnected from chat server");
        *self.shared.disconnected_since.lock() = self.shared.clock.now();
        self.shared.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        !self.shared.is_connected()
    }

    pub fn is_delivering(&self) -> bool {
        self.shared.delivering.load(Ordering::SeqCst)
    }

    /// Records currently being sent. Empty while the engine is stopped.
    pub fn active_deliveries(&self) -> DelivererResult<Vec<OutboxRecord>> {
        if !self.is_delivering() {
            debug!("Not delivering, no active deliveries");
            return Ok(Vec::new());
        }
        let outbox = self.shared.outbox()?;
        Ok(outbox
            .pull_all_conversations(false, false)?
            .into_iter()
            .filter(|r| r.state.is_sending())
            .collect())
    }

    /// Subscribe to the next batch of terminally failed records.
    pub fn next_failure(&self) -> FailureSubscription {
        self.shared.failures.subscribe()
    }

    pub fn unsubscribe_failure(&self, token: FailureToken) {
        self.shared.failures.unsubscribe(token);
    }

    /// Put an errored record back into `Sending` and wake the loop.
    pub fn retry(
        &self,
        outbox_id: &OutboxId,
        identify_behavior: Option<IdentifyBehavior>,
    ) -> DelivererResult<OutboxRecord> {
        let outbox = self.shared.outbox()?;
        let record = outbox
            .retry_message(outbox_id, identify_behavior)?
            .ok_or_else(|| OutboxError::NotFound(outbox_id.clone()))?;
        info!(outbox_id = %outbox_id, conv_id = %record.conv_id, "Retrying message");
        self.force_deliver_loop();
        Ok(record)
    }

    /// Drop a pending or errored record.
    pub fn cancel(&self, outbox_id: &OutboxId) -> DelivererResult<OutboxRecord> {
        let outbox = self.shared.outbox()?;
        let record = outbox
            .remove_message(outbox_id)?
            .ok_or_else(|| OutboxError::NotFound(outbox_id.clone()))?;
        info!(outbox_id = %outbox_id, conv_id = %record.conv_id, "Canceled message");
        Ok(record)
    }

    /// Drop stale errored records. Returns the purged ephemeral ones.
    pub fn purge_failed(&self) -> DelivererResult<Vec<OutboxRecord>> {
        let outbox = self.shared.outbox()?;
        let purged = outbox.purge()?;
        if !purged.is_empty() {
            info!(count = purged.len(), "Purged failed ephemeral messages");
        }
        Ok(purged)
    }

    /// Run one delivery pass over the bound outbox, outside the loop.
    #[cfg(test)]
    pub(crate) async fn run_pass(&self) -> DelivererResult<()> {
        let outbox = self.shared.outbox()?;
        deliver_pass(&self.shared, &outbox).await;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn running_tasks(&self) -> usize {
        self.lifecycle
            .lock()
            .await
            .tasks
            .iter()
            .filter(|t| !t.is_finished())
            .count()
    }
}

impl Drop for Deliverer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.lifecycle.get_mut().shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

async fn deliver_loop(
    shared: Arc<Shared>,
    outbox: Arc<dyn Outbox>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut msg_sent = shared.msg_sent_rx.lock().await;
    let mut reconnect = shared.reconnect_rx.lock().await;
    info!(
        uid = %outbox.uid(),
        interval_ms = shared.config.interval.as_millis() as u64,
        "Starting deliver loop"
    );

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!(uid = %outbox.uid(), "Shutting down deliver loop");
                return;
            }
            Some(()) = reconnect.recv() => {
                debug!(uid = %outbox.uid(), "Flushing outbox on reconnect");
            }
            Some(()) = msg_sent.recv() => {
                debug!(uid = %outbox.uid(), "Flushing outbox on new message");
            }
            _ = tokio::time::sleep(shared.config.interval) => {}
        }

        deliver_pass(&shared, &outbox).await;
    }
}

async fn bypass_loop(
    shared: Arc<Shared>,
    outbox: Arc<dyn Outbox>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut queue = shared.bypass_rx.lock().await;
    debug!(uid = %outbox.uid(), "Starting bypass deliver loop");

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!(uid = %outbox.uid(), "Shutting down bypass deliver loop");
                return;
            }
            Some(record) = queue.recv() => {
                debug!(conv_id = %record.conv_id, "Flushing bypass record");
                let ctx = SendContext {
                    uid: outbox.uid().clone(),
                    identify_behavior: IdentifyBehavior::ChatCli,
                    outbox_id: None,
                };
                if let Err(e) = shared
                    .collab
                    .sender
                    .send(&record.conv_id, &record.msg, None, None, &ctx)
                    .await
                {
                    warn!(conv_id = %record.conv_id, error = %e, "Unable to deliver bypass message");
                }
            }
        }
    }
}

/// Pull every pending record and deliver each conversation concurrently.
async fn deliver_pass(shared: &Arc<Shared>, outbox: &Arc<dyn Outbox>) {
    let records = match outbox.pull_all_conversations(false, false) {
        Ok(records) => records,
        Err(e) => {
            warn!(uid = %outbox.uid(), error = %e, "Unable to pull outbox");
            return;
        }
    };

    let mut by_conv: HashMap<ConversationId, Vec<OutboxRecord>> = HashMap::new();
    for record in records {
        by_conv.entry(record.conv_id.clone()).or_default().push(record);
    }

    let mut workers = JoinSet::new();
    for (_, records) in by_conv {
        let shared = Arc::clone(shared);
        let outbox = Arc::clone(outbox);
        workers.spawn(async move { deliver_for_conv(&shared, outbox.as_ref(), records).await });
    }
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "Conversation delivery worker failed");
        }
    }
}

enum Attempt {
    Sent(OutboxRecord),
    Skipped,
    Failed(OutboxRecord, SendError),
}

async fn deliver_for_conv(shared: &Shared, outbox: &dyn Outbox, records: Vec<OutboxRecord>) {
    if let Some(first) = records.first() {
        debug!(
            uid = %outbox.uid(),
            conv_id = %first.conv_id,
            count = records.len(),
            "Flushing items from the outbox"
        );
    }

    for record in records {
        match attempt(shared, outbox, record).await {
            Attempt::Skipped => continue,
            Attempt::Sent(record) => {
                if let Err(e) = outbox.remove_message(&record.outbox_id) {
                    debug!(outbox_id = %record.outbox_id, error = %e, "Failed to remove sent message");
                }
            }
            Attempt::Failed(record, err) => {
                handle_failure(shared, outbox, &record, err).await;
                if !should_break_loop(&record) {
                    debug!(outbox_id = %record.outbox_id, "Not breaking conversation pass for unfurl failure");
                    continue;
                }
                break;
            }
        }
    }
}

async fn attempt(shared: &Shared, outbox: &dyn Outbox, record: OutboxRecord) -> Attempt {
    if !shared.is_connected() {
        return Attempt::Failed(record, SendError::disconnected());
    }

    let age = shared.clock.now() - record.ctime;
    if age > shared.config.expire_after {
        debug!(
            outbox_id = %record.outbox_id,
            age_secs = age.num_seconds(),
            "Expiring pending message because it is too old"
        );
        return Attempt::Failed(record, SendError::Expired);
    }

    let record = match process_background_task(&shared.collab, outbox, record.clone()).await {
        Ok(GateOutcome::Ready(ready)) => ready,
        Ok(GateOutcome::InProgress(task)) => {
            debug!(
                conv_id = %record.conv_id,
                outbox_id = %record.outbox_id,
                task = %task,
                "Background task in progress, skipping"
            );
            return Attempt::Skipped;
        }
        Err(err) => return Attempt::Failed(record, err),
    };

    match cancel_pending_duplicate_reactions(outbox, &record) {
        Ok(true) => {
            debug!(
                conv_id = %record.conv_id,
                outbox_id = %record.outbox_id,
                "Aborting send, duplicate reaction"
            );
            return Attempt::Skipped;
        }
        Ok(false) => {}
        Err(e) => {
            warn!(outbox_id = %record.outbox_id, error = %e, "Unable to cancel duplicate reactions");
        }
    }

    let ctx = SendContext {
        uid: outbox.uid().clone(),
        identify_behavior: record.identify_behavior,
        outbox_id: Some(record.outbox_id.clone()),
    };
    let sent = shared
        .collab
        .sender
        .send(
            &record.conv_id,
            &record.msg,
            record.send_opts.as_ref(),
            record.prepare_opts.as_ref(),
            &ctx,
        )
        .await;

    match sent {
        Ok(()) => Attempt::Sent(record),
        Err(err) => Attempt::Failed(record, err),
    }
}

async fn handle_failure(shared: &Shared, outbox: &dyn Outbox, record: &OutboxRecord, err: SendError) {
    debug!(
        uid = %outbox.uid(),
        conv_id = %record.conv_id,
        outbox_id = %record.outbox_id,
        attempts = record.attempts(),
        error = %err,
        "Failed to send message"
    );

    let verdict = classify(record, &err, &shared.connectivity(), &shared.config);
    if verdict.reconnect {
        debug!(error = %err, "Network error, reconnecting to the server");
        if let Err(e) = shared.collab.server.reconnect().await {
            debug!(error = %e, "Failed to reconnect");
        }
    }

    if verdict.permanent {
        warn!(
            outbox_id = %record.outbox_id,
            kind = %verdict.kind,
            attempts = record.attempts(),
            "Failure condition reached, marking as error"
        );
        if let Err(e) = fail_message(shared, outbox, record, verdict.state_error()).await {
            warn!(outbox_id = %record.outbox_id, error = %e, "Unable to fail message");
        }
    } else if should_record_error(&err) {
        if let Err(e) = outbox.record_failed_attempt(record) {
            warn!(outbox_id = %record.outbox_id, error = %e, "Unable to record failed attempt");
        }
    }
}

/// Move a record (or, for too many attempts, its whole conversation) into
/// a terminal error and tell everyone who cares.
async fn fail_message(
    shared: &Shared,
    outbox: &dyn Outbox,
    record: &OutboxRecord,
    error: OutboxStateError,
) -> DelivererResult<()> {
    let uid = outbox.uid().clone();
    let marked = match error.kind {
        OutboxErrorKind::TooManyAttempts => {
            debug!(conv_id = %record.conv_id, "Too many attempts, marking conversation as failed");
            outbox.mark_conv_as_error(&record.conv_id, error)?
        }
        OutboxErrorKind::Duplicate | OutboxErrorKind::AlreadyDeleted => {
            outbox.remove_message(&record.outbox_id)?;
            Vec::new()
        }
        _ => vec![outbox.mark_as_error(record, error)?],
    };
    if marked.is_empty() {
        return Ok(());
    }

    let conversation = match shared
        .collab
        .inbox
        .increment_local_conv_version(&uid, &record.conv_id)
        .await
    {
        Ok(info) => Some(info),
        Err(e) => {
            debug!(conv_id = %record.conv_id, error = %e, "Failed to increment local conversation version");
            None
        }
    };

    shared.collab.notifier.activity(
        &uid,
        ChatActivity::FailedMessage {
            records: marked.clone(),
            conversation,
        },
    );
    shared.failures.alert(&marked);
    shared.collab.badger.send().await
}
