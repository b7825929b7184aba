//! The `Outbox` contract and its read-modify-write implementation over a
//! pluggable record storage.

use crate::clock::Clock;
use crate::error::{OutboxError, OutboxResult};
use crate::types::{
    ConversationId, IdentifyBehavior, NewOutboxMessage, OutboxId, OutboxRecord, OutboxState,
    OutboxStateError, Uid,
};
use chrono::Duration;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Ordinals start at 100 so late-added thread decorations never collide.
pub const OUTBOX_ORDINAL_START: i64 = 100;

/// Errored ephemeral records are purged after a day.
pub const EPHEMERAL_PURGE_CUTOFF_SECS: i64 = 24 * 60 * 60;

/// Errored regular records are purged after a week.
pub const ERROR_PURGE_CUTOFF_SECS: i64 = 7 * 24 * 60 * 60;

/// Durable queue of not-yet-confirmed outgoing messages for one user.
///
/// Every operation is atomic with respect to every other operation on the
/// same outbox; callers never need their own locking.
pub trait Outbox: Send + Sync {
    /// Identity this outbox belongs to.
    fn uid(&self) -> &Uid;

    /// Append a new record in `Sending { attempts: 0 }` state.
    fn push_message(&self, message: NewOutboxMessage) -> OutboxResult<OutboxRecord>;

    /// All records, oldest first. Errored records are included only when
    /// `include_errors` is set; `remove` drops the returned pending records.
    fn pull_all_conversations(
        &self,
        include_errors: bool,
        remove: bool,
    ) -> OutboxResult<Vec<OutboxRecord>>;

    /// All records of one conversation, including errored ones.
    fn pull_for_conversation(&self, conv_id: &ConversationId) -> OutboxResult<Vec<OutboxRecord>>;

    fn get_record(&self, outbox_id: &OutboxId) -> OutboxResult<OutboxRecord>;

    /// Bump the attempt count of a sending record, inserting it if missing.
    fn record_failed_attempt(&self, record: &OutboxRecord) -> OutboxResult<()>;

    /// Mark one record as errored, inserting it if missing.
    fn mark_as_error(
        &self,
        record: &OutboxRecord,
        error: OutboxStateError,
    ) -> OutboxResult<OutboxRecord>;

    /// Mark every not-yet-errored record of a conversation as errored.
    fn mark_conv_as_error(
        &self,
        conv_id: &ConversationId,
        error: OutboxStateError,
    ) -> OutboxResult<Vec<OutboxRecord>>;

    /// Replace a stored record. Returns whether it was present.
    fn update_message(&self, record: &OutboxRecord) -> OutboxResult<bool>;

    /// Remove every record the predicate selects, atomically.
    fn cancel_messages_with_predicate(
        &self,
        predicate: &mut dyn FnMut(&OutboxRecord) -> bool,
    ) -> OutboxResult<usize>;

    /// Remove one record. Returns it if it was present.
    fn remove_message(&self, outbox_id: &OutboxId) -> OutboxResult<Option<OutboxRecord>>;

    /// Reset a record to `Sending { attempts: 0 }` with a fresh creation time.
    fn retry_message(
        &self,
        outbox_id: &OutboxId,
        identify_behavior: Option<IdentifyBehavior>,
    ) -> OutboxResult<Option<OutboxRecord>>;

    /// Drop stale errored records. Returns the purged ephemeral ones.
    fn purge(&self) -> OutboxResult<Vec<OutboxRecord>>;
}

/// Opens the outbox of a given identity.
pub trait OutboxProvider: Send + Sync {
    fn open(&self, uid: &Uid) -> OutboxResult<Arc<dyn Outbox>>;
}

/// Whole-outbox persistence used by [`StoredOutbox`].
pub trait OutboxStorage: Send + Sync {
    fn read_records(&self) -> OutboxResult<Vec<OutboxRecord>>;
    fn write_records(&self, records: &[OutboxRecord]) -> OutboxResult<()>;
    fn name(&self) -> &'static str;
}

/// Outbox that loads, edits, and rewrites its full record list under a lock.
pub struct StoredOutbox<S> {
    uid: Uid,
    storage: S,
    clock: Arc<dyn Clock>,
    lock: Mutex<()>,
}

impl<S: OutboxStorage> StoredOutbox<S> {
    pub fn new(uid: Uid, storage: S, clock: Arc<dyn Clock>) -> Self {
        debug!(uid = %uid, engine = storage.name(), "Opened outbox");
        Self {
            uid,
            storage,
            clock,
            lock: Mutex::new(()),
        }
    }

    /// Run `edit` over the stored records and persist the result.
    fn modify<T>(&self, edit: impl FnOnce(&mut Vec<OutboxRecord>) -> T) -> OutboxResult<T> {
        self.try_modify(|records| Ok(edit(records)))
    }

    /// Like `modify`, but nothing is written when `edit` fails.
    fn try_modify<T>(
        &self,
        edit: impl FnOnce(&mut Vec<OutboxRecord>) -> OutboxResult<T>,
    ) -> OutboxResult<T> {
        let _guard = self.lock.lock();
        let mut records = self.storage.read_records()?;
        let result = edit(&mut records)?;
        self.storage.write_records(&records)?;
        Ok(result)
    }

    fn read(&self) -> OutboxResult<Vec<OutboxRecord>> {
        let _guard = self.lock.lock();
        self.storage.read_records()
    }
}

fn next_ordinal(records: &[OutboxRecord], conv_id: &ConversationId) -> i64 {
    records
        .iter()
        .filter(|r| &r.conv_id == conv_id && r.ordinal >= OUTBOX_ORDINAL_START)
        .map(|r| r.ordinal + 1)
        .fold(OUTBOX_ORDINAL_START, i64::max)
}

fn insert_by_ctime(records: &mut Vec<OutboxRecord>, record: OutboxRecord) {
    records.push(record);
    records.sort_by_key(|r| r.ctime);
}

fn bump_attempts(state: &mut OutboxState) {
    if let OutboxState::Sending { attempts } = state {
        *attempts += 1;
    }
}

impl<S: OutboxStorage> Outbox for StoredOutbox<S> {
    fn uid(&self) -> &Uid {
        &self.uid
    }

    fn push_message(&self, message: NewOutboxMessage) -> OutboxResult<OutboxRecord> {
        let now = self.clock.now();
        self.try_modify(|records| {
            let outbox_id = message.outbox_id.unwrap_or_else(OutboxId::generate);
            if records.iter().any(|r| r.outbox_id == outbox_id) {
                return Err(OutboxError::DuplicateOutboxId(outbox_id));
            }
            let mut msg = message.msg;
            msg.header.outbox_id = Some(outbox_id.clone());

            let record = OutboxRecord {
                ordinal: next_ordinal(records, &message.conv_id),
                conv_id: message.conv_id,
                outbox_id,
                msg,
                send_opts: message.send_opts,
                prepare_opts: message.prepare_opts,
                identify_behavior: message.identify_behavior,
                ctime: now,
                state: OutboxState::Sending { attempts: 0 },
            };
            records.push(record.clone());
            Ok(record)
        })
    }

    fn pull_all_conversations(
        &self,
        include_errors: bool,
        remove: bool,
    ) -> OutboxResult<Vec<OutboxRecord>> {
        let partition = |records: &[OutboxRecord]| {
            let (pulled, kept): (Vec<_>, Vec<_>) = records
                .iter()
                .cloned()
                .partition(|r| include_errors || !r.state.is_error());
            (pulled, kept)
        };

        if !remove {
            return Ok(partition(&self.read()?).0);
        }
        self.modify(|records| {
            let (pulled, kept) = partition(records);
            *records = kept;
            pulled
        })
    }

    fn pull_for_conversation(&self, conv_id: &ConversationId) -> OutboxResult<Vec<OutboxRecord>> {
        Ok(self
            .read()?
            .into_iter()
            .filter(|r| &r.conv_id == conv_id)
            .collect())
    }

    fn get_record(&self, outbox_id: &OutboxId) -> OutboxResult<OutboxRecord> {
        self.read()?
            .into_iter()
            .find(|r| &r.outbox_id == outbox_id)
            .ok_or_else(|| OutboxError::NotFound(outbox_id.clone()))
    }

    fn record_failed_attempt(&self, record: &OutboxRecord) -> OutboxResult<()> {
        self.modify(|records| {
            match records.iter_mut().find(|r| r.outbox_id == record.outbox_id) {
                Some(existing) => bump_attempts(&mut existing.state),
                None => {
                    let mut added = record.clone();
                    bump_attempts(&mut added.state);
                    insert_by_ctime(records, added);
                }
            }
        })
    }

    fn mark_as_error(
        &self,
        record: &OutboxRecord,
        error: OutboxStateError,
    ) -> OutboxResult<OutboxRecord> {
        self.modify(|records| {
            match records.iter_mut().find(|r| r.outbox_id == record.outbox_id) {
                Some(existing) => {
                    existing.state = OutboxState::Error(error);
                    existing.clone()
                }
                None => {
                    let mut added = record.clone();
                    added.state = OutboxState::Error(error);
                    insert_by_ctime(records, added.clone());
                    added
                }
            }
        })
    }

    fn mark_conv_as_error(
        &self,
        conv_id: &ConversationId,
        error: OutboxStateError,
    ) -> OutboxResult<Vec<OutboxRecord>> {
        self.modify(|records| {
            records
                .iter_mut()
                .filter(|r| &r.conv_id == conv_id && !r.state.is_error())
                .map(|r| {
                    r.state = OutboxState::Error(error.clone());
                    r.clone()
                })
                .collect()
        })
    }

    fn update_message(&self, record: &OutboxRecord) -> OutboxResult<bool> {
        self.modify(|records| {
            match records.iter_mut().find(|r| r.outbox_id == record.outbox_id) {
                Some(existing) => {
                    *existing = record.clone();
                    true
                }
                None => false,
            }
        })
    }

    fn cancel_messages_with_predicate(
        &self,
        predicate: &mut dyn FnMut(&OutboxRecord) -> bool,
    ) -> OutboxResult<usize> {
        self.modify(|records| {
            let before = records.len();
            records.retain(|r| !predicate(r));
            before - records.len()
        })
    }

    fn remove_message(&self, outbox_id: &OutboxId) -> OutboxResult<Option<OutboxRecord>> {
        self.modify(|records| {
            let position = records.iter().position(|r| &r.outbox_id == outbox_id)?;
            Some(records.remove(position))
        })
    }

    fn retry_message(
        &self,
        outbox_id: &OutboxId,
        identify_behavior: Option<IdentifyBehavior>,
    ) -> OutboxResult<Option<OutboxRecord>> {
        let now = self.clock.now();
        self.modify(|records| {
            let record = records.iter_mut().find(|r| &r.outbox_id == outbox_id)?;
            debug!(outbox_id = %outbox_id, "Resetting send information");
            record.state = OutboxState::Sending { attempts: 0 };
            record.ctime = now;
            if let Some(behavior) = identify_behavior {
                record.identify_behavior = behavior;
            }
            Some(record.clone())
        })
    }

    fn purge(&self) -> OutboxResult<Vec<OutboxRecord>> {
        let now = self.clock.now();
        self.modify(|records| {
            let mut ephemeral_purged = Vec::new();
            records.retain(|r| {
                if !r.state.is_error() {
                    return true;
                }
                let cutoff = if r.msg.is_ephemeral() {
                    EPHEMERAL_PURGE_CUTOFF_SECS
                } else {
                    ERROR_PURGE_CUTOFF_SECS
                };
                if r.ctime + Duration::seconds(cutoff) >= now {
                    return true;
                }
                debug!(outbox_id = %r.outbox_id, ephemeral = r.msg.is_ephemeral(), "Purging errored record");
                if r.msg.is_ephemeral() {
                    ephemeral_purged.push(r.clone());
                }
                false
            });
            ephemeral_purged
        })
    }
}
