//! Collapsing of duplicate reaction toggles.

use chat_outbox::{MessageType, Outbox, OutboxRecord, OutboxResult};
use tracing::debug;

/// Remove other pending reactions identical to `record`.
///
/// Returns `true` when `record` itself must not be sent: either another
/// pass already removed it, or an odd number of duplicates cancelled out
/// and it was removed here.
pub fn cancel_pending_duplicate_reactions(
    outbox: &dyn Outbox,
    record: &OutboxRecord,
) -> OutboxResult<bool> {
    let Some(reaction) = record.msg.body.reaction() else {
        return Ok(false);
    };

    let mut in_outbox = false;
    let canceled = outbox.cancel_messages_with_predicate(&mut |other: &OutboxRecord| {
        if other.conv_id != record.conv_id || other.message_type() != MessageType::Reaction {
            return false;
        }
        let same_record = other.outbox_id == record.outbox_id;
        in_outbox |= same_record;

        let cancel = !same_record && other.msg.body.reaction() == Some(reaction);
        if cancel {
            debug!(conv_id = %other.conv_id, outbox_id = %other.outbox_id, "Canceling duplicate reaction");
        }
        cancel
    })?;

    if !in_outbox {
        return Ok(true);
    }
    if canceled % 2 == 1 {
        outbox.remove_message(&record.outbox_id)?;
        return Ok(true);
    }
    Ok(false)
}
