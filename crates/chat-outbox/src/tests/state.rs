use super::{misc_error, outboxes, text};
use crate::clock::{Clock, ManualClock};
use crate::error::OutboxError;
use crate::types::{
    ConversationId, IdentifyBehavior, MessageBody, OutboxErrorKind, OutboxId, OutboxRecord,
    OutboxState, OutboxStateError,
};
use chrono::Duration;

#[test]
fn record_failed_attempt_increments_sending_count() {
    let clock = ManualClock::default();
    for outbox in outboxes(&clock) {
        let record = outbox.push_message(text("c1", "hi")).unwrap();
        outbox.record_failed_attempt(&record).unwrap();
        outbox.record_failed_attempt(&record).unwrap();

        let stored = outbox.get_record(&record.outbox_id).unwrap();
        assert_eq!(stored.attempts(), 2);
    }
}

#[test]
fn record_failed_attempt_reinserts_missing_record() {
    let clock = ManualClock::default();
    for outbox in outboxes(&clock) {
        let early = outbox.push_message(text("c1", "early")).unwrap();
        clock.advance(Duration::seconds(1));
        outbox.push_message(text("c1", "late")).unwrap();
        outbox.remove_message(&early.outbox_id).unwrap();

        outbox.record_failed_attempt(&early).unwrap();

        let records = outbox.pull_all_conversations(true, false).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].outbox_id, early.outbox_id);
        assert_eq!(records[0].attempts(), 1);
    }
}

#[test]
fn failed_attempt_does_not_touch_errored_records() {
    let clock = ManualClock::default();
    for outbox in outboxes(&clock) {
        let record = outbox.push_message(text("c1", "hi")).unwrap();
        outbox.mark_as_error(&record, misc_error("boom")).unwrap();
        outbox.record_failed_attempt(&record).unwrap();

        assert!(outbox.get_record(&record.outbox_id).unwrap().state.is_error());
    }
}

#[test]
fn mark_as_error_inserts_when_missing() {
    let clock = ManualClock::default();
    for outbox in outboxes(&clock) {
        let record = outbox.push_message(text("c1", "hi")).unwrap();
        outbox.remove_message(&record.outbox_id).unwrap();

        let marked = outbox.mark_as_error(&record, misc_error("gone")).unwrap();
        assert_eq!(marked.state.error().map(|e| e.kind), Some(OutboxErrorKind::Misc));
        assert!(outbox.get_record(&record.outbox_id).unwrap().state.is_error());
    }
}

#[test]
fn mark_conv_as_error_skips_other_conversations_and_existing_errors() {
    let clock = ManualClock::default();
    for outbox in outboxes(&clock) {
        let already = outbox.push_message(text("c1", "a")).unwrap();
        outbox.push_message(text("c1", "b")).unwrap();
        outbox.push_message(text("c1", "c")).unwrap();
        let other = outbox.push_message(text("c2", "d")).unwrap();
        outbox.mark_as_error(&already, misc_error("first")).unwrap();

        let marked = outbox
            .mark_conv_as_error(
                &ConversationId::from("c1"),
                OutboxStateError {
                    kind: OutboxErrorKind::TooManyAttempts,
                    message: "max send attempts reached".to_string(),
                },
            )
            .unwrap();

        assert_eq!(marked.len(), 2);
        let first = outbox.get_record(&already.outbox_id).unwrap();
        assert_eq!(first.state.error().map(|e| e.kind), Some(OutboxErrorKind::Misc));
        assert!(outbox.get_record(&other.outbox_id).unwrap().state.is_sending());
    }
}

#[test]
fn update_message_replaces_body() {
    let clock = ManualClock::default();
    for outbox in outboxes(&clock) {
        let mut record = outbox.push_message(text("c1", "draft")).unwrap();
        record.msg.body = MessageBody::Text {
            body: "final".to_string(),
        };
        assert!(outbox.update_message(&record).unwrap());
        assert_eq!(outbox.get_record(&record.outbox_id).unwrap().msg.body, record.msg.body);

        outbox.remove_message(&record.outbox_id).unwrap();
        assert!(!outbox.update_message(&record).unwrap());
    }
}

#[test]
fn cancel_with_predicate_removes_matches() {
    let clock = ManualClock::default();
    for outbox in outboxes(&clock) {
        outbox.push_message(text("c1", "x")).unwrap();
        outbox.push_message(text("c1", "y")).unwrap();
        outbox.push_message(text("c2", "x")).unwrap();

        let removed = outbox
            .cancel_messages_with_predicate(&mut |r: &OutboxRecord| {
                matches!(&r.msg.body, MessageBody::Text { body } if body == "x")
            })
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(outbox.pull_all_conversations(true, false).unwrap().len(), 1);
    }
}

#[test]
fn get_missing_record_is_not_found() {
    let clock = ManualClock::default();
    for outbox in outboxes(&clock) {
        assert!(matches!(
            outbox.get_record(&OutboxId::from("nope")),
            Err(OutboxError::NotFound(_))
        ));
        assert!(outbox.remove_message(&OutboxId::from("nope")).unwrap().is_none());
    }
}

#[test]
fn retry_resets_state_and_ctime() {
    let clock = ManualClock::default();
    for outbox in outboxes(&clock) {
        let record = outbox.push_message(text("c1", "hi")).unwrap();
        outbox.mark_as_error(&record, misc_error("boom")).unwrap();
        clock.advance(Duration::minutes(3));

        let retried = outbox
            .retry_message(&record.outbox_id, Some(IdentifyBehavior::ChatGui))
            .unwrap()
            .unwrap();

        assert_eq!(retried.state, OutboxState::Sending { attempts: 0 });
        assert_eq!(retried.ctime, clock.now());
        assert_eq!(retried.identify_behavior, IdentifyBehavior::ChatGui);
        assert!(outbox
            .retry_message(&OutboxId::from("nope"), None)
            .unwrap()
            .is_none());
    }
}
