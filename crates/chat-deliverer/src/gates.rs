//! Background-task gates for attachment, unfurl, and flip messages.
//!
//! Each gate asks the owning provider how its task is doing. A finished
//! task has its result spliced into the record body and persisted.

use crate::collaborators::{
    AttachmentUploadStatus, BackgroundTask, Collaborators, FlipSendStatus, UnfurlStatus,
};
use crate::error::SendError;
use chat_outbox::{
    MessageAttachment, MessageBody, MessageType, MessageUnfurl, Outbox, OutboxRecord,
};
use tracing::debug;

/// Whether a record can be sent now.
#[derive(Debug)]
pub enum GateOutcome {
    Ready(OutboxRecord),
    /// Prerequisite still running; skip without counting an attempt.
    InProgress(BackgroundTask),
}

pub async fn process_background_task(
    collab: &Collaborators,
    outbox: &dyn Outbox,
    record: OutboxRecord,
) -> Result<GateOutcome, SendError> {
    match record.message_type() {
        MessageType::Attachment => process_attachment(collab, outbox, record).await,
        MessageType::Unfurl => process_unfurl(collab, outbox, record).await,
        MessageType::Flip => process_flip(collab, outbox, record).await,
        _ => Ok(GateOutcome::Ready(record)),
    }
}

fn upload_error(message: impl Into<String>, permanent: bool) -> SendError {
    SendError::BackgroundTask {
        task: BackgroundTask::AttachmentUpload,
        message: message.into(),
        permanent,
    }
}

fn missing_provider(task: BackgroundTask) -> SendError {
    SendError::BackgroundTask {
        task,
        message: "no provider configured".to_string(),
        permanent: true,
    }
}

async fn process_attachment(
    collab: &Collaborators,
    outbox: &dyn Outbox,
    mut record: OutboxRecord,
) -> Result<GateOutcome, SendError> {
    let uploader = collab
        .attachments
        .as_ref()
        .ok_or_else(|| missing_provider(BackgroundTask::AttachmentUpload))?;

    let status = uploader
        .status(&record.outbox_id)
        .await
        .map_err(|e| upload_error(e.to_string(), false))?;

    match status {
        AttachmentUploadStatus::Success(result) => {
            let previews = result.preview.iter().cloned().collect();
            record.msg.body = MessageBody::Attachment(MessageAttachment {
                object: result.object,
                preview: result.preview,
                previews,
                metadata: result.metadata,
                uploaded: true,
            });
            outbox.update_message(&record)?;
            Ok(GateOutcome::Ready(record))
        }
        AttachmentUploadStatus::Failed { error } => {
            if let Err(e) = uploader.retry(&record.outbox_id).await {
                debug!(outbox_id = %record.outbox_id, error = %e, "Failed to retry upload");
                return Err(upload_error(e.to_string(), true));
            }
            Err(upload_error(
                error.unwrap_or_else(|| "<unknown>".to_string()),
                false,
            ))
        }
        AttachmentUploadStatus::Uploading => {
            if let Err(e) = uploader.retry(&record.outbox_id).await {
                debug!(outbox_id = %record.outbox_id, error = %e, "Failed to retry upload on in-progress task");
                return Err(upload_error(e.to_string(), true));
            }
            Ok(GateOutcome::InProgress(BackgroundTask::AttachmentUpload))
        }
    }
}

async fn process_unfurl(
    collab: &Collaborators,
    outbox: &dyn Outbox,
    mut record: OutboxRecord,
) -> Result<GateOutcome, SendError> {
    let unfurler = collab
        .unfurler
        .as_ref()
        .ok_or_else(|| missing_provider(BackgroundTask::Unfurl))?;

    let status = unfurler
        .status(&record.outbox_id)
        .await
        .map_err(|e| SendError::Other(e.to_string()))?;

    let unfurl_error = |permanent: bool| SendError::BackgroundTask {
        task: BackgroundTask::Unfurl,
        message: if permanent {
            "unfurler permanent error".to_string()
        } else {
            "unfurler error".to_string()
        },
        permanent,
    };

    match status {
        UnfurlStatus::Success(None) => {
            Err(SendError::Other("unfurl success with no result".to_string()))
        }
        UnfurlStatus::Success(Some(unfurl)) => {
            record.msg.body = MessageBody::Unfurl(MessageUnfurl {
                message_id: record.msg.header.supersedes,
                unfurl: Some(unfurl),
            });
            outbox.update_message(&record)?;
            Ok(GateOutcome::Ready(record))
        }
        UnfurlStatus::Unfurling => {
            unfurler.retry(&record.outbox_id).await;
            Ok(GateOutcome::InProgress(BackgroundTask::Unfurl))
        }
        UnfurlStatus::Failed => {
            unfurler.retry(&record.outbox_id).await;
            Err(unfurl_error(false))
        }
        UnfurlStatus::PermFailed => Err(unfurl_error(true)),
    }
}

async fn process_flip(
    collab: &Collaborators,
    outbox: &dyn Outbox,
    mut record: OutboxRecord,
) -> Result<GateOutcome, SendError> {
    let flips = collab
        .flips
        .as_ref()
        .ok_or_else(|| missing_provider(BackgroundTask::Flip))?;

    match flips.flip_conversation_status(&record.outbox_id).await {
        FlipSendStatus::InProgress => Ok(GateOutcome::InProgress(BackgroundTask::Flip)),
        FlipSendStatus::Error => Err(SendError::BackgroundTask {
            task: BackgroundTask::Flip,
            message: "unable to start flip".to_string(),
            permanent: true,
        }),
        FlipSendStatus::Sent(flip_conv_id) => {
            debug!(outbox_id = %record.outbox_id, flip_conv_id = %flip_conv_id, "Sending flip");
            if let MessageBody::Flip(flip) = &mut record.msg.body {
                flip.flip_conv_id = Some(flip_conv_id);
            }
            outbox.update_message(&record)?;
            Ok(GateOutcome::Ready(record))
        }
    }
}
