//! Single-writer actor for serialized SQLite writes (SPEC_FULL 4.5).
//!
//! All mutations to the `delivery_records` table flow through this actor via
//! an [`mpsc`](tokio::sync::mpsc) channel, mirroring the teacher's memory
//! store: reads go straight through the pool (concurrent), writes funnel
//! through one task to avoid SQLite write contention.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, trace};

use crate::types::{Channel, ChannelTracking, MessageStatus};

use super::DeliveryError;

/// A single field update folded into a status transition.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

/// Operations that can be sent to the write actor.
pub enum WriteOp {
    Insert {
        recipient_phone_or_email: String,
        channel: Channel,
        max_retries: u32,
        template_name: Option<String>,
        conversation_id: Option<String>,
        pricing_model: Option<String>,
        channel_tracking: ChannelTracking,
        reply: oneshot::Sender<Result<i64, DeliveryError>>,
    },
    SetMessageId {
        id: i64,
        message_id: String,
        reply: oneshot::Sender<Result<(), DeliveryError>>,
    },
    Transition {
        id: i64,
        next: MessageStatus,
        update: StatusUpdate,
        reply: oneshot::Sender<Result<MessageStatus, DeliveryError>>,
    },
    Retry {
        id: i64,
        reply: oneshot::Sender<Result<bool, DeliveryError>>,
    },
    Sweep {
        retention_days: u32,
        reply: oneshot::Sender<Result<u64, DeliveryError>>,
    },
}

/// Run the single-writer actor loop until the sender half is dropped.
pub async fn run_writer(db: SqlitePool, mut rx: mpsc::Receiver<WriteOp>) {
    while let Some(op) = rx.recv().await {
        handle_op(&db, op).await;
    }
    trace!("delivery writer actor stopped");
}

async fn handle_op(db: &SqlitePool, op: WriteOp) {
    match op {
        WriteOp::Insert {
            recipient_phone_or_email,
            channel,
            max_retries,
            template_name,
            conversation_id,
            pricing_model,
            channel_tracking,
            reply,
        } => {
            let result = insert(
                db,
                &recipient_phone_or_email,
                channel,
                max_retries,
                template_name.as_deref(),
                conversation_id.as_deref(),
                pricing_model.as_deref(),
                channel_tracking,
            )
            .await;
            if let Err(err) = &result {
                error!(error = %err, "delivery insert failed");
            }
            let _ = reply.send(result);
        }
        WriteOp::SetMessageId {
            id,
            message_id,
            reply,
        } => {
            let result = set_message_id(db, id, &message_id).await;
            if let Err(err) = &result {
                error!(id, error = %err, "delivery message_id update failed");
            }
            let _ = reply.send(result);
        }
        WriteOp::Transition {
            id,
            next,
            update,
            reply,
        } => {
            let result = transition(db, id, next, update).await;
            if let Err(err) = &result {
                error!(id, error = %err, "delivery transition failed");
            }
            let _ = reply.send(result);
        }
        WriteOp::Retry { id, reply } => {
            let result = retry(db, id).await;
            if let Err(err) = &result {
                error!(id, error = %err, "delivery retry failed");
            }
            let _ = reply.send(result);
        }
        WriteOp::Sweep {
            retention_days,
            reply,
        } => {
            let result = sweep(db, retention_days).await;
            if let Err(err) = &result {
                error!(error = %err, "delivery retention sweep failed");
            }
            let _ = reply.send(result);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn insert(
    db: &SqlitePool,
    recipient_phone_or_email: &str,
    channel: Channel,
    max_retries: u32,
    template_name: Option<&str>,
    conversation_id: Option<&str>,
    pricing_model: Option<&str>,
    channel_tracking: ChannelTracking,
) -> Result<i64, DeliveryError> {
    let now = Utc::now();
    let result = sqlx::query(
        "INSERT INTO delivery_records \
            (recipient_phone_or_email, channel, status, retry_count, max_retries, \
             created_at, updated_at, template_name, conversation_id, pricing_model, \
             channel_tracking) \
         VALUES (?1, ?2, ?3, 0, ?4, ?5, ?5, ?6, ?7, ?8, ?9)",
    )
    .bind(recipient_phone_or_email)
    .bind(channel.as_str())
    .bind(MessageStatus::Queued.as_str())
    .bind(max_retries)
    .bind(now.to_rfc3339())
    .bind(template_name)
    .bind(conversation_id)
    .bind(pricing_model)
    .bind(channel_tracking_str(channel_tracking))
    .execute(db)
    .await?;
    Ok(result.last_insert_rowid())
}

async fn set_message_id(db: &SqlitePool, id: i64, message_id: &str) -> Result<(), DeliveryError> {
    sqlx::query("UPDATE delivery_records SET message_id = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(message_id)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(db)
        .await?;
    Ok(())
}

async fn transition(
    db: &SqlitePool,
    id: i64,
    next: MessageStatus,
    update: StatusUpdate,
) -> Result<MessageStatus, DeliveryError> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT status FROM delivery_records WHERE id = ?1")
            .bind(id)
            .fetch_optional(db)
            .await?;
    let Some((status_str,)) = row else {
        return Err(DeliveryError::NotFound(id));
    };
    let current = MessageStatus::parse(&status_str).unwrap_or(MessageStatus::Unknown);

    if !current.can_transition_to(next) {
        return Err(DeliveryError::IllegalTransition {
            from: current,
            to: next,
        });
    }

    // A late-arriving happy-path update (same rank or one step behind, e.g.
    // `read` then a delayed `sent` webhook) is accepted above so its
    // timestamp is recorded, but must not regress the stored status (spec
    // 4.5). Only move `status` forward when `next` actually outranks
    // `current`, or unconditionally for the `deleted` tombstone.
    let moves_forward = match (current.happy_path_rank(), next.happy_path_rank()) {
        (Some(a), Some(b)) => b > a,
        _ => true,
    };
    let stored_status = if next == MessageStatus::Deleted || moves_forward {
        next
    } else {
        current
    };

    let now = Utc::now().to_rfc3339();
    sqlx::query(
        "UPDATE delivery_records SET \
            status = ?1, updated_at = ?2, \
            sent_at = COALESCE(sent_at, ?3), \
            delivered_at = COALESCE(delivered_at, ?4), \
            read_at = COALESCE(read_at, ?5), \
            failed_at = COALESCE(failed_at, ?6), \
            error_code = COALESCE(?7, error_code), \
            error_message = COALESCE(?8, error_message) \
         WHERE id = ?9",
    )
    .bind(stored_status.as_str())
    .bind(&now)
    .bind(update.sent_at.map(|t| t.to_rfc3339()))
    .bind(update.delivered_at.map(|t| t.to_rfc3339()))
    .bind(update.read_at.map(|t| t.to_rfc3339()))
    .bind(update.failed_at.map(|t| t.to_rfc3339()))
    .bind(update.error_code)
    .bind(update.error_message)
    .bind(id)
    .execute(db)
    .await?;
    Ok(stored_status)
}

async fn retry(db: &SqlitePool, id: i64) -> Result<bool, DeliveryError> {
    let row: Option<(String, u32, u32)> = sqlx::query_as(
        "SELECT status, retry_count, max_retries FROM delivery_records WHERE id = ?1",
    )
    .bind(id)
    .fetch_optional(db)
    .await?;
    let Some((status_str, retry_count, max_retries)) = row else {
        return Err(DeliveryError::NotFound(id));
    };
    let current = MessageStatus::parse(&status_str).unwrap_or(MessageStatus::Unknown);
    if current != MessageStatus::Failed || retry_count >= max_retries {
        return Ok(false);
    }

    sqlx::query(
        "UPDATE delivery_records SET status = ?1, retry_count = retry_count + 1, \
         updated_at = ?2 WHERE id = ?3",
    )
    .bind(MessageStatus::Queued.as_str())
    .bind(Utc::now().to_rfc3339())
    .bind(id)
    .execute(db)
    .await?;
    Ok(true)
}

async fn sweep(db: &SqlitePool, retention_days: u32) -> Result<u64, DeliveryError> {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
    let result = sqlx::query("DELETE FROM delivery_records WHERE created_at < ?1")
        .bind(cutoff.to_rfc3339())
        .execute(db)
        .await?;
    Ok(result.rows_affected())
}

pub(super) fn channel_tracking_str(tracking: ChannelTracking) -> &'static str {
    match tracking {
        ChannelTracking::Confirmed => "confirmed",
        ChannelTracking::None => "none",
    }
}
