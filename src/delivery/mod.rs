//! Durable per-message delivery tracking (SPEC_FULL 4.5), grounded in
//! `src/memory/mod.rs` + `src/memory/writer.rs`'s single-writer-actor-plus-pool
//! pattern: reads go through the pool directly, writes funnel through one
//! `mpsc`-fed actor task to avoid SQLite write contention.

pub mod writer;

use std::num::NonZeroUsize;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use sqlx::SqlitePool;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::types::{Channel, ChannelTracking, DeliveryRecord, MessageStatus};
use writer::{StatusUpdate, WriteOp};

/// Capacity of the single-writer actor's channel.
const WRITER_CHANNEL_CAPACITY: usize = 1024;

/// Default number of most-recently-touched records the in-memory LRU holds
/// when a caller doesn't override it via config (spec 4.5: "an in-memory LRU
/// of the ~1000 most-recently-touched records").
const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// Errors surfaced by the delivery store.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("no delivery record with id {0}")]
    NotFound(i64),
    #[error("illegal status transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: MessageStatus,
        to: MessageStatus,
    },
    #[error("writer actor has stopped")]
    WriterClosed,
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for DeliveryError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::WriterClosed
    }
}

impl From<oneshot::error::RecvError> for DeliveryError {
    fn from(_: oneshot::error::RecvError) -> Self {
        Self::WriterClosed
    }
}

/// Row type returned by SQLite queries for delivery records.
type DeliveryRow = (
    i64,
    Option<String>,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    i64,
    i64,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
);

const SELECT_COLUMNS: &str = "id, message_id, recipient_phone_or_email, channel, status, \
    sent_at, delivered_at, read_at, failed_at, error_code, error_message, \
    retry_count, max_retries, created_at, updated_at, template_name, \
    conversation_id, pricing_model, channel_tracking";

fn parse_ts(value: Option<&str>) -> Option<DateTime<Utc>> {
    value.and_then(|v| DateTime::parse_from_rfc3339(v).ok().map(|dt| dt.with_timezone(&Utc)))
}

/// Convert a `DeliveryRow` tuple into a [`DeliveryRecord`], falling back to
/// `Unknown`/`None` for fields that fail to parse rather than erroring, since
/// these rows are our own writes and a parse failure indicates a schema
/// mismatch that callers cannot act on anyway.
fn record_from_row(row: DeliveryRow) -> DeliveryRecord {
    DeliveryRecord {
        id: row.0,
        message_id: row.1,
        recipient_phone_or_email: row.2,
        channel: match row.3.as_str() {
            "mail" => Channel::Mail,
            "whatsapp_browser" => Channel::WhatsAppBrowser,
            _ => Channel::WhatsAppApi,
        },
        status: MessageStatus::parse(&row.4).unwrap_or(MessageStatus::Unknown),
        sent_at: parse_ts(row.5.as_deref()),
        delivered_at: parse_ts(row.6.as_deref()),
        read_at: parse_ts(row.7.as_deref()),
        failed_at: parse_ts(row.8.as_deref()),
        error_code: row.9,
        error_message: row.10,
        retry_count: row.11.cast_unsigned() as u32,
        max_retries: row.12.cast_unsigned() as u32,
        created_at: parse_ts(Some(&row.13)).unwrap_or_else(Utc::now),
        updated_at: parse_ts(Some(&row.14)).unwrap_or_else(Utc::now),
        template_name: row.15,
        conversation_id: row.16,
        pricing_model: row.17,
        channel_tracking: match row.18.as_str() {
            "confirmed" => ChannelTracking::Confirmed,
            _ => ChannelTracking::None,
        },
    }
}

/// Per-status, per-error-code, and timing rollup over a time window
/// (spec 4.5 "Analytics").
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DeliveryAnalytics {
    pub total: u64,
    pub queued: u64,
    pub sending: u64,
    pub sent: u64,
    pub delivered: u64,
    pub read: u64,
    pub failed: u64,
    pub deleted: u64,
    pub delivery_rate: f64,
    pub read_rate: f64,
    pub failure_rate: f64,
    pub avg_delivery_time_seconds: Option<f64>,
    pub avg_read_time_seconds: Option<f64>,
    pub error_code_histogram: std::collections::HashMap<String, u64>,
}

/// Durable delivery store fronted by an in-memory LRU (spec 4.5).
pub struct DeliveryStore {
    db: SqlitePool,
    writer_tx: mpsc::Sender<WriteOp>,
    writer_handle: tokio::task::JoinHandle<()>,
    cache: Mutex<LruCache<i64, DeliveryRecord>>,
}

impl std::fmt::Debug for DeliveryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryStore").finish_non_exhaustive()
    }
}

impl DeliveryStore {
    /// Open a delivery store backed by `db`, creating the schema if absent
    /// and spawning the single-writer actor as a background task. The LRU
    /// front defaults to [`DEFAULT_CACHE_CAPACITY`] entries.
    pub async fn new(db: SqlitePool) -> Result<Self, DeliveryError> {
        Self::with_cache_capacity(db, DEFAULT_CACHE_CAPACITY).await
    }

    /// Like [`Self::new`], but with an explicit LRU capacity (spec 4.5;
    /// sized from `DeliveryConfig::lru_capacity` by callers that load it
    /// from config).
    pub async fn with_cache_capacity(db: SqlitePool, cache_capacity: usize) -> Result<Self, DeliveryError> {
        create_schema(&db).await?;

        let (writer_tx, writer_rx) = mpsc::channel(WRITER_CHANNEL_CAPACITY);
        let writer_pool = db.clone();
        let writer_handle = tokio::spawn(writer::run_writer(writer_pool, writer_rx));

        info!(cache_capacity, "delivery store initialised");

        Ok(Self {
            db,
            writer_tx,
            writer_handle,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(cache_capacity.max(1)).expect("capacity clamped to at least 1"),
            )),
        })
    }

    /// Create a new `queued` record and return its row id.
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        recipient_phone_or_email: impl Into<String>,
        channel: Channel,
        max_retries: u32,
        template_name: Option<String>,
        conversation_id: Option<String>,
        pricing_model: Option<String>,
        channel_tracking: ChannelTracking,
    ) -> Result<i64, DeliveryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.writer_tx
            .send(WriteOp::Insert {
                recipient_phone_or_email: recipient_phone_or_email.into(),
                channel,
                max_retries,
                template_name,
                conversation_id,
                pricing_model,
                channel_tracking,
                reply: reply_tx,
            })
            .await?;
        reply_rx.await?
    }

    /// Attach the provider-assigned message id to a record once the adapter
    /// accepts the send (spec 3 DeliveryRecord: "assigned by the channel
    /// adapter on successful submit").
    pub async fn set_message_id(&self, id: i64, message_id: impl Into<String>) -> Result<(), DeliveryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.writer_tx
            .send(WriteOp::SetMessageId {
                id,
                message_id: message_id.into(),
                reply: reply_tx,
            })
            .await?;
        let result = reply_rx.await?;
        self.invalidate(id);
        result
    }

    /// Apply a status transition, rejecting transitions the status machine
    /// disallows (spec 4.5).
    pub async fn transition(
        &self,
        id: i64,
        next: MessageStatus,
        update: StatusUpdate,
    ) -> Result<MessageStatus, DeliveryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.writer_tx
            .send(WriteOp::Transition {
                id,
                next,
                update,
                reply: reply_tx,
            })
            .await?;
        let result = reply_rx.await?;
        self.invalidate(id);
        result
    }

    /// Retry a failed record: resets status to `queued` and increments
    /// `retry_count`, only if `retry_count < max_retries`. Returns whether a
    /// retry was scheduled.
    pub async fn retry(&self, id: i64) -> Result<bool, DeliveryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.writer_tx
            .send(WriteOp::Retry { id, reply: reply_tx })
            .await?;
        let result = reply_rx.await?;
        self.invalidate(id);
        result
    }

    /// Remove records older than `retention_days` (spec 4.5 "Retention").
    /// Idempotent; returns the number of rows removed.
    pub async fn sweep_retention(&self, retention_days: u32) -> Result<u64, DeliveryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.writer_tx
            .send(WriteOp::Sweep {
                retention_days,
                reply: reply_tx,
            })
            .await?;
        let removed = reply_rx.await??;
        if removed > 0 {
            // Cheapest correct option: a targeted per-id invalidation would
            // need to know which ids were swept, so just drop the whole
            // cache; it repopulates from the pool on next read.
            self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
        }
        Ok(removed)
    }

    /// Look up a record by row id, consulting the LRU cache first.
    pub async fn get(&self, id: i64) -> Result<Option<DeliveryRecord>, DeliveryError> {
        if let Some(hit) = self.cache.lock().unwrap_or_else(|e| e.into_inner()).get(&id).cloned() {
            return Ok(Some(hit));
        }
        let row: Option<DeliveryRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM delivery_records WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let record = record_from_row(row);
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(id, record.clone());
        Ok(Some(record))
    }

    /// Look up a record by its provider-assigned `message_id`, used by the
    /// webhook receiver (spec 4.6) to apply status updates.
    pub async fn get_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<DeliveryRecord>, DeliveryError> {
        let row: Option<DeliveryRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM delivery_records WHERE message_id = ?1"
        ))
        .bind(message_id)
        .fetch_optional(&self.db)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let record = record_from_row(row);
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(record.id, record.clone());
        Ok(Some(record))
    }

    /// Compute analytics over `[now - window, now]` (spec 4.5 "Analytics").
    /// Runs as a single transactional read so concurrent writes cannot be
    /// observed half-applied.
    pub async fn analytics(&self, window: Duration) -> Result<DeliveryAnalytics, DeliveryError> {
        let since = (Utc::now() - window).to_rfc3339();
        let mut tx = self.db.begin().await?;

        let status_rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, count(*) FROM delivery_records WHERE created_at >= ?1 GROUP BY status",
        )
        .bind(&since)
        .fetch_all(&mut *tx)
        .await?;

        let mut analytics = DeliveryAnalytics::default();
        for (status, count) in status_rows {
            let count = count.cast_unsigned();
            analytics.total += count;
            match MessageStatus::parse(&status) {
                Some(MessageStatus::Queued) => analytics.queued = count,
                Some(MessageStatus::Sending) => analytics.sending = count,
                Some(MessageStatus::Sent) => analytics.sent = count,
                Some(MessageStatus::Delivered) => analytics.delivered = count,
                Some(MessageStatus::Read) => analytics.read = count,
                Some(MessageStatus::Failed) => analytics.failed = count,
                Some(MessageStatus::Deleted) => analytics.deleted = count,
                _ => {}
            }
        }

        if analytics.total > 0 {
            let total = analytics.total as f64;
            analytics.delivery_rate = analytics.delivered as f64 / total;
            analytics.read_rate = analytics.read as f64 / total;
            analytics.failure_rate = analytics.failed as f64 / total;
        }

        let delivery_times: Vec<(String, String)> = sqlx::query_as(
            "SELECT sent_at, delivered_at FROM delivery_records \
             WHERE created_at >= ?1 AND sent_at IS NOT NULL AND delivered_at IS NOT NULL",
        )
        .bind(&since)
        .fetch_all(&mut *tx)
        .await?;
        analytics.avg_delivery_time_seconds = mean_duration_seconds(&delivery_times);

        let read_times: Vec<(String, String)> = sqlx::query_as(
            "SELECT delivered_at, read_at FROM delivery_records \
             WHERE created_at >= ?1 AND delivered_at IS NOT NULL AND read_at IS NOT NULL",
        )
        .bind(&since)
        .fetch_all(&mut *tx)
        .await?;
        analytics.avg_read_time_seconds = mean_duration_seconds(&read_times);

        let error_rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT error_code, count(*) FROM delivery_records \
             WHERE created_at >= ?1 AND error_code IS NOT NULL GROUP BY error_code",
        )
        .bind(&since)
        .fetch_all(&mut *tx)
        .await?;
        analytics.error_code_histogram = error_rows
            .into_iter()
            .map(|(code, count)| (code, count.cast_unsigned()))
            .collect();

        tx.commit().await?;
        Ok(analytics)
    }

    /// Returns a reference to the underlying pool (for the webhook dedup
    /// ledger and other components that share the same database file).
    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Gracefully shut down the writer actor, draining any in-flight writes.
    pub async fn shutdown(self) {
        drop(self.writer_tx);
        let _ = self.writer_handle.await;
    }

    fn invalidate(&self, id: i64) {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).pop(&id);
    }
}

fn mean_duration_seconds(pairs: &[(String, String)]) -> Option<f64> {
    if pairs.is_empty() {
        return None;
    }
    let mut total_seconds = 0.0;
    let mut n = 0u64;
    for (start, end) in pairs {
        if let (Some(start), Some(end)) = (parse_ts(Some(start)), parse_ts(Some(end))) {
            total_seconds += (end - start).num_milliseconds() as f64 / 1000.0;
            n += 1;
        }
    }
    if n == 0 {
        None
    } else {
        Some(total_seconds / n as f64)
    }
}

async fn create_schema(db: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS delivery_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id TEXT,
            recipient_phone_or_email TEXT NOT NULL,
            channel TEXT NOT NULL,
            status TEXT NOT NULL,
            sent_at TEXT,
            delivered_at TEXT,
            read_at TEXT,
            failed_at TEXT,
            error_code TEXT,
            error_message TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            template_name TEXT,
            conversation_id TEXT,
            pricing_model TEXT,
            channel_tracking TEXT NOT NULL DEFAULT 'none'
        )",
    )
    .execute(db)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_delivery_status ON delivery_records (status)")
        .execute(db)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_delivery_created_at ON delivery_records (created_at)")
        .execute(db)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_delivery_recipient ON delivery_records (recipient_phone_or_email)",
    )
    .execute(db)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_delivery_message_id ON delivery_records (message_id)")
        .execute(db)
        .await?;

    Ok(())
}
