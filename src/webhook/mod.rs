//! Inbound provider webhook processing (SPEC_FULL 4.6), grounded in
//! `original_source/.../webhook_manager.py`'s `WebhookManager` (signature
//! verification, envelope parsing, status-update mapping) and ported to
//! `hmac` + `sha2` for a constant-time signature compare.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::delivery::{writer::StatusUpdate, DeliveryStore};
use crate::types::MessageStatus;

type HmacSha256 = Hmac<Sha256>;

/// Capacity of the bounded dedup ledger (spec 4.6: "bounded map of processed
/// event IDs, size 10000").
const DEDUP_CAPACITY: usize = 10_000;

/// Inbound message forwarded to the caller instead of tracked against an
/// outgoing [`crate::types::DeliveryRecord`] (spec 4.6).
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub message_id: Option<String>,
    pub from: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub raw: serde_json::Value,
}

/// A WhatsApp template approval/rejection notification, forwarded to C9
/// (spec 4.6: "field == message_template_status_update -> forward to C9").
#[derive(Debug, Clone)]
pub struct TemplateStatusEvent {
    pub template_name: Option<String>,
    pub event: Option<String>,
    pub raw: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("missing signature header")]
    MissingSignature,
    #[error("signature verification failed")]
    InvalidSignature,
    #[error("malformed webhook payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),
    #[error("delivery store error: {0}")]
    Delivery(#[from] crate::delivery::DeliveryError),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    entry: Vec<Entry>,
}

#[derive(Debug, Deserialize)]
struct Entry {
    #[serde(default)]
    changes: Vec<Change>,
}

#[derive(Debug, Deserialize)]
struct Change {
    field: Option<String>,
    #[serde(default)]
    value: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct MessageValue {
    #[serde(default)]
    statuses: Vec<StatusPayload>,
    #[serde(default)]
    messages: Vec<MessagePayload>,
}

#[derive(Debug, Deserialize)]
struct StatusPayload {
    id: Option<String>,
    status: Option<String>,
    timestamp: Option<String>,
    #[serde(default)]
    errors: Vec<ErrorPayload>,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    code: Option<serde_json::Value>,
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagePayload {
    id: Option<String>,
    from: Option<String>,
    timestamp: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TemplateStatusValue {
    message_template_name: Option<String>,
    event: Option<String>,
}

/// Receives and dispatches provider webhook calls against the delivery
/// store (spec 4.6).
pub struct WebhookReceiver {
    secret: Option<String>,
    delivery: std::sync::Arc<DeliveryStore>,
    seen_events: Mutex<SeenEvents>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    template_tx: mpsc::Sender<TemplateStatusEvent>,
}

struct SeenEvents {
    order: VecDeque<String>,
    set: std::collections::HashSet<String>,
}

impl SeenEvents {
    fn new() -> Self {
        Self {
            order: VecDeque::with_capacity(DEDUP_CAPACITY),
            set: std::collections::HashSet::with_capacity(DEDUP_CAPACITY),
        }
    }

    /// Returns true if `key` had already been seen (and thus should be
    /// skipped); otherwise records it and returns false.
    fn check_and_record(&mut self, key: String) -> bool {
        if self.set.contains(&key) {
            return true;
        }
        if self.order.len() >= DEDUP_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.set.insert(key);
        false
    }
}

impl WebhookReceiver {
    /// Construct a receiver and the two channels it forwards inbound
    /// messages / template-status events on.
    pub fn new(
        secret: Option<String>,
        delivery: std::sync::Arc<DeliveryStore>,
    ) -> (Self, mpsc::Receiver<InboundMessage>, mpsc::Receiver<TemplateStatusEvent>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let (template_tx, template_rx) = mpsc::channel(64);
        (
            Self {
                secret,
                delivery,
                seen_events: Mutex::new(SeenEvents::new()),
                inbound_tx,
                template_tx,
            },
            inbound_rx,
            template_rx,
        )
    }

    /// Verify signature (if a secret is configured), parse, and dispatch the
    /// webhook payload. Returns `true` on success, `false` for signature
    /// failures; malformed JSON and dispatch errors are returned as
    /// [`WebhookError`] without side effects on the delivery store.
    pub async fn process(
        &self,
        payload: &[u8],
        signature_header: Option<&str>,
    ) -> Result<bool, WebhookError> {
        if let Some(secret) = &self.secret {
            match signature_header {
                Some(header) => {
                    if !verify_signature(secret, payload, header) {
                        warn!("webhook signature verification failed");
                        return Ok(false);
                    }
                }
                None => {
                    warn!("webhook secret configured but no signature header present");
                    return Err(WebhookError::MissingSignature);
                }
            }
        }

        let envelope: Envelope = serde_json::from_slice(payload)?;
        self.dispatch(envelope).await?;
        Ok(true)
    }

    async fn dispatch(&self, envelope: Envelope) -> Result<(), WebhookError> {
        for entry in envelope.entry {
            for change in entry.changes {
                match change.field.as_deref() {
                    Some("messages") => {
                        let value: MessageValue =
                            serde_json::from_value(change.value).unwrap_or_default();
                        for status in value.statuses {
                            self.handle_status_update(status).await?;
                        }
                        for message in value.messages {
                            self.handle_incoming_message(message).await;
                        }
                    }
                    Some("message_template_status_update") => {
                        let value: TemplateStatusValue =
                            serde_json::from_value(change.value).unwrap_or_default();
                        self.handle_template_status(value).await;
                    }
                    other => {
                        debug!(field = ?other, "ignoring unrecognised webhook change field");
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_status_update(&self, status: StatusPayload) -> Result<(), WebhookError> {
        let Some(message_id) = status.id else {
            warn!("status update missing message id");
            return Ok(());
        };
        let Some(status_str) = status.status else {
            warn!(message_id, "status update missing status");
            return Ok(());
        };

        let event_key = format!("{message_id}:{status_str}:{:?}", status.timestamp);
        if self.seen_events.lock().unwrap_or_else(|e| e.into_inner()).check_and_record(event_key) {
            debug!(message_id, "duplicate webhook status event ignored");
            return Ok(());
        }

        let next = match status_str.as_str() {
            "sent" => MessageStatus::Sent,
            "delivered" => MessageStatus::Delivered,
            "read" => MessageStatus::Read,
            "failed" => MessageStatus::Failed,
            _ => MessageStatus::Unknown,
        };
        if next == MessageStatus::Unknown {
            debug!(message_id, status = %status_str, "unrecognised provider status");
            return Ok(());
        }

        let timestamp = status
            .timestamp
            .as_deref()
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or_else(Utc::now);

        let mut update = StatusUpdate::default();
        match next {
            MessageStatus::Sent => update.sent_at = Some(timestamp),
            MessageStatus::Delivered => update.delivered_at = Some(timestamp),
            MessageStatus::Read => update.read_at = Some(timestamp),
            MessageStatus::Failed => {
                update.failed_at = Some(timestamp);
                if let Some(error) = status.errors.into_iter().next() {
                    update.error_code = Some(match error.code {
                        Some(serde_json::Value::String(s)) => s,
                        Some(other) => other.to_string(),
                        None => "unknown".to_string(),
                    });
                    update.error_message = Some(error.title.unwrap_or_else(|| "Unknown error".to_string()));
                }
            }
            _ => {}
        }

        // Per spec §9 Open Question: a message_id not found in C5 is logged,
        // not a failure — the webhook call still returns success.
        let Some(record) = self.delivery.get_by_message_id(&message_id).await? else {
            warn!(message_id, "status update for unknown message id");
            return Ok(());
        };

        match self.delivery.transition(record.id, next, update).await {
            Ok(_) => debug!(message_id, status = %status_str, "delivery status updated from webhook"),
            Err(crate::delivery::DeliveryError::IllegalTransition { from, to }) => {
                debug!(message_id, ?from, ?to, "webhook status update rejected by status machine");
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    async fn handle_incoming_message(&self, message: MessagePayload) {
        let timestamp = message
            .timestamp
            .as_deref()
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or_else(Utc::now);
        let inbound = InboundMessage {
            message_id: message.id,
            from: message.from,
            timestamp,
            raw: serde_json::Value::Null,
        };
        if self.inbound_tx.send(inbound).await.is_err() {
            debug!("inbound message receiver dropped; discarding event");
        }
    }

    async fn handle_template_status(&self, value: TemplateStatusValue) {
        let event = TemplateStatusEvent {
            template_name: value.message_template_name.clone(),
            event: value.event.clone(),
            raw: serde_json::json!({
                "message_template_name": value.message_template_name,
                "event": value.event,
            }),
        };
        if self.template_tx.send(event).await.is_err() {
            debug!("template status receiver dropped; discarding event");
        }
    }
}

/// Verify an HMAC-SHA256 signature, accepting an optional `sha256=` prefix
/// (spec 4.6). Uses `Mac::verify_slice`, which compares in constant time.
fn verify_signature(secret: &str, payload: &[u8], header: &str) -> bool {
    let hex_sig = header.strip_prefix("sha256=").unwrap_or(header);
    let Ok(sig_bytes) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&sig_bytes).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Channel, ChannelTracking};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_receiver() -> (
        WebhookReceiver,
        std::sync::Arc<DeliveryStore>,
        mpsc::Receiver<InboundMessage>,
        mpsc::Receiver<TemplateStatusEvent>,
    ) {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite pool");
        let store = std::sync::Arc::new(DeliveryStore::new(pool).await.expect("schema"));
        let (receiver, inbound_rx, template_rx) =
            WebhookReceiver::new(Some("test-secret".to_string()), store.clone());
        (receiver, store, inbound_rx, template_rx)
    }

    fn sign(secret: &str, payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[tokio::test]
    async fn rejects_missing_signature_when_secret_configured() {
        let (receiver, _store, _rx1, _rx2) = test_receiver().await;
        let result = receiver.process(b"{}", None).await;
        assert!(matches!(result, Err(WebhookError::MissingSignature)));
    }

    #[tokio::test]
    async fn rejects_invalid_signature() {
        let (receiver, _store, _rx1, _rx2) = test_receiver().await;
        let ok = receiver.process(b"{}", Some("sha256=deadbeef")).await.unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn malformed_json_is_an_error_not_a_panic() {
        let (receiver, _store, _rx1, _rx2) = test_receiver().await;
        let payload = b"not json";
        let sig = sign("test-secret", payload);
        let result = receiver.process(payload, Some(&sig)).await;
        assert!(matches!(result, Err(WebhookError::MalformedPayload(_))));
    }

    #[tokio::test]
    async fn status_update_applies_to_known_message() {
        let (receiver, store, _rx1, _rx2) = test_receiver().await;
        let id = store
            .create("+15551234567", Channel::WhatsAppApi, 3, None, None, None, ChannelTracking::Confirmed)
            .await
            .unwrap();
        store
            .transition(id, MessageStatus::Sending, StatusUpdate::default())
            .await
            .unwrap();
        store
            .transition(id, MessageStatus::Sent, StatusUpdate::default())
            .await
            .unwrap();
        store.set_message_id(id, "wamid.123").await.unwrap();

        let payload = serde_json::json!({
            "entry": [{
                "changes": [{
                    "field": "messages",
                    "value": {
                        "statuses": [{
                            "id": "wamid.123",
                            "status": "delivered",
                            "timestamp": "1700000000"
                        }]
                    }
                }]
            }]
        });
        let bytes = serde_json::to_vec(&payload).unwrap();
        let sig = sign("test-secret", &bytes);
        let ok = receiver.process(&bytes, Some(&sig)).await.unwrap();
        assert!(ok);

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, MessageStatus::Delivered);
    }

    #[tokio::test]
    async fn status_update_for_unknown_message_id_does_not_fail_call() {
        let (receiver, _store, _rx1, _rx2) = test_receiver().await;
        let payload = serde_json::json!({
            "entry": [{
                "changes": [{
                    "field": "messages",
                    "value": {
                        "statuses": [{"id": "wamid.missing", "status": "sent", "timestamp": "1700000000"}]
                    }
                }]
            }]
        });
        let bytes = serde_json::to_vec(&payload).unwrap();
        let sig = sign("test-secret", &bytes);
        let ok = receiver.process(&bytes, Some(&sig)).await.unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn duplicate_event_is_deduped() {
        let (receiver, store, _rx1, _rx2) = test_receiver().await;
        let id = store
            .create("+15551234567", Channel::WhatsAppApi, 3, None, None, None, ChannelTracking::Confirmed)
            .await
            .unwrap();
        store.set_message_id(id, "wamid.dup").await.unwrap();

        let payload = serde_json::json!({
            "entry": [{
                "changes": [{
                    "field": "messages",
                    "value": {
                        "statuses": [{"id": "wamid.dup", "status": "sent", "timestamp": "1700000000"}]
                    }
                }]
            }]
        });
        let bytes = serde_json::to_vec(&payload).unwrap();
        let sig = sign("test-secret", &bytes);
        receiver.process(&bytes, Some(&sig)).await.unwrap();
        receiver.process(&bytes, Some(&sig)).await.unwrap();

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn incoming_message_is_forwarded_not_tracked() {
        let (receiver, _store, mut inbound_rx, _rx2) = test_receiver().await;
        let payload = serde_json::json!({
            "entry": [{
                "changes": [{
                    "field": "messages",
                    "value": {
                        "messages": [{"id": "wamid.in", "from": "15559876543", "timestamp": "1700000000"}]
                    }
                }]
            }]
        });
        let bytes = serde_json::to_vec(&payload).unwrap();
        let sig = sign("test-secret", &bytes);
        receiver.process(&bytes, Some(&sig)).await.unwrap();

        let inbound = inbound_rx.recv().await.unwrap();
        assert_eq!(inbound.from.as_deref(), Some("15559876543"));
    }

    #[tokio::test]
    async fn template_status_update_is_forwarded() {
        let (receiver, _store, _rx1, mut template_rx) = test_receiver().await;
        let payload = serde_json::json!({
            "entry": [{
                "changes": [{
                    "field": "message_template_status_update",
                    "value": {"message_template_name": "welcome", "event": "APPROVED"}
                }]
            }]
        });
        let bytes = serde_json::to_vec(&payload).unwrap();
        let sig = sign("test-secret", &bytes);
        receiver.process(&bytes, Some(&sig)).await.unwrap();

        let event = template_rx.recv().await.unwrap();
        assert_eq!(event.template_name.as_deref(), Some("welcome"));
        assert_eq!(event.event.as_deref(), Some("APPROVED"));
    }
}
