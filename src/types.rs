//! Shared data model (spec 3): `Recipient`, `Channel`, and the message
//! status machine used by the delivery store and webhook receiver.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A delivery channel (spec 3 "Channel").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Local mail-client sink.
    Mail,
    /// WhatsApp Business provider HTTP API.
    WhatsAppApi,
    /// WhatsApp Web browser-automation fallback.
    WhatsAppBrowser,
}

impl Channel {
    /// Short string form, used as a quota kind discriminator and in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mail => "mail",
            Self::WhatsAppApi => "whatsapp_api",
            Self::WhatsAppBrowser => "whatsapp_browser",
        }
    }

    /// Returns true if this channel addresses recipients by phone number.
    pub fn is_whatsapp(self) -> bool {
        matches!(self, Self::WhatsAppApi | Self::WhatsAppBrowser)
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recipient record produced by ingestion and validation (spec 3 "Recipient").
///
/// Immutable once produced by C1 -> C2: callers that need to adjust a
/// recipient construct a new value rather than mutating this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    /// Recipient's display name. May be empty.
    pub name: String,
    /// Recipient's company/organization. May be empty.
    pub company: String,
    /// Recipient's email address. May be empty.
    pub email: String,
    /// Recipient's phone number, E.164-ish or raw. May be empty.
    pub phone: String,
    /// 1-based row number in the source file this recipient was read from.
    pub row_number: u64,
}

impl Recipient {
    /// True if at least one channel-required field is populated for `channel`
    /// (spec 3 Recipient invariant): email for mail, phone for WhatsApp.
    pub fn has_required_field_for(&self, channel: Channel) -> bool {
        match channel {
            Channel::Mail => !self.email.trim().is_empty(),
            Channel::WhatsAppApi | Channel::WhatsAppBrowser => !self.phone.trim().is_empty(),
        }
    }

    /// The address used to key delivery records for `channel`.
    pub fn address_for(&self, channel: Channel) -> &str {
        match channel {
            Channel::Mail => &self.email,
            Channel::WhatsAppApi | Channel::WhatsAppBrowser => &self.phone,
        }
    }
}

/// Delivery status machine (spec 3 DeliveryRecord, spec 4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Accepted by the dispatcher, not yet sent.
    Queued,
    /// Handed to the adapter, awaiting its result.
    Sending,
    /// Adapter accepted the message.
    Sent,
    /// Provider confirmed device delivery.
    Delivered,
    /// Provider confirmed the recipient read the message.
    Read,
    /// Terminal failure (exhausted retries or non-retriable).
    Failed,
    /// Tombstoned; not a physical delete.
    Deleted,
    /// Status reported by a provider that doesn't map to a known value.
    Unknown,
}

impl MessageStatus {
    /// Returns the string stored in SQLite, matching `parse`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
            Self::Deleted => "deleted",
            Self::Unknown => "unknown",
        }
    }

    /// Parse a status previously produced by `as_str`.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => Self::Queued,
            "sending" => Self::Sending,
            "sent" => Self::Sent,
            "delivered" => Self::Delivered,
            "read" => Self::Read,
            "failed" => Self::Failed,
            "deleted" => Self::Deleted,
            "unknown" => Self::Unknown,
            _ => return None,
        })
    }

    /// The terminal rank of a status along the happy path
    /// `queued -> sending -> sent -> delivered -> read`, used to decide
    /// whether an incoming update would regress status (spec 4.5).
    ///
    /// `None` for statuses outside the happy path (`failed`, `deleted`,
    /// `unknown`), which are handled by dedicated transition rules instead.
    fn happy_path_rank(self) -> Option<u8> {
        match self {
            Self::Queued => Some(0),
            Self::Sending => Some(1),
            Self::Sent => Some(2),
            Self::Delivered => Some(3),
            Self::Read => Some(4),
            Self::Failed | Self::Deleted | Self::Unknown => None,
        }
    }

    /// Whether `self -> next` is an allowed transition (spec 4.5 status machine).
    ///
    /// This only gates whether an update is accepted at all; it does not by
    /// itself decide whether the stored `status` column moves to `next`.
    /// A same-rank or one-step-behind happy-path pair (e.g. `read -> sent`
    /// arriving out of order) is accepted here so its timestamp can be
    /// recorded, but [`crate::delivery::writer::transition`] only rewrites
    /// `status` when `next` is strictly further along than the stored
    /// status (spec 4.5: "late-arriving updates ... do not regress status
    /// — they only fill missing timestamps").
    pub fn can_transition_to(self, next: Self) -> bool {
        if next == Self::Deleted {
            return true; // any -> deleted, terminal tombstone.
        }
        match (self, next) {
            (Self::Queued, Self::Sending) => true,
            (Self::Sending, Self::Sent) | (Self::Sending, Self::Failed) => true,
            (Self::Sent, Self::Delivered) | (Self::Sent, Self::Failed) => true,
            (Self::Delivered, Self::Read) | (Self::Delivered, Self::Failed) => true,
            // failed -> queued only happens via explicit retry (checked by
            // the caller against retry_count < max_retries), not here.
            (Self::Failed, Self::Queued) => true,
            _ => match (self.happy_path_rank(), next.happy_path_rank()) {
                // Accept the same status (idempotent resend) or exactly one
                // step behind (one out-of-order webhook event); anything
                // further back is rejected outright rather than treated as
                // a no-op regression.
                (Some(a), Some(b)) => b <= a && a - b <= 1,
                _ => false,
            },
        }
    }
}

/// Durable record of one message's delivery lifecycle (spec 3 DeliveryRecord).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    /// Row id assigned by the delivery store.
    pub id: i64,
    /// Provider-assigned message id, set once the adapter accepts the send.
    pub message_id: Option<String>,
    /// Recipient's phone number or email, depending on `channel`.
    pub recipient_phone_or_email: String,
    /// Delivery channel.
    pub channel: Channel,
    /// Current status.
    pub status: MessageStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub template_name: Option<String>,
    pub conversation_id: Option<String>,
    pub pricing_model: Option<String>,
    /// Open Question (spec 9): set for channels (browser fallback) that
    /// report `sent` without any real delivery confirmation, so analytics
    /// can flag the metric as provider-dependent instead of conflating it
    /// with confirmed provider delivery.
    pub channel_tracking: ChannelTracking,
}

/// Whether a channel's status reporting reflects confirmed provider state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelTracking {
    /// Status transitions are backed by provider confirmation (webhooks).
    Confirmed,
    /// Status is optimistic; e.g. browser-fallback reports `sent` on URL
    /// launch alone (spec 9 Open Question).
    None,
}

impl DeliveryRecord {
    /// True if a failed record is eligible for automatic retry (spec 4.5).
    pub fn can_retry(&self) -> bool {
        self.status == MessageStatus::Failed && self.retry_count < self.max_retries
    }

    /// Time from sent to delivered, if both timestamps are present.
    pub fn delivery_time(&self) -> Option<chrono::Duration> {
        match (self.sent_at, self.delivered_at) {
            (Some(s), Some(d)) => Some(d - s),
            _ => None,
        }
    }

    /// Time from delivered to read, if both timestamps are present.
    pub fn read_time(&self) -> Option<chrono::Duration> {
        match (self.delivered_at, self.read_at) {
            (Some(d), Some(r)) => Some(r - d),
            _ => None,
        }
    }
}

/// One invocation of the Dispatcher over a batch (spec 3 "Session").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: uuid::Uuid,
    pub channel: Channel,
    pub template_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub sent_total: u64,
    pub failed_total: u64,
}

impl Session {
    /// Start a new open session.
    pub fn start(channel: Channel, template_id: String) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4(),
            channel,
            template_id,
            started_at: Utc::now(),
            ended_at: None,
            sent_total: 0,
            failed_total: 0,
        }
    }

    /// Close the session, recording the end time.
    pub fn close(&mut self) {
        self.ended_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipient_required_field_per_channel() {
        let r = Recipient {
            name: "Jane".into(),
            company: "Acme".into(),
            email: String::new(),
            phone: "+15551234567".into(),
            row_number: 1,
        };
        assert!(!r.has_required_field_for(Channel::Mail));
        assert!(r.has_required_field_for(Channel::WhatsAppApi));
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            MessageStatus::Queued,
            MessageStatus::Sending,
            MessageStatus::Sent,
            MessageStatus::Delivered,
            MessageStatus::Read,
            MessageStatus::Failed,
            MessageStatus::Deleted,
            MessageStatus::Unknown,
        ] {
            assert_eq!(MessageStatus::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn happy_path_transitions_allowed() {
        assert!(MessageStatus::Queued.can_transition_to(MessageStatus::Sending));
        assert!(MessageStatus::Sending.can_transition_to(MessageStatus::Sent));
        assert!(MessageStatus::Sent.can_transition_to(MessageStatus::Delivered));
        assert!(MessageStatus::Delivered.can_transition_to(MessageStatus::Read));
    }

    #[test]
    fn late_arriving_update_does_not_regress() {
        // delivered arriving after read must not regress status.
        assert!(MessageStatus::Read.can_transition_to(MessageStatus::Delivered));
        assert!(!MessageStatus::Read.can_transition_to(MessageStatus::Sent));
    }

    #[test]
    fn failed_to_queued_is_a_retry_transition() {
        assert!(MessageStatus::Failed.can_transition_to(MessageStatus::Queued));
    }

    #[test]
    fn any_status_can_be_tombstoned() {
        assert!(MessageStatus::Sent.can_transition_to(MessageStatus::Deleted));
        assert!(MessageStatus::Failed.can_transition_to(MessageStatus::Deleted));
    }

    #[test]
    fn unknown_transitions_are_rejected() {
        assert!(!MessageStatus::Queued.can_transition_to(MessageStatus::Read));
        assert!(!MessageStatus::Deleted.can_transition_to(MessageStatus::Sent));
    }
}
