//! Channel adapters (SPEC_FULL 4.7): one uniform `send`/`test_connection`
//! contract, three implementations. The trait shape is grounded in the
//! teacher's `Executor` trait (`src/executor/mod.rs`); adapter internals are
//! grounded per-module below.

pub mod browser;
pub mod mail;
pub mod provider_api;

use async_trait::async_trait;

use crate::template::RenderedMessage;

/// Outcome of a channel send attempt (spec 4.7).
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message_id: String,
}

/// A send failure, tagged with whether the caller should retry (spec 4.7).
#[derive(Debug, Clone, thiserror::Error)]
#[error("channel send failed: {message} (code={code}, retriable={retriable})")]
pub struct SendError {
    pub code: String,
    pub message: String,
    pub retriable: bool,
}

/// Connection/health diagnostics returned by `test_connection` (spec 4.7).
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub ok: bool,
    pub details: String,
}

/// Uniform channel contract (spec 4.7): send, health check, and recipient
/// field validation, mirroring the teacher's `Executor` trait shape.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Send a rendered message. `to` is the channel-appropriate address
    /// (email for mail, phone for WhatsApp) as produced by
    /// `Recipient::address_for`.
    async fn send(&self, to: &str, rendered: &RenderedMessage) -> Result<SendOutcome, SendError>;

    /// Check connectivity/health for this adapter.
    async fn test_connection(&self) -> ConnectionStatus;

    /// Validate that `value` is well-formed for this channel's recipient
    /// field (email format for mail, digit-plus for WhatsApp).
    fn validate_recipient_field(&self, value: &str) -> bool;
}
