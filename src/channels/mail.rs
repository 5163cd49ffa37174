//! Mail-sink adapter (SPEC_FULL 4.7): hands `(subject, body, to)` to an
//! opaque local mail client. Modeled as a trait object so the concrete
//! client is swappable, mirroring the teacher's treatment of `Executor`
//! backends (`src/executor/mod.rs`) as interchangeable trait objects.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{ChannelAdapter, ConnectionStatus, SendError, SendOutcome};
use crate::template::RenderedMessage;

/// The opaque local mail client a `MailAdapter` hands messages to.
/// Success means "accepted for send or draft" (spec 4.7); this adapter
/// performs no real delivery tracking beyond that.
#[async_trait]
pub trait MailSink: Send + Sync {
    async fn accept(&self, subject: &str, body: &str, to: &str, draft_only: bool) -> Result<String, String>;
}

/// In-process stub sink: always accepts, synthesizes a message id. Used when
/// no real mail transport is configured.
#[derive(Debug, Default)]
pub struct StubMailSink;

#[async_trait]
impl MailSink for StubMailSink {
    async fn accept(&self, _subject: &str, _body: &str, _to: &str, _draft_only: bool) -> Result<String, String> {
        Ok(format!("stub-mail-{}", uuid::Uuid::new_v4()))
    }
}

/// File-based sink: appends each accepted message to a file as a single
/// JSON line. Used in tests and local runs where no real mail transport is
/// wired up, per spec 4.7's "opaque local mail client".
#[derive(Debug)]
pub struct FileMailSink {
    path: PathBuf,
}

impl FileMailSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl MailSink for FileMailSink {
    async fn accept(&self, subject: &str, body: &str, to: &str, draft_only: bool) -> Result<String, String> {
        let message_id = format!("file-mail-{}", uuid::Uuid::new_v4());
        let record = serde_json::json!({
            "message_id": message_id,
            "subject": subject,
            "body": body,
            "to": to,
            "draft_only": draft_only,
        });
        let line = format!("{record}\n");
        tokio::fs::create_dir_all(self.path.parent().unwrap_or_else(|| std::path::Path::new(".")))
            .await
            .map_err(|e| e.to_string())?;
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| e.to_string())?;
        file.write_all(line.as_bytes()).await.map_err(|e| e.to_string())?;
        Ok(message_id)
    }
}

/// Mail channel adapter (spec 4.7 "Mail-sink adapter").
pub struct MailAdapter {
    sink: Arc<dyn MailSink>,
    draft_only: bool,
}

impl MailAdapter {
    pub fn new(sink: Arc<dyn MailSink>, draft_only: bool) -> Self {
        Self { sink, draft_only }
    }
}

#[async_trait]
impl ChannelAdapter for MailAdapter {
    async fn send(&self, to: &str, rendered: &RenderedMessage) -> Result<SendOutcome, SendError> {
        let subject = rendered.subject.as_deref().unwrap_or("");
        match self.sink.accept(subject, &rendered.body, to, self.draft_only).await {
            Ok(message_id) => {
                debug!(to, message_id, "mail accepted");
                Ok(SendOutcome { message_id })
            }
            Err(message) => Err(SendError {
                code: "mail_sink_rejected".to_string(),
                message,
                retriable: false,
            }),
        }
    }

    async fn test_connection(&self) -> ConnectionStatus {
        ConnectionStatus {
            ok: true,
            details: "mail sink does not expose a connectivity check".to_string(),
        }
    }

    fn validate_recipient_field(&self, value: &str) -> bool {
        value.contains('@') && value.split('@').count() == 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Channel;

    fn rendered() -> RenderedMessage {
        RenderedMessage {
            channel: Channel::Mail,
            subject: Some("Hello".to_string()),
            body: "Body text".to_string(),
            segments: Vec::new(),
        }
    }

    #[tokio::test]
    async fn stub_sink_accepts_and_returns_synthetic_id() {
        let adapter = MailAdapter::new(Arc::new(StubMailSink), false);
        let outcome = adapter.send("jane@example.com", &rendered()).await.unwrap();
        assert!(outcome.message_id.starts_with("stub-mail-"));
    }

    #[tokio::test]
    async fn file_sink_writes_one_line_per_message() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.jsonl");
        let adapter = MailAdapter::new(Arc::new(FileMailSink::new(path.clone())), true);
        adapter.send("jane@example.com", &rendered()).await.unwrap();
        adapter.send("jane@example.com", &rendered()).await.unwrap();
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn recipient_validation_requires_single_at() {
        let adapter = MailAdapter::new(Arc::new(StubMailSink), false);
        assert!(adapter.validate_recipient_field("jane@example.com"));
        assert!(!adapter.validate_recipient_field("not-an-email"));
    }
}
