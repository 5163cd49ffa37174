//! End-to-end scenarios (SPEC_FULL 8 "Testable properties"): each test below
//! is one of the literal scenarios, driven directly against the library's
//! public API rather than the CLI binary.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::mpsc;

use dispatchctl::channels::mail::{FileMailSink, MailAdapter};
use dispatchctl::channels::{ChannelAdapter, ConnectionStatus, SendError, SendOutcome};
use dispatchctl::delivery::DeliveryStore;
use dispatchctl::dispatcher::{CancelToken, DispatchOptions, Dispatcher};
use dispatchctl::quota::{QuotaConfig, QuotaManager};
use dispatchctl::template::{MultiMessageConfig, RenderedMessage, SplitStrategy, Template, TemplateBodies};
use dispatchctl::types::{Channel, MessageStatus, Recipient};
use dispatchctl::webhook::WebhookReceiver;

type HmacSha256 = Hmac<Sha256>;

async fn memory_delivery_store() -> Arc<DeliveryStore> {
    let pool = SqlitePoolOptions::new()
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite pool");
    Arc::new(DeliveryStore::new(pool).await.expect("schema init"))
}

fn quota_manager(kind: &str, limit: u64, burst: u64, window_seconds: i64) -> Arc<QuotaManager> {
    let config = QuotaConfig {
        window_seconds,
        limit,
        burst_capacity: burst,
        warning_threshold_percent: 80,
        critical_threshold_percent: 95,
    };
    let snapshot = std::env::temp_dir().join(format!(
        "dispatchctl_scenario_quota_{}_{}.json",
        kind,
        uuid::Uuid::new_v4()
    ));
    Arc::new(QuotaManager::new(vec![(kind.to_string(), config)], snapshot).expect("valid quota config"))
}

// --- Scenario 1: mail-only happy path -------------------------------------

#[tokio::test]
async fn mail_only_happy_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sink_path = dir.path().join("outbox.jsonl");

    let template = Template {
        name: "welcome".to_string(),
        bodies: TemplateBodies {
            email_subject: Some("Hi {name}".to_string()),
            email_body: Some("Hello {name} from {company}".to_string()),
            whatsapp_body: None,
        },
        variables: HashSet::from(["name".to_string(), "company".to_string()]),
        enabled_channels: vec![Channel::Mail],
        whatsapp_api_parameter_count: None,
        multi_message: None,
    };
    template.validate().expect("template is well-formed");

    let recipient = Recipient {
        name: "John Doe".to_string(),
        company: "Acme".to_string(),
        email: "john@acme.com".to_string(),
        phone: String::new(),
        row_number: 1,
    };

    let delivery = memory_delivery_store().await;
    let quota = quota_manager("mail", 1000, 0, 60);

    let mut adapters: HashMap<Channel, Arc<dyn ChannelAdapter>> = HashMap::new();
    adapters.insert(
        Channel::Mail,
        Arc::new(MailAdapter::new(Arc::new(FileMailSink::new(sink_path.clone())), false)),
    );

    let dispatcher = Dispatcher::new(quota, delivery.clone(), adapters);
    let (recipient_tx, recipient_rx) = mpsc::channel(4);
    let (progress_tx, mut progress_rx) = mpsc::channel(4);
    recipient_tx.send(recipient).await.unwrap();
    drop(recipient_tx);

    let options = DispatchOptions {
        channels: vec![Channel::Mail],
        ..DispatchOptions::default()
    };
    let session = dispatcher
        .run(recipient_rx, &template, &options, progress_tx, CancelToken::new())
        .await;

    let progress = progress_rx.recv().await.expect("one progress event");
    assert_eq!(progress.status, MessageStatus::Sent);
    assert_eq!(session.sent_total, 1);
    assert_eq!(session.failed_total, 0);

    let record = delivery
        .get_by_message_id(progress.message_id.as_deref().unwrap())
        .await
        .unwrap()
        .expect("delivery record exists");
    assert_eq!(record.status, MessageStatus::Sent);

    let outbox = tokio::fs::read_to_string(&sink_path).await.unwrap();
    let line: serde_json::Value = serde_json::from_str(outbox.lines().next().unwrap()).unwrap();
    assert_eq!(line["subject"], "Hi John Doe");
    assert!(line["body"].as_str().unwrap().contains("Hello John Doe from Acme"));
}

// --- Scenario 2: quota deny + wait -----------------------------------------

#[tokio::test]
async fn quota_denies_third_request_then_admits_after_window() {
    let quota = quota_manager("whatsapp_api", 2, 0, 1);

    for _ in 0..2 {
        let (admitted, _) = quota.can_make_request("whatsapp_api", true).await.unwrap();
        assert!(admitted);
        quota.record_request("whatsapp_api", false).await.unwrap();
    }

    let (admitted, details) = quota.can_make_request("whatsapp_api", true).await.unwrap();
    assert!(!admitted, "third request must be denied within the first window");
    assert_eq!(details.current, 2, "first window must have admitted exactly 2");
    let wait = details.wait_seconds.expect("a denied request reports a wait time");
    assert!(wait > 0.0);

    tokio::time::sleep(std::time::Duration::from_secs_f64(wait + 0.1)).await;

    let (admitted, _) = quota.can_make_request("whatsapp_api", true).await.unwrap();
    assert!(admitted, "request must be admitted once the window has elapsed");
    quota.record_request("whatsapp_api", false).await.unwrap();
}

// --- Scenario 3: webhook status update -------------------------------------

#[tokio::test]
async fn webhook_delivered_event_updates_existing_record() {
    let delivery = memory_delivery_store().await;
    let id = delivery
        .create(
            "+15551234567".to_string(),
            Channel::WhatsAppApi,
            3,
            Some("welcome".to_string()),
            None,
            None,
            dispatchctl::types::ChannelTracking::Confirmed,
        )
        .await
        .unwrap();
    delivery.set_message_id(id, "wamid.123").await.unwrap();
    delivery
        .transition(id, MessageStatus::Sending, Default::default())
        .await
        .unwrap();
    let sent_at = chrono::Utc::now();
    delivery
        .transition(
            id,
            MessageStatus::Sent,
            dispatchctl::delivery::writer::StatusUpdate {
                sent_at: Some(sent_at),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let (receiver, _inbound_rx, _template_rx) =
        WebhookReceiver::new(Some("whsec".to_string()), delivery.clone());

    let delivered_epoch = sent_at.timestamp() + 5;
    let payload = serde_json::json!({
        "entry": [{
            "changes": [{
                "field": "messages",
                "value": {
                    "statuses": [{
                        "id": "wamid.123",
                        "status": "delivered",
                        "timestamp": delivered_epoch.to_string(),
                    }]
                }
            }]
        }]
    });
    let bytes = serde_json::to_vec(&payload).unwrap();
    let mut mac = HmacSha256::new_from_slice(b"whsec").unwrap();
    mac.update(&bytes);
    let signature = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

    let ok = receiver.process(&bytes, Some(&signature)).await.unwrap();
    assert!(ok);

    let record = delivery.get_by_message_id("wamid.123").await.unwrap().unwrap();
    assert_eq!(record.status, MessageStatus::Delivered);
    assert_eq!(record.delivered_at.unwrap().timestamp(), delivered_epoch);
}

// --- Scenario 4: retry then succeed -----------------------------------------

struct FlakyAdapter {
    attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl ChannelAdapter for FlakyAdapter {
    async fn send(&self, _to: &str, _rendered: &RenderedMessage) -> Result<SendOutcome, SendError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt == 1 {
            Err(SendError {
                code: "transient".to_string(),
                message: "transient provider error".to_string(),
                retriable: true,
            })
        } else {
            Ok(SendOutcome {
                message_id: "wamid.X".to_string(),
            })
        }
    }

    async fn test_connection(&self) -> ConnectionStatus {
        ConnectionStatus {
            ok: true,
            details: "flaky test adapter".to_string(),
        }
    }

    fn validate_recipient_field(&self, _value: &str) -> bool {
        true
    }
}

#[tokio::test]
async fn failed_send_retries_then_succeeds() {
    let template = Template {
        name: "otp".to_string(),
        bodies: TemplateBodies {
            email_subject: None,
            email_body: None,
            whatsapp_body: Some("Hi {name}".to_string()),
        },
        variables: HashSet::from(["name".to_string()]),
        enabled_channels: vec![Channel::WhatsAppApi],
        whatsapp_api_parameter_count: None,
        multi_message: None,
    };
    template.validate().expect("template is well-formed");

    let recipient = Recipient {
        name: "Jane".to_string(),
        company: String::new(),
        email: String::new(),
        phone: "+15559876543".to_string(),
        row_number: 7,
    };

    let delivery = memory_delivery_store().await;
    let quota = quota_manager("whatsapp_api", 1000, 0, 60);
    let attempts = Arc::new(AtomicUsize::new(0));

    let mut adapters: HashMap<Channel, Arc<dyn ChannelAdapter>> = HashMap::new();
    adapters.insert(
        Channel::WhatsAppApi,
        Arc::new(FlakyAdapter {
            attempts: attempts.clone(),
        }),
    );

    let dispatcher = Dispatcher::new(quota, delivery.clone(), adapters);
    let (recipient_tx, recipient_rx) = mpsc::channel(4);
    let (progress_tx, mut progress_rx) = mpsc::channel(4);
    recipient_tx.send(recipient).await.unwrap();
    drop(recipient_tx);

    let options = DispatchOptions {
        channels: vec![Channel::WhatsAppApi],
        max_retries: 3,
        retry_base_seconds: 0.01,
        retry_cap_seconds: 0.01,
        ..DispatchOptions::default()
    };
    dispatcher
        .run(recipient_rx, &template, &options, progress_tx, CancelToken::new())
        .await;

    let progress = progress_rx.recv().await.expect("one progress event");
    assert_eq!(progress.status, MessageStatus::Sent);
    assert_eq!(progress.message_id.as_deref(), Some("wamid.X"));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    let record = delivery.get_by_message_id("wamid.X").await.unwrap().unwrap();
    assert_eq!(record.retry_count, 1);
}

// --- Scenario 5: invalid signature ------------------------------------------

#[tokio::test]
async fn invalid_signature_is_rejected_without_a_db_write() {
    let delivery = memory_delivery_store().await;
    let (receiver, _inbound_rx, _template_rx) =
        WebhookReceiver::new(Some("whsec".to_string()), delivery.clone());

    let before: i64 = sqlx::query_scalar("SELECT count(*) FROM delivery_records")
        .fetch_one(delivery.pool())
        .await
        .unwrap();

    let payload = br#"{"entry":[{"changes":[{"field":"messages","value":{"statuses":[{"id":"x","status":"delivered"}]}}]}]}"#;
    let ok = receiver.process(payload, Some("sha256=deadbeef")).await.unwrap();
    assert!(!ok);

    let after: i64 = sqlx::query_scalar("SELECT count(*) FROM delivery_records")
        .fetch_one(delivery.pool())
        .await
        .unwrap();
    assert_eq!(before, after, "a rejected signature must not touch the delivery store");
}

// --- Scenario 6: multi-message order ----------------------------------------

struct RecordingAdapter {
    sent_bodies: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ChannelAdapter for RecordingAdapter {
    async fn send(&self, _to: &str, rendered: &RenderedMessage) -> Result<SendOutcome, SendError> {
        self.sent_bodies.lock().unwrap().push(rendered.body.clone());
        Ok(SendOutcome {
            message_id: format!("wamid.{}", uuid::Uuid::new_v4()),
        })
    }

    async fn test_connection(&self) -> ConnectionStatus {
        ConnectionStatus {
            ok: true,
            details: "recording test adapter".to_string(),
        }
    }

    fn validate_recipient_field(&self, _value: &str) -> bool {
        true
    }
}

#[tokio::test]
async fn multi_message_segments_send_in_order_with_spacing() {
    let template = Template {
        name: "multi".to_string(),
        bodies: TemplateBodies {
            email_subject: None,
            email_body: None,
            whatsapp_body: Some("A|B|C".to_string()),
        },
        variables: HashSet::new(),
        enabled_channels: vec![Channel::WhatsAppApi],
        whatsapp_api_parameter_count: None,
        multi_message: Some(MultiMessageConfig {
            strategy: SplitStrategy::CustomDelimiter {
                delimiter: "|".to_string(),
            },
            delay_seconds: 0.1,
        }),
    };
    template.validate().expect("template is well-formed");

    let recipient = Recipient {
        name: "Sam".to_string(),
        company: String::new(),
        email: String::new(),
        phone: "+15550001111".to_string(),
        row_number: 3,
    };

    let delivery = memory_delivery_store().await;
    let quota = quota_manager("whatsapp_api", 1000, 0, 60);
    let sent_bodies = Arc::new(Mutex::new(Vec::new()));

    let mut adapters: HashMap<Channel, Arc<dyn ChannelAdapter>> = HashMap::new();
    adapters.insert(
        Channel::WhatsAppApi,
        Arc::new(RecordingAdapter {
            sent_bodies: sent_bodies.clone(),
        }),
    );

    let dispatcher = Dispatcher::new(quota, delivery.clone(), adapters);
    let (recipient_tx, recipient_rx) = mpsc::channel(4);
    let (progress_tx, mut progress_rx) = mpsc::channel(8);
    recipient_tx.send(recipient).await.unwrap();
    drop(recipient_tx);

    let options = DispatchOptions {
        channels: vec![Channel::WhatsAppApi],
        ..DispatchOptions::default()
    };
    dispatcher
        .run(recipient_rx, &template, &options, progress_tx, CancelToken::new())
        .await;

    let mut message_ids = Vec::new();
    while let Some(progress) = progress_rx.recv().await {
        assert_eq!(progress.status, MessageStatus::Sent);
        message_ids.push(progress.message_id.unwrap());
    }
    assert_eq!(message_ids.len(), 3);
    assert_eq!(*sent_bodies.lock().unwrap(), vec!["A", "B", "C"]);

    let mut sent_ats = Vec::new();
    for id in &message_ids {
        let record = delivery.get_by_message_id(id).await.unwrap().unwrap();
        sent_ats.push(record.sent_at.unwrap());
    }
    for pair in sent_ats.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(
            gap >= chrono::Duration::milliseconds(90),
            "expected >= 0.1s between multi-message sends, got {gap:?}"
        );
    }
}
