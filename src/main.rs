//! Thin binary entry point (SPEC_FULL 4.10/4.11): loads config, wires every
//! component, and runs one dispatch pass over a single input file. Mirrors
//! the teacher's `main.rs` shape (init tracing, construct components, hand
//! off to long-running tasks) trimmed of agent/LLM-specific wiring.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::mpsc;
use tracing::{info, warn};

use dispatchctl::channels::browser::BrowserAdapter;
use dispatchctl::channels::mail::{FileMailSink, MailAdapter, StubMailSink};
use dispatchctl::channels::provider_api::ProviderApiAdapter;
use dispatchctl::channels::ChannelAdapter;
use dispatchctl::config::DispatchConfig;
use dispatchctl::delivery::DeliveryStore;
use dispatchctl::dispatcher::{CancelToken, DispatchOptions, Dispatcher};
use dispatchctl::ingest::mapping::ColumnMapper;
use dispatchctl::ingest::Ingestor;
use dispatchctl::quota::{run_queue_processor, QuotaConfig as QuotaWindowConfig, QuotaManager};
use dispatchctl::template::Template;
use dispatchctl::types::{Channel, Recipient};
use dispatchctl::validate::{AdvancedDataValidator, ValidationOptions};
use dispatchctl::webhook::WebhookReceiver;
use dispatchctl::whatsapp_templates::{self, TemplateRegistry};

/// Channel buffer size for the recipient -> dispatcher pipe.
const RECIPIENT_CHANNEL_BUFFER: usize = 256;

#[derive(Parser, Debug)]
#[command(about = "Bulk multi-channel outbound messaging engine")]
struct Cli {
    /// Path to the recipient source file (.csv, .tsv, .xlsx, .json, .jsonl).
    #[arg(long)]
    input: PathBuf,
    /// Template name to render and send.
    #[arg(long)]
    template: String,
    /// Channels to send on, in order.
    #[arg(long, value_delimiter = ',', default_value = "mail")]
    channels: Vec<String>,
    /// Render and admit but never call adapters.
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = DispatchConfig::load().context("failed to load configuration")?;
    info!(input = %cli.input.display(), template = cli.template, "dispatch run starting");

    let channels = parse_channels(&cli.channels)?;

    let db = SqlitePoolOptions::new()
        .connect(&format!("sqlite://{}?mode=rwc", config.delivery.db_path))
        .await
        .context("failed to open delivery database")?;
    let delivery = Arc::new(
        DeliveryStore::with_cache_capacity(db, config.delivery.lru_capacity)
            .await
            .context("failed to initialise delivery store")?,
    );

    let quota_configs: Vec<(String, QuotaWindowConfig)> = channels
        .iter()
        .map(|c| {
            (
                c.as_str().to_string(),
                QuotaWindowConfig {
                    window_seconds: config.quota.window_seconds as i64,
                    limit: config.quota.limit,
                    burst_capacity: config.quota.burst_allowance,
                    warning_threshold_percent: config.quota.warning_threshold_percent,
                    critical_threshold_percent: config.quota.critical_threshold_percent,
                },
            )
        })
        .collect();
    let quota = Arc::new(
        QuotaManager::new(quota_configs, PathBuf::from(&config.quota.snapshot_path))
            .context("failed to initialise quota manager")?,
    );
    tokio::spawn(run_queue_processor(quota.clone()));

    let (webhook_receiver, mut inbound_rx, template_status_rx) =
        WebhookReceiver::new(config.webhook.signing_secret.clone(), delivery.clone());
    let webhook_receiver = Arc::new(webhook_receiver);
    tokio::spawn(async move {
        while let Some(message) = inbound_rx.recv().await {
            info!(from = ?message.from, message_id = ?message.message_id, "inbound message received");
        }
    });

    let templates_registry = TemplateRegistry::load(PathBuf::from("whatsapp_templates.json"))
        .await
        .context("failed to load WhatsApp template registry")?;
    tokio::spawn(whatsapp_templates::run_poller(
        templates_registry.clone(),
        whatsapp_templates::DEFAULT_POLL_INTERVAL,
        |_template| async { None },
        template_status_rx,
    ));

    let adapters = build_adapters(&channels, &config)?;

    let mapper = ColumnMapper::new();
    let ingestor = Ingestor::new(mapper);
    let (_structure, mapping) = ingestor
        .inspect(&cli.input)
        .with_context(|| format!("failed to inspect {}", cli.input.display()))?;
    if !mapping.missing_required_fields.is_empty() {
        anyhow::bail!(
            "input file is missing required columns: {}",
            mapping.missing_required_fields.join(", ")
        );
    }
    let header_to_field: HashMap<String, String> = mapping
        .mappings
        .iter()
        .map(|(header, m)| (header.clone(), m.target_field.clone()))
        .collect();
    let chunks = ingestor
        .stream_chunks(&cli.input)
        .with_context(|| format!("failed to read {}", cli.input.display()))?;

    let validator = AdvancedDataValidator::new(ValidationOptions {
        default_phone_country: config.ingest.default_phone_country.clone(),
        ..ValidationOptions::default()
    });

    let template = load_template(&cli.template)?;

    let (recipient_tx, recipient_rx) = mpsc::channel(RECIPIENT_CHANNEL_BUFFER);
    let feed_handle = tokio::spawn(async move {
        for chunk in chunks {
            for row in chunk {
                let recipient = row_to_recipient(&row, &header_to_field);
                let report = validator.validate_customer_data(&recipient);
                if report.error_count() > 0 {
                    warn!(row = recipient.row_number, errors = report.error_count(), "recipient failed validation, skipping");
                    continue;
                }
                if recipient_tx.send(recipient).await.is_err() {
                    break;
                }
            }
        }
    });

    let options = DispatchOptions {
        channels: channels.clone(),
        dry_run: cli.dry_run,
        ..DispatchOptions::default()
    };
    let (progress_tx, mut progress_rx) = mpsc::channel(RECIPIENT_CHANNEL_BUFFER);
    let cancel = CancelToken::new();

    let dispatcher = Dispatcher::new(quota.clone(), delivery.clone(), adapters);
    let progress_task = tokio::spawn(async move {
        let mut sent = 0u64;
        let mut failed = 0u64;
        while let Some(progress) = progress_rx.recv().await {
            match progress.status {
                dispatchctl::types::MessageStatus::Sent => sent += 1,
                dispatchctl::types::MessageStatus::Failed => failed += 1,
                _ => {}
            }
        }
        (sent, failed)
    });

    let session = dispatcher.run(recipient_rx, &template, &options, progress_tx, cancel).await;
    feed_handle.await.ok();
    let (sent, failed) = progress_task.await.unwrap_or((0, 0));

    info!(
        session_id = %session.session_id,
        sent_total = session.sent_total,
        failed_total = session.failed_total,
        sent,
        failed,
        "dispatch run complete"
    );

    let _ = webhook_receiver;
    drop(dispatcher);
    match Arc::try_unwrap(delivery) {
        Ok(store) => store.shutdown().await,
        Err(_) => warn!("delivery store still has outstanding references, skipping clean shutdown"),
    }
    Ok(())
}

fn parse_channels(names: &[String]) -> Result<Vec<Channel>> {
    names
        .iter()
        .map(|name| match name.as_str() {
            "mail" => Ok(Channel::Mail),
            "whatsapp_api" => Ok(Channel::WhatsAppApi),
            "whatsapp_browser" => Ok(Channel::WhatsAppBrowser),
            other => Err(anyhow::anyhow!("unknown channel: {other}")),
        })
        .collect()
}

fn build_adapters(
    channels: &[Channel],
    config: &DispatchConfig,
) -> Result<HashMap<Channel, Arc<dyn ChannelAdapter>>> {
    let mut adapters: HashMap<Channel, Arc<dyn ChannelAdapter>> = HashMap::new();
    for &channel in channels {
        let adapter: Arc<dyn ChannelAdapter> = match channel {
            Channel::Mail => {
                let sink: Arc<dyn dispatchctl::channels::mail::MailSink> =
                    match &config.channels.mail_sink_path {
                        Some(path) => Arc::new(FileMailSink::new(PathBuf::from(path))),
                        None => Arc::new(StubMailSink),
                    };
                Arc::new(MailAdapter::new(sink, false))
            }
            Channel::WhatsAppApi => {
                let token = config
                    .channels
                    .whatsapp_api_token
                    .clone()
                    .context("whatsapp_api channel enabled but no API token configured")?;
                Arc::new(ProviderApiAdapter::new(
                    config.channels.whatsapp_api_base_url.clone(),
                    token,
                ))
            }
            Channel::WhatsAppBrowser => Arc::new(BrowserAdapter::new(
                200,
                dispatchctl::channels::browser::DEFAULT_MIN_INTERVAL,
            )),
        };
        adapters.insert(channel, adapter);
    }
    Ok(adapters)
}

/// Remap a raw source row's header-keyed fields to canonical `Recipient`
/// fields using the column mapping computed once per file (spec 4.1).
fn row_to_recipient(
    row: &dispatchctl::ingest::RowRecord,
    header_to_field: &HashMap<String, String>,
) -> Recipient {
    let mut canonical: HashMap<&str, String> = HashMap::new();
    for (header, value) in &row.fields {
        if let Some(field) = header_to_field.get(header) {
            canonical.insert(field.as_str(), value.clone());
        }
    }
    Recipient {
        name: canonical.remove("name").unwrap_or_default(),
        company: canonical.remove("company").unwrap_or_default(),
        email: canonical.remove("email").unwrap_or_default(),
        phone: canonical.remove("phone").unwrap_or_default(),
        row_number: row.row_number,
    }
}

fn load_template(name: &str) -> Result<Template> {
    let path = PathBuf::from(format!("templates/{name}.json"));
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read template file {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("failed to parse template {name}"))
}
