//! WhatsApp Template Lifecycle (SPEC_FULL 4.9): a local registry of
//! `WhatsAppTemplate`s, ported from `original_source/.../whatsapp_template_manager.py`,
//! persisted to a single JSON file with the teacher's atomic
//! write-tmp-then-rename pattern (`src/heartbeat/health.rs`) and polled on a
//! background interval ticker (`src/heartbeat/mod.rs`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::webhook::TemplateStatusEvent;

/// Default polling interval for pending templates (spec 4.9: "default every 5 min").
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum TemplateLifecycleError {
    #[error("template '{0}' already exists")]
    AlreadyExists(String),
    #[error("template '{0}' not found")]
    NotFound(String),
    #[error("template validation failed: {0}")]
    Invalid(String),
    #[error("template '{name}' is not in draft status (currently {status:?})")]
    NotDraft { name: String, status: TemplateStatus },
    #[error("cannot delete template '{name}' in {status:?} status")]
    NotDeletable { name: String, status: TemplateStatus },
    #[error("I/O error persisting template registry: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize template registry: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Template approval status (spec 4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateStatus {
    Draft,
    Pending,
    Approved,
    Rejected,
    Disabled,
    Paused,
}

impl TemplateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Disabled => "disabled",
            Self::Paused => "paused",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "draft" => Self::Draft,
            "pending" => Self::Pending,
            "approved" => Self::Approved,
            "rejected" => Self::Rejected,
            "disabled" => Self::Disabled,
            "paused" => Self::Paused,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateCategory {
    Marketing,
    Utility,
    Authentication,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    Header,
    Body,
    Footer,
    Buttons,
}

/// One template component (spec 4.9, ported from `TemplateComponent`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateComponent {
    #[serde(rename = "type")]
    pub kind: ComponentType,
    pub text: Option<String>,
    /// Declared parameter count for this component (header/body text only).
    pub parameter_count: usize,
    pub format: Option<String>,
}

impl TemplateComponent {
    fn validate(&self, index: usize) -> Vec<String> {
        let mut errors = Vec::new();

        if self.kind == ComponentType::Body && self.text.as_deref().unwrap_or("").is_empty() {
            errors.push(format!("Component {} (body): body component requires text", index + 1));
        }

        if self.kind == ComponentType::Header {
            if let Some(format) = &self.format {
                if !["TEXT", "IMAGE", "DOCUMENT", "VIDEO"].contains(&format.as_str()) {
                    errors.push(format!(
                        "Component {} (header): invalid header format: {format}",
                        index + 1
                    ));
                }
            }
        }

        if let Some(text) = &self.text {
            let placeholder_count = placeholder_regex().find_iter(text).count();
            if placeholder_count != self.parameter_count {
                errors.push(format!(
                    "Component {} ({}): parameter count mismatch: {placeholder_count} placeholders, {} parameters",
                    index + 1,
                    self.kind.as_str(),
                    self.parameter_count
                ));
            }
        }

        errors
    }
}

impl ComponentType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Header => "header",
            Self::Body => "body",
            Self::Footer => "footer",
            Self::Buttons => "buttons",
        }
    }
}

fn placeholder_regex() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\d+\}\}").expect("static regex is valid"))
}

fn name_regex() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9_]+$").expect("static regex is valid"))
}

fn language_regex() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z]{2}(_[A-Z]{2})?$").expect("static regex is valid"))
}

/// A WhatsApp Business API template (spec 4.9, ported from `WhatsAppTemplate`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppTemplate {
    pub name: String,
    pub language: String,
    pub category: TemplateCategory,
    pub components: Vec<TemplateComponent>,

    pub provider_id: Option<String>,
    pub status: TemplateStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,

    pub usage_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_used: Option<DateTime<Utc>>,
}

impl WhatsAppTemplate {
    /// Validate name charset/length, language format, component arity, and
    /// each component's own invariants (spec 3 invariants; ported from
    /// `WhatsAppTemplate.validate()`).
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.name.is_empty() {
            errors.push("Template name is required".to_string());
        } else if !name_regex().is_match(&self.name) {
            errors.push("Template name must contain only lowercase letters, numbers, and underscores".to_string());
        } else if self.name.len() > 512 {
            errors.push("Template name must be 512 characters or less".to_string());
        }

        if self.language.is_empty() {
            errors.push("Template language is required".to_string());
        } else if !language_regex().is_match(&self.language) {
            errors.push("Invalid language code format (use ISO 639-1 format like 'en' or 'en_US')".to_string());
        }

        if self.components.is_empty() {
            errors.push("Template must have at least one component".to_string());
        }

        let body_count = self.components.iter().filter(|c| c.kind == ComponentType::Body).count();
        if body_count != 1 {
            errors.push("Template must have exactly one body component".to_string());
        }

        let header_count = self.components.iter().filter(|c| c.kind == ComponentType::Header).count();
        if header_count > 1 {
            errors.push("Template can have at most one header component".to_string());
        }

        let footer_count = self.components.iter().filter(|c| c.kind == ComponentType::Footer).count();
        if footer_count > 1 {
            errors.push("Template can have at most one footer component".to_string());
        }

        for (i, component) in self.components.iter().enumerate() {
            errors.extend(component.validate(i));
        }

        errors
    }

    fn body_component(&self) -> Option<&TemplateComponent> {
        self.components.iter().find(|c| c.kind == ComponentType::Body)
    }

    /// Substitute `{{i}}` with `params["param_i"]`, or the literal `[type]`
    /// placeholder when the parameter isn't supplied (spec 4.9 "Preview").
    pub fn preview(&self, params: &HashMap<String, String>) -> PreviewOutput {
        let header = self
            .components
            .iter()
            .find(|c| c.kind == ComponentType::Header)
            .and_then(|c| c.text.as_ref())
            .map(|text| render_component_text(text, params));
        let body = self
            .body_component()
            .and_then(|c| c.text.as_ref())
            .map(|text| render_component_text(text, params))
            .unwrap_or_default();
        let footer = self
            .components
            .iter()
            .find(|c| c.kind == ComponentType::Footer)
            .and_then(|c| c.text.as_ref())
            .map(|text| render_component_text(text, params));

        PreviewOutput { header, body, footer }
    }
}

fn render_component_text(text: &str, params: &HashMap<String, String>) -> String {
    let mut rendered = text.to_string();
    for (i, _) in placeholder_regex().find_iter(text).enumerate() {
        let placeholder = format!("{{{{{}}}}}", i + 1);
        let key = format!("param_{}", i + 1);
        let value = params.get(&key).cloned().unwrap_or_else(|| "[text]".to_string());
        rendered = rendered.replacen(&placeholder, &value, 1);
    }
    rendered
}

/// Rendered preview of a template's components (spec 4.9 "Preview").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewOutput {
    pub header: Option<String>,
    pub body: String,
    pub footer: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct RegistryFile {
    timestamp: DateTime<Utc>,
    templates: HashMap<String, WhatsAppTemplate>,
}

/// The local template registry (spec 4.9 "Stores a local registry of `WhatsAppTemplate`s").
pub struct TemplateRegistry {
    storage_path: PathBuf,
    templates: Mutex<HashMap<String, WhatsAppTemplate>>,
}

impl TemplateRegistry {
    /// Load the registry from `storage_path` if it exists, starting empty otherwise.
    pub async fn load(storage_path: PathBuf) -> Result<Arc<Self>, TemplateLifecycleError> {
        let templates = match tokio::fs::read(&storage_path).await {
            Ok(bytes) => {
                let file: RegistryFile = serde_json::from_slice(&bytes)?;
                info!(count = file.templates.len(), "loaded WhatsApp template registry");
                file.templates
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!(error = %e, "failed to read template registry, starting empty");
                HashMap::new()
            }
        };
        Ok(Arc::new(Self {
            storage_path,
            templates: Mutex::new(templates),
        }))
    }

    /// Create a new `draft` template from a body/header/footer text bundle
    /// (spec 4.9 "Create (status=draft)"; ported from `create_template`).
    /// `{{i}}` placeholders in the provided text are auto-counted as text
    /// parameters, matching the original's `param_{i+1}` convention.
    pub async fn create(
        &self,
        name: String,
        language: String,
        category: TemplateCategory,
        body_text: String,
        header_text: Option<String>,
        footer_text: Option<String>,
    ) -> Result<WhatsAppTemplate, TemplateLifecycleError> {
        let mut guard = self.templates.lock().await;
        if guard.contains_key(&name) {
            return Err(TemplateLifecycleError::AlreadyExists(name));
        }

        let mut components = Vec::new();
        if let Some(text) = header_text {
            components.push(TemplateComponent {
                kind: ComponentType::Header,
                parameter_count: placeholder_regex().find_iter(&text).count(),
                text: Some(text),
                format: Some("TEXT".to_string()),
            });
        }
        components.push(TemplateComponent {
            kind: ComponentType::Body,
            parameter_count: placeholder_regex().find_iter(&body_text).count(),
            text: Some(body_text),
            format: None,
        });
        if let Some(text) = footer_text {
            components.push(TemplateComponent {
                kind: ComponentType::Footer,
                parameter_count: 0,
                text: Some(text),
                format: None,
            });
        }

        let now = Utc::now();
        let template = WhatsAppTemplate {
            name: name.clone(),
            language,
            category,
            components,
            provider_id: None,
            status: TemplateStatus::Draft,
            created_at: now,
            updated_at: now,
            submitted_at: None,
            approved_at: None,
            rejected_at: None,
            rejection_reason: None,
            usage_count: 0,
            success_count: 0,
            failure_count: 0,
            last_used: None,
        };

        let errors = template.validate();
        if !errors.is_empty() {
            return Err(TemplateLifecycleError::Invalid(errors.join("; ")));
        }

        guard.insert(name.clone(), template.clone());
        self.persist(&guard).await?;
        info!(name, "created WhatsApp template");
        Ok(template)
    }

    /// Submit a draft template to the provider via `submit_fn`, transitioning
    /// it to `pending` with `submitted_at` set (spec 4.9 "submit").
    pub async fn submit<F, Fut>(&self, name: &str, submit_fn: F) -> Result<(), TemplateLifecycleError>
    where
        F: FnOnce(WhatsAppTemplate) -> Fut,
        Fut: std::future::Future<Output = Result<String, String>>,
    {
        let mut guard = self.templates.lock().await;
        let template = guard.get(name).ok_or_else(|| TemplateLifecycleError::NotFound(name.to_string()))?;
        if template.status != TemplateStatus::Draft {
            return Err(TemplateLifecycleError::NotDraft {
                name: name.to_string(),
                status: template.status,
            });
        }

        let errors = template.validate();
        if !errors.is_empty() {
            return Err(TemplateLifecycleError::Invalid(errors.join("; ")));
        }

        let provider_id = submit_fn(template.clone())
            .await
            .map_err(TemplateLifecycleError::Invalid)?;

        let template = guard.get_mut(name).expect("checked present above");
        template.status = TemplateStatus::Pending;
        template.provider_id = Some(provider_id);
        template.submitted_at = Some(Utc::now());
        template.updated_at = Utc::now();

        self.persist(&guard).await?;
        info!(name, "submitted WhatsApp template for approval");
        Ok(())
    }

    /// Apply a provider-driven status transition, recording a rejection
    /// reason when present (spec 4.9 "transition to approved|rejected with
    /// reason, or disabled|paused as directed by webhook events").
    pub async fn transition(
        &self,
        name: &str,
        status: TemplateStatus,
        reason: Option<String>,
    ) -> Result<(), TemplateLifecycleError> {
        let mut guard = self.templates.lock().await;
        let template = guard.get_mut(name).ok_or_else(|| TemplateLifecycleError::NotFound(name.to_string()))?;
        let old_status = template.status;
        if old_status == status {
            return Ok(());
        }

        template.status = status;
        template.updated_at = Utc::now();
        match status {
            TemplateStatus::Approved => template.approved_at = Some(Utc::now()),
            TemplateStatus::Rejected => {
                template.rejected_at = Some(Utc::now());
                template.rejection_reason = reason;
            }
            _ => {}
        }

        self.persist(&guard).await?;
        info!(name, from = old_status.as_str(), to = status.as_str(), "template status changed");
        Ok(())
    }

    /// Record one usage outcome against a template's running analytics.
    pub async fn record_usage(&self, name: &str, success: bool) -> Result<(), TemplateLifecycleError> {
        let mut guard = self.templates.lock().await;
        let template = guard.get_mut(name).ok_or_else(|| TemplateLifecycleError::NotFound(name.to_string()))?;
        template.usage_count += 1;
        if success {
            template.success_count += 1;
        } else {
            template.failure_count += 1;
        }
        template.last_used = Some(Utc::now());
        template.updated_at = Utc::now();
        self.persist(&guard).await?;
        Ok(())
    }

    /// Preview a template's rendered components (spec 4.9 "Preview").
    pub async fn preview(
        &self,
        name: &str,
        params: &HashMap<String, String>,
    ) -> Result<PreviewOutput, TemplateLifecycleError> {
        let guard = self.templates.lock().await;
        let template = guard.get(name).ok_or_else(|| TemplateLifecycleError::NotFound(name.to_string()))?;
        Ok(template.preview(params))
    }

    /// Delete a template; only `draft` and `rejected` templates are
    /// deletable (spec 4.9).
    pub async fn delete(&self, name: &str) -> Result<(), TemplateLifecycleError> {
        let mut guard = self.templates.lock().await;
        let template = guard.get(name).ok_or_else(|| TemplateLifecycleError::NotFound(name.to_string()))?;
        if !matches!(template.status, TemplateStatus::Draft | TemplateStatus::Rejected) {
            return Err(TemplateLifecycleError::NotDeletable {
                name: name.to_string(),
                status: template.status,
            });
        }
        guard.remove(name);
        self.persist(&guard).await?;
        info!(name, "deleted WhatsApp template");
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<WhatsAppTemplate> {
        self.templates.lock().await.get(name).cloned()
    }

    pub async fn all(&self) -> Vec<WhatsAppTemplate> {
        self.templates.lock().await.values().cloned().collect()
    }

    /// Templates approved for use, feeding C3 as valid parameterized bodies
    /// (spec 4.9 "Approved templates feed C3").
    pub async fn approved(&self) -> Vec<WhatsAppTemplate> {
        self.templates
            .lock()
            .await
            .values()
            .filter(|t| t.status == TemplateStatus::Approved)
            .cloned()
            .collect()
    }

    async fn persist(&self, templates: &HashMap<String, WhatsAppTemplate>) -> Result<(), TemplateLifecycleError> {
        write_registry_file(&self.storage_path, templates).await
    }
}

/// Write the registry to disk atomically: serialize to a temp file, then
/// rename over the real path (ported from the teacher's
/// `heartbeat::health::write_health_file`).
async fn write_registry_file(
    path: &Path,
    templates: &HashMap<String, WhatsAppTemplate>,
) -> Result<(), TemplateLifecycleError> {
    let file = RegistryFile {
        timestamp: Utc::now(),
        templates: templates.clone(),
    };
    let json = serde_json::to_string_pretty(&file)?;

    let tmp_path = path.with_extension("json.tmp");
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&tmp_path, json.as_bytes()).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    debug!("WhatsApp template registry persisted");
    Ok(())
}

/// Background status poller: on each tick, checks `pending` templates via
/// `poll_fn` and applies the returned transition (spec 4.9 "monitor (poll
/// provider periodically on a background ticker, default every 5 min)").
///
/// Also drains `status_events` forwarded from the webhook receiver (C6),
/// applying provider-driven transitions the instant they arrive rather than
/// waiting for the next tick.
pub async fn run_poller<F, Fut>(
    registry: Arc<TemplateRegistry>,
    interval: Duration,
    poll_fn: F,
    mut status_events: mpsc::Receiver<TemplateStatusEvent>,
) where
    F: Fn(WhatsAppTemplate) -> Fut,
    Fut: std::future::Future<Output = Option<(TemplateStatus, Option<String>)>>,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let pending: Vec<WhatsAppTemplate> = registry
                    .all()
                    .await
                    .into_iter()
                    .filter(|t| t.status == TemplateStatus::Pending && t.provider_id.is_some())
                    .collect();

                for template in pending {
                    let name = template.name.clone();
                    match poll_fn(template).await {
                        Some((status, reason)) => {
                            if let Err(err) = registry.transition(&name, status, reason).await {
                                warn!(name, error = %err, "failed to apply polled template status");
                            }
                        }
                        None => debug!(name, "template still pending"),
                    }
                }
            }
            event = status_events.recv() => {
                let Some(event) = event else {
                    debug!("template status event channel closed, poller exiting");
                    break;
                };
                let (Some(name), Some(raw_event)) = (event.template_name, event.event) else {
                    debug!(raw = ?event.raw, "template status event missing name or event field");
                    continue;
                };
                let Some(status) = map_event_status(&raw_event) else {
                    debug!(name, event = raw_event, "unrecognised provider template event");
                    continue;
                };
                if let Err(err) = registry.transition(&name, status, None).await {
                    warn!(name, error = %err, "failed to apply webhook-driven template status");
                }
            }
        }
    }
}

/// Map a provider `event` string (e.g. `APPROVED`, `REJECTED`, `DISABLED`,
/// `PAUSED`) to a [`TemplateStatus`].
fn map_event_status(event: &str) -> Option<TemplateStatus> {
    TemplateStatus::parse(&event.to_ascii_lowercase())
}
