//! Configuration loading and management (SPEC_FULL 4.10).
//!
//! Loads configuration from `./dispatch.toml` (or `$DISPATCH_CONFIG_PATH`).
//! Environment variables override file values; file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level configuration loaded from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Quota manager settings (`[quota]`).
    pub quota: QuotaConfig,
    /// Delivery store settings (`[delivery]`).
    pub delivery: DeliveryConfig,
    /// Channel adapter settings (`[channels]`).
    pub channels: ChannelsConfig,
    /// Webhook receiver settings (`[webhook]`).
    pub webhook: WebhookConfig,
    /// Ingestion settings (`[ingest]`).
    pub ingest: IngestConfig,
}

impl DispatchConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from TOML file only, no env overrides.
    fn load_from_file() -> Result<Self> {
        let path = Self::config_path()?;
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: DispatchConfig =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(DispatchConfig::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Resolve config file path: `$DISPATCH_CONFIG_PATH` or `./dispatch.toml`.
    fn config_path() -> Result<PathBuf> {
        Self::config_path_with(|key| std::env::var(key).ok())
    }

    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> Result<PathBuf> {
        if let Some(p) = env("DISPATCH_CONFIG_PATH") {
            return Ok(PathBuf::from(p));
        }
        Ok(PathBuf::from("dispatch.toml"))
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability (avoids unsafe `set_var` in tests).
    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("DISPATCH_QUOTA_WINDOW_SECONDS") {
            match v.parse() {
                Ok(n) => self.quota.window_seconds = n,
                Err(_) => tracing::warn!(
                    var = "DISPATCH_QUOTA_WINDOW_SECONDS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("DISPATCH_QUOTA_LIMIT") {
            match v.parse() {
                Ok(n) => self.quota.limit = n,
                Err(_) => tracing::warn!(
                    var = "DISPATCH_QUOTA_LIMIT",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("DISPATCH_DB_PATH") {
            self.delivery.db_path = v;
        }
        if let Some(v) = env("DISPATCH_WEBHOOK_SECRET") {
            self.webhook.signing_secret = Some(v);
        }
        if let Some(v) = env("DISPATCH_WHATSAPP_API_TOKEN") {
            self.channels.whatsapp_api_token = Some(v);
        }
        if let Some(v) = env("DISPATCH_WHATSAPP_API_BASE_URL") {
            self.channels.whatsapp_api_base_url = v;
        }
        if let Some(v) = env("DISPATCH_MAIL_SINK_PATH") {
            self.channels.mail_sink_path = Some(v);
        }
        if let Some(v) = env("DISPATCH_DEFAULT_COUNTRY") {
            self.ingest.default_phone_country = v;
        }
    }
}

/// Quota manager configuration (SPEC_FULL 4.4).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Sliding window length in seconds.
    pub window_seconds: u64,
    /// Maximum requests admitted per window.
    pub limit: u64,
    /// Extra admissions allowed beyond `limit` within a short burst window.
    pub burst_allowance: u64,
    /// Percent of `limit` at which a warning alert fires.
    pub warning_threshold_percent: u8,
    /// Percent of `limit` at which a critical alert fires.
    pub critical_threshold_percent: u8,
    /// Path to the quota snapshot file, persisted across restarts.
    pub snapshot_path: String,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            window_seconds: 86400,
            limit: 1000,
            burst_allowance: 50,
            warning_threshold_percent: 80,
            critical_threshold_percent: 95,
            snapshot_path: "quota_snapshot.json".to_string(),
        }
    }
}

/// Delivery store configuration (SPEC_FULL 4.5).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// SQLite database file path.
    pub db_path: String,
    /// In-memory LRU cache capacity (entries).
    pub lru_capacity: usize,
    /// Days after which terminal records become eligible for the retention sweep.
    pub retention_days: u32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            db_path: "dispatch.db".to_string(),
            lru_capacity: 4096,
            retention_days: 90,
        }
    }
}

/// Channel adapter configuration (SPEC_FULL 4.7).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    /// WhatsApp Business provider API base URL.
    pub whatsapp_api_base_url: String,
    /// Bearer token for the WhatsApp Business provider API.
    pub whatsapp_api_token: Option<String>,
    /// Path to the file-based mail sink used in local/test runs.
    pub mail_sink_path: Option<String>,
    /// `wa.me`-style base URL used by the browser fallback adapter.
    pub whatsapp_browser_base_url: String,
    /// HTTP request timeout in milliseconds.
    pub request_timeout_ms: u64,
    /// TCP connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            whatsapp_api_base_url: "https://graph.facebook.com/v19.0".to_string(),
            whatsapp_api_token: None,
            mail_sink_path: None,
            whatsapp_browser_base_url: "https://wa.me".to_string(),
            request_timeout_ms: 15_000,
            connect_timeout_ms: 5_000,
        }
    }
}

/// Webhook receiver configuration (SPEC_FULL 4.6).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// HMAC-SHA256 signing secret shared with the provider.
    pub signing_secret: Option<String>,
    /// Maximum accepted body size in bytes.
    pub max_body_bytes: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            signing_secret: None,
            max_body_bytes: 1_048_576,
        }
    }
}

/// Ingestion configuration (SPEC_FULL 4.1).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Default country code used to resolve ambiguous phone numbers.
    pub default_phone_country: String,
    /// Minimum confidence score (0.0-1.0) for an automatic column mapping.
    pub min_mapping_confidence: f64,
    /// Path to the persisted column-mapping template file.
    pub mapping_template_path: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            default_phone_country: "US".to_string(),
            min_mapping_confidence: 0.6,
            mapping_template_path: "mapping_templates.json".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = DispatchConfig::default();
        assert_eq!(cfg.quota.limit, 1000);
        assert_eq!(cfg.delivery.db_path, "dispatch.db");
    }

    #[test]
    fn config_path_prefers_env_var() {
        let path = DispatchConfig::config_path_with(|key| {
            if key == "DISPATCH_CONFIG_PATH" {
                Some("/etc/dispatch/custom.toml".to_string())
            } else {
                None
            }
        })
        .unwrap();
        assert_eq!(path, PathBuf::from("/etc/dispatch/custom.toml"));
    }

    #[test]
    fn config_path_falls_back_to_default() {
        let path = DispatchConfig::config_path_with(|_| None).unwrap();
        assert_eq!(path, PathBuf::from("dispatch.toml"));
    }

    #[test]
    fn env_overrides_take_precedence_over_file_values() {
        let mut cfg = DispatchConfig::default();
        cfg.apply_overrides(|key| match key {
            "DISPATCH_QUOTA_LIMIT" => Some("5000".to_string()),
            "DISPATCH_WEBHOOK_SECRET" => Some("topsecret".to_string()),
            _ => None,
        });
        assert_eq!(cfg.quota.limit, 5000);
        assert_eq!(cfg.webhook.signing_secret.as_deref(), Some("topsecret"));
    }

    #[test]
    fn invalid_numeric_override_is_ignored() {
        let mut cfg = DispatchConfig::default();
        let before = cfg.quota.limit;
        cfg.apply_overrides(|key| {
            if key == "DISPATCH_QUOTA_LIMIT" {
                Some("not-a-number".to_string())
            } else {
                None
            }
        });
        assert_eq!(cfg.quota.limit, before);
    }
}
