//! WhatsApp Web browser-fallback adapter (SPEC_FULL 4.7). No OS automation
//! is implemented — out of scope per spec.md §1 — consistent with the
//! teacher's `executor/playwright.rs` treating actual browser steering as an
//! external collaborator; this adapter only constructs the launch URL and
//! reports whether it would be launched.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{ChannelAdapter, ConnectionStatus, SendError, SendOutcome};
use crate::template::RenderedMessage;

/// Minimum delay between sends, separate from the quota manager (spec 4.7:
/// "minimum inter-send delay (default 30s) separate from C4").
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(30);

struct LaunchHistory {
    /// Timestamps of sends in the current UTC day, oldest first.
    today: VecDeque<DateTime<Utc>>,
    last_send: Option<DateTime<Utc>>,
}

/// Self-imposed rate limiting for the browser-fallback adapter: a daily cap
/// and a minimum inter-send delay, both separate from the quota manager
/// (spec 4.7).
pub struct BrowserAdapter {
    daily_cap: u32,
    min_interval: Duration,
    history: Mutex<LaunchHistory>,
}

impl BrowserAdapter {
    pub fn new(daily_cap: u32, min_interval: Duration) -> Self {
        Self {
            daily_cap,
            min_interval,
            history: Mutex::new(LaunchHistory {
                today: VecDeque::new(),
                last_send: None,
            }),
        }
    }

    /// Build the `wa.me`-style launch URL for `phone` and `text` (spec 4.7).
    pub fn build_url(phone: &str, text: &str) -> String {
        let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
        format!("https://wa.me/{digits}?text={}", urlencoding::encode(text))
    }

    fn check_rate_limit(&self) -> Result<(), SendError> {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();

        while let Some(&oldest) = history.today.front() {
            if now.signed_duration_since(oldest) >= chrono::Duration::days(1) {
                history.today.pop_front();
            } else {
                break;
            }
        }

        if history.today.len() as u32 >= self.daily_cap {
            return Err(SendError {
                code: "browser_daily_cap_reached".to_string(),
                message: format!("daily cap of {} browser sends reached", self.daily_cap),
                retriable: true,
            });
        }

        if let Some(last) = history.last_send {
            let elapsed = now.signed_duration_since(last);
            let min_interval = chrono::Duration::from_std(self.min_interval).unwrap_or_default();
            if elapsed < min_interval {
                return Err(SendError {
                    code: "browser_rate_limited".to_string(),
                    message: "minimum inter-send delay not yet elapsed".to_string(),
                    retriable: true,
                });
            }
        }

        history.today.push_back(now);
        history.last_send = Some(now);
        Ok(())
    }
}

#[async_trait]
impl ChannelAdapter for BrowserAdapter {
    async fn send(&self, to: &str, rendered: &RenderedMessage) -> Result<SendOutcome, SendError> {
        self.check_rate_limit()?;
        let url = Self::build_url(to, &rendered.body);
        // Success criterion is "URL launched" (spec 4.7); clicking send is
        // best-effort, platform-specific automation out of scope here.
        debug!(to, url, "browser-fallback url constructed");
        Ok(SendOutcome {
            message_id: format!("browser-{}", uuid::Uuid::new_v4()),
        })
    }

    async fn test_connection(&self) -> ConnectionStatus {
        ConnectionStatus {
            ok: true,
            details: "browser-fallback adapter has no persistent connection to check".to_string(),
        }
    }

    fn validate_recipient_field(&self, value: &str) -> bool {
        let digits = value.chars().filter(|c| c.is_ascii_digit()).count();
        (8..=15).contains(&digits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Channel;

    fn rendered() -> RenderedMessage {
        RenderedMessage {
            channel: Channel::WhatsAppBrowser,
            subject: None,
            body: "Hi there".to_string(),
            segments: Vec::new(),
        }
    }

    #[test]
    fn build_url_strips_non_digits_and_urlencodes_text() {
        let url = BrowserAdapter::build_url("+1 (555) 123-4567", "Hi & bye");
        assert_eq!(url, "https://wa.me/15551234567?text=Hi%20%26%20bye");
    }

    #[tokio::test]
    async fn daily_cap_is_enforced() {
        let adapter = BrowserAdapter::new(1, Duration::from_millis(0));
        adapter.send("+15551234567", &rendered()).await.unwrap();
        let result = adapter.send("+15551234567", &rendered()).await;
        assert!(matches!(result, Err(e) if e.code == "browser_daily_cap_reached"));
    }

    #[tokio::test]
    async fn minimum_interval_is_enforced() {
        let adapter = BrowserAdapter::new(100, Duration::from_secs(3600));
        adapter.send("+15551234567", &rendered()).await.unwrap();
        let result = adapter.send("+15551234567", &rendered()).await;
        assert!(matches!(result, Err(e) if e.code == "browser_rate_limited"));
    }

    #[test]
    fn recipient_validation_checks_digit_count() {
        let adapter = BrowserAdapter::new(100, DEFAULT_MIN_INTERVAL);
        assert!(adapter.validate_recipient_field("+15551234567"));
        assert!(!adapter.validate_recipient_field("abc"));
    }
}
