//! Template rendering (SPEC_FULL 4.3, component C3).
//!
//! A template is a bundle of channel-keyed bodies plus a declared variable
//! set. Rendering substitutes `{placeholder}` occurrences with recipient
//! field values; missing values render empty and are logged at info.

use std::collections::HashSet;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use thiserror::Error;

use crate::types::{Channel, Recipient};

static PLACEHOLDER_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{(\w+)\}").unwrap());
static WHATSAPP_PARAM_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{\{(\d+)\}\}").unwrap());

/// Errors raised while validating a template definition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template has no body for enabled channel {0}")]
    EmptyBody(&'static str),
    #[error("declared variable '{0}' is not used in any enabled body")]
    UnusedVariable(String),
    #[error("inter-message delay {0}s is below the minimum of 0.1s")]
    DelayTooLow(f64),
    #[error("whatsapp-api parameter count mismatch: body references {found} but template declares {declared}")]
    ParameterCountMismatch { found: usize, declared: usize },
}

/// Which channels a template provides a body for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateBodies {
    pub email_subject: Option<String>,
    pub email_body: Option<String>,
    pub whatsapp_body: Option<String>,
}

/// Strategy for splitting a single WhatsApp body into a multi-message
/// sequence (SPEC_FULL 4.3 "multi-message mode").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SplitStrategy {
    Paragraph,
    Sentence,
    CustomDelimiter { delimiter: String },
    CharacterLimit { limit: usize },
}

/// A message template bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    pub bodies: TemplateBodies,
    pub variables: HashSet<String>,
    pub enabled_channels: Vec<Channel>,
    /// Declared `{{i}}` parameter count, for WhatsApp-API templates.
    pub whatsapp_api_parameter_count: Option<usize>,
    pub multi_message: Option<MultiMessageConfig>,
}

/// Multi-message split configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiMessageConfig {
    pub strategy: SplitStrategy,
    pub delay_seconds: f64,
}

const MIN_DELAY_SECONDS: f64 = 0.1;

impl Template {
    /// Validate the template per SPEC_FULL 4.3's rules: no empty bodies for
    /// enabled channels, no unused declared variables, delay floor, and
    /// WhatsApp-API parameter count consistency.
    pub fn validate(&self) -> Result<(), TemplateError> {
        for channel in &self.enabled_channels {
            let body = self.body_for(*channel);
            if body.map(|b| b.trim().is_empty()).unwrap_or(true) {
                return Err(TemplateError::EmptyBody(channel.as_str()));
            }
        }

        let all_bodies: Vec<&str> = [
            self.bodies.email_subject.as_deref(),
            self.bodies.email_body.as_deref(),
            self.bodies.whatsapp_body.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect();

        for variable in &self.variables {
            let used = all_bodies
                .iter()
                .any(|body| body.contains(&format!("{{{variable}}}")));
            if !used {
                return Err(TemplateError::UnusedVariable(variable.clone()));
            }
        }

        if let Some(cfg) = &self.multi_message {
            if cfg.delay_seconds < MIN_DELAY_SECONDS {
                return Err(TemplateError::DelayTooLow(cfg.delay_seconds));
            }
        }

        if let Some(declared) = self.whatsapp_api_parameter_count {
            if let Some(body) = &self.bodies.whatsapp_body {
                let found = whatsapp_parameter_count(body);
                if found != declared {
                    return Err(TemplateError::ParameterCountMismatch { found, declared });
                }
            }
        }

        Ok(())
    }

    fn body_for(&self, channel: Channel) -> Option<&str> {
        match channel {
            Channel::Mail => self.bodies.email_body.as_deref(),
            Channel::WhatsAppApi | Channel::WhatsAppBrowser => self.bodies.whatsapp_body.as_deref(),
        }
    }

    /// Render every body the template provides for `channel`'s enabled
    /// surface. Missing recipient fields render as empty string.
    pub fn render(&self, channel: Channel, recipient: &Recipient) -> RenderedMessage {
        let fields = recipient_fields(recipient);
        match channel {
            Channel::Mail => RenderedMessage {
                channel,
                subject: self.bodies.email_subject.as_deref().map(|s| substitute(s, &fields)),
                body: self.bodies.email_body.as_deref().map(|s| substitute(s, &fields)).unwrap_or_default(),
                segments: Vec::new(),
            },
            Channel::WhatsAppApi | Channel::WhatsAppBrowser => {
                let body = self.bodies.whatsapp_body.as_deref().map(|s| substitute(s, &fields)).unwrap_or_default();
                let segments = self
                    .multi_message
                    .as_ref()
                    .map(|cfg| split_message(&body, &cfg.strategy))
                    .unwrap_or_default();
                RenderedMessage {
                    channel,
                    subject: None,
                    body,
                    segments,
                }
            }
        }
    }
}

/// The output of rendering one template against one recipient for one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderedMessage {
    pub channel: Channel,
    pub subject: Option<String>,
    pub body: String,
    /// Ordered multi-message segments, populated only in multi-message mode.
    pub segments: Vec<String>,
}

impl RenderedMessage {
    /// Estimated total send time for a multi-message sequence:
    /// `(n-1) * delay_seconds` (SPEC_FULL 4.3).
    pub fn estimated_total_send_seconds(&self, delay_seconds: f64) -> f64 {
        if self.segments.len() <= 1 {
            0.0
        } else {
            (self.segments.len() - 1) as f64 * delay_seconds
        }
    }
}

fn recipient_fields(recipient: &Recipient) -> Vec<(&'static str, &str)> {
    vec![
        ("name", recipient.name.as_str()),
        ("company", recipient.company.as_str()),
        ("email", recipient.email.as_str()),
        ("phone", recipient.phone.as_str()),
    ]
}

fn substitute(body: &str, fields: &[(&str, &str)]) -> String {
    PLACEHOLDER_PATTERN
        .replace_all(body, |caps: &regex::Captures| {
            let key = &caps[1];
            fields
                .iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| value.to_string())
                .unwrap_or_else(|| {
                    tracing::info!(placeholder = key, "template placeholder missing from recipient, rendering empty");
                    String::new()
                })
        })
        .into_owned()
}

fn whatsapp_parameter_count(body: &str) -> usize {
    WHATSAPP_PARAM_PATTERN
        .captures_iter(body)
        .filter_map(|c| c[1].parse::<usize>().ok())
        .max()
        .unwrap_or(0)
}

fn split_message(body: &str, strategy: &SplitStrategy) -> Vec<String> {
    match strategy {
        SplitStrategy::Paragraph => body
            .split("\n\n")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        SplitStrategy::Sentence => split_sentences(body),
        SplitStrategy::CustomDelimiter { delimiter } => body
            .split(delimiter.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        SplitStrategy::CharacterLimit { limit } => split_by_character_limit(body, *limit),
    }
}

fn split_sentences(body: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let chars: Vec<char> = body.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            let next_is_space = chars.get(i + 1).map(|c| c.is_whitespace()).unwrap_or(true);
            let after_space_is_upper = chars
                .get(i + 2)
                .map(|c| c.is_uppercase())
                .unwrap_or(true);
            if next_is_space && after_space_is_upper {
                sentences.push(current.trim().to_string());
                current.clear();
            }
        }
        i += 1;
    }
    if !current.trim().is_empty() {
        sentences.push(current.trim().to_string());
    }
    sentences.into_iter().filter(|s| !s.is_empty()).collect()
}

fn split_by_character_limit(body: &str, limit: usize) -> Vec<String> {
    if limit == 0 {
        return vec![body.to_string()];
    }
    let mut segments = Vec::new();
    let mut current = String::new();
    for word in body.split_whitespace() {
        let candidate_len = current.len() + if current.is_empty() { 0 } else { 1 } + word.len();
        if candidate_len > limit && !current.is_empty() {
            segments.push(current.clone());
            current.clear();
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipient() -> Recipient {
        Recipient {
            name: "Jane".to_string(),
            company: "Acme".to_string(),
            email: "jane@example.com".to_string(),
            phone: "+15551234567".to_string(),
            row_number: 1,
        }
    }

    #[test]
    fn render_substitutes_known_placeholders() {
        let template = Template {
            name: "greeting".to_string(),
            bodies: TemplateBodies {
                email_subject: Some("Hello {name}".to_string()),
                email_body: Some("Dear {name} of {company}".to_string()),
                whatsapp_body: None,
            },
            variables: ["name".to_string(), "company".to_string()].into_iter().collect(),
            enabled_channels: vec![Channel::Mail],
            whatsapp_api_parameter_count: None,
            multi_message: None,
        };
        let rendered = template.render(Channel::Mail, &recipient());
        assert_eq!(rendered.subject.as_deref(), Some("Hello Jane"));
        assert_eq!(rendered.body, "Dear Jane of Acme");
    }

    #[test]
    fn missing_placeholder_renders_empty() {
        let template = Template {
            name: "t".to_string(),
            bodies: TemplateBodies {
                email_subject: None,
                email_body: Some("Order {order_id} shipped".to_string()),
                whatsapp_body: None,
            },
            variables: HashSet::new(),
            enabled_channels: vec![Channel::Mail],
            whatsapp_api_parameter_count: None,
            multi_message: None,
        };
        let rendered = template.render(Channel::Mail, &recipient());
        assert_eq!(rendered.body, "Order  shipped");
    }

    #[test]
    fn validate_rejects_empty_body_for_enabled_channel() {
        let template = Template {
            name: "t".to_string(),
            bodies: TemplateBodies::default(),
            variables: HashSet::new(),
            enabled_channels: vec![Channel::Mail],
            whatsapp_api_parameter_count: None,
            multi_message: None,
        };
        assert_eq!(template.validate(), Err(TemplateError::EmptyBody("mail")));
    }

    #[test]
    fn validate_rejects_unused_declared_variable() {
        let template = Template {
            name: "t".to_string(),
            bodies: TemplateBodies {
                email_subject: None,
                email_body: Some("Hello there".to_string()),
                whatsapp_body: None,
            },
            variables: ["name".to_string()].into_iter().collect(),
            enabled_channels: vec![Channel::Mail],
            whatsapp_api_parameter_count: None,
            multi_message: None,
        };
        assert!(matches!(template.validate(), Err(TemplateError::UnusedVariable(_))));
    }

    #[test]
    fn validate_rejects_delay_below_minimum() {
        let template = Template {
            name: "t".to_string(),
            bodies: TemplateBodies {
                email_subject: None,
                email_body: None,
                whatsapp_body: Some("Hi {name}".to_string()),
            },
            variables: ["name".to_string()].into_iter().collect(),
            enabled_channels: vec![Channel::WhatsAppApi],
            whatsapp_api_parameter_count: None,
            multi_message: Some(MultiMessageConfig {
                strategy: SplitStrategy::Paragraph,
                delay_seconds: 0.01,
            }),
        };
        assert_eq!(template.validate(), Err(TemplateError::DelayTooLow(0.01)));
    }

    #[test]
    fn validate_rejects_parameter_count_mismatch() {
        let template = Template {
            name: "t".to_string(),
            bodies: TemplateBodies {
                email_subject: None,
                email_body: None,
                whatsapp_body: Some("Hi {{1}}, your order {{2}} shipped".to_string()),
            },
            variables: HashSet::new(),
            enabled_channels: vec![Channel::WhatsAppApi],
            whatsapp_api_parameter_count: Some(1),
            multi_message: None,
        };
        assert_eq!(
            template.validate(),
            Err(TemplateError::ParameterCountMismatch { found: 2, declared: 1 })
        );
    }

    #[test]
    fn paragraph_split_produces_ordered_segments() {
        let body = "First part.\n\nSecond part.\n\nThird part.";
        let segments = split_message(body, &SplitStrategy::Paragraph);
        assert_eq!(segments, vec!["First part.", "Second part.", "Third part."]);
    }

    #[test]
    fn character_limit_split_respects_the_limit() {
        let body = "one two three four five six seven";
        let segments = split_by_character_limit(body, 12);
        assert!(segments.iter().all(|s| s.len() <= 12));
    }

    #[test]
    fn estimated_total_send_time_matches_formula() {
        let rendered = RenderedMessage {
            channel: Channel::WhatsAppApi,
            subject: None,
            body: String::new(),
            segments: vec!["a".to_string(), "b".to_string(), "c".to_string()],
        };
        assert_eq!(rendered.estimated_total_send_seconds(2.0), 4.0);
    }
}
