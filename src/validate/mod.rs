//! Data validation (SPEC_FULL 4.2, component C2).
//!
//! Ported from `original_source/.../data_validator.py`'s
//! `EmailValidator`/`PhoneValidator`/`BusinessRuleValidator`/
//! `AdvancedDataValidator`. Validation never throws: every failure mode
//! becomes an `Issue` and `is_valid = false`.

pub mod email;
pub mod phone;
pub mod rules;

use serde::{Deserialize, Serialize};

use crate::types::Recipient;

/// Severity of a single validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// Broad category a finding belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Format,
    Domain,
    BusinessRule,
    DataQuality,
    CrossField,
}

/// A single validation finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub field: String,
    pub value: String,
    pub severity: Severity,
    pub category: Category,
    pub message: String,
    pub suggestion: Option<String>,
    pub rule_name: &'static str,
}

/// Full validation outcome for one recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub issues: Vec<Issue>,
    pub quality_score: f64,
    pub suggestions: Vec<String>,
}

impl ValidationReport {
    pub fn error_count(&self) -> usize {
        self.issues.iter().filter(|i| i.severity == Severity::Error).count()
    }

    pub fn warning_count(&self) -> usize {
        self.issues.iter().filter(|i| i.severity == Severity::Warning).count()
    }

    pub fn info_count(&self) -> usize {
        self.issues.iter().filter(|i| i.severity == Severity::Info).count()
    }
}

/// Options controlling optional, network-dependent checks.
#[derive(Debug, Clone)]
pub struct ValidationOptions {
    pub check_mx_record: bool,
    pub default_phone_country: String,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            check_mx_record: false,
            default_phone_country: "US".to_string(),
        }
    }
}

/// Validates `Recipient`s against email/phone/name/company rules plus
/// cross-field checks, and computes a 0-100 quality score.
#[derive(Default)]
pub struct AdvancedDataValidator {
    options: ValidationOptions,
}

impl AdvancedDataValidator {
    pub fn new(options: ValidationOptions) -> Self {
        Self { options }
    }

    /// Validate a single recipient, never failing: every problem becomes an
    /// `Issue` instead of an `Err`.
    pub fn validate_customer_data(&self, recipient: &Recipient) -> ValidationReport {
        let mut issues = Vec::new();

        issues.extend(email::validate_email(&recipient.email, self.options.check_mx_record));
        issues.extend(phone::validate_phone(
            &recipient.phone,
            &self.options.default_phone_country,
        ));
        issues.extend(rules::validate_name(&recipient.name));
        issues.extend(rules::validate_company(&recipient.company));
        issues.extend(self.validate_cross_field_rules(recipient));

        let is_valid = !issues.iter().any(|i| i.severity == Severity::Error);
        let quality_score = self.calculate_quality_score(recipient, &issues);
        let suggestions = self.generate_improvement_suggestions(&issues);

        ValidationReport {
            is_valid,
            issues,
            quality_score,
            suggestions,
        }
    }

    /// Validate a batch, returning one report per recipient in input order.
    pub fn validate_batch_data(&self, recipients: &[Recipient]) -> Vec<ValidationReport> {
        recipients.iter().map(|r| self.validate_customer_data(r)).collect()
    }

    fn validate_cross_field_rules(&self, recipient: &Recipient) -> Vec<Issue> {
        let mut issues = Vec::new();

        if !recipient.email.is_empty() && !recipient.name.is_empty() {
            if let Some(local_part) = recipient.email.split('@').next() {
                let local_lower = local_part.to_lowercase();
                let shares_substring = recipient
                    .name
                    .split_whitespace()
                    .any(|token| {
                        let token_lower = token.to_lowercase();
                        token_lower.len() >= 3 && local_lower.contains(&token_lower)
                    });
                if !shares_substring {
                    issues.push(Issue {
                        field: "email".to_string(),
                        value: recipient.email.clone(),
                        severity: Severity::Warning,
                        category: Category::CrossField,
                        message: "Email address does not appear to relate to the recipient's name"
                            .to_string(),
                        suggestion: None,
                        rule_name: "cross_field_name_email_mismatch",
                    });
                }
            }
        }

        let placeholder_tokens = ["test", "sample", "example", "placeholder", "n/a", "tbd"];
        for (field, value) in [
            ("name", &recipient.name),
            ("company", &recipient.company),
            ("email", &recipient.email),
        ] {
            let lower = value.to_lowercase();
            if placeholder_tokens.iter().any(|t| lower.contains(t)) {
                issues.push(Issue {
                    field: field.to_string(),
                    value: value.clone(),
                    severity: Severity::Warning,
                    category: Category::CrossField,
                    message: format!("{field} contains a placeholder-like token"),
                    suggestion: None,
                    rule_name: "cross_field_placeholder_token",
                });
            }
        }

        issues
    }

    fn calculate_quality_score(&self, recipient: &Recipient, issues: &[Issue]) -> f64 {
        let mut score: f64 = 100.0;
        for issue in issues {
            score -= match issue.severity {
                Severity::Error => 20.0,
                Severity::Warning => 10.0,
                Severity::Info => 2.0,
            };
        }

        let fields = [&recipient.name, &recipient.company, &recipient.email, &recipient.phone];
        let populated = fields.iter().filter(|f| !f.trim().is_empty()).count();
        let completeness_bonus = (populated as f64 / fields.len() as f64) * 10.0;
        score += completeness_bonus;

        score.clamp(0.0, 100.0)
    }

    fn generate_improvement_suggestions(&self, issues: &[Issue]) -> Vec<String> {
        issues
            .iter()
            .filter_map(|i| i.suggestion.clone())
            .take(5)
            .collect()
    }
}
