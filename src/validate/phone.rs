//! Phone validation rules (SPEC_FULL 4.2), ported from
//! `original_source/.../data_validator.py`'s `PhoneValidator`.

use super::{Category, Issue, Severity};

/// Validate a phone number: required, digit-count bounds, suspicious
/// patterns, then a library-based parse against `default_country`.
pub fn validate_phone(phone: &str, default_country: &str) -> Vec<Issue> {
    if phone.trim().is_empty() {
        return vec![Issue {
            field: "phone".to_string(),
            value: phone.to_string(),
            severity: Severity::Error,
            category: Category::Format,
            message: "Phone number is required".to_string(),
            suggestion: None,
            rule_name: "phone_required",
        }];
    }

    let phone = phone.trim();
    let mut issues = validate_format(phone);
    issues.extend(validate_with_library(phone, default_country));
    issues
}

fn digits_and_plus(phone: &str) -> String {
    phone.chars().filter(|c| c.is_ascii_digit() || *c == '+').collect()
}

fn validate_format(phone: &str) -> Vec<Issue> {
    let mut issues = Vec::new();
    let digits_only = digits_and_plus(phone);
    let digit_count = digits_only.chars().filter(|c| c.is_ascii_digit()).count();

    if digit_count < 8 {
        issues.push(Issue {
            field: "phone".to_string(),
            value: phone.to_string(),
            severity: Severity::Error,
            category: Category::Format,
            message: format!("Phone number too short: {phone}"),
            suggestion: Some("Phone numbers should be at least 8 digits".to_string()),
            rule_name: "phone_too_short",
        });
    } else if digit_count > 15 {
        issues.push(Issue {
            field: "phone".to_string(),
            value: phone.to_string(),
            severity: Severity::Error,
            category: Category::Format,
            message: format!("Phone number too long: {phone}"),
            suggestion: Some("Phone numbers should not exceed 15 digits".to_string()),
            rule_name: "phone_too_long",
        });
    }

    let digits: String = digits_only.chars().filter(|c| c.is_ascii_digit()).collect();
    if is_all_same_digit(&digits) {
        issues.push(Issue {
            field: "phone".to_string(),
            value: phone.to_string(),
            severity: Severity::Warning,
            category: Category::DataQuality,
            message: format!("Phone number has suspicious pattern (all same digit): {phone}"),
            suggestion: Some("Verify this is a real phone number".to_string()),
            rule_name: "phone_suspicious_pattern",
        });
    }
    if is_sequential(&digits) {
        issues.push(Issue {
            field: "phone".to_string(),
            value: phone.to_string(),
            severity: Severity::Warning,
            category: Category::DataQuality,
            message: format!("Phone number has suspicious pattern (sequential): {phone}"),
            suggestion: Some("Verify this is a real phone number".to_string()),
            rule_name: "phone_sequential",
        });
    }

    issues
}

fn is_all_same_digit(digits: &str) -> bool {
    !digits.is_empty() && digits.chars().collect::<std::collections::HashSet<_>>().len() == 1
}

fn is_sequential(digits: &str) -> bool {
    if digits.len() < 4 {
        return false;
    }
    let chars: Vec<u32> = digits.chars().filter_map(|c| c.to_digit(10)).take(5).collect();
    if chars.len() < 4 {
        return false;
    }
    let ascending = chars.windows(2).all(|w| w[1] == w[0] + 1);
    let descending = chars.windows(2).all(|w| w[0] > 0 && w[1] == w[0] - 1);
    ascending || descending
}

fn validate_with_library(phone: &str, default_country: &str) -> Vec<Issue> {
    let country = match default_country.parse::<phonenumber::country::Id>() {
        Ok(c) => c,
        Err(_) => return Vec::new(),
    };

    match phonenumber::parse(Some(country), phone) {
        Ok(parsed) => {
            let mut issues = Vec::new();
            if !phonenumber::is_valid(&parsed) {
                issues.push(Issue {
                    field: "phone".to_string(),
                    value: phone.to_string(),
                    severity: Severity::Error,
                    category: Category::Format,
                    message: format!("Invalid phone number: {phone}"),
                    suggestion: Some(suggest_fix(phone)),
                    rule_name: "phone_invalid",
                });
                return issues;
            }

            let formatted_international = parsed
                .format()
                .mode(phonenumber::Mode::International)
                .to_string();
            if phone != formatted_international {
                issues.push(Issue {
                    field: "phone".to_string(),
                    value: phone.to_string(),
                    severity: Severity::Info,
                    category: Category::Format,
                    message: "Phone number formatting suggestion".to_string(),
                    suggestion: Some(format!(
                        "Consider using international format: {formatted_international}"
                    )),
                    rule_name: "phone_format_suggestion",
                });
            }
            issues
        }
        Err(_) => vec![Issue {
            field: "phone".to_string(),
            value: phone.to_string(),
            severity: Severity::Error,
            category: Category::Format,
            message: format!("Cannot parse phone number: {phone}"),
            suggestion: Some(suggest_fix(phone)),
            rule_name: "phone_parse_error",
        }],
    }
}

fn suggest_fix(phone: &str) -> String {
    let cleaned = digits_and_plus(phone);
    let digit_count = cleaned.chars().filter(|c| c.is_ascii_digit()).count();
    if cleaned.is_empty() {
        return "Phone number must contain digits".to_string();
    }
    if digit_count < 8 {
        return "Phone number is too short (minimum 8 digits)".to_string();
    }
    if digit_count > 15 {
        return "Phone number is too long (maximum 15 digits)".to_string();
    }
    if !cleaned.starts_with('+') && digit_count >= 10 {
        return format!("Consider adding country code: +1{cleaned} (for US numbers)");
    }
    "Check phone number format (example: +1-555-123-4567)".to_string()
}
