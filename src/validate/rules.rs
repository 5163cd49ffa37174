//! Name and company validation rules (SPEC_FULL 4.2), ported from
//! `original_source/.../data_validator.py`'s `BusinessRuleValidator`.

use regex::Regex;
use std::sync::LazyLock;

use super::{Category, Issue, Severity};

const COMPANY_SUFFIXES: &[&str] = &[
    "inc", "incorporated", "corp", "corporation", "llc", "ltd", "limited",
    "co", "company", "group", "holdings", "enterprises", "solutions",
    "services", "systems", "technologies", "tech", "consulting",
];

static SUSPICIOUS_NAME_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^\d+$",
        r"^test\d*$",
        r"^sample\d*$",
        r"^example\d*$",
        r"^[a-z]+$",
        r"^[A-Z]+$",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Validate a person's name: required, length bounds, and suspicious
/// pattern checks (all-numeric, test/sample/example, all-caps/lowercase).
pub fn validate_name(name: &str) -> Vec<Issue> {
    if name.trim().is_empty() {
        return vec![Issue {
            field: "name".to_string(),
            value: name.to_string(),
            severity: Severity::Error,
            category: Category::Format,
            message: "Name is required".to_string(),
            suggestion: None,
            rule_name: "name_required",
        }];
    }

    let name = name.trim();
    let mut issues = Vec::new();

    if name.chars().count() < 2 {
        issues.push(Issue {
            field: "name".to_string(),
            value: name.to_string(),
            severity: Severity::Error,
            category: Category::Format,
            message: format!("Name too short: {name}"),
            suggestion: Some("Names should be at least 2 characters long".to_string()),
            rule_name: "name_too_short",
        });
    } else if name.chars().count() > 100 {
        issues.push(Issue {
            field: "name".to_string(),
            value: name.to_string(),
            severity: Severity::Warning,
            category: Category::Format,
            message: format!("Name unusually long: {name}"),
            suggestion: Some("Verify this is a complete name".to_string()),
            rule_name: "name_too_long",
        });
    }

    let lower = name.to_lowercase();
    if SUSPICIOUS_NAME_PATTERNS.iter().any(|re| re.is_match(&lower)) {
        let suggestion = if name.chars().all(|c| c.is_lowercase() || c.is_whitespace())
            || name.chars().all(|c| c.is_uppercase() || c.is_whitespace())
        {
            Some(proper_case(name))
        } else {
            None
        };
        issues.push(Issue {
            field: "name".to_string(),
            value: name.to_string(),
            severity: Severity::Warning,
            category: Category::DataQuality,
            message: format!("Name matches a suspicious pattern: {name}"),
            suggestion,
            rule_name: "name_suspicious_pattern",
        });
    }

    issues
}

fn proper_case(name: &str) -> String {
    name.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Validate a company name: required, length bounds, suspicious tokens,
/// and an info-level nudge when a single-word name lacks a legal suffix.
pub fn validate_company(company: &str) -> Vec<Issue> {
    if company.trim().is_empty() {
        return vec![Issue {
            field: "company".to_string(),
            value: company.to_string(),
            severity: Severity::Error,
            category: Category::Format,
            message: "Company is required".to_string(),
            suggestion: None,
            rule_name: "company_required",
        }];
    }

    let company = company.trim();
    let mut issues = Vec::new();

    if company.chars().count() < 2 {
        issues.push(Issue {
            field: "company".to_string(),
            value: company.to_string(),
            severity: Severity::Error,
            category: Category::Format,
            message: format!("Company name too short: {company}"),
            suggestion: None,
            rule_name: "company_too_short",
        });
    } else if company.chars().count() > 200 {
        issues.push(Issue {
            field: "company".to_string(),
            value: company.to_string(),
            severity: Severity::Warning,
            category: Category::Format,
            message: format!("Company name unusually long: {company}"),
            suggestion: None,
            rule_name: "company_too_long",
        });
    }

    if company.chars().all(|c| c.is_ascii_digit()) {
        issues.push(Issue {
            field: "company".to_string(),
            value: company.to_string(),
            severity: Severity::Warning,
            category: Category::DataQuality,
            message: format!("Company name is purely numeric: {company}"),
            suggestion: None,
            rule_name: "company_numeric",
        });
    }

    let lower = company.to_lowercase();
    for token in ["test", "sample", "placeholder"] {
        if lower.contains(token) {
            issues.push(Issue {
                field: "company".to_string(),
                value: company.to_string(),
                severity: Severity::Warning,
                category: Category::DataQuality,
                message: format!("Company name contains a placeholder-like token: {company}"),
                suggestion: None,
                rule_name: "company_placeholder_token",
            });
            break;
        }
    }

    let is_single_word = !company.contains(char::is_whitespace);
    let has_suffix = COMPANY_SUFFIXES
        .iter()
        .any(|suffix| lower.split(|c: char| !c.is_alphanumeric()).any(|tok| tok == *suffix));
    if is_single_word && !has_suffix {
        issues.push(Issue {
            field: "company".to_string(),
            value: company.to_string(),
            severity: Severity::Info,
            category: Category::BusinessRule,
            message: "Company name has no legal suffix (Inc, LLC, ...)".to_string(),
            suggestion: None,
            rule_name: "company_no_suffix",
        });
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_name_is_required_error() {
        let issues = validate_name("");
        assert_eq!(issues[0].rule_name, "name_required");
    }

    #[test]
    fn all_lowercase_name_is_suspicious_with_proper_case_suggestion() {
        let issues = validate_name("jane smith");
        let issue = issues.iter().find(|i| i.rule_name == "name_suspicious_pattern").unwrap();
        assert_eq!(issue.suggestion.as_deref(), Some("Jane Smith"));
    }

    #[test]
    fn purely_numeric_name_is_suspicious() {
        let issues = validate_name("12345");
        assert!(issues.iter().any(|i| i.rule_name == "name_suspicious_pattern"));
    }

    #[test]
    fn ordinary_mixed_case_name_has_no_suspicious_pattern() {
        let issues = validate_name("Jane Smith");
        assert!(!issues.iter().any(|i| i.rule_name == "name_suspicious_pattern"));
    }

    #[test]
    fn single_word_company_without_suffix_gets_info_nudge() {
        let issues = validate_company("Acme");
        assert!(issues.iter().any(|i| i.rule_name == "company_no_suffix"));
    }

    #[test]
    fn company_with_suffix_has_no_nudge() {
        let issues = validate_company("Acme Inc");
        assert!(!issues.iter().any(|i| i.rule_name == "company_no_suffix"));
    }
}
