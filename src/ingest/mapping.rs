//! Intelligent column-to-field mapping (SPEC_FULL 4.1).
//!
//! Ported from `original_source/.../column_mapper.py`'s
//! `IntelligentColumnMapper`: five independent strategies (template, exact,
//! pattern, fuzzy, data-pattern) are combined and conflicts resolved by a
//! fixed priority order, the same as the original.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Confidence tier assigned to a resolved mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingConfidence {
    Exact,
    High,
    Medium,
    Low,
    None,
}

/// One resolved source-column -> target-field mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub source_column: String,
    pub target_field: String,
    pub confidence: MappingConfidence,
    pub confidence_score: f64,
    pub detection_method: &'static str,
    pub suggestions: Vec<String>,
}

/// A persisted, reusable mapping template (SPEC_FULL 4.1 "Template" strategy).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingTemplate {
    pub name: String,
    pub description: String,
    /// field -> column name pattern (substring match, case-insensitive).
    pub mappings: HashMap<String, String>,
    pub usage_count: u64,
    pub success_rate: f64,
}

/// Full result of mapping a header row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingResult {
    pub mappings: HashMap<String, ColumnMapping>,
    pub unmapped_columns: Vec<String>,
    pub missing_required_fields: Vec<String>,
    pub confidence_score: f64,
}

struct FieldDefinition {
    name: &'static str,
    required: bool,
    weight: f64,
    exact_matches: &'static [&'static str],
    pattern_matches: &'static [&'static str],
    fuzzy_matches: &'static [&'static str],
    data_patterns: &'static [&'static str],
    negative_patterns: &'static [&'static str],
}

const FIELD_DEFINITIONS: &[FieldDefinition] = &[
    FieldDefinition {
        name: "name",
        required: true,
        weight: 1.0,
        exact_matches: &[
            "name", "customer_name", "full_name", "client_name", "contact_name",
            "nome", "nombre", "nom", "person_name", "individual_name",
        ],
        pattern_matches: &[
            ".*name.*", ".*cliente.*", ".*customer.*", ".*contact.*",
            ".*person.*", ".*individual.*",
        ],
        fuzzy_matches: &[
            "first_name", "last_name", "firstname", "lastname", "fname", "lname",
        ],
        data_patterns: &[r"^[A-Za-z\s\-'\.]{2,50}$"],
        negative_patterns: &[
            r"^\d+$",
            r"^[^@]+@[^@]+\.[^@]+$",
            r"^\+?\d[\d\s\-\(\)]{7,}$",
        ],
    },
    FieldDefinition {
        name: "company",
        required: true,
        weight: 1.0,
        exact_matches: &[
            "company", "company_name", "organization", "org", "business",
            "empresa", "compañía", "société", "corporation", "corp",
        ],
        pattern_matches: &[
            ".*company.*", ".*organization.*", ".*business.*", ".*corp.*",
            ".*empresa.*", ".*firm.*", ".*agency.*",
        ],
        fuzzy_matches: &["employer", "workplace", "office"],
        data_patterns: &[r"^[A-Za-z0-9\s\-&\.,]{2,100}$"],
        negative_patterns: &[r"^[^@]+@[^@]+\.[^@]+$", r"^\+?\d[\d\s\-\(\)]{7,}$"],
    },
    FieldDefinition {
        name: "email",
        required: true,
        weight: 1.0,
        exact_matches: &[
            "email", "email_address", "e-mail", "mail", "correo", "courriel",
            "electronic_mail", "e_mail",
        ],
        pattern_matches: &[".*email.*", ".*mail.*", ".*correo.*"],
        fuzzy_matches: &["contact_email", "work_email", "business_email"],
        data_patterns: &[r"^[^@]+@[^@]+\.[^@]+$"],
        negative_patterns: &[r"^\d+$", r"^[A-Za-z\s\-'\.]{2,50}$"],
    },
    FieldDefinition {
        name: "phone",
        required: true,
        weight: 1.0,
        exact_matches: &[
            "phone", "telephone", "mobile", "cell", "telefone", "teléfono",
            "téléphone", "phone_number", "tel", "cellular",
        ],
        pattern_matches: &[
            ".*phone.*", ".*tel.*", ".*mobile.*", ".*cell.*", ".*contact.*number.*",
        ],
        fuzzy_matches: &["contact_phone", "work_phone", "business_phone", "home_phone"],
        data_patterns: &[r"^\+?\d[\d\s\-\(\)]{7,}$"],
        negative_patterns: &[r"^[^@]+@[^@]+\.[^@]+$", r"^[A-Za-z\s\-'\.]{2,50}$"],
    },
];

/// Maps source-file headers onto `name`/`company`/`email`/`phone` target fields.
pub struct ColumnMapper {
    templates: Vec<MappingTemplate>,
}

impl ColumnMapper {
    pub fn new() -> Self {
        Self { templates: Vec::new() }
    }

    pub fn with_templates(templates: Vec<MappingTemplate>) -> Self {
        Self { templates }
    }

    /// Map `headers`, optionally using `sample_rows` (header -> value) for
    /// data-pattern analysis.
    pub fn map_columns(
        &self,
        headers: &[String],
        sample_rows: &[HashMap<String, String>],
    ) -> MappingResult {
        let template_mappings = self.apply_template_matching(headers);
        let exact_mappings = Self::exact_matching(headers);
        let pattern_mappings = Self::pattern_matching(headers);
        let fuzzy_mappings = Self::fuzzy_matching(headers);
        let data_mappings = if sample_rows.is_empty() {
            HashMap::new()
        } else {
            Self::data_pattern_matching(headers, sample_rows)
        };

        let mappings = Self::resolve_conflicts(
            &[
                ("exact", &exact_mappings),
                ("template", &template_mappings),
                ("pattern", &pattern_mappings),
                ("data", &data_mappings),
                ("fuzzy", &fuzzy_mappings),
            ],
        );

        let mapped_columns: std::collections::HashSet<&str> =
            mappings.values().map(|m| m.source_column.as_str()).collect();
        let unmapped_columns: Vec<String> = headers
            .iter()
            .filter(|h| !mapped_columns.contains(h.as_str()))
            .cloned()
            .collect();

        let required: std::collections::HashSet<&str> = FIELD_DEFINITIONS
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name)
            .collect();
        let mapped_fields: std::collections::HashSet<&str> =
            mappings.keys().map(|s| s.as_str()).collect();
        let missing_required_fields: Vec<String> = required
            .difference(&mapped_fields)
            .map(|s| s.to_string())
            .collect();

        let confidence_score = Self::overall_confidence(&mappings, &required);

        MappingResult {
            mappings,
            unmapped_columns,
            missing_required_fields,
            confidence_score,
        }
    }

    fn exact_matching(headers: &[String]) -> HashMap<String, ColumnMapping> {
        let mut out = HashMap::new();
        for header in headers {
            let lower = header.to_lowercase();
            let lower = lower.trim();
            for field in FIELD_DEFINITIONS {
                if out.contains_key(field.name) {
                    continue;
                }
                if field.exact_matches.iter().any(|m| lower == *m) {
                    out.insert(
                        field.name.to_string(),
                        ColumnMapping {
                            source_column: header.clone(),
                            target_field: field.name.to_string(),
                            confidence: MappingConfidence::Exact,
                            confidence_score: 1.0,
                            detection_method: "exact_match",
                            suggestions: Vec::new(),
                        },
                    );
                    break;
                }
            }
        }
        out
    }

    fn pattern_matching(headers: &[String]) -> HashMap<String, ColumnMapping> {
        let mut out = HashMap::new();
        for header in headers {
            let lower = header.to_lowercase();
            let lower = lower.trim();
            for field in FIELD_DEFINITIONS {
                if out.contains_key(field.name) {
                    continue;
                }
                let mut best_score = 0.0_f64;
                for pattern in field.pattern_matches {
                    if let Ok(re) = Regex::new(pattern) {
                        if re.is_match(lower) {
                            let score = 0.8 + (pattern.len() as f64 / 100.0);
                            if score > best_score {
                                best_score = score;
                            }
                        }
                    }
                }
                if best_score > 0.0 {
                    let confidence = if best_score > 0.85 {
                        MappingConfidence::High
                    } else {
                        MappingConfidence::Medium
                    };
                    out.insert(
                        field.name.to_string(),
                        ColumnMapping {
                            source_column: header.clone(),
                            target_field: field.name.to_string(),
                            confidence,
                            confidence_score: best_score.min(0.95),
                            detection_method: "pattern_match",
                            suggestions: Vec::new(),
                        },
                    );
                }
            }
        }
        out
    }

    fn fuzzy_matching(headers: &[String]) -> HashMap<String, ColumnMapping> {
        let mut out = HashMap::new();
        for header in headers {
            let lower = header.to_lowercase();
            let lower = lower.trim();
            for field in FIELD_DEFINITIONS {
                if out.contains_key(field.name) {
                    continue;
                }
                let mut best_score = 0.0_f64;
                let mut best_match: Option<&str> = None;
                for candidate in field.fuzzy_matches.iter().chain(field.exact_matches.iter()) {
                    let similarity = strsim::normalized_levenshtein(lower, &candidate.to_lowercase());
                    if similarity > best_score && similarity > 0.7 {
                        best_score = similarity;
                        best_match = Some(candidate);
                    }
                }
                if best_score > 0.7 {
                    let confidence = if best_score > 0.9 {
                        MappingConfidence::High
                    } else {
                        MappingConfidence::Medium
                    };
                    out.insert(
                        field.name.to_string(),
                        ColumnMapping {
                            source_column: header.clone(),
                            target_field: field.name.to_string(),
                            confidence,
                            confidence_score: best_score * 0.9,
                            detection_method: "fuzzy_match",
                            suggestions: best_match
                                .map(|m| vec![format!("Similar to: {m}")])
                                .unwrap_or_default(),
                        },
                    );
                }
            }
        }
        out
    }

    fn data_pattern_matching(
        headers: &[String],
        sample_rows: &[HashMap<String, String>],
    ) -> HashMap<String, ColumnMapping> {
        let mut out = HashMap::new();
        for header in headers {
            let values: Vec<&str> = sample_rows
                .iter()
                .filter_map(|row| row.get(header))
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .collect();
            if values.is_empty() {
                continue;
            }
            let total = values.len() as f64;
            let mut best_field: Option<&str> = None;
            let mut best_score = 0.0_f64;
            for field in FIELD_DEFINITIONS {
                if out.contains_key(field.name) {
                    continue;
                }
                let positive = field
                    .data_patterns
                    .iter()
                    .filter_map(|p| Regex::new(p).ok())
                    .map(|re| values.iter().filter(|v| re.is_match(v)).count() as f64 / total)
                    .fold(0.0_f64, f64::max);
                let negative = field
                    .negative_patterns
                    .iter()
                    .filter_map(|p| Regex::new(p).ok())
                    .map(|re| values.iter().filter(|v| re.is_match(v)).count() as f64 / total)
                    .fold(0.0_f64, f64::max);
                let combined = positive - negative * 0.5;
                if combined > best_score && combined > 0.6 {
                    best_score = combined;
                    best_field = Some(field.name);
                }
            }
            if let Some(field_name) = best_field {
                let confidence = if best_score > 0.8 {
                    MappingConfidence::High
                } else {
                    MappingConfidence::Medium
                };
                out.insert(
                    field_name.to_string(),
                    ColumnMapping {
                        source_column: header.clone(),
                        target_field: field_name.to_string(),
                        confidence,
                        confidence_score: best_score,
                        detection_method: "data_pattern",
                        suggestions: vec![format!(
                            "Based on data pattern analysis ({best_score:.2} confidence)"
                        )],
                    },
                );
            }
        }
        out
    }

    fn apply_template_matching(&self, headers: &[String]) -> HashMap<String, ColumnMapping> {
        let mut out = HashMap::new();
        let mut scored: Vec<(&MappingTemplate, f64)> = self
            .templates
            .iter()
            .map(|t| (t, Self::score_template(t, headers)))
            .filter(|(_, score)| *score > 0.5)
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        if let Some((template, score)) = scored.into_iter().next() {
            for (field, pattern) in &template.mappings {
                if let Some(header) = headers
                    .iter()
                    .find(|h| h.to_lowercase().contains(&pattern.to_lowercase()))
                {
                    out.insert(
                        field.clone(),
                        ColumnMapping {
                            source_column: header.clone(),
                            target_field: field.clone(),
                            confidence: MappingConfidence::High,
                            confidence_score: score,
                            detection_method: "template_match",
                            suggestions: vec![format!("From template: {}", template.name)],
                        },
                    );
                }
            }
        }
        out
    }

    fn score_template(template: &MappingTemplate, headers: &[String]) -> f64 {
        if template.mappings.is_empty() {
            return 0.0;
        }
        let total = template.mappings.len() as f64;
        let matches = template
            .mappings
            .values()
            .filter(|pattern| {
                headers
                    .iter()
                    .any(|h| h.to_lowercase().contains(&pattern.to_lowercase()))
            })
            .count() as f64;
        let base = matches / total;
        let bonus = (template.success_rate / 100.0) * 0.1 + (template.usage_count as f64 / 100.0).min(0.1);
        (base + bonus).min(1.0)
    }

    /// Priority order, matching the original: exact, template, pattern, data, fuzzy.
    fn resolve_conflicts(
        ranked: &[(&str, &HashMap<String, ColumnMapping>)],
    ) -> HashMap<String, ColumnMapping> {
        let mut final_mappings = HashMap::new();
        let mut used_columns = std::collections::HashSet::new();
        for field in FIELD_DEFINITIONS {
            for (_, candidates) in ranked {
                if let Some(mapping) = candidates.get(field.name) {
                    if used_columns.contains(&mapping.source_column) {
                        continue;
                    }
                    used_columns.insert(mapping.source_column.clone());
                    final_mappings.insert(field.name.to_string(), mapping.clone());
                    break;
                }
            }
        }
        final_mappings
    }

    fn overall_confidence(
        mappings: &HashMap<String, ColumnMapping>,
        required: &std::collections::HashSet<&str>,
    ) -> f64 {
        if mappings.is_empty() {
            return 0.0;
        }
        let mut total_weight = 0.0;
        let mut weighted = 0.0;
        for (field, mapping) in mappings {
            let weight = FIELD_DEFINITIONS
                .iter()
                .find(|f| f.name == field)
                .map(|f| f.weight)
                .unwrap_or(1.0);
            total_weight += weight;
            weighted += mapping.confidence_score * weight;
        }
        let base = if total_weight > 0.0 { weighted / total_weight } else { 0.0 };
        let mapped_required = mappings.keys().filter(|f| required.contains(f.as_str())).count();
        let completeness = if required.is_empty() {
            1.0
        } else {
            mapped_required as f64 / required.len() as f64
        };
        base * completeness
    }
}

impl Default for ColumnMapper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn exact_header_names_map_with_full_confidence() {
        let mapper = ColumnMapper::new();
        let result = mapper.map_columns(
            &headers(&["Name", "Company", "Email", "Phone"]),
            &[],
        );
        assert_eq!(result.mappings.len(), 4);
        assert!(result.missing_required_fields.is_empty());
        assert!((result.confidence_score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn multilingual_exact_matches_are_recognized() {
        let mapper = ColumnMapper::new();
        let result = mapper.map_columns(
            &headers(&["nombre", "empresa", "correo", "teléfono"]),
            &[],
        );
        assert_eq!(result.mappings.len(), 4);
    }

    #[test]
    fn missing_required_fields_are_reported() {
        let mapper = ColumnMapper::new();
        let result = mapper.map_columns(&headers(&["Name"]), &[]);
        assert!(result.missing_required_fields.contains(&"email".to_string()));
        assert!(result.missing_required_fields.contains(&"phone".to_string()));
    }

    #[test]
    fn fuzzy_matching_recognizes_close_variants() {
        let mapper = ColumnMapper::new();
        let result = mapper.map_columns(&headers(&["telephon"]), &[]);
        assert_eq!(
            result.mappings.get("phone").map(|m| m.detection_method),
            Some("fuzzy_match")
        );
    }

    #[test]
    fn data_pattern_analysis_infers_email_from_values() {
        let mapper = ColumnMapper::new();
        let mut row = HashMap::new();
        row.insert("contact_info".to_string(), "jane@example.com".to_string());
        let result = mapper.map_columns(&headers(&["contact_info"]), &[row]);
        assert_eq!(result.mappings.get("email").map(|m| m.target_field.as_str()), Some("email"));
    }

    #[test]
    fn exact_match_wins_over_pattern_match_for_the_same_column() {
        let mapper = ColumnMapper::new();
        // "email" matches exact_matches *and* pattern ".*mail.*"; exact must win.
        let result = mapper.map_columns(&headers(&["email"]), &[]);
        assert_eq!(
            result.mappings.get("email").map(|m| m.detection_method),
            Some("exact_match")
        );
    }

    #[test]
    fn unmapped_columns_are_listed() {
        let mapper = ColumnMapper::new();
        let result = mapper.map_columns(&headers(&["Name", "Notes"]), &[]);
        assert_eq!(result.unmapped_columns, vec!["Notes".to_string()]);
    }
}
