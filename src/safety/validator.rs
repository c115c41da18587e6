//! Structural validation: complexity scoring, dangerous keywords and
//! sensitive-table references.

use aho_corasick::AhoCorasick;
use regex::Regex;

use crate::safety::types::{
    CheckDetails, RiskLevel, SafetyCheckResult, SafetyCheckType, SchemaInfo,
};

const DANGEROUS_KEYWORDS: [&str; 9] = [
    "drop", "truncate", "delete", "update", "insert", "alter", "create", "exec", "execute",
];

const SENSITIVE_NAME_FRAGMENTS: [&str; 9] = [
    "user",
    "password",
    "credential",
    "auth",
    "token",
    "key",
    "secret",
    "private",
    "confidential",
];

/// Weighted pattern contributing to the complexity score.
struct ScoreTerm {
    regex: Regex,
    weight: u32,
    /// Count every occurrence instead of scoring presence once.
    per_occurrence: bool,
}

pub struct QueryValidator {
    max_complexity_score: u32,
    terms: Vec<ScoreTerm>,
    dangerous: Vec<(&'static str, Regex)>,
    sensitive_fragments: AhoCorasick,
}

impl QueryValidator {
    pub fn new(max_complexity_score: u32) -> Self {
        let term = |pattern: &str, weight, per_occurrence| ScoreTerm {
            regex: Regex::new(&format!("(?i){pattern}")).expect("valid complexity regex"),
            weight,
            per_occurrence,
        };

        let terms = vec![
            term(r"\bselect\b", 10, false),
            term(r"\bjoin\b", 15, true),
            term(r"\(", 10, true),
            term(r"\bunion\b", 20, true),
            term(r"\bgroup\s+by\b", 10, false),
            term(r"\border\s+by\b", 5, false),
            term(r"\bhaving\b", 10, false),
            term(r"\bcase\b", 5, true),
            term(r"\bover\s*\(|\bwindow\b", 15, false),
        ];

        let dangerous = DANGEROUS_KEYWORDS
            .iter()
            .map(|kw| {
                let regex = Regex::new(&format!(r"(?i)\b{kw}\b")).expect("valid keyword regex");
                (*kw, regex)
            })
            .collect();

        let sensitive_fragments = AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .build(SENSITIVE_NAME_FRAGMENTS)
            .expect("Failed to build sensitive-name matcher");

        Self {
            max_complexity_score: max_complexity_score.max(1),
            terms,
            dangerous,
            sensitive_fragments,
        }
    }

    pub fn max_complexity_score(&self) -> u32 {
        self.max_complexity_score
    }

    /// Additive complexity score for `query`.
    pub fn complexity(&self, query: &str) -> u32 {
        let structural: u32 = self
            .terms
            .iter()
            .map(|t| {
                let hits = if t.per_occurrence {
                    t.regex.find_iter(query).count() as u32
                } else {
                    u32::from(t.regex.is_match(query))
                };
                t.weight * hits
            })
            .sum();

        let length = (query.len() / 100).min(20) as u32;
        structural + length
    }

    /// Dangerous keywords present in `query`, in list order.
    pub fn dangerous_operations(&self, query: &str) -> Vec<String> {
        self.dangerous
            .iter()
            .filter(|(_, regex)| regex.is_match(query))
            .map(|(kw, _)| kw.to_string())
            .collect()
    }

    /// Tables from `schema` that are referenced by `query` and carry a
    /// sensitive name fragment.
    pub fn sensitive_tables(&self, query: &str, schema: &SchemaInfo) -> Vec<String> {
        let query_lower = query.to_lowercase();
        schema
            .tables
            .iter()
            .map(|t| t.name.to_lowercase())
            .filter(|name| !name.is_empty() && query_lower.contains(name.as_str()))
            .filter(|name| self.sensitive_fragments.is_match(name))
            .collect()
    }

    pub fn validate(&self, query: &str, schema: Option<&SchemaInfo>) -> SafetyCheckResult {
        let max = self.max_complexity_score;
        let mut issues = Vec::new();

        let score = self.complexity(query);
        if score > max {
            issues.push(format!("Query complexity too high: {score}"));
        }

        let dangerous_operations = self.dangerous_operations(query);
        issues.extend(
            dangerous_operations
                .iter()
                .map(|op| format!("Dangerous operation detected: {op}")),
        );

        if let Some(schema) = schema {
            issues.extend(
                self.sensitive_tables(query, schema)
                    .into_iter()
                    .map(|t| format!("Access to sensitive table: {t}")),
            );
        }

        let score_f = f64::from(score);
        let max_f = f64::from(max);
        let risk_level = if score_f > max_f * 0.8 || !dangerous_operations.is_empty() {
            RiskLevel::High
        } else if score_f > max_f * 0.5 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        let passed = issues.is_empty();
        let confidence = if passed {
            0.9
        } else {
            (1.0 - issues.len() as f64 * 0.2).max(0.1)
        };
        let message = if passed {
            "Query validation completed".to_string()
        } else {
            format!("Query validation failed: {}", issues.join("; "))
        };

        SafetyCheckResult::new(
            SafetyCheckType::QueryComplexity,
            passed,
            risk_level,
            confidence,
            message,
            CheckDetails::Complexity {
                complexity_score: score,
                max_complexity: max,
                issues,
                dangerous_operations,
            },
        )
    }
}

impl Default for QueryValidator {
    fn default() -> Self {
        Self::new(100)
    }
}
