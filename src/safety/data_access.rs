//! Data-access check: configured sensitive tables/columns and bulk
//! aggregation patterns.

use aho_corasick::{AhoCorasick, MatchKind};

use crate::safety::types::{CheckDetails, RiskLevel, SafetyCheckResult, SafetyCheckType};

const AGGREGATE_PATTERNS: [&str; 5] = ["count(*)", "sum(", "avg(", "max(", "min("];

pub struct DataAccessChecker {
    sensitive_tables: Vec<String>,
    sensitive_columns: Vec<String>,
    aggregates: AhoCorasick,
}

impl DataAccessChecker {
    pub fn new(sensitive_tables: &[String], sensitive_columns: &[String]) -> Self {
        let aggregates = AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .match_kind(MatchKind::LeftmostFirst)
            .build(AGGREGATE_PATTERNS)
            .expect("Failed to build aggregate matcher");

        Self {
            sensitive_tables: normalize(sensitive_tables),
            sensitive_columns: normalize(sensitive_columns),
            aggregates,
        }
    }

    pub fn check(&self, query: &str) -> SafetyCheckResult {
        let query_lower = query.to_lowercase();
        let mut issues = Vec::new();

        for table in &self.sensitive_tables {
            if query_lower.contains(table.as_str()) {
                issues.push(format!("Access to sensitive table: {table}"));
            }
        }
        for column in &self.sensitive_columns {
            if query_lower.contains(column.as_str()) {
                issues.push(format!("Access to sensitive column: {column}"));
            }
        }

        let mut seen = [false; AGGREGATE_PATTERNS.len()];
        for mat in self.aggregates.find_iter(&query_lower) {
            seen[mat.pattern().as_usize()] = true;
        }
        for (pattern, _) in AGGREGATE_PATTERNS.iter().zip(seen).filter(|(_, hit)| *hit) {
            issues.push(format!("Data aggregation pattern: {pattern}"));
        }

        if issues.is_empty() {
            return SafetyCheckResult::new(
                SafetyCheckType::DataAccess,
                true,
                RiskLevel::Low,
                0.9,
                "Data access check passed",
                CheckDetails::DataAccess { issues },
            );
        }

        SafetyCheckResult::new(
            SafetyCheckType::DataAccess,
            false,
            RiskLevel::Medium,
            0.8,
            format!("Data access concerns: {}", issues.join("; ")),
            CheckDetails::DataAccess { issues },
        )
    }
}

impl Default for DataAccessChecker {
    fn default() -> Self {
        Self::new(&[], &[])
    }
}

fn normalize(names: &[String]) -> Vec<String> {
    names
        .iter()
        .map(|n| n.trim().to_lowercase())
        .filter(|n| !n.is_empty())
        .collect()
}
