//! SQL injection pattern detection.

use regex::Regex;
use serde::Serialize;

use crate::config::InjectionConfidence;

/// Family a rule belongs to; decides the confidence tier of its matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionFamily {
    /// Bare DDL/DML keyword presence.
    Keyword,
    /// `UNION [ALL] SELECT`.
    UnionSelect,
    /// Comment tokens that truncate the rest of a statement.
    Comment,
    /// Always-true predicates.
    Tautology,
    /// A second statement after `;`.
    StackedQuery,
    /// Time-based blind probes.
    Timing,
    /// Procedure or shell execution.
    Exec,
}

/// A single rule match.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InjectionDetection {
    /// Index of the rule in evaluation order.
    pub pattern_id: usize,
    pub family: InjectionFamily,
    pub matched_text: String,
    pub start: usize,
    pub end: usize,
    pub confidence: f64,
}

struct InjectionRule {
    regex: Regex,
    family: InjectionFamily,
}

/// Ordered list of case-insensitive, multiline, dot-all rules.
pub struct InjectionDetector {
    rules: Vec<InjectionRule>,
    confidence: InjectionConfidence,
}

impl InjectionDetector {
    pub fn new(confidence: InjectionConfidence) -> Self {
        use InjectionFamily::*;

        let rules = [
            (
                r"\b(?:UNION|SELECT|INSERT|UPDATE|DELETE|DROP|CREATE|ALTER|EXEC|EXECUTE)\b",
                Keyword,
            ),
            (r"\bUNION\s+(?:ALL\s+)?SELECT\b", UnionSelect),
            (r"--|#|/\*|\*/", Comment),
            (r"\bOR\b.*\b1\s*=\s*1\b|\bAND\b.*\b1\s*=\s*1\b", Tautology),
            (r"\bOR\b.*\bTRUE\b|\bAND\b.*\bTRUE\b", Tautology),
            (r"\bOR\s+'([^']*)'\s*=\s*'([^']*)'", Tautology),
            (r";\s*(?:DROP|DELETE|UPDATE|INSERT)\b", StackedQuery),
            (r"\bWAITFOR\s+DELAY\b", Timing),
            (r"\bBENCHMARK\s*\(", Timing),
            (r"\b(?:PG_)?SLEEP\s*\(", Timing),
            (r"\bXP_CMDSHELL\b", Exec),
            (r"\bSP_EXECUTESQL\b", Exec),
        ]
        .into_iter()
        .map(|(pattern, family)| InjectionRule {
            regex: Regex::new(&format!("(?ims){pattern}")).expect("valid injection regex"),
            family,
        })
        .collect();

        Self { rules, confidence }
    }

    /// Evaluate every rule and report all matches.
    ///
    /// Callers take the maximum confidence when deciding a risk level.
    pub fn detect(&self, query: &str) -> Vec<InjectionDetection> {
        let mut detections = Vec::new();

        for (pattern_id, rule) in self.rules.iter().enumerate() {
            for mat in rule.regex.find_iter(query) {
                detections.push(InjectionDetection {
                    pattern_id,
                    family: rule.family,
                    matched_text: mat.as_str().to_string(),
                    start: mat.start(),
                    end: mat.end(),
                    confidence: self.tier(rule.family),
                });
            }
        }

        detections
    }

    fn tier(&self, family: InjectionFamily) -> f64 {
        let c = &self.confidence;
        match family {
            InjectionFamily::Keyword => c.keyword,
            InjectionFamily::UnionSelect => c.union_select,
            InjectionFamily::Comment => c.comment,
            InjectionFamily::Tautology => c.tautology,
            InjectionFamily::StackedQuery => c.stacked_query,
            InjectionFamily::Timing => c.timing,
            InjectionFamily::Exec => c.exec,
        }
    }
}

impl Default for InjectionDetector {
    fn default() -> Self {
        Self::new(InjectionConfidence::default())
    }
}

/// Highest confidence among `detections`, if any.
pub fn max_confidence(detections: &[InjectionDetection]) -> Option<f64> {
    detections.iter().map(|d| d.confidence).reduce(f64::max)
}
