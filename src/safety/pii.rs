//! Detection and redaction of personally identifiable information.
//!
//! Every pattern runs independently over the input, so a single span can be
//! reported by more than one PII type. Recall is preferred over precision;
//! implausible matches are kept but their confidence is discounted.

use std::ops::Range;

use regex::Regex;
use serde::Serialize;

use crate::config::PiiConfidence;

/// Kind of personally identifiable information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiType {
    Email,
    Phone,
    NationalId,
    PaymentCard,
    IpAddress,
    Url,
}

impl PiiType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Phone => "phone",
            Self::NationalId => "national_id",
            Self::PaymentCard => "payment_card",
            Self::IpAddress => "ip_address",
            Self::Url => "url",
        }
    }
}

/// A single PII match.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PiiDetection {
    pub pii_type: PiiType,
    pub matched_text: String,
    pub start: usize,
    pub end: usize,
    pub confidence: f64,
}

impl PiiDetection {
    pub fn span(&self) -> Range<usize> {
        self.start..self.end
    }
}

struct PiiPattern {
    pii_type: PiiType,
    regex: Regex,
}

/// Stateless set of compiled PII patterns.
pub struct PiiDetector {
    patterns: Vec<PiiPattern>,
    confidence: PiiConfidence,
}

impl PiiDetector {
    pub fn new(confidence: PiiConfidence) -> Self {
        let compile = |pii_type, pattern: &str| PiiPattern {
            pii_type,
            regex: Regex::new(pattern).expect("valid PII regex"),
        };

        let patterns = vec![
            compile(
                PiiType::Email,
                r"(?i)\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
            ),
            compile(
                PiiType::Phone,
                r"\b(?:\+?1[-.\s]?)?\(?[0-9]{3}\)?[-.\s]?[0-9]{3}[-.\s]?[0-9]{4}\b",
            ),
            compile(PiiType::NationalId, r"\b\d{3}-\d{2}-\d{4}\b"),
            compile(PiiType::PaymentCard, r"\b(?:\d{4}[-\s]?){3}\d{4}\b"),
            compile(PiiType::IpAddress, r"\b(?:[0-9]{1,3}\.){3}[0-9]{1,3}\b"),
            compile(
                PiiType::Url,
                r"(?i)https?://[-\w.]+(?::\d+)?(?:/[\w/_.\-]*(?:\?[\w&=%.\-]*)?(?:#\w*)?)?",
            ),
        ];

        Self {
            patterns,
            confidence,
        }
    }

    /// Return every match of every pattern, in pattern order.
    pub fn detect(&self, text: &str) -> Vec<PiiDetection> {
        let mut detections = Vec::new();

        for pattern in &self.patterns {
            for mat in pattern.regex.find_iter(text) {
                detections.push(PiiDetection {
                    pii_type: pattern.pii_type,
                    matched_text: mat.as_str().to_string(),
                    start: mat.start(),
                    end: mat.end(),
                    confidence: self.score(pattern.pii_type, mat.as_str()),
                });
            }
        }

        detections
    }

    fn score(&self, pii_type: PiiType, value: &str) -> f64 {
        let c = &self.confidence;
        match pii_type {
            PiiType::Email => c.email,
            PiiType::Phone => {
                let digits = value.chars().filter(char::is_ascii_digit).count();
                if digits == 10 {
                    c.phone
                } else {
                    c.phone * c.phone_digit_penalty
                }
            }
            PiiType::NationalId => {
                if is_plausible_national_id(value) {
                    c.national_id
                } else {
                    c.national_id * c.national_id_penalty
                }
            }
            PiiType::PaymentCard => c.payment_card,
            PiiType::IpAddress => c.ip_address,
            PiiType::Url => c.url,
        }
    }
}

impl Default for PiiDetector {
    fn default() -> Self {
        Self::new(PiiConfidence::default())
    }
}

/// Structural sanity check for `AAA-GG-SSSS` identifiers.
///
/// The area segment may not be `000`, `666` or start with `9`; the group and
/// serial segments may not be all zeros.
fn is_plausible_national_id(value: &str) -> bool {
    let parts: Vec<&str> = value.split('-').collect();
    let [area, group, serial] = parts.as_slice() else {
        return false;
    };
    if area.len() != 3 || group.len() != 2 || serial.len() != 4 {
        return false;
    }
    if *area == "000" || *area == "666" || area.starts_with('9') {
        return false;
    }
    *group != "00" && *serial != "0000"
}

/// Replace each detected span with `token`.
///
/// Overlapping spans (the same text reported by several PII types) are merged
/// first so every redacted region carries exactly one token. Replacement runs
/// from the last span to the first so earlier offsets stay valid.
pub fn redact(text: &str, detections: &[PiiDetection], token: &str) -> String {
    let mut spans: Vec<Range<usize>> = detections.iter().map(PiiDetection::span).collect();
    spans.sort_by_key(|s| s.start);

    let mut merged: Vec<Range<usize>> = Vec::with_capacity(spans.len());
    for span in spans {
        match merged.last_mut() {
            Some(last) if span.start < last.end => last.end = last.end.max(span.end),
            _ => merged.push(span),
        }
    }

    let mut redacted = text.to_string();
    for span in merged.iter().rev() {
        redacted.replace_range(span.clone(), token);
    }
    redacted
}
