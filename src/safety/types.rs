//! Verdict types shared by the detectors and the risk assessor.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::safety::injection::InjectionDetection;
use crate::safety::pii::PiiDetection;

/// Severity classification for a query or an output.
///
/// Variant order is load-bearing: aggregation takes the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub const ALL: [RiskLevel; 4] = [Self::Low, Self::Medium, Self::High, Self::Critical];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(ConfigError::InvalidValue {
                key: "risk_level".to_string(),
                message: format!("unknown risk level '{other}'"),
            }),
        }
    }
}

/// Which check produced a [`SafetyCheckResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyCheckType {
    PiiDetection,
    SqlInjection,
    QueryComplexity,
    DataAccess,
    OutputFiltering,
}

/// Check-specific payload attached to a [`SafetyCheckResult`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckDetails {
    Pii {
        detections: Vec<PiiDetection>,
    },
    Injection {
        detections: Vec<InjectionDetection>,
    },
    Complexity {
        complexity_score: u32,
        max_complexity: u32,
        issues: Vec<String>,
        dangerous_operations: Vec<String>,
    },
    DataAccess {
        issues: Vec<String>,
    },
    Output {
        detections: Vec<PiiDetection>,
        /// Copy of the output with every detected span redacted.
        #[serde(skip_serializing_if = "Option::is_none")]
        filtered_output: Option<String>,
    },
}

/// One detector's verdict. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetyCheckResult {
    pub check_type: SafetyCheckType,
    /// Whether the detector found nothing to report.
    pub passed: bool,
    pub risk_level: RiskLevel,
    /// Detector confidence in `[0, 1]`.
    pub confidence: f64,
    /// Human-readable summary of what was found.
    pub message: String,
    pub details: CheckDetails,
    /// When the check ran.
    pub timestamp: DateTime<Utc>,
}

impl SafetyCheckResult {
    /// Build a result stamped with the current time. `confidence` is
    /// clamped into `[0, 1]`.
    pub fn new(
        check_type: SafetyCheckType,
        passed: bool,
        risk_level: RiskLevel,
        confidence: f64,
        message: impl Into<String>,
        details: CheckDetails,
    ) -> Self {
        Self {
            check_type,
            passed,
            risk_level,
            confidence: confidence.clamp(0.0, 1.0),
            message: message.into(),
            details,
            timestamp: Utc::now(),
        }
    }

    /// Redacted output text, present only on failed output checks.
    pub fn filtered_output(&self) -> Option<&str> {
        match &self.details {
            CheckDetails::Output {
                filtered_output, ..
            } => filtered_output.as_deref(),
            _ => None,
        }
    }

    /// JSON form with snake_case enum values and an RFC 3339 timestamp.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Aggregate verdict over every check run for one query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetyAssessment {
    /// Highest risk among failed checks, or `Low` when all passed.
    pub overall_risk: RiskLevel,
    pub passed_all: bool,
    /// One result per check, in run order.
    pub results: Vec<SafetyCheckResult>,
    /// Deduplicated advice, in the order it was first produced.
    pub recommendations: Vec<String>,
    /// Set when `overall_risk` is not allowed by the risk thresholds.
    pub blocked: bool,
    /// Present exactly when `blocked` is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl SafetyAssessment {
    /// The result produced by a given check, if it ran.
    pub fn result(&self, check_type: SafetyCheckType) -> Option<&SafetyCheckResult> {
        self.results.iter().find(|r| r.check_type == check_type)
    }

    /// Results of checks that did not pass.
    pub fn failed_checks(&self) -> impl Iterator<Item = &SafetyCheckResult> {
        self.results.iter().filter(|r| !r.passed)
    }

    /// JSON form with every result nested.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Table metadata optionally supplied with a query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaInfo {
    /// Tables the query may touch; matched against sensitive-table names.
    #[serde(default)]
    pub tables: Vec<TableInfo>,
}

/// One table of a [`SchemaInfo`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    #[serde(default)]
    pub columns: Vec<String>,
}

impl SchemaInfo {
    /// Schema of bare table names without column lists.
    pub fn with_tables<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tables: names
                .into_iter()
                .map(|name| TableInfo {
                    name: name.into(),
                    columns: Vec::new(),
                })
                .collect(),
        }
    }
}

/// Caller-supplied context for a query assessment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssessmentContext {
    /// Enables the sensitive-table part of the complexity check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_info: Option<SchemaInfo>,
}

impl AssessmentContext {
    /// Context carrying only schema metadata.
    pub fn with_schema(schema_info: SchemaInfo) -> Self {
        Self {
            schema_info: Some(schema_info),
        }
    }
}
