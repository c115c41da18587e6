//! Risk assessment for machine-generated SQL.
//!
//! This module classifies a candidate query along independent risk
//! dimensions and aggregates them into one verdict:
//! - PII exposure in the query text
//! - SQL injection patterns
//! - Structural complexity and dangerous keywords
//! - Access to sensitive data and bulk aggregation
//!
//! It also scans free-text answers for leaked PII and redacts it.

mod data_access;
pub mod injection;
pub mod pii;
mod types;
mod validator;

use std::borrow::Cow;

pub use data_access::DataAccessChecker;
pub use injection::{InjectionDetection, InjectionDetector, InjectionFamily};
pub use pii::{PiiDetection, PiiDetector, PiiType};
pub use types::{
    AssessmentContext, CheckDetails, RiskLevel, SafetyAssessment, SafetyCheckResult,
    SafetyCheckType, SchemaInfo, TableInfo,
};
pub use validator::QueryValidator;

use crate::config::SafetyConfig;

/// The risk assessor. Holds no mutable state; share one instance freely.
pub struct SafetyManager {
    pii_detector: PiiDetector,
    injection_detector: InjectionDetector,
    query_validator: QueryValidator,
    data_access: DataAccessChecker,
    config: SafetyConfig,
}

impl SafetyManager {
    pub fn new(config: &SafetyConfig) -> Self {
        Self {
            pii_detector: PiiDetector::new(config.pii_confidence.clone()),
            injection_detector: InjectionDetector::new(config.injection_confidence.clone()),
            query_validator: QueryValidator::new(config.max_query_complexity),
            data_access: DataAccessChecker::new(
                &config.sensitive_tables,
                &config.sensitive_columns,
            ),
            config: config.clone(),
        }
    }

    /// Run all four checks over `query` and aggregate them.
    ///
    /// Checks never short-circuit; every assessment carries four results.
    pub fn assess_query(
        &self,
        query: &str,
        context: Option<&AssessmentContext>,
    ) -> SafetyAssessment {
        let schema = context.and_then(|c| c.schema_info.as_ref());

        let results = vec![
            self.check_pii(query),
            self.check_injection(query),
            self.query_validator.validate(query, schema),
            self.data_access.check(query),
        ];

        let assessment = self.aggregate(results);

        tracing::info!(
            overall_risk = %assessment.overall_risk,
            passed_all = assessment.passed_all,
            blocked = assessment.blocked,
            "Safety assessment completed"
        );
        if assessment.blocked {
            tracing::warn!(
                reason = assessment.block_reason.as_deref().unwrap_or_default(),
                failed = ?assessment
                    .failed_checks()
                    .map(|r| r.check_type)
                    .collect::<Vec<_>>(),
                "Query blocked by risk policy"
            );
        }

        assessment
    }

    /// Scan a free-text answer for PII, attaching a redacted copy on hits.
    pub fn assess_output(&self, output: &str, original_query: &str) -> SafetyCheckResult {
        let detections = self.pii_detector.detect(output);

        if detections.is_empty() {
            return SafetyCheckResult::new(
                SafetyCheckType::OutputFiltering,
                true,
                RiskLevel::Low,
                0.95,
                "Output safety check passed",
                CheckDetails::Output {
                    detections,
                    filtered_output: None,
                },
            );
        }

        let filtered = pii::redact(output, &detections, &self.config.redaction_token);
        tracing::warn!(
            instances = detections.len(),
            query_len = original_query.len(),
            "PII detected in output"
        );

        SafetyCheckResult::new(
            SafetyCheckType::OutputFiltering,
            false,
            RiskLevel::High,
            0.9,
            format!("PII detected in output: {} instances", detections.len()),
            CheckDetails::Output {
                detections,
                filtered_output: Some(filtered),
            },
        )
    }

    /// Safe to run only when not blocked and every check passed.
    pub fn is_safe_to_execute(&self, assessment: &SafetyAssessment) -> bool {
        !assessment.blocked && assessment.passed_all
    }

    /// The text a caller should show for `output` given its output check.
    pub fn safe_output<'a>(&self, output: &'a str, output_check: &SafetyCheckResult) -> Cow<'a, str> {
        if output_check.check_type != SafetyCheckType::OutputFiltering || output_check.passed {
            return Cow::Borrowed(output);
        }
        match output_check.filtered_output() {
            Some(filtered) => Cow::Owned(filtered.to_string()),
            None => Cow::Borrowed(output),
        }
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    pub fn pii_detector(&self) -> &PiiDetector {
        &self.pii_detector
    }

    pub fn injection_detector(&self) -> &InjectionDetector {
        &self.injection_detector
    }

    pub fn query_validator(&self) -> &QueryValidator {
        &self.query_validator
    }

    fn check_pii(&self, text: &str) -> SafetyCheckResult {
        let detections = self.pii_detector.detect(text);

        let Some(max_confidence) = detections.iter().map(|d| d.confidence).reduce(f64::max)
        else {
            return SafetyCheckResult::new(
                SafetyCheckType::PiiDetection,
                true,
                RiskLevel::Low,
                0.9,
                "No PII detected",
                CheckDetails::Pii { detections },
            );
        };

        let risk_level = if max_confidence > self.config.pii_high_risk_above {
            RiskLevel::High
        } else {
            RiskLevel::Medium
        };

        SafetyCheckResult::new(
            SafetyCheckType::PiiDetection,
            false,
            risk_level,
            max_confidence,
            format!("PII detected: {} instances", detections.len()),
            CheckDetails::Pii { detections },
        )
    }

    fn check_injection(&self, query: &str) -> SafetyCheckResult {
        let detections = self.injection_detector.detect(query);

        let Some(max_confidence) = injection::max_confidence(&detections) else {
            return SafetyCheckResult::new(
                SafetyCheckType::SqlInjection,
                true,
                RiskLevel::Low,
                0.85,
                "No SQL injection patterns detected",
                CheckDetails::Injection { detections },
            );
        };

        SafetyCheckResult::new(
            SafetyCheckType::SqlInjection,
            false,
            self.config.injection_risk.risk_for(max_confidence),
            max_confidence,
            format!(
                "Potential SQL injection detected: {} patterns",
                detections.len()
            ),
            CheckDetails::Injection { detections },
        )
    }

    fn aggregate(&self, results: Vec<SafetyCheckResult>) -> SafetyAssessment {
        let passed_all = results.iter().all(|r| r.passed);
        let overall_risk = results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| r.risk_level)
            .max()
            .unwrap_or(RiskLevel::Low);

        let recommendations = results
            .iter()
            .filter(|r| !r.passed)
            .filter_map(|r| recommendation_for(r.check_type))
            .map(str::to_string)
            .collect();

        let blocked = !self.config.risk_thresholds.allows(overall_risk);
        let block_reason =
            blocked.then(|| format!("Query blocked due to {overall_risk} risk level"));

        SafetyAssessment {
            overall_risk,
            passed_all,
            results,
            recommendations,
            blocked,
            block_reason,
            timestamp: chrono::Utc::now(),
        }
    }
}

impl Default for SafetyManager {
    fn default() -> Self {
        Self::new(&SafetyConfig::default())
    }
}

fn recommendation_for(check_type: SafetyCheckType) -> Option<&'static str> {
    match check_type {
        SafetyCheckType::PiiDetection => {
            Some("Remove or mask personally identifiable information before sending the query")
        }
        SafetyCheckType::SqlInjection => Some("Review the query for potential SQL injection patterns"),
        SafetyCheckType::QueryComplexity => {
            Some("Simplify the query or break it into smaller parts")
        }
        SafetyCheckType::DataAccess => {
            Some("Review data access patterns and consider less sensitive alternatives")
        }
        SafetyCheckType::OutputFiltering => None,
    }
}
