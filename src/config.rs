//! Configuration for the governance layer.
//!
//! Safety settings come from the environment (optionally seeded from a
//! `.env` file). Permission rules live in a separate YAML file loaded by
//! [`crate::permissions::PermissionStore`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogFormat;
use crate::safety::RiskLevel;

/// Default location of the permission rule file.
pub const DEFAULT_PERMISSIONS_PATH: &str = "config/permissions.yaml";

/// Which risk levels are allowed to execute (`true` = allowed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskThresholds {
    /// Whether `Low` risk queries may run.
    pub low: bool,
    /// Whether `Medium` risk queries may run.
    pub medium: bool,
    /// Whether `High` risk queries may run.
    pub high: bool,
    /// Whether `Critical` risk queries may run.
    pub critical: bool,
}

impl RiskThresholds {
    /// Allow every level up to and including `max`.
    pub fn allow_up_to(max: RiskLevel) -> Self {
        Self {
            low: RiskLevel::Low <= max,
            medium: RiskLevel::Medium <= max,
            high: RiskLevel::High <= max,
            critical: RiskLevel::Critical <= max,
        }
    }

    /// Whether a query assessed at `level` may run.
    pub fn allows(&self, level: RiskLevel) -> bool {
        match level {
            RiskLevel::Low => self.low,
            RiskLevel::Medium => self.medium,
            RiskLevel::High => self.high,
            RiskLevel::Critical => self.critical,
        }
    }
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self::allow_up_to(RiskLevel::Medium)
    }
}

/// Base confidence per PII type, before plausibility discounts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PiiConfidence {
    pub email: f64,
    pub phone: f64,
    pub national_id: f64,
    pub payment_card: f64,
    pub ip_address: f64,
    pub url: f64,
    /// Multiplier for phone numbers that do not have exactly ten digits.
    pub phone_digit_penalty: f64,
    /// Multiplier for national IDs failing the structural check.
    pub national_id_penalty: f64,
}

impl Default for PiiConfidence {
    fn default() -> Self {
        Self {
            email: 0.9,
            phone: 0.8,
            national_id: 0.95,
            payment_card: 0.9,
            ip_address: 0.7,
            url: 0.6,
            phone_digit_penalty: 0.5,
            national_id_penalty: 0.3,
        }
    }
}

/// Confidence tier per injection rule family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectionConfidence {
    pub stacked_query: f64,
    pub union_select: f64,
    pub comment: f64,
    pub tautology: f64,
    pub timing: f64,
    pub exec: f64,
    pub keyword: f64,
}

impl Default for InjectionConfidence {
    fn default() -> Self {
        Self {
            stacked_query: 0.95,
            union_select: 0.95,
            comment: 0.9,
            tautology: 0.85,
            timing: 0.9,
            exec: 0.95,
            keyword: 0.7,
        }
    }
}

/// Maps the strongest injection confidence onto a risk level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectionRiskCutoffs {
    /// Confidence strictly above this is `Critical`.
    pub critical_above: f64,
    /// Confidence at or above this is `High`; anything lower is `Medium`.
    pub high_at_least: f64,
}

impl InjectionRiskCutoffs {
    /// Risk level for an injection hit of `confidence`.
    ///
    /// With the defaults a bare keyword hit (0.7) is `Medium` and stays
    /// executable, so ordinary `SELECT`s are not blocked. This is a
    /// deliberate departure from treating every injection hit as at least
    /// `High`; set `high_at_least` to `0.0` to get that stricter mapping.
    pub fn risk_for(&self, confidence: f64) -> RiskLevel {
        if confidence > self.critical_above {
            RiskLevel::Critical
        } else if confidence >= self.high_at_least {
            RiskLevel::High
        } else {
            RiskLevel::Medium
        }
    }
}

impl Default for InjectionRiskCutoffs {
    fn default() -> Self {
        Self {
            critical_above: 0.9,
            high_at_least: 0.85,
        }
    }
}

/// Risk assessor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub max_query_complexity: u32,
    pub risk_thresholds: RiskThresholds,
    pub sensitive_tables: Vec<String>,
    pub sensitive_columns: Vec<String>,
    pub pii_confidence: PiiConfidence,
    /// PII hits with a confidence above this are `High`, otherwise `Medium`.
    pub pii_high_risk_above: f64,
    pub injection_confidence: InjectionConfidence,
    pub injection_risk: InjectionRiskCutoffs,
    pub redaction_token: String,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_query_complexity: 100,
            risk_thresholds: RiskThresholds::default(),
            sensitive_tables: Vec::new(),
            sensitive_columns: Vec::new(),
            pii_confidence: PiiConfidence::default(),
            pii_high_risk_above: 0.8,
            injection_confidence: InjectionConfidence::default(),
            injection_risk: InjectionRiskCutoffs::default(),
            redaction_token: "[REDACTED]".to_string(),
        }
    }
}

impl SafetyConfig {
    /// Apply `SQLGOV_*` overrides found through `lookup` on top of the defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("SQLGOV_MAX_QUERY_COMPLEXITY") {
            config.max_query_complexity =
                raw.trim()
                    .parse()
                    .map_err(|e: std::num::ParseIntError| ConfigError::InvalidValue {
                        key: "SQLGOV_MAX_QUERY_COMPLEXITY".to_string(),
                        message: e.to_string(),
                    })?;
            if config.max_query_complexity == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "SQLGOV_MAX_QUERY_COMPLEXITY".to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }

        if let Some(raw) = lookup("SQLGOV_MAX_ALLOWED_RISK") {
            let level: RiskLevel = raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "SQLGOV_MAX_ALLOWED_RISK".to_string(),
                message: format!("expected low|medium|high|critical, got '{raw}'"),
            })?;
            config.risk_thresholds = RiskThresholds::allow_up_to(level);
        }

        if let Some(raw) = lookup("SQLGOV_SENSITIVE_TABLES") {
            config.sensitive_tables = split_list(&raw);
        }
        if let Some(raw) = lookup("SQLGOV_SENSITIVE_COLUMNS") {
            config.sensitive_columns = split_list(&raw);
        }
        if let Some(raw) = lookup("SQLGOV_REDACTION_TOKEN") {
            if !raw.is_empty() {
                config.redaction_token = raw;
            }
        }

        Ok(config)
    }
}

/// Everything needed to construct a [`crate::SqlGovernance`] instance.
#[derive(Debug, Clone, PartialEq)]
pub struct GovernanceConfig {
    pub safety: SafetyConfig,
    pub permissions_path: PathBuf,
    pub log_format: LogFormat,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            safety: SafetyConfig::default(),
            permissions_path: PathBuf::from(DEFAULT_PERMISSIONS_PATH),
            log_format: LogFormat::default(),
        }
    }
}

impl GovernanceConfig {
    /// Load from the process environment after reading `.env` if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let safety = SafetyConfig::from_lookup(&lookup)?;
        let permissions_path = lookup("SQLGOV_PERMISSIONS_PATH")
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PERMISSIONS_PATH));
        let log_format = match lookup("SQLGOV_LOG_FORMAT") {
            Some(raw) => raw.parse()?,
            None => LogFormat::default(),
        };

        Ok(Self {
            safety,
            permissions_path,
            log_format,
        })
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_thresholds_block_high_and_critical() {
        let thresholds = RiskThresholds::default();
        assert!(thresholds.allows(RiskLevel::Low));
        assert!(thresholds.allows(RiskLevel::Medium));
        assert!(!thresholds.allows(RiskLevel::High));
        assert!(!thresholds.allows(RiskLevel::Critical));
    }

    #[test]
    fn test_injection_risk_cutoffs() {
        let cutoffs = InjectionRiskCutoffs::default();
        assert_eq!(cutoffs.risk_for(0.95), RiskLevel::Critical);
        assert_eq!(cutoffs.risk_for(0.9), RiskLevel::High);
        assert_eq!(cutoffs.risk_for(0.85), RiskLevel::High);
        assert_eq!(cutoffs.risk_for(0.7), RiskLevel::Medium);

        let strict = InjectionRiskCutoffs {
            high_at_least: 0.0,
            ..InjectionRiskCutoffs::default()
        };
        assert_eq!(strict.risk_for(0.7), RiskLevel::High);
        assert_eq!(strict.risk_for(0.95), RiskLevel::Critical);
    }

    #[test]
    fn test_empty_environment_gives_defaults() {
        let config = GovernanceConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, GovernanceConfig::default());
        assert_eq!(config.safety.max_query_complexity, 100);
        assert_eq!(config.safety.redaction_token, "[REDACTED]");
    }

    #[test]
    fn test_environment_overrides() {
        let config = GovernanceConfig::from_lookup(lookup_from(&[
            ("SQLGOV_MAX_QUERY_COMPLEXITY", "40"),
            ("SQLGOV_MAX_ALLOWED_RISK", "low"),
            ("SQLGOV_SENSITIVE_TABLES", "salaries, audit_log,"),
            ("SQLGOV_PERMISSIONS_PATH", "/etc/sqlgov/permissions.yaml"),
            ("SQLGOV_LOG_FORMAT", "json"),
        ]))
        .unwrap();

        assert_eq!(config.safety.max_query_complexity, 40);
        assert!(!config.safety.risk_thresholds.allows(RiskLevel::Medium));
        assert_eq!(config.safety.sensitive_tables, vec!["salaries", "audit_log"]);
        assert_eq!(
            config.permissions_path,
            PathBuf::from("/etc/sqlgov/permissions.yaml")
        );
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_complexity_is_rejected() {
        let err = SafetyConfig::from_lookup(lookup_from(&[(
            "SQLGOV_MAX_QUERY_COMPLEXITY",
            "lots",
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("SQLGOV_MAX_QUERY_COMPLEXITY"));

        let err = SafetyConfig::from_lookup(lookup_from(&[("SQLGOV_MAX_QUERY_COMPLEXITY", "0")]))
            .unwrap_err();
        assert!(err.to_string().contains("greater than zero"));
    }

    #[test]
    fn test_invalid_risk_level_is_rejected() {
        let err =
            SafetyConfig::from_lookup(lookup_from(&[("SQLGOV_MAX_ALLOWED_RISK", "extreme")]))
                .unwrap_err();
        assert!(err.to_string().contains("extreme"));
    }

    #[test]
    fn test_safety_config_partial_yaml() {
        let config: SafetyConfig =
            serde_yaml::from_str("max_query_complexity: 50\npii_confidence:\n  url: 0.4\n")
                .unwrap();
        assert_eq!(config.max_query_complexity, 50);
        assert_eq!(config.pii_confidence.url, 0.4);
        assert_eq!(config.pii_confidence.email, 0.9);
        assert_eq!(config.risk_thresholds, RiskThresholds::default());
    }
}
