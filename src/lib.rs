//! Governance layer for machine-generated SQL.
//!
//! Two independent engines sit between a query generator and the database:
//!
//! - [`safety::SafetyManager`] scores a candidate query for PII exposure,
//!   injection patterns, structural complexity and sensitive data access, and
//!   decides whether it is blocked under the configured risk thresholds.
//! - [`permissions::PermissionChecker`] authorizes the statement for a
//!   principal against a YAML rule file and splices row-level filters into
//!   its WHERE clause.
//!
//! [`SqlGovernance`] wires both together behind the function-level API.

pub mod config;
pub mod error;
pub mod hot_reload;
pub mod logging;
pub mod permissions;
pub mod safety;

use std::sync::Arc;

use serde::Serialize;

pub use config::{GovernanceConfig, RiskThresholds, SafetyConfig};
pub use error::{ConfigError, Error, PermissionError, Result};
pub use permissions::{
    EffectivePermission, Operation, PermissionChecker, PermissionStore, Principal,
};
pub use safety::{
    AssessmentContext, RiskLevel, SafetyAssessment, SafetyCheckResult, SafetyCheckType,
    SafetyManager, SchemaInfo,
};

/// Outcome of [`SqlGovernance::authorize_query`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Verdict {
    /// The statement may run as `sql`.
    Approved {
        sql: String,
        warnings: Vec<String>,
        assessment: SafetyAssessment,
    },
    /// The rewritten statement was blocked by the risk policy.
    Blocked { assessment: SafetyAssessment },
}

impl Verdict {
    /// Whether the statement may run.
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved { .. })
    }

    /// Risk assessment of the rewritten statement.
    pub fn assessment(&self) -> &SafetyAssessment {
        match self {
            Self::Approved { assessment, .. } | Self::Blocked { assessment } => assessment,
        }
    }
}

/// Risk assessor plus permission rewriter sharing one configuration.
pub struct SqlGovernance {
    safety: SafetyManager,
    permissions: PermissionChecker,
}

impl SqlGovernance {
    /// Build from configuration, loading the permission file.
    ///
    /// A missing or invalid permission file does not fail construction; the
    /// store falls back to default-deny and logs the error.
    pub fn new(config: &GovernanceConfig) -> Self {
        let store = Arc::new(PermissionStore::load(&config.permissions_path));
        Self::from_parts(SafetyManager::new(&config.safety), PermissionChecker::new(store))
    }

    /// Like [`SqlGovernance::new`], but an unreadable or invalid permission
    /// file is an error instead of a default-deny fallback.
    pub fn try_new(config: &GovernanceConfig) -> Result<Self> {
        let store = Arc::new(PermissionStore::try_load(&config.permissions_path)?);
        Ok(Self::from_parts(
            SafetyManager::new(&config.safety),
            PermissionChecker::new(store),
        ))
    }

    /// Build from `SQLGOV_*` environment variables (and `.env`).
    pub fn from_env() -> Result<Self> {
        let config = GovernanceConfig::from_env()?;
        Ok(Self::new(&config))
    }

    /// Assemble from already-built engines, e.g. sharing one store.
    pub fn from_parts(safety: SafetyManager, permissions: PermissionChecker) -> Self {
        Self {
            safety,
            permissions,
        }
    }

    pub fn safety(&self) -> &SafetyManager {
        &self.safety
    }

    pub fn permissions(&self) -> &PermissionChecker {
        &self.permissions
    }

    /// Run all query checks; see [`SafetyManager::assess_query`].
    pub fn assess_query_safety(
        &self,
        sql: &str,
        context: Option<&AssessmentContext>,
    ) -> SafetyAssessment {
        self.safety.assess_query(sql, context)
    }

    /// Scan a query result for PII and redact it.
    pub fn assess_output_safety(&self, output: &str, original_query: &str) -> SafetyCheckResult {
        self.safety.assess_output(output, original_query)
    }

    /// Authorize `sql` for a user and splice in row filters.
    ///
    /// Returns the statement to run and warnings describing the rewrite.
    pub fn check_and_transform_query(
        &self,
        sql: &str,
        username: &str,
        user_type: Option<&str>,
    ) -> std::result::Result<(String, Vec<String>), PermissionError> {
        let mut principal = Principal::new(username);
        principal.user_type = user_type.map(str::to_string);
        self.permissions.check_and_transform_query(sql, &principal)
    }

    /// Whether the user may see `column` of `table`.
    pub fn check_column_access(
        &self,
        table: &str,
        column: &str,
        username: &str,
        user_type: Option<&str>,
    ) -> bool {
        let mut principal = Principal::new(username);
        principal.user_type = user_type.map(str::to_string);
        self.permissions.check_column_access(table, column, &principal)
    }

    /// Re-read the permission file. On failure the store serves
    /// default-deny rules until a later reload succeeds.
    pub fn reload_permissions(&self) -> std::result::Result<(), ConfigError> {
        self.permissions.reload_permissions()
    }

    /// Rewrite `sql` for `principal`, then assess the rewritten statement.
    ///
    /// A permission refusal is an [`Error::Permission`]; a risk block is a
    /// [`Verdict`].
    pub fn authorize_query(
        &self,
        sql: &str,
        principal: &Principal,
        context: Option<&AssessmentContext>,
    ) -> Result<Verdict> {
        let (rewritten, warnings) = self.permissions.check_and_transform_query(sql, principal)?;
        let assessment = self.safety.assess_query(&rewritten, context);

        if assessment.blocked {
            return Ok(Verdict::Blocked { assessment });
        }
        Ok(Verdict::Approved {
            sql: rewritten,
            warnings,
            assessment,
        })
    }
}
