//! Permission file model and resolved permissions.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Statement operation subject to authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Operation {
    Select,
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Select => "SELECT",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    /// Whether row filters are spliced into statements of this kind.
    pub fn takes_row_filter(&self) -> bool {
        !matches!(self, Self::Insert)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SELECT" => Ok(Self::Select),
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(ConfigError::UnknownOperation(other.to_string())),
        }
    }
}

impl TryFrom<String> for Operation {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Operation> for String {
    fn from(op: Operation) -> Self {
        op.as_str().to_string()
    }
}

/// The acting identity on whose behalf a statement runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    /// Substituted into `{username}` and matched by role patterns.
    pub username: String,
    /// Preferred role key; matched before any role pattern.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_type: Option<String>,
}

impl Principal {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            user_type: None,
        }
    }

    pub fn with_user_type(mut self, user_type: impl Into<String>) -> Self {
        self.user_type = Some(user_type.into());
        self
    }
}

/// SQL dialect whose lexical rules statements are analysed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    /// `#` comments, backtick identifiers, double-quoted strings.
    #[default]
    MySql,
    /// Double-quoted identifiers, dollar-quoted strings.
    #[serde(alias = "postgres", alias = "opengauss")]
    PostgreSql,
    Generic,
}

/// `global_settings` section of the permission file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    /// When false every statement passes through unchanged.
    pub enabled: bool,
    /// Log each resolution and denial.
    pub log_checks: bool,
    /// Return detailed refusal reasons instead of `access_denied_message`.
    pub verbose_errors: bool,
    /// Refusal text used when `verbose_errors` is off.
    pub access_denied_message: String,
    /// Dialect of the statements being checked.
    pub sql_dialect: SqlDialect,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            log_checks: true,
            verbose_errors: true,
            access_denied_message: "You do not have permission to access this data".to_string(),
            sql_dialect: SqlDialect::default(),
        }
    }
}

/// `default_permission` section: what an unmatched (table, principal) gets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultPermission {
    /// Empty unless configured.
    #[serde(default)]
    pub allowed_operations: Vec<Operation>,
    /// Defaults to no columns, which makes unmatched tables inaccessible.
    #[serde(default = "no_columns")]
    pub allowed_columns: Option<Vec<String>>,
    /// Defaults to a predicate matching no row.
    #[serde(default = "deny_all_rows")]
    pub row_filter: Option<String>,
    #[serde(default)]
    pub forbidden_columns: Option<Vec<String>>,
}

fn no_columns() -> Option<Vec<String>> {
    Some(Vec::new())
}

fn deny_all_rows() -> Option<String> {
    Some(DENY_ALL_ROWS.to_string())
}

/// Predicate that matches no row.
pub const DENY_ALL_ROWS: &str = "1=0";

impl Default for DefaultPermission {
    fn default() -> Self {
        Self {
            allowed_operations: Vec::new(),
            allowed_columns: no_columns(),
            row_filter: deny_all_rows(),
            forbidden_columns: None,
        }
    }
}

/// One role entry under a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleRule {
    /// Matched exactly against the principal's user type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_type: Option<String>,
    /// Legacy fallback: regex matched against the start of the username.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_pattern: Option<String>,
    /// Operations granted on the table.
    #[serde(default)]
    pub allowed_operations: Vec<Operation>,
    /// `None` allows every column, `Some([])` makes the table inaccessible.
    #[serde(default)]
    pub allowed_columns: Option<Vec<String>>,
    /// Denied even when `allowed_columns` would allow them.
    #[serde(default)]
    pub forbidden_columns: Option<Vec<String>>,
    /// May contain `{username}`, substituted at resolve time.
    #[serde(default)]
    pub row_filter: Option<String>,
}

/// Role entries for one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TablePermissions {
    /// Matched case-insensitively against unqualified table names.
    pub table: String,
    /// Tried in order; the first match wins within each matching pass.
    #[serde(default)]
    pub roles: Vec<RoleRule>,
}

/// The whole permission file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PermissionFile {
    #[serde(default)]
    pub global_settings: GlobalSettings,
    #[serde(default)]
    pub default_permission: DefaultPermission,
    #[serde(default)]
    pub permissions: Vec<TablePermissions>,
}

/// Which rule produced an [`EffectivePermission`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PermissionSource {
    UserType(String),
    RolePattern(String),
    Default,
}

/// Permission of one principal on one table after rule matching.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectivePermission {
    pub allowed_operations: BTreeSet<Operation>,
    /// `None` means every column.
    pub allowed_columns: Option<Vec<String>>,
    /// Predicate with `{username}` already substituted.
    pub row_filter: Option<String>,
    pub forbidden_columns: Vec<String>,
    /// The rule that produced this permission.
    pub source: PermissionSource,
}

impl EffectivePermission {
    pub fn allows(&self, operation: Operation) -> bool {
        self.allowed_operations.contains(&operation)
    }

    /// `allowed_columns` is an explicit empty list.
    pub fn is_inaccessible(&self) -> bool {
        matches!(&self.allowed_columns, Some(cols) if cols.is_empty())
    }

    /// Forbidden list wins, then the allow list (absent means all).
    pub fn column_allowed(&self, column: &str) -> bool {
        if self
            .forbidden_columns
            .iter()
            .any(|c| c.eq_ignore_ascii_case(column))
        {
            return false;
        }
        match &self.allowed_columns {
            None => true,
            Some(cols) => cols.iter().any(|c| c.eq_ignore_ascii_case(column)),
        }
    }

    pub fn is_default(&self) -> bool {
        self.source == PermissionSource::Default
    }
}
