//! Operation authorization and row-filter rewriting.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{ConfigError, PermissionError};
use crate::permissions::model::{EffectivePermission, GlobalSettings, Operation, Principal};
use crate::permissions::statement::{Statement, TableRef};
use crate::permissions::store::{PermissionStore, RuleSet};

/// Checks statements against the permission store and splices row filters
/// into the ones that are allowed.
#[derive(Clone)]
pub struct PermissionChecker {
    store: Arc<PermissionStore>,
}

impl PermissionChecker {
    pub fn new(store: Arc<PermissionStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<PermissionStore> {
        &self.store
    }

    /// Authorize `sql` for `principal` and return the rewritten statement
    /// plus warnings describing the rewrite.
    ///
    /// The whole call works on one rule snapshot, so a concurrent reload
    /// cannot mix old and new rules within a single check.
    pub fn check_and_transform_query(
        &self,
        sql: &str,
        principal: &Principal,
    ) -> Result<(String, Vec<String>), PermissionError> {
        let rules = self.store.snapshot();
        let settings = rules.settings();

        if !settings.enabled {
            tracing::warn!(
                user = %principal.username,
                "Permission checks are disabled, statement passed through unchanged"
            );
            return Ok((sql.to_string(), Vec::new()));
        }

        transform(&rules, sql, principal)
            .map_err(|e| refuse(settings, principal, sql, e))
    }

    /// Whether `principal` may see `column` of `table`.
    pub fn check_column_access(&self, table: &str, column: &str, principal: &Principal) -> bool {
        let rules = self.store.snapshot();
        if !rules.settings().enabled {
            return true;
        }
        let allowed = rules.resolve(table, principal).column_allowed(column);
        if !allowed && rules.settings().log_checks {
            tracing::warn!(
                user = %principal.username,
                table,
                column,
                "Column access denied"
            );
        }
        allowed
    }

    /// Re-read the permission file; see [`PermissionStore::reload`].
    pub fn reload_permissions(&self) -> Result<(), ConfigError> {
        self.store.reload()
    }
}

fn transform(
    rules: &RuleSet,
    sql: &str,
    principal: &Principal,
) -> Result<(String, Vec<String>), PermissionError> {
    let Some(statement) = Statement::parse(sql, rules.settings().sql_dialect)? else {
        return Ok((sql.to_string(), Vec::new()));
    };
    let operation = statement.operation;

    let targets = resolve_all(rules, &statement.targets, principal);
    let reads = resolve_all(rules, &statement.reads, principal);

    for (table, permission) in &targets {
        if !permission.allows(operation) {
            return Err(not_allowed(principal, operation, table));
        }
    }
    for (table, permission) in &reads {
        if !permission.allows(Operation::Select) {
            return Err(not_allowed(principal, Operation::Select, table));
        }
    }

    if let Some((table, _)) = targets
        .iter()
        .chain(reads.iter())
        .find(|(_, permission)| permission.is_inaccessible())
    {
        return Err(PermissionError::denied(format!(
            "Access to table {table} is not permitted"
        )));
    }

    if let Some((table, _)) = reads.iter().find(|(_, p)| p.row_filter.is_some()) {
        return Err(PermissionError::denied(format!(
            "Table {table} is row-restricted and may only be used as a top-level table"
        )));
    }

    if !operation.takes_row_filter() {
        return Ok((sql.to_string(), Vec::new()));
    }

    let filters: Vec<String> = targets
        .iter()
        .filter_map(|(_, permission)| permission.row_filter.as_deref())
        .map(|filter| format!("({filter})"))
        .collect();
    if filters.is_empty() {
        return Ok((sql.to_string(), Vec::new()));
    }

    let combined = filters.join(" AND ");
    let rewritten = statement.splice_filter(&combined)?;
    if rewritten == sql {
        return Ok((rewritten, Vec::new()));
    }

    tracing::info!(
        user = %principal.username,
        operation = %operation,
        filter = %combined,
        "Row-level filter applied"
    );
    let tables: Vec<&str> = targets.iter().map(|(t, _)| t.as_str()).collect();
    let warnings = vec![format!(
        "Row-level filter applied on {}: {combined}",
        tables.join(", ")
    )];
    Ok((rewritten, warnings))
}

/// Resolve each table once, keyed case-insensitively, in first-seen order.
fn resolve_all(
    rules: &RuleSet,
    tables: &[TableRef],
    principal: &Principal,
) -> Vec<(String, EffectivePermission)> {
    let mut seen = HashSet::new();
    tables
        .iter()
        .filter(|t| seen.insert(t.name.to_lowercase()))
        .map(|t| (t.name.clone(), rules.resolve(&t.name, principal)))
        .collect()
}

fn not_allowed(principal: &Principal, operation: Operation, table: &str) -> PermissionError {
    PermissionError::denied(format!(
        "User {} is not allowed to {operation} on table {table}",
        principal.username
    ))
}

/// Log the detailed reason; hide it from the caller unless verbose errors
/// are on.
fn refuse(
    settings: &GlobalSettings,
    principal: &Principal,
    sql: &str,
    err: PermissionError,
) -> PermissionError {
    tracing::warn!(
        user = %principal.username,
        user_type = principal.user_type.as_deref().unwrap_or_default(),
        reason = err.reason(),
        sql,
        "Statement denied"
    );
    if settings.verbose_errors {
        err
    } else {
        PermissionError::denied(settings.access_denied_message.clone())
    }
}
