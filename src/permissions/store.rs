//! Permission rule store with atomic reload.
//!
//! The rule table is built off to the side and published with a single
//! pointer swap, so a concurrent [`PermissionStore::resolve`] sees either the
//! old or the new table, never a mix. The read path takes no lock.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use regex::Regex;

use crate::error::ConfigError;
use crate::permissions::model::{
    DENY_ALL_ROWS, DefaultPermission, EffectivePermission, GlobalSettings, PermissionFile,
    PermissionSource, Principal, RoleRule,
};

enum RoleMatcher {
    UserType(String),
    Pattern { source: String, regex: Regex },
}

struct CompiledRole {
    matchers: Vec<RoleMatcher>,
    rule: RoleRule,
}

/// Immutable, compiled form of a permission file.
pub struct RuleSet {
    settings: GlobalSettings,
    default_permission: DefaultPermission,
    tables: HashMap<String, Vec<CompiledRole>>,
}

impl RuleSet {
    /// Compile a parsed file. Fails on empty role matchers or bad regexes.
    pub fn compile(file: PermissionFile) -> Result<Self, ConfigError> {
        let mut tables: HashMap<String, Vec<CompiledRole>> = HashMap::new();

        for entry in file.permissions {
            let key = entry.table.trim().to_lowercase();
            for rule in entry.roles {
                let mut matchers = Vec::new();
                if let Some(user_type) = &rule.user_type {
                    matchers.push(RoleMatcher::UserType(user_type.clone()));
                }
                if let Some(pattern) = &rule.role_pattern {
                    // Anchored at the start of the username.
                    let regex = Regex::new(&format!("^(?:{pattern})")).map_err(|e| {
                        ConfigError::InvalidRolePattern {
                            table: entry.table.clone(),
                            pattern: pattern.clone(),
                            reason: e.to_string(),
                        }
                    })?;
                    matchers.push(RoleMatcher::Pattern {
                        source: pattern.clone(),
                        regex,
                    });
                }
                if matchers.is_empty() {
                    return Err(ConfigError::EmptyRoleMatcher {
                        table: entry.table.clone(),
                    });
                }
                tables
                    .entry(key.clone())
                    .or_default()
                    .push(CompiledRole { matchers, rule });
            }
        }

        let mut default_permission = file.default_permission;
        if default_permission
            .row_filter
            .as_deref()
            .is_none_or(|f| f.trim().is_empty())
        {
            default_permission.row_filter = Some(DENY_ALL_ROWS.to_string());
        }

        Ok(Self {
            settings: file.global_settings,
            default_permission,
            tables,
        })
    }

    /// Parse and compile YAML text. Blank input yields [`RuleSet::restrictive`].
    pub fn from_yaml(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            tracing::warn!(path = %origin.display(), "Permission file is empty, denying by default");
            return Ok(Self::restrictive());
        }
        let file: PermissionFile =
            serde_yaml::from_str(text).map_err(|e| ConfigError::ParseError {
                path: origin.to_path_buf(),
                reason: e.to_string(),
            })?;
        Self::compile(file)
    }

    /// No rules, default-deny, governance enabled.
    pub fn restrictive() -> Self {
        Self {
            settings: GlobalSettings::default(),
            default_permission: DefaultPermission::default(),
            tables: HashMap::new(),
        }
    }

    pub fn settings(&self) -> &GlobalSettings {
        &self.settings
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Resolve the permission of `principal` on `table`.
    ///
    /// Exact `user_type` matches win over legacy `role_pattern` matches; no
    /// match yields the default-deny permission.
    pub fn resolve(&self, table: &str, principal: &Principal) -> EffectivePermission {
        let log_checks = self.settings.log_checks;
        let Some(roles) = self.tables.get(&table.trim().to_lowercase()) else {
            if log_checks {
                tracing::warn!(
                    user = %principal.username,
                    table,
                    "No permission entry for table, using default permission"
                );
            }
            return self.default_effective();
        };

        if let Some(user_type) = principal.user_type.as_deref() {
            let hit = roles.iter().find(|role| {
                role.matchers
                    .iter()
                    .any(|m| matches!(m, RoleMatcher::UserType(t) if t == user_type))
            });
            if let Some(role) = hit {
                let permission = effective(
                    &role.rule,
                    principal,
                    PermissionSource::UserType(user_type.to_string()),
                );
                if log_checks {
                    tracing::info!(
                        user = %principal.username,
                        table,
                        user_type,
                        row_filter = permission.row_filter.as_deref().unwrap_or_default(),
                        "Permission matched by user type"
                    );
                }
                return permission;
            }
        }

        for role in roles {
            for matcher in &role.matchers {
                if let RoleMatcher::Pattern { source, regex } = matcher {
                    if regex.is_match(&principal.username) {
                        let permission = effective(
                            &role.rule,
                            principal,
                            PermissionSource::RolePattern(source.clone()),
                        );
                        if log_checks {
                            tracing::info!(
                                user = %principal.username,
                                table,
                                role_pattern = %source,
                                row_filter = permission.row_filter.as_deref().unwrap_or_default(),
                                "Permission matched by role pattern"
                            );
                        }
                        return permission;
                    }
                }
            }
        }

        if log_checks {
            tracing::warn!(
                user = %principal.username,
                table,
                "No role matched principal, using default permission"
            );
        }
        self.default_effective()
    }

    fn default_effective(&self) -> EffectivePermission {
        let d = &self.default_permission;
        EffectivePermission {
            allowed_operations: d.allowed_operations.iter().copied().collect(),
            allowed_columns: d.allowed_columns.clone(),
            row_filter: d.row_filter.clone(),
            forbidden_columns: d.forbidden_columns.clone().unwrap_or_default(),
            source: PermissionSource::Default,
        }
    }
}

fn effective(rule: &RoleRule, principal: &Principal, source: PermissionSource) -> EffectivePermission {
    let row_filter = rule
        .row_filter
        .as_deref()
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(|f| substitute_username(f, &principal.username));

    EffectivePermission {
        allowed_operations: rule.allowed_operations.iter().copied().collect::<BTreeSet<_>>(),
        allowed_columns: rule.allowed_columns.clone(),
        row_filter,
        forbidden_columns: rule.forbidden_columns.clone().unwrap_or_default(),
        source,
    }
}

/// Replace every `{username}` with the username, doubling single quotes so
/// the value stays inside a quoted SQL literal.
fn substitute_username(template: &str, username: &str) -> String {
    template.replace("{username}", &username.replace('\'', "''"))
}

/// Shared, hot-reloadable permission store.
pub struct PermissionStore {
    path: Option<PathBuf>,
    rules: ArcSwap<RuleSet>,
    generation: AtomicU64,
}

impl PermissionStore {
    /// Load rules from `path`, falling back to default-deny on any failure.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let rules = match read_rules(&path) {
            Ok(rules) => {
                tracing::info!(
                    path = %path.display(),
                    tables = rules.table_count(),
                    enabled = rules.settings().enabled,
                    "Permission configuration loaded"
                );
                rules
            }
            Err(e) => {
                tracing::error!(
                    path = %path.display(),
                    error = %e,
                    "Failed to load permission configuration, denying by default"
                );
                RuleSet::restrictive()
            }
        };
        Self {
            path: Some(path),
            rules: ArcSwap::from_pointee(rules),
            generation: AtomicU64::new(0),
        }
    }

    /// Load rules from `path`, returning the error instead of falling back.
    pub fn try_load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let rules = read_rules(&path)?;
        Ok(Self {
            path: Some(path),
            rules: ArcSwap::from_pointee(rules),
            generation: AtomicU64::new(0),
        })
    }

    /// A store not backed by a file; `reload` keeps the current rules.
    pub fn from_rules(rules: RuleSet) -> Self {
        Self {
            path: None,
            rules: ArcSwap::from_pointee(rules),
            generation: AtomicU64::new(0),
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(Self::from_rules(RuleSet::from_yaml(text, Path::new("<inline>"))?))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Re-read the backing file and publish it atomically.
    ///
    /// On failure the default-deny rule set is published and the error is
    /// returned; governance never fails open.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let Some(path) = &self.path else {
            tracing::debug!("Permission store has no backing file, nothing to reload");
            return Ok(());
        };

        match read_rules(path) {
            Ok(rules) => {
                let tables = rules.table_count();
                self.publish(rules);
                tracing::info!(
                    path = %path.display(),
                    tables,
                    generation = self.generation(),
                    "Permission configuration reloaded"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    path = %path.display(),
                    error = %e,
                    "Permission reload failed, publishing default-deny configuration"
                );
                self.publish(RuleSet::restrictive());
                Err(e)
            }
        }
    }

    /// Swap in a fully built rule set.
    pub fn publish(&self, rules: RuleSet) {
        self.rules.store(Arc::new(rules));
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// The currently published rule set.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.rules.load_full()
    }

    pub fn resolve(&self, table: &str, principal: &Principal) -> EffectivePermission {
        self.rules.load().resolve(table, principal)
    }

    pub fn settings(&self) -> GlobalSettings {
        self.rules.load().settings().clone()
    }

    /// Number of publications since construction.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

fn read_rules(path: &Path) -> Result<RuleSet, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    RuleSet::from_yaml(&text, path)
}
