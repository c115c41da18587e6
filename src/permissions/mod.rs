//! Row-level and table-level access control.
//!
//! [`PermissionStore`] holds the compiled rule table and [`PermissionChecker`]
//! authorizes statements against it, splicing row filters into the ones it
//! lets through.

pub mod model;
pub mod rewriter;
pub mod statement;
pub mod store;

pub use model::{
    DefaultPermission, EffectivePermission, GlobalSettings, Operation, PermissionFile,
    PermissionSource, Principal, RoleRule, SqlDialect, TablePermissions,
};
pub use rewriter::PermissionChecker;
pub use statement::Statement;
pub use store::{PermissionStore, RuleSet};
