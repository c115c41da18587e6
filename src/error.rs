//! Error types for the SQL governance layer.

use std::path::PathBuf;

/// Top-level error type for the governance layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Permission error: {0}")]
    Permission(#[from] PermissionError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse permission file {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Invalid role pattern '{pattern}' for table {table}: {reason}")]
    InvalidRolePattern {
        table: String,
        pattern: String,
        reason: String,
    },

    #[error("Role entry for table {table} has neither user_type nor role_pattern")]
    EmptyRoleMatcher { table: String },

    #[error("Unknown SQL operation: {0}")]
    UnknownOperation(String),

    #[error("Failed to watch {path}: {reason}")]
    Watch { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Access-control errors raised by the permission rewriter.
///
/// Always terminal for the call; callers surface them as a hard refusal.
#[derive(Debug, thiserror::Error)]
pub enum PermissionError {
    #[error("Permission denied: {reason}")]
    Denied { reason: String },
}

impl PermissionError {
    pub fn denied(reason: impl Into<String>) -> Self {
        Self::Denied {
            reason: reason.into(),
        }
    }

    /// The human-readable refusal reason.
    pub fn reason(&self) -> &str {
        match self {
            Self::Denied { reason } => reason,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
