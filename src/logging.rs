//! Structured logging setup.
//!
//! The governance layer only emits `tracing` events; hosts that do not
//! install their own subscriber can call [`init`] once at startup.
//!
//! `RUST_LOG` controls filtering (default `info`), e.g.
//! `RUST_LOG=sql_governance=debug`.

use std::str::FromStr;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::ConfigError;

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable, multi-line.
    #[default]
    Pretty,
    /// Single-line human-readable.
    Compact,
    /// One JSON object per event.
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::InvalidValue {
                key: "SQLGOV_LOG_FORMAT".to_string(),
                message: format!("expected pretty|compact|json, got '{other}'"),
            }),
        }
    }
}

impl LogFormat {
    /// Read `SQLGOV_LOG_FORMAT`, falling back to pretty output.
    pub fn from_env() -> Self {
        std::env::var("SQLGOV_LOG_FORMAT")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_default()
    }
}

/// Install a global subscriber. Returns `false` if one was already set.
pub fn init(format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
        LogFormat::Compact => registry.with(fmt::layer().compact()).try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init(),
    };

    result.is_ok()
}
