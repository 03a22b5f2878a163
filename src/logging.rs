//! Structured logging setup using the tracing crate.
//!
//! Format and level come from the environment:
//!
//! - `LOG_FORMAT`: `json` (default), `pretty`, or `compact`
//! - `LOG_LEVEL`: ERROR, WARN, INFO (default), DEBUG, TRACE
//! - `RUST_LOG`: overrides filtering entirely when set

use once_cell::sync::OnceCell;
use std::env;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static INIT: OnceCell<()> = OnceCell::new();

/// Log output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Initialize the global subscriber. Safe to call more than once; only the
/// first call takes effect.
pub fn init() {
    INIT.get_or_init(|| {
        let format = LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_default());
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()))
        });

        let registry = tracing_subscriber::registry().with(filter);
        match format {
            LogFormat::Json => registry.with(fmt::layer().json()).init(),
            LogFormat::Pretty => registry.with(fmt::layer().pretty()).init(),
            LogFormat::Compact => registry.with(fmt::layer().compact()).init(),
        }
    });
}
