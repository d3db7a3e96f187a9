//! Tracing subscriber setup for processes embedding the mesh

use crate::error::{McpError, Result};
use tracing_subscriber::{fmt, EnvFilter};

fn env_filter(default_filter: &str) -> EnvFilter {
    let default_filter = if default_filter.is_empty() { "info" } else { default_filter };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Install a human-readable fmt subscriber.
///
/// `RUST_LOG` wins over `default_filter`. Fails if a global subscriber is
/// already installed.
pub fn init_tracing(default_filter: &str) -> Result<()> {
    fmt()
        .with_env_filter(env_filter(default_filter))
        .with_target(true)
        .try_init()
        .map_err(|e| McpError::Configuration(format!("Failed to install tracing subscriber: {}", e)))
}

/// Install a JSON subscriber for log shippers
pub fn init_json_tracing(default_filter: &str) -> Result<()> {
    fmt()
        .json()
        .with_env_filter(env_filter(default_filter))
        .with_current_span(true)
        .try_init()
        .map_err(|e| McpError::Configuration(format!("Failed to install tracing subscriber: {}", e)))
}
