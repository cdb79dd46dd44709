//! Configuration validation.
//!
//! Serde handles syntax; this module checks value ranges and address
//! shapes. All problems are reported, not just the first.

use thiserror::Error;

use crate::config::schema::GatewayConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listener.max_connections must be greater than 0")]
    ZeroMaxConnections,

    #[error("listener.addresses contains an empty entry")]
    EmptyAddress,

    #[error("duplicate listener address: {0}")]
    DuplicateAddress(String),

    #[error("limits.max_headers must be between 1 and {max}, got {got}")]
    MaxHeaders { got: usize, max: usize },

    #[error("limits.max_head_bytes must be at least {min}, got {got}")]
    MaxHeadBytes { got: usize, min: usize },

    #[error("timeouts.{0} must be greater than 0")]
    ZeroTimeout(&'static str),

    #[error("unknown log level: {0}")]
    LogLevel(String),
}

const MAX_HEADERS_CEILING: usize = 1024;
const MIN_HEAD_BYTES: usize = 256;
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Check a configuration, returning every problem found.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.max_connections == 0 {
        errors.push(ValidationError::ZeroMaxConnections);
    }

    let mut seen = std::collections::HashSet::new();
    for address in &config.listener.addresses {
        let address = address.trim();
        if address.is_empty() {
            errors.push(ValidationError::EmptyAddress);
        } else if !seen.insert(address) {
            errors.push(ValidationError::DuplicateAddress(address.to_string()));
        }
    }

    let max_headers = config.limits.max_headers;
    if max_headers == 0 || max_headers > MAX_HEADERS_CEILING {
        errors.push(ValidationError::MaxHeaders {
            got: max_headers,
            max: MAX_HEADERS_CEILING,
        });
    }

    if config.limits.max_head_bytes < MIN_HEAD_BYTES {
        errors.push(ValidationError::MaxHeadBytes {
            got: config.limits.max_head_bytes,
            min: MIN_HEAD_BYTES,
        });
    }

    if config.timeouts.listen_secs == 0 {
        errors.push(ValidationError::ZeroTimeout("listen_secs"));
    }
    if config.timeouts.idle_secs == 0 {
        errors.push(ValidationError::ZeroTimeout("idle_secs"));
    }

    let level = config.observability.log_level.to_ascii_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        errors.push(ValidationError::LogLevel(config.observability.log_level.clone()));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
