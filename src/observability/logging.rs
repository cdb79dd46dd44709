//! Structured logging.
//!
//! The library only emits `tracing` events; installing a subscriber is left
//! to the binary (or a test) through [`init_logging`].

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// Install a formatting subscriber filtered by `RUST_LOG`, falling back to the
/// configured level for this crate.
///
/// Returns `false` when a global subscriber was already installed.
pub fn init_logging(config: &ObservabilityConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter(&config.log_level).into());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

fn default_filter(level: &str) -> String {
    format!("server_gateway={level}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_targets_crate() {
        assert_eq!(default_filter("debug"), "server_gateway=debug");
    }

    #[test]
    fn second_init_is_rejected() {
        let config = ObservabilityConfig::default();
        init_logging(&config);
        assert!(!init_logging(&config));
    }
}
