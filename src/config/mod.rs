//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated, immutable)
//!     → shared via Arc with the accept loops
//! ```
//!
//! # Design Decisions
//! - Config is immutable once a server is constructed
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    BodyFraming, DispatchMode, GatewayConfig, LimitsConfig, ListenerConfig, ObservabilityConfig,
    TimeoutConfig,
};
pub use validation::{validate_config, ValidationError};
