//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Listeners, connections and request dispatch produce:
//!     → logging.rs (structured tracing events, one span per connection)
//!     → metrics.rs (counters, gauges, histograms via the metrics facade)
//!
//! Consumers:
//!     → whatever tracing subscriber the embedding binary installs
//!     → whatever metrics recorder is installed (no-op otherwise)
//! ```

pub mod logging;
pub mod metrics;
