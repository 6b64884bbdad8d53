//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Connection handlers produce:
//!     → logging.rs (structured log events, keyed by connection id)
//!     → metrics.rs (byte counters, decision counters, header wait histogram)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → Metrics endpoint (Prometheus scrape)
//! ```

pub mod logging;
pub mod metrics;
