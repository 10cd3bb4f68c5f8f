//! # Utility Modules
//!
//! Supporting utilities for logging, timing and observability.
//!
//! ## Components
//! - **Logging**: tracing-subscriber setup driven by `LoggingConfig`
//! - **Timeout**: async timeout wrappers and default durations
//! - **Metrics**: thread-safe observability counters

pub mod logging;
pub mod metrics;
pub mod timeout;

pub use metrics::{global_metrics, Metrics, MetricsSnapshot};
