//! Observability for the event pipeline
//!
//! Structured logging through `tracing` and an in-memory metrics sink the
//! runner reports step counters and timings to.

pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{MetricsCollector, MetricsSink, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{event_span, step_span};
