//! Error reporting side channel
//!
//! Reporting is fire-and-forget: `capture` is synchronous, cannot fail and
//! must not block the failure-handling path.

use crate::event::RawEvent;
use crate::pipeline::StepId;
use serde::Serialize;
use serde_json::Value;
use tracing::error;

/// Context attached to a reported error
#[derive(Debug, Clone, Serialize)]
pub struct ErrorContext {
    pub step: StepId,
    /// JSON snapshot of the arguments the step was invoked with
    pub step_args: Value,
    pub original_event: Option<RawEvent>,
    /// Set when reporting a secondary failure, e.g. a dead-letter publish
    pub primary_error: Option<String>,
}

/// Sink for errors that should reach an external error-tracking service
pub trait ErrorReporter: Send + Sync {
    fn capture(&self, error: &(dyn std::error::Error + 'static), context: &ErrorContext);
}

/// Reporter that emits each error as a structured `tracing` event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn capture(&self, err: &(dyn std::error::Error + 'static), context: &ErrorContext) {
        let original_event = context
            .original_event
            .as_ref()
            .and_then(|event| serde_json::to_string(event).ok());

        error!(
            error = %err,
            step = %context.step,
            step_args = %context.step_args,
            original_event = original_event.as_deref().unwrap_or("none"),
            primary_error = context.primary_error.as_deref().unwrap_or("none"),
            "Captured pipeline error"
        );
    }
}
