//! Error types for pipeline steps and their collaborators
//!
//! Step failures are recovered by the runner and never reach the queue
//! consumer. They surface through the error reporter, metrics and the
//! dead-letter queue instead.

use crate::pipeline::StepId;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use thiserror::Error;

/// Error raised by a pipeline step (or by the runner on its behalf)
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Plugin execution failed: {message}")]
    PluginFailed { message: String },

    #[error("Invalid event: {message}")]
    InvalidEvent { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Identity store error: {message}")]
    Identity { message: String },

    #[error("Step {step} timed out after {}ms", timeout.as_millis())]
    StepTimeout { step: StepId, timeout: Duration },

    #[error("Unknown pipeline step: {0}")]
    UnknownStep(String),

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Step error: {0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl PipelineError {
    /// Create plugin failure
    pub fn plugin_failed<S: Into<String>>(message: S) -> Self {
        Self::PluginFailed {
            message: message.into(),
        }
    }

    /// Create invalid event error
    pub fn invalid_event<S: Into<String>>(message: S) -> Self {
        Self::InvalidEvent {
            message: message.into(),
        }
    }

    /// Create storage error
    pub fn storage<S: Into<String>>(message: S) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create identity store error
    pub fn identity<S: Into<String>>(message: S) -> Self {
        Self::Identity {
            message: message.into(),
        }
    }

    /// Create internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Longest error text written into a dead-letter record
const MAX_ERROR_MESSAGE_LEN: usize = 500;

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)([=:])\s*\S+")
        .expect("secret pattern is valid")
});

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("path pattern is valid")
});

/// Strip credentials and sensitive paths from an error message before it
/// leaves the process, truncating to at most 500 bytes
pub(crate) fn sanitize_error_message(message: &str) -> String {
    let sanitized = SECRET_PATTERN.replace_all(message, "${1}${2}***");
    let mut sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .into_owned();

    if sanitized.len() > MAX_ERROR_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_ERROR_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(truncate_suffix);
    }

    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_failed_constructor() {
        let error = PipelineError::plugin_failed("geoip crashed");
        assert!(matches!(error, PipelineError::PluginFailed { .. }));
        assert_eq!(error.to_string(), "Plugin execution failed: geoip crashed");
    }

    #[test]
    fn test_invalid_event_constructor() {
        let error = PipelineError::invalid_event("missing timestamp");
        assert_eq!(error.to_string(), "Invalid event: missing timestamp");
    }

    #[test]
    fn test_step_timeout_display() {
        let error = PipelineError::StepTimeout {
            step: StepId::CreateEvent,
            timeout: Duration::from_millis(2500),
        };
        assert_eq!(error.to_string(), "Step createEventStep timed out after 2500ms");
    }

    #[test]
    fn test_boxed_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(io);
        let error: PipelineError = boxed.into();
        assert_eq!(error.to_string(), "Step error: disk full");
    }

    #[test]
    fn test_sanitize_redacts_secrets() {
        let sanitized =
            sanitize_error_message("Failed to authenticate: password=secret123 token: abc456");

        assert!(!sanitized.contains("secret123"));
        assert!(!sanitized.contains("abc456"));
        assert!(sanitized.contains("password=***"));
        assert!(sanitized.contains("token:***"));
    }

    #[test]
    fn test_sanitize_keeps_the_original_separator() {
        assert_eq!(sanitize_error_message("api_key: abc"), "api_key:***");
        assert_eq!(sanitize_error_message("secret=abc"), "secret=***");
        assert_eq!(sanitize_error_message("TOKEN:abc rest"), "TOKEN:*** rest");
    }

    #[test]
    fn test_sanitize_redacts_sensitive_paths() {
        let sanitized = sanitize_error_message("Failed to read /home/user/.aws/credentials");

        assert!(sanitized.contains("/***REDACTED***/"));
        assert!(!sanitized.contains(".aws/credentials"));
    }

    #[test]
    fn test_sanitize_truncates_long_messages() {
        let sanitized = sanitize_error_message(&"x".repeat(600));

        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_sanitize_truncates_on_char_boundary() {
        let sanitized = sanitize_error_message(&"é".repeat(400));

        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_sanitize_keeps_short_messages() {
        assert_eq!(sanitize_error_message(""), "");
        assert_eq!(sanitize_error_message(&"x".repeat(500)).len(), 500);
    }
}
