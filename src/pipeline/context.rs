//! Shared capabilities injected into every pipeline run

use super::steps::{PipelineSteps, StepId};
use crate::dead_letter::{DeadLetterPublisher, DEFAULT_ERROR_LOCATION};
use crate::identity::IdentityStore;
use crate::observability::metrics::MetricsSink;
use crate::reporting::{ErrorReporter, TracingErrorReporter};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-step timeout policy. Empty by default, meaning steps run until they
/// complete on their own.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepTimeoutPolicy {
    pub default: Option<Duration>,
    pub overrides: HashMap<StepId, Duration>,
}

impl StepTimeoutPolicy {
    /// No timeouts at all
    pub fn disabled() -> Self {
        Self::default()
    }

    /// The same timeout for every step
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            default: Some(timeout),
            overrides: HashMap::new(),
        }
    }

    /// Override the timeout for one step
    pub fn with_override(mut self, step: StepId, timeout: Duration) -> Self {
        self.overrides.insert(step, timeout);
        self
    }

    /// Timeout applying to `step`, if any
    pub fn timeout_for(&self, step: StepId) -> Option<Duration> {
        self.overrides.get(&step).copied().or(self.default)
    }
}

/// Everything a runner (and the steps it drives) may touch outside the event
///
/// Shared by all concurrent runners; holds no per-event state.
pub struct PipelineContext {
    steps: Arc<dyn PipelineSteps>,
    identity_store: Arc<dyn IdentityStore>,
    dead_letter: Arc<dyn DeadLetterPublisher>,
    metrics: Option<Arc<dyn MetricsSink>>,
    error_reporter: Arc<dyn ErrorReporter>,
    timeouts: StepTimeoutPolicy,
    error_location: String,
}

impl PipelineContext {
    /// Create a context without metrics, reporting errors through `tracing`
    pub fn new(
        steps: Arc<dyn PipelineSteps>,
        identity_store: Arc<dyn IdentityStore>,
        dead_letter: Arc<dyn DeadLetterPublisher>,
    ) -> Self {
        Self {
            steps,
            identity_store,
            dead_letter,
            metrics: None,
            error_reporter: Arc::new(TracingErrorReporter),
            timeouts: StepTimeoutPolicy::disabled(),
            error_location: DEFAULT_ERROR_LOCATION.to_string(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_error_reporter(mut self, error_reporter: Arc<dyn ErrorReporter>) -> Self {
        self.error_reporter = error_reporter;
        self
    }

    pub fn with_step_timeouts(mut self, timeouts: StepTimeoutPolicy) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_error_location<S: Into<String>>(mut self, location: S) -> Self {
        self.error_location = location.into();
        self
    }

    pub fn steps(&self) -> &dyn PipelineSteps {
        self.steps.as_ref()
    }

    pub fn identity_store(&self) -> &dyn IdentityStore {
        self.identity_store.as_ref()
    }

    pub fn dead_letter(&self) -> &dyn DeadLetterPublisher {
        self.dead_letter.as_ref()
    }

    pub fn error_reporter(&self) -> &dyn ErrorReporter {
        self.error_reporter.as_ref()
    }

    pub fn timeouts(&self) -> &StepTimeoutPolicy {
        &self.timeouts
    }

    pub fn error_location(&self) -> &str {
        &self.error_location
    }

    /// Increment a counter; a no-op without a metrics sink
    pub fn increment(&self, name: &str, tags: &[(&str, &str)]) {
        if let Some(metrics) = &self.metrics {
            metrics.increment(name, tags);
        }
    }

    /// Record a timing sample; a no-op without a metrics sink
    pub fn timing(&self, name: &str, since: Instant, tags: &[(&str, &str)]) {
        if let Some(metrics) = &self.metrics {
            metrics.timing(name, since, tags);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_policy_has_no_timeouts() {
        let policy = StepTimeoutPolicy::disabled();
        assert_eq!(policy.timeout_for(StepId::CreateEvent), None);
    }

    #[test]
    fn test_override_takes_precedence_over_default() {
        let policy = StepTimeoutPolicy::uniform(Duration::from_secs(30))
            .with_override(StepId::CreateEvent, Duration::from_secs(5));

        assert_eq!(
            policy.timeout_for(StepId::CreateEvent),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            policy.timeout_for(StepId::PrepareEvent),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_override_without_default() {
        let policy = StepTimeoutPolicy::disabled()
            .with_override(StepId::PluginsProcessEvent, Duration::from_millis(200));

        assert_eq!(
            policy.timeout_for(StepId::PluginsProcessEvent),
            Some(Duration::from_millis(200))
        );
        assert_eq!(policy.timeout_for(StepId::RunAsyncHandlers), None);
    }
}
