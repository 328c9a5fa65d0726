//! Test helpers and utilities for integration tests

use event_pipeline::event::RawEvent;
use event_pipeline::pipeline::{PipelineContext, StepTimeoutPolicy};
use event_pipeline::testing::{
    MockDeadLetterPublisher, MockIdentityStore, RecordingErrorReporter, RecordingMetrics,
    ScriptedSteps,
};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// The event used across runner tests: team 2, distinct id `my_id`
#[allow(dead_code)]
pub fn test_event() -> RawEvent {
    serde_json::from_value(json!({
        "distinct_id": "my_id",
        "ip": "127.0.0.1",
        "site_url": "http://localhost",
        "team_id": 2,
        "uuid": Uuid::new_v4(),
        "now": "2020-02-23T02:15:00Z",
        "event": "default event",
        "properties": {"plan": "free"}
    }))
    .unwrap()
}

/// A runner context wired entirely to recording doubles
#[allow(dead_code)]
pub struct Harness {
    pub steps: Arc<ScriptedSteps>,
    pub metrics: Arc<RecordingMetrics>,
    pub dead_letter: Arc<MockDeadLetterPublisher>,
    pub identity: Arc<MockIdentityStore>,
    pub reporter: Arc<RecordingErrorReporter>,
    pub context: Arc<PipelineContext>,
}

#[allow(dead_code)]
pub struct HarnessBuilder {
    steps: ScriptedSteps,
    dead_letter: MockDeadLetterPublisher,
    identity: MockIdentityStore,
    with_metrics: bool,
    timeouts: StepTimeoutPolicy,
}

#[allow(dead_code)]
impl HarnessBuilder {
    pub fn dead_letter(mut self, dead_letter: MockDeadLetterPublisher) -> Self {
        self.dead_letter = dead_letter;
        self
    }

    pub fn identity(mut self, identity: MockIdentityStore) -> Self {
        self.identity = identity;
        self
    }

    pub fn without_metrics(mut self) -> Self {
        self.with_metrics = false;
        self
    }

    pub fn timeouts(mut self, timeouts: StepTimeoutPolicy) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn build(self) -> Harness {
        let steps = Arc::new(self.steps);
        let metrics = Arc::new(RecordingMetrics::new());
        let dead_letter = Arc::new(self.dead_letter);
        let identity = Arc::new(self.identity);
        let reporter = Arc::new(RecordingErrorReporter::new());

        let mut context = PipelineContext::new(steps.clone(), identity.clone(), dead_letter.clone())
            .with_error_reporter(reporter.clone())
            .with_step_timeouts(self.timeouts);
        if self.with_metrics {
            context = context.with_metrics(metrics.clone());
        }

        Harness {
            steps,
            metrics,
            dead_letter,
            identity,
            reporter,
            context: Arc::new(context),
        }
    }
}

#[allow(dead_code)]
impl Harness {
    pub fn builder(steps: ScriptedSteps) -> HarnessBuilder {
        HarnessBuilder {
            steps,
            dead_letter: MockDeadLetterPublisher::new(),
            identity: MockIdentityStore::new(),
            with_metrics: true,
            timeouts: StepTimeoutPolicy::disabled(),
        }
    }

    pub fn new(steps: ScriptedSteps) -> Self {
        Self::builder(steps).build()
    }
}
