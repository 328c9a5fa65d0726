//! Mock implementations for testing
//!
//! Provides scripted pipeline steps plus recording doubles for every
//! capability a runner is given, so tests can assert call order, arguments
//! and metric tags precisely.

use crate::dead_letter::{DeadLetterError, DeadLetterPublisher, DeadLetterRecord};
use crate::error::{PipelineError, PipelineResult};
use crate::event::{NormalizedEvent, Person, RawEvent};
use crate::identity::IdentityStore;
use crate::observability::metrics::MetricsSink;
use crate::pipeline::{
    EventPipelineRunner, PipelineState, PipelineSteps, Step, StepId, StepOutcome,
};
use crate::reporting::{ErrorContext, ErrorReporter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

/// What a scripted step does when invoked
#[derive(Debug, Clone, PartialEq)]
pub enum StepBehavior {
    /// Continue to the next step of the standard chain
    Continue,
    /// Continue to an arbitrary step
    ContinueTo(StepId),
    /// Stop the traversal successfully
    Terminate,
    /// Fail with a plugin error carrying this message
    Fail(String),
    /// Never complete
    Hang,
    /// Sleep, then continue along the standard chain
    Delay(Duration),
}

/// Pipeline steps driven by a script, recording every invocation
///
/// Per-invocation behaviors queued with [`ScriptedSteps::following`] take
/// precedence over per-step behaviors. Steps without either continue along
/// the standard chain; the last step terminates.
#[derive(Debug)]
pub struct ScriptedSteps {
    raw: RawEvent,
    normalized: NormalizedEvent,
    behaviors: HashMap<StepId, StepBehavior>,
    script: Mutex<VecDeque<StepBehavior>>,
    invocations: Mutex<Vec<Step>>,
    observed_states: Mutex<Vec<PipelineState>>,
}

impl ScriptedSteps {
    /// Script whose continuations carry `raw` (and a normalized copy of it)
    pub fn new(raw: RawEvent) -> Self {
        let normalized = normalized_from(&raw);
        Self {
            raw,
            normalized,
            behaviors: HashMap::new(),
            script: Mutex::new(VecDeque::new()),
            invocations: Mutex::new(Vec::new()),
            observed_states: Mutex::new(Vec::new()),
        }
    }

    pub fn with_behavior(mut self, step: StepId, behavior: StepBehavior) -> Self {
        self.behaviors.insert(step, behavior);
        self
    }

    pub fn failing_at(self, step: StepId, message: &str) -> Self {
        self.with_behavior(step, StepBehavior::Fail(message.to_string()))
    }

    /// Script a route: invocation `i` continues to `route[i + 1]`, the last
    /// one terminates. The first element is where the caller starts.
    pub fn following(self, route: &[StepId]) -> Self {
        self.with_script(route_script(route))
    }

    /// Queue one behavior per invocation, consumed in order
    pub fn with_script(self, script: Vec<StepBehavior>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..self
        }
    }

    pub fn normalized(&self) -> &NormalizedEvent {
        &self.normalized
    }

    pub async fn invocations(&self) -> Vec<Step> {
        self.invocations.lock().await.clone()
    }

    pub async fn invoked_steps(&self) -> Vec<StepId> {
        self.invocations
            .lock()
            .await
            .iter()
            .map(Step::id)
            .collect()
    }

    pub async fn call_count(&self, step: StepId) -> usize {
        self.invocations
            .lock()
            .await
            .iter()
            .filter(|s| s.id() == step)
            .count()
    }

    /// Runner state seen from inside each invocation
    pub async fn observed_states(&self) -> Vec<PipelineState> {
        self.observed_states.lock().await.clone()
    }

    pub async fn clear_history(&self) {
        self.invocations.lock().await.clear();
        self.observed_states.lock().await.clear();
    }

    async fn respond(
        &self,
        runner: &EventPipelineRunner,
        invoked: Step,
        person: Option<&Person>,
    ) -> PipelineResult<StepOutcome> {
        let step = invoked.id();
        self.invocations.lock().await.push(invoked);
        self.observed_states.lock().await.push(runner.state());

        let scripted = self.script.lock().await.pop_front();
        let behavior = scripted
            .or_else(|| self.behaviors.get(&step).cloned())
            .unwrap_or(StepBehavior::Continue);

        match behavior {
            StepBehavior::Continue => Ok(self.continue_after(step, person)),
            StepBehavior::ContinueTo(next) => Ok(StepOutcome::Continue(self.step_for(next, person))),
            StepBehavior::Terminate => Ok(StepOutcome::Terminate),
            StepBehavior::Fail(message) => Err(PipelineError::plugin_failed(message)),
            StepBehavior::Hang => {
                std::future::pending::<()>().await;
                Ok(StepOutcome::Terminate)
            }
            StepBehavior::Delay(duration) => {
                tokio::time::sleep(duration).await;
                Ok(self.continue_after(step, person))
            }
        }
    }

    fn continue_after(&self, step: StepId, person: Option<&Person>) -> StepOutcome {
        let next = match step {
            StepId::PluginsProcessEvent => StepId::PrepareEvent,
            StepId::PrepareEvent => StepId::DetermineShouldBuffer,
            StepId::DetermineShouldBuffer => StepId::CreateEvent,
            StepId::CreateEvent => StepId::RunAsyncHandlers,
            StepId::RunAsyncHandlers => return StepOutcome::Terminate,
        };
        StepOutcome::Continue(self.step_for(next, person))
    }

    fn step_for(&self, step: StepId, person: Option<&Person>) -> Step {
        match step {
            StepId::PluginsProcessEvent => Step::PluginsProcessEvent(self.raw.clone()),
            StepId::PrepareEvent => Step::PrepareEvent(self.raw.clone()),
            StepId::DetermineShouldBuffer => Step::DetermineShouldBuffer(self.normalized.clone()),
            StepId::CreateEvent => Step::CreateEvent(self.normalized.clone(), person.cloned()),
            StepId::RunAsyncHandlers => {
                Step::RunAsyncHandlers(self.normalized.clone(), person.cloned())
            }
        }
    }
}

#[async_trait]
impl PipelineSteps for ScriptedSteps {
    async fn plugins_process_event(
        &self,
        runner: &EventPipelineRunner,
        event: &RawEvent,
    ) -> PipelineResult<StepOutcome> {
        self.respond(runner, Step::PluginsProcessEvent(event.clone()), None)
            .await
    }

    async fn prepare_event(
        &self,
        runner: &EventPipelineRunner,
        event: &RawEvent,
    ) -> PipelineResult<StepOutcome> {
        self.respond(runner, Step::PrepareEvent(event.clone()), None).await
    }

    async fn determine_should_buffer(
        &self,
        runner: &EventPipelineRunner,
        event: &NormalizedEvent,
    ) -> PipelineResult<StepOutcome> {
        self.respond(runner, Step::DetermineShouldBuffer(event.clone()), None)
            .await
    }

    async fn create_event(
        &self,
        runner: &EventPipelineRunner,
        event: &NormalizedEvent,
        person: Option<&Person>,
    ) -> PipelineResult<StepOutcome> {
        self.respond(runner, Step::CreateEvent(event.clone(), person.cloned()), person)
            .await
    }

    async fn run_async_handlers(
        &self,
        runner: &EventPipelineRunner,
        event: &NormalizedEvent,
        person: Option<&Person>,
    ) -> PipelineResult<StepOutcome> {
        self.respond(runner, Step::RunAsyncHandlers(event.clone(), person.cloned()), person)
            .await
    }
}

/// Script walking `route`: each invocation continues to the next entry and
/// the last one terminates
pub fn route_script(route: &[StepId]) -> Vec<StepBehavior> {
    route
        .iter()
        .skip(1)
        .map(|next| StepBehavior::ContinueTo(*next))
        .chain(std::iter::once(StepBehavior::Terminate))
        .collect()
}

/// Normalized copy of a raw event without validation
pub fn normalized_from(raw: &RawEvent) -> NormalizedEvent {
    let timestamp = raw
        .timestamp
        .as_deref()
        .unwrap_or(&raw.now)
        .parse::<DateTime<Utc>>()
        .unwrap_or_else(|_| Utc::now());

    NormalizedEvent {
        event_uuid: raw.uuid.unwrap_or_else(Uuid::nil),
        distinct_id: raw.distinct_id.clone(),
        team_id: raw.team_id,
        ip: raw.ip.clone(),
        site_url: raw.site_url.clone(),
        timestamp,
        event: raw.event.clone(),
        properties: raw.properties.clone(),
        elements_list: Vec::new(),
    }
}

/// Kind of metrics call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Increment,
    Timing,
}

/// One call made against [`RecordingMetrics`]
#[derive(Debug, Clone, PartialEq)]
pub struct MetricCall {
    pub kind: MetricKind,
    pub name: String,
    pub tags: Vec<(String, String)>,
    pub elapsed: Option<Duration>,
}

impl MetricCall {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Metrics sink recording every call in order
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    calls: StdMutex<Vec<MetricCall>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<MetricCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Increment calls for a metric name, in call order
    pub fn increments(&self, name: &str) -> Vec<MetricCall> {
        self.calls_of(MetricKind::Increment, name)
    }

    /// Timing calls for a metric name, in call order
    pub fn timings(&self, name: &str) -> Vec<MetricCall> {
        self.calls_of(MetricKind::Timing, name)
    }

    pub fn increment_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.kind == MetricKind::Increment)
            .count()
    }

    pub fn timing_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.kind == MetricKind::Timing)
            .count()
    }

    /// Whether an increment with exactly these tags was recorded
    pub fn was_incremented_with(&self, name: &str, tags: &[(&str, &str)]) -> bool {
        let mut expected: Vec<(String, String)> = tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        expected.sort();

        self.increments(name).iter().any(|call| {
            let mut actual = call.tags.clone();
            actual.sort();
            actual == expected
        })
    }

    fn calls_of(&self, kind: MetricKind, name: &str) -> Vec<MetricCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.kind == kind && c.name == name)
            .collect()
    }

    fn record(&self, kind: MetricKind, name: &str, tags: &[(&str, &str)], elapsed: Option<Duration>) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(MetricCall {
                kind,
                name: name.to_string(),
                tags: tags
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                elapsed,
            });
        }
    }
}

impl MetricsSink for RecordingMetrics {
    fn increment(&self, name: &str, tags: &[(&str, &str)]) {
        self.record(MetricKind::Increment, name, tags, None);
    }

    fn timing(&self, name: &str, since: Instant, tags: &[(&str, &str)]) {
        self.record(MetricKind::Timing, name, tags, Some(since.elapsed()));
    }
}

/// A captured error with its context
#[derive(Debug, Clone)]
pub struct CapturedError {
    pub message: String,
    pub context: ErrorContext,
}

/// Error reporter recording captures
#[derive(Debug, Default)]
pub struct RecordingErrorReporter {
    captured: StdMutex<Vec<CapturedError>>,
}

impl RecordingErrorReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn captured(&self) -> Vec<CapturedError> {
        self.captured.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl ErrorReporter for RecordingErrorReporter {
    fn capture(&self, error: &(dyn std::error::Error + 'static), context: &ErrorContext) {
        if let Ok(mut captured) = self.captured.lock() {
            captured.push(CapturedError {
                message: error.to_string(),
                context: context.clone(),
            });
        }
    }
}

/// Dead-letter publisher keeping records in memory
#[derive(Debug, Default)]
pub struct MockDeadLetterPublisher {
    published: Mutex<Vec<DeadLetterRecord>>,
    attempts: AtomicUsize,
    pub should_fail: bool,
}

impl MockDeadLetterPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub async fn published(&self) -> Vec<DeadLetterRecord> {
        self.published.lock().await.clone()
    }

    /// Publish calls, including failed ones
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeadLetterPublisher for MockDeadLetterPublisher {
    async fn publish(&self, record: &DeadLetterRecord) -> Result<(), DeadLetterError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.should_fail {
            return Err(DeadLetterError::publish("Mock dead-letter failure"));
        }

        self.published.lock().await.push(record.clone());
        Ok(())
    }
}

/// Identity store double counting fetches
#[derive(Debug, Default)]
pub struct MockIdentityStore {
    persons: Mutex<HashMap<(i64, String), Person>>,
    fetches: AtomicUsize,
    pub should_fail: bool,
    /// Never answer a fetch
    pub should_hang: bool,
}

impl MockIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub fn with_hang() -> Self {
        Self {
            should_hang: true,
            ..Default::default()
        }
    }

    pub async fn set_person(&self, distinct_id: &str, person: Person) {
        self.persons
            .lock()
            .await
            .insert((person.team_id, distinct_id.to_string()), person);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityStore for MockIdentityStore {
    async fn fetch_person(
        &self,
        team_id: i64,
        distinct_id: &str,
    ) -> PipelineResult<Option<Person>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.should_hang {
            std::future::pending::<()>().await;
        }
        if self.should_fail {
            return Err(PipelineError::identity("Mock identity store failure"));
        }

        let persons = self.persons.lock().await;
        Ok(persons.get(&(team_id, distinct_id.to_string())).cloned())
    }
}

/// Person fixture
pub fn test_person(id: i64, team_id: i64) -> Person {
    Person {
        id,
        uuid: Uuid::new_v4(),
        team_id,
        properties: Default::default(),
        is_identified: true,
        created_at: Utc::now(),
    }
}
