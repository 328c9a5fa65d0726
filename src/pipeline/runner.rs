//! Event pipeline runner
//!
//! A runner drives exactly one event through the registered steps. Each step
//! returns the next step to run (with its arguments) or asks to terminate.
//! Failures are recovered here: the error is reported, counted and, when the
//! event had not yet been stored, the original event is dead-lettered. The
//! caller never sees a step failure.

use super::context::PipelineContext;
use super::steps::{Step, StepId, StepOutcome};
use crate::dead_letter::{DeadLetterError, DeadLetterRecord};
use crate::error::{PipelineError, PipelineResult};
use crate::event::{NormalizedEvent, RawEvent};
use crate::reporting::ErrorContext;
use crate::{event_span, step_span};
use chrono::Utc;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn, Instrument};

/// Successful step invocations, tagged by step
pub const STEP_COUNTER: &str = "kafka_queue.event_pipeline.step";
/// Duration of successful step invocations, tagged by step
pub const STEP_TIMING: &str = "kafka_queue.event_pipeline.step.timing";
/// Terminal step of a completed traversal, tagged by step and team
pub const LAST_STEP_COUNTER: &str = "kafka_queue.event_pipeline.step.last";
/// Failed step invocations, tagged by step
pub const STEP_ERROR_COUNTER: &str = "kafka_queue.event_pipeline.step.error";
/// Dead-letter records published successfully
pub const DEAD_LETTER_COUNTER: &str = "events_added_to_dead_letter_queue";
/// Events handled by the main entry point
pub const SINGLE_EVENT_PROCESSED: &str = "kafka_queue.single_event.processed_and_ingested";
/// Events handled by the buffer-resume entry point
pub const BUFFER_EVENT_PROCESSED: &str = "kafka_queue.buffer_event.processed_and_ingested";

/// Where a runner is in its single traversal
///
/// The terminal states are reported by [`PipelineOutcome::state`], since the
/// entry points consume the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    NotStarted,
    Running(StepId),
    Completed(StepId),
    Failed(StepId),
}

/// How a traversal ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// A step returned [`StepOutcome::Terminate`]
    Completed { last_step: StepId },
    /// A step failed; the traversal stopped there
    Failed { step: StepId, dead_lettered: bool },
}

impl PipelineOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, PipelineOutcome::Completed { .. })
    }

    /// Step the traversal ended at, successfully or not
    pub fn step(&self) -> StepId {
        match self {
            PipelineOutcome::Completed { last_step } => *last_step,
            PipelineOutcome::Failed { step, .. } => *step,
        }
    }

    /// Terminal state the runner ended in
    pub fn state(&self) -> PipelineState {
        match self {
            PipelineOutcome::Completed { last_step } => PipelineState::Completed(*last_step),
            PipelineOutcome::Failed { step, .. } => PipelineState::Failed(*step),
        }
    }
}

/// Single-use runner for one event
///
/// The entry points consume the runner; build a new one per event.
pub struct EventPipelineRunner {
    context: Arc<PipelineContext>,
    original_event: Option<RawEvent>,
    state: PipelineState,
}

impl EventPipelineRunner {
    /// Create a runner. `original_event` is the event as received from the
    /// queue; without it failures cannot be dead-lettered.
    pub fn new(context: Arc<PipelineContext>, original_event: Option<RawEvent>) -> Self {
        Self {
            context,
            original_event,
            state: PipelineState::NotStarted,
        }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.context
    }

    pub fn original_event(&self) -> Option<&RawEvent> {
        self.original_event.as_ref()
    }

    /// Current state. `NotStarted` before an entry point is called and
    /// `Running` while a step executes; steps see the latter through the
    /// runner they are handed.
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Run a freshly received event from the first step
    pub async fn run_main_pipeline(mut self, event: RawEvent) -> PipelineOutcome {
        let span = event_span!(
            entry = "main",
            team_id = event.team_id,
            distinct_id = %event.distinct_id
        );

        let outcome = self
            .run_pipeline(Step::PluginsProcessEvent(event))
            .instrument(span)
            .await;

        self.context.increment(SINGLE_EVENT_PROCESSED, &[]);
        outcome
    }

    /// Resume a buffered event at event creation, with the person as it is now
    ///
    /// The person is always fetched again here; a failed fetch is handled as
    /// a failure of the event-creation step.
    pub async fn run_buffer_pipeline(mut self, event: NormalizedEvent) -> PipelineOutcome {
        let span = event_span!(
            entry = "buffer",
            team_id = event.team_id,
            distinct_id = %event.distinct_id
        );

        let outcome = self.resume_buffered(event).instrument(span).await;

        self.context.increment(BUFFER_EVENT_PROCESSED, &[]);
        outcome
    }

    async fn resume_buffered(&mut self, event: NormalizedEvent) -> PipelineOutcome {
        // the fetch is part of event creation, so it shares that step's timeout
        let fetch = self
            .context
            .identity_store()
            .fetch_person(event.team_id, &event.distinct_id);
        let fetched = self.within_timeout(StepId::CreateEvent, fetch).await;

        match fetched {
            Ok(person) => self.run_pipeline(Step::CreateEvent(event, person)).await,
            Err(err) => {
                let step = Step::CreateEvent(event, None);
                self.state = PipelineState::Running(step.id());
                self.handle_error(err, &step).await
            }
        }
    }

    async fn run_pipeline(&mut self, first: Step) -> PipelineOutcome {
        let mut current = first;

        loop {
            let step_id = current.id();
            self.state = PipelineState::Running(step_id);
            let timer = Instant::now();

            let result = self
                .run_step(&current)
                .instrument(step_span!(step = %step_id))
                .await;

            match result {
                Ok(outcome) => {
                    let tags = [("step", step_id.as_str())];
                    self.context.increment(STEP_COUNTER, &tags);
                    self.context.timing(STEP_TIMING, timer, &tags);

                    match outcome {
                        StepOutcome::Continue(next) => {
                            debug!(step = %step_id, next_step = %next.id(), "Step completed");
                            current = next;
                        }
                        StepOutcome::Terminate => {
                            let team_id = self.team_tag(&current);
                            self.context.increment(
                                LAST_STEP_COUNTER,
                                &[("step", step_id.as_str()), ("team_id", team_id.as_str())],
                            );
                            debug!(step = %step_id, "Pipeline completed");
                            self.state = PipelineState::Completed(step_id);
                            return PipelineOutcome::Completed { last_step: step_id };
                        }
                    }
                }
                Err(err) => return self.handle_error(err, &current).await,
            }
        }
    }

    async fn run_step(&self, step: &Step) -> PipelineResult<StepOutcome> {
        let invocation = step.invoke(self.context.steps(), self);
        self.within_timeout(step.id(), invocation).await
    }

    /// Await `work` under the timeout configured for `step`, if any
    async fn within_timeout<T, F>(&self, step: StepId, work: F) -> PipelineResult<T>
    where
        F: Future<Output = PipelineResult<T>>,
    {
        match self.context.timeouts().timeout_for(step) {
            Some(limit) => tokio::time::timeout(limit, work)
                .await
                .map_err(|_| PipelineError::StepTimeout {
                    step,
                    timeout: limit,
                })?,
            None => work.await,
        }
    }

    async fn handle_error(&mut self, err: PipelineError, step: &Step) -> PipelineOutcome {
        let step_id = step.id();
        warn!(step = %step_id, error = %err, "Pipeline step failed");

        let error_context = ErrorContext {
            step: step_id,
            step_args: serde_json::to_value(step).unwrap_or(Value::Null),
            original_event: self.original_event.clone(),
            primary_error: None,
        };
        self.context.error_reporter().capture(&err, &error_context);
        self.context
            .increment(STEP_ERROR_COUNTER, &[("step", step_id.as_str())]);

        let dead_lettered = match &self.original_event {
            Some(original) if step_id.is_pre_durability() => {
                self.emit_dead_letter(original, &err, error_context).await
            }
            _ => false,
        };

        self.state = PipelineState::Failed(step_id);
        PipelineOutcome::Failed {
            step: step_id,
            dead_lettered,
        }
    }

    /// Publish the original event to the dead-letter queue. Failures here are
    /// reported and swallowed.
    async fn emit_dead_letter(
        &self,
        original: &RawEvent,
        err: &PipelineError,
        error_context: ErrorContext,
    ) -> bool {
        match self.publish_dead_letter(original, err).await {
            Ok(()) => {
                self.context.increment(DEAD_LETTER_COUNTER, &[]);
                true
            }
            Err(dlq_error) => {
                error!(
                    step = %error_context.step,
                    error = %dlq_error,
                    "Errored trying to add event to dead letter queue"
                );
                let error_context = ErrorContext {
                    primary_error: Some(err.to_string()),
                    ..error_context
                };
                self.context
                    .error_reporter()
                    .capture(&dlq_error, &error_context);
                false
            }
        }
    }

    async fn publish_dead_letter(
        &self,
        original: &RawEvent,
        err: &PipelineError,
    ) -> Result<(), DeadLetterError> {
        let record = DeadLetterRecord::from_failed_event(
            original,
            err,
            self.context.error_location(),
            Utc::now(),
        )?;
        self.context.dead_letter().publish(&record).await
    }

    fn team_tag(&self, current: &Step) -> String {
        self.original_event
            .as_ref()
            .map(|event| event.team_id)
            .unwrap_or_else(|| current.team_id())
            .to_string()
    }
}
