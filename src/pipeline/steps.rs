//! Step registry for the event pipeline
//!
//! Steps are a closed set. [`StepId`] names them, [`Step`] carries the
//! strongly-typed arguments each one expects, and [`PipelineSteps`] is the
//! trait a stage implementation provides. Dispatch is an exhaustive match,
//! so a step without an implementation does not compile.

use super::runner::EventPipelineRunner;
use crate::error::{PipelineError, PipelineResult};
use crate::event::{NormalizedEvent, Person, RawEvent};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a registered pipeline step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepId {
    #[serde(rename = "pluginsProcessEventStep")]
    PluginsProcessEvent,
    #[serde(rename = "prepareEventStep")]
    PrepareEvent,
    #[serde(rename = "determineShouldBufferStep")]
    DetermineShouldBuffer,
    #[serde(rename = "createEventStep")]
    CreateEvent,
    #[serde(rename = "runAsyncHandlersStep")]
    RunAsyncHandlers,
}

/// Every registered step, in chain order
pub const ALL_STEPS: [StepId; 5] = [
    StepId::PluginsProcessEvent,
    StepId::PrepareEvent,
    StepId::DetermineShouldBuffer,
    StepId::CreateEvent,
    StepId::RunAsyncHandlers,
];

/// Steps that run before the event is durably stored. A failure in one of
/// these can be dead-lettered and replayed without duplicating storage.
pub const PRE_DURABILITY_STEPS: [StepId; 4] = [
    StepId::PluginsProcessEvent,
    StepId::PrepareEvent,
    StepId::DetermineShouldBuffer,
    StepId::CreateEvent,
];

impl StepId {
    /// Name used in metric tags, logs and configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            StepId::PluginsProcessEvent => "pluginsProcessEventStep",
            StepId::PrepareEvent => "prepareEventStep",
            StepId::DetermineShouldBuffer => "determineShouldBufferStep",
            StepId::CreateEvent => "createEventStep",
            StepId::RunAsyncHandlers => "runAsyncHandlersStep",
        }
    }

    /// Whether a failure at this step is eligible for the dead-letter queue
    pub fn is_pre_durability(&self) -> bool {
        PRE_DURABILITY_STEPS.contains(self)
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepId {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_STEPS
            .iter()
            .copied()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| PipelineError::UnknownStep(s.to_string()))
    }
}

/// A step together with the arguments it will be invoked with
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "step", content = "args")]
pub enum Step {
    #[serde(rename = "pluginsProcessEventStep")]
    PluginsProcessEvent(RawEvent),
    #[serde(rename = "prepareEventStep")]
    PrepareEvent(RawEvent),
    #[serde(rename = "determineShouldBufferStep")]
    DetermineShouldBuffer(NormalizedEvent),
    #[serde(rename = "createEventStep")]
    CreateEvent(NormalizedEvent, Option<Person>),
    #[serde(rename = "runAsyncHandlersStep")]
    RunAsyncHandlers(NormalizedEvent, Option<Person>),
}

impl Step {
    pub fn id(&self) -> StepId {
        match self {
            Step::PluginsProcessEvent(_) => StepId::PluginsProcessEvent,
            Step::PrepareEvent(_) => StepId::PrepareEvent,
            Step::DetermineShouldBuffer(_) => StepId::DetermineShouldBuffer,
            Step::CreateEvent(..) => StepId::CreateEvent,
            Step::RunAsyncHandlers(..) => StepId::RunAsyncHandlers,
        }
    }

    /// Team the step's event belongs to
    pub fn team_id(&self) -> i64 {
        match self {
            Step::PluginsProcessEvent(event) | Step::PrepareEvent(event) => event.team_id,
            Step::DetermineShouldBuffer(event)
            | Step::CreateEvent(event, _)
            | Step::RunAsyncHandlers(event, _) => event.team_id,
        }
    }

    /// Invoke the matching stage function
    pub(crate) async fn invoke(
        &self,
        steps: &dyn PipelineSteps,
        runner: &EventPipelineRunner,
    ) -> PipelineResult<StepOutcome> {
        match self {
            Step::PluginsProcessEvent(event) => steps.plugins_process_event(runner, event).await,
            Step::PrepareEvent(event) => steps.prepare_event(runner, event).await,
            Step::DetermineShouldBuffer(event) => {
                steps.determine_should_buffer(runner, event).await
            }
            Step::CreateEvent(event, person) => {
                steps.create_event(runner, event, person.as_ref()).await
            }
            Step::RunAsyncHandlers(event, person) => {
                steps.run_async_handlers(runner, event, person.as_ref()).await
            }
        }
    }
}

/// What a step asks the runner to do next
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Run the given step next
    Continue(Step),
    /// Stop the traversal; the current step is the last one
    Terminate,
}

/// Stage implementations, one async method per registered step
///
/// Each method receives the running pipeline (for access to the shared
/// context) plus its step-specific arguments, and returns the next step or
/// [`StepOutcome::Terminate`]. Errors are handled by the runner.
#[async_trait]
pub trait PipelineSteps: Send + Sync {
    async fn plugins_process_event(
        &self,
        runner: &EventPipelineRunner,
        event: &RawEvent,
    ) -> PipelineResult<StepOutcome>;

    async fn prepare_event(
        &self,
        runner: &EventPipelineRunner,
        event: &RawEvent,
    ) -> PipelineResult<StepOutcome>;

    async fn determine_should_buffer(
        &self,
        runner: &EventPipelineRunner,
        event: &NormalizedEvent,
    ) -> PipelineResult<StepOutcome>;

    async fn create_event(
        &self,
        runner: &EventPipelineRunner,
        event: &NormalizedEvent,
        person: Option<&Person>,
    ) -> PipelineResult<StepOutcome>;

    async fn run_async_handlers(
        &self,
        runner: &EventPipelineRunner,
        event: &NormalizedEvent,
        person: Option<&Person>,
    ) -> PipelineResult<StepOutcome>;
}
