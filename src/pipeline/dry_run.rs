//! Reference steps for exercising the runner without real storage
//!
//! Plugins pass events through untouched, preparation validates and
//! normalizes, buffering never defers, creation stores nothing and async
//! handlers only log. Events that cannot be normalized fail the prepare step
//! and end up in the dead-letter queue like any other early failure.

use super::runner::EventPipelineRunner;
use super::steps::{PipelineSteps, Step, StepOutcome};
use crate::error::{PipelineError, PipelineResult};
use crate::event::{Element, NormalizedEvent, Person, RawEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

/// Property carrying the autocapture element chain
const ELEMENTS_PROPERTY: &str = "$elements";

/// Steps that validate and normalize events but persist nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunSteps;

#[async_trait]
impl PipelineSteps for DryRunSteps {
    async fn plugins_process_event(
        &self,
        _runner: &EventPipelineRunner,
        event: &RawEvent,
    ) -> PipelineResult<StepOutcome> {
        Ok(StepOutcome::Continue(Step::PrepareEvent(event.clone())))
    }

    async fn prepare_event(
        &self,
        _runner: &EventPipelineRunner,
        event: &RawEvent,
    ) -> PipelineResult<StepOutcome> {
        let normalized = normalize_event(event)?;
        Ok(StepOutcome::Continue(Step::DetermineShouldBuffer(normalized)))
    }

    async fn determine_should_buffer(
        &self,
        runner: &EventPipelineRunner,
        event: &NormalizedEvent,
    ) -> PipelineResult<StepOutcome> {
        let person = runner
            .context()
            .identity_store()
            .fetch_person(event.team_id, &event.distinct_id)
            .await?;
        Ok(StepOutcome::Continue(Step::CreateEvent(event.clone(), person)))
    }

    async fn create_event(
        &self,
        _runner: &EventPipelineRunner,
        event: &NormalizedEvent,
        person: Option<&Person>,
    ) -> PipelineResult<StepOutcome> {
        Ok(StepOutcome::Continue(Step::RunAsyncHandlers(
            event.clone(),
            person.cloned(),
        )))
    }

    async fn run_async_handlers(
        &self,
        _runner: &EventPipelineRunner,
        event: &NormalizedEvent,
        person: Option<&Person>,
    ) -> PipelineResult<StepOutcome> {
        debug!(
            event_uuid = %event.event_uuid,
            event = %event.event,
            has_person = person.is_some(),
            "Dry run: skipping async handlers"
        );
        Ok(StepOutcome::Terminate)
    }
}

/// Derive a [`NormalizedEvent`] from a raw event
///
/// The client timestamp wins over the server `now`; both must be RFC 3339.
pub fn normalize_event(event: &RawEvent) -> PipelineResult<NormalizedEvent> {
    if event.distinct_id.trim().is_empty() {
        return Err(PipelineError::invalid_event("distinct_id is empty"));
    }
    if event.event.trim().is_empty() {
        return Err(PipelineError::invalid_event("event name is empty"));
    }

    let timestamp = match event.timestamp.as_deref() {
        Some(ts) => parse_timestamp(ts)?,
        None => parse_timestamp(&event.now)?,
    };

    let mut properties = event.properties.clone();
    let elements_list = match properties.remove(ELEMENTS_PROPERTY) {
        Some(elements) => serde_json::from_value::<Vec<Element>>(elements).map_err(|e| {
            PipelineError::invalid_event(format!("{ELEMENTS_PROPERTY} is malformed: {e}"))
        })?,
        None => Vec::new(),
    };

    Ok(NormalizedEvent {
        event_uuid: event.uuid.unwrap_or_else(Uuid::new_v4),
        distinct_id: event.distinct_id.clone(),
        team_id: event.team_id,
        ip: event.ip.clone(),
        site_url: event.site_url.clone(),
        timestamp,
        event: event.event.clone(),
        properties,
        elements_list,
    })
}

fn parse_timestamp(value: &str) -> PipelineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| PipelineError::invalid_event(format!("invalid timestamp '{value}': {e}")))
}
