//! Batch driving and dead-letter replay as the command-line tool runs them

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use event_pipeline::config::IngestionConfig;
use event_pipeline::dead_letter::DeadLetterRecord;
use event_pipeline::event::{NormalizedEvent, Person, RawEvent};
use event_pipeline::harness::{drive_events, replay_dead_letters, HarnessError, RunSummary};
use event_pipeline::identity::InMemoryIdentityStore;
use event_pipeline::observability::MetricsCollector;
use event_pipeline::pipeline::runner::SINGLE_EVENT_PROCESSED;
use event_pipeline::pipeline::{
    DryRunSteps, EventPipelineRunner, PipelineContext, PipelineSteps, StepOutcome,
};
use event_pipeline::testing::MockDeadLetterPublisher;
use event_pipeline::{PipelineError, PipelineResult};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn pageview(distinct_id: &str) -> RawEvent {
    RawEvent::new(
        distinct_id,
        2,
        "$pageview",
        Utc.with_ymd_and_hms(2020, 2, 23, 2, 15, 0).unwrap(),
    )
}

fn broken_pageview(distinct_id: &str) -> RawEvent {
    let mut event = pageview(distinct_id);
    event.timestamp = Some("not a timestamp".to_string());
    event
}

fn dead_letter_line(event: &RawEvent) -> String {
    let err = PipelineError::invalid_event("earlier failure");
    let record =
        DeadLetterRecord::from_failed_event(event, &err, "plugin_server_ingest_event", Utc::now())
            .unwrap();
    serde_json::to_string(&record).unwrap()
}

fn json_lines(events: &[RawEvent]) -> String {
    events
        .iter()
        .map(|event| serde_json::to_string(event).unwrap())
        .collect::<Vec<_>>()
        .join("\n")
}

fn dry_run_context(dead_letter: Arc<MockDeadLetterPublisher>) -> Arc<PipelineContext> {
    Arc::new(PipelineContext::new(
        Arc::new(DryRunSteps),
        Arc::new(InMemoryIdentityStore::new()),
        dead_letter,
    ))
}

fn config_writing_to(path: &Path) -> IngestionConfig {
    let mut config = IngestionConfig::default();
    config.dead_letter.path = path.to_path_buf();
    config
}

#[tokio::test]
async fn test_unreadable_lines_are_counted_not_dead_lettered() {
    let dead_letter = Arc::new(MockDeadLetterPublisher::new());
    let input = format!(
        "{}\n{{not json\n\n{}\n",
        json_lines(&[pageview("user-1")]),
        json_lines(&[pageview("user-2")])
    );

    let summary = drive_events(dry_run_context(dead_letter.clone()), input.as_bytes(), 4)
        .await
        .unwrap();

    assert_eq!(
        summary,
        RunSummary {
            events: 2,
            completed: 2,
            failed: 0,
            dead_lettered: 0,
            unreadable_lines: 1,
        }
    );
    assert_eq!(dead_letter.attempts(), 0);
}

#[tokio::test]
async fn test_failed_events_are_dead_lettered_from_input() {
    let dead_letter = Arc::new(MockDeadLetterPublisher::new());
    let input = json_lines(&[pageview("user-1"), broken_pageview("user-2")]);

    let summary = drive_events(dry_run_context(dead_letter.clone()), input.as_bytes(), 4)
        .await
        .unwrap();

    assert_eq!(summary.events, 2);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.dead_lettered, 1);

    let published = dead_letter.published().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].distinct_id, "user-2");
}

/// Steps that end at the first step after holding it open for a while
#[derive(Default)]
struct InFlightSteps {
    current: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl PipelineSteps for InFlightSteps {
    async fn plugins_process_event(
        &self,
        _runner: &EventPipelineRunner,
        _event: &RawEvent,
    ) -> PipelineResult<StepOutcome> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(StepOutcome::Terminate)
    }

    async fn prepare_event(
        &self,
        _runner: &EventPipelineRunner,
        _event: &RawEvent,
    ) -> PipelineResult<StepOutcome> {
        Ok(StepOutcome::Terminate)
    }

    async fn determine_should_buffer(
        &self,
        _runner: &EventPipelineRunner,
        _event: &NormalizedEvent,
    ) -> PipelineResult<StepOutcome> {
        Ok(StepOutcome::Terminate)
    }

    async fn create_event(
        &self,
        _runner: &EventPipelineRunner,
        _event: &NormalizedEvent,
        _person: Option<&Person>,
    ) -> PipelineResult<StepOutcome> {
        Ok(StepOutcome::Terminate)
    }

    async fn run_async_handlers(
        &self,
        _runner: &EventPipelineRunner,
        _event: &NormalizedEvent,
        _person: Option<&Person>,
    ) -> PipelineResult<StepOutcome> {
        Ok(StepOutcome::Terminate)
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_limit_is_respected() {
    let steps = Arc::new(InFlightSteps::default());
    let context = Arc::new(PipelineContext::new(
        steps.clone(),
        Arc::new(InMemoryIdentityStore::new()),
        Arc::new(MockDeadLetterPublisher::new()),
    ));
    let events: Vec<RawEvent> = (0..6).map(|i| pageview(&format!("user-{i}"))).collect();
    let input = json_lines(&events);

    let summary = drive_events(context, input.as_bytes(), 2).await.unwrap();

    assert_eq!(summary.events, 6);
    assert_eq!(summary.completed, 6);
    assert_eq!(steps.peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_replay_recovers_raw_payload_events() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("dead_letter.jsonl");
    let output = dir.path().join("replayed.jsonl");
    let good = pageview("user-1");
    let still_broken = broken_pageview("user-2");
    let content = format!(
        "{}\ngarbage\n{}\n",
        dead_letter_line(&good),
        dead_letter_line(&still_broken)
    );
    tokio::fs::write(&source, &content).await.unwrap();

    let metrics = Arc::new(MetricsCollector::new());
    let summary = replay_dead_letters(&config_writing_to(&output), &source, metrics.clone())
        .await
        .unwrap();

    assert_eq!(
        summary,
        RunSummary {
            events: 2,
            completed: 1,
            failed: 1,
            dead_lettered: 1,
            unreadable_lines: 1,
        }
    );
    assert_eq!(metrics.counter(SINGLE_EVENT_PROCESSED, &[]), 2);

    let replayed = tokio::fs::read_to_string(&output).await.unwrap();
    let records: Vec<DeadLetterRecord> = replayed
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].original_event().unwrap(), still_broken);

    assert_eq!(tokio::fs::read_to_string(&source).await.unwrap(), content);
}

#[tokio::test]
async fn test_replay_refuses_its_own_output_through_a_dotted_path() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("dead_letter.jsonl");
    let content = format!("{}\n", dead_letter_line(&broken_pageview("user-1")));
    tokio::fs::write(&source, &content).await.unwrap();

    let config = config_writing_to(&dir.path().join(".").join("dead_letter.jsonl"));
    let result =
        replay_dead_letters(&config, &source, Arc::new(MetricsCollector::new())).await;

    assert!(matches!(result, Err(HarnessError::ReplayIntoSource(_))));
    assert_eq!(tokio::fs::read_to_string(&source).await.unwrap(), content);
}

#[tokio::test]
async fn test_replay_of_missing_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_writing_to(&dir.path().join("replayed.jsonl"));

    let result = replay_dead_letters(
        &config,
        &dir.path().join("missing.jsonl"),
        Arc::new(MetricsCollector::new()),
    )
    .await;

    assert!(matches!(result, Err(HarnessError::Io(_))));
}
