//! Batch driver behind the command-line tool
//!
//! Reads raw events (or dead-letter records) line by line, runs each through
//! its own [`EventPipelineRunner`] and tallies the outcomes.

use crate::config::{ConfigError, IngestionConfig};
use crate::dead_letter::{DeadLetterError, DeadLetterRecord, JsonLinesDeadLetterPublisher};
use crate::event::RawEvent;
use crate::identity::InMemoryIdentityStore;
use crate::observability::MetricsCollector;
use crate::pipeline::{DryRunSteps, EventPipelineRunner, PipelineContext, PipelineOutcome};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{AcquireError, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Errors that abort a whole batch
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("Failed to read input: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    DeadLetter(#[from] DeadLetterError),
    #[error("Concurrency limiter closed: {0}")]
    Limiter(#[from] AcquireError),
    #[error("Refusing to replay {} into itself; configure another dead_letter.path", .0.display())]
    ReplayIntoSource(PathBuf),
}

/// Totals for one batch
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub events: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub unreadable_lines: usize,
}

impl RunSummary {
    pub fn record(&mut self, outcome: PipelineOutcome) {
        self.events += 1;
        match outcome {
            PipelineOutcome::Completed { .. } => self.completed += 1,
            PipelineOutcome::Failed { dead_lettered, .. } => {
                self.failed += 1;
                if dead_lettered {
                    self.dead_lettered += 1;
                }
            }
        }
    }

    /// Count a runner that never produced an outcome
    pub fn record_lost(&mut self) {
        self.events += 1;
        self.failed += 1;
    }
}

/// Wire the dry-run steps and local backends into a shared context
pub async fn build_context(
    config: &IngestionConfig,
    metrics: Arc<MetricsCollector>,
) -> Result<Arc<PipelineContext>, HarnessError> {
    let dead_letter = JsonLinesDeadLetterPublisher::open(&config.dead_letter.path).await?;
    info!(
        "Dead-letter records go to: {}",
        dead_letter.path().display()
    );

    let context = PipelineContext::new(
        Arc::new(DryRunSteps),
        Arc::new(InMemoryIdentityStore::new()),
        Arc::new(dead_letter),
    )
    .with_metrics(metrics)
    .with_step_timeouts(config.step_timeouts()?)
    .with_error_location(config.dead_letter.error_location.clone());

    Ok(Arc::new(context))
}

/// Run every event read from `reader`, at most `max_concurrent` at a time
///
/// Lines that are not a raw event are logged and counted; there is no
/// original event to dead-letter for them.
pub async fn drive_events<R>(
    context: Arc<PipelineContext>,
    reader: R,
    max_concurrent: usize,
) -> Result<RunSummary, HarnessError>
where
    R: AsyncRead + Unpin,
{
    let permits = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let mut tasks = JoinSet::new();
    let mut summary = RunSummary::default();
    let mut lines = BufReader::new(reader).lines();
    let mut line_number = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }

        let event: RawEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!(line = line_number, error = %e, "Skipping unreadable event");
                summary.unreadable_lines += 1;
                continue;
            }
        };

        let permit = permits.clone().acquire_owned().await?;
        let context = context.clone();
        tasks.spawn(async move {
            let _permit = permit;
            EventPipelineRunner::new(context, Some(event.clone()))
                .run_main_pipeline(event)
                .await
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => summary.record(outcome),
            Err(e) => {
                error!(error = %e, "Pipeline runner task did not finish");
                summary.record_lost();
            }
        }
    }

    Ok(summary)
}

/// Original events stored in a dead-letter file, plus the number of lines
/// that could not be decoded
pub async fn read_dead_letter_events(path: &Path) -> Result<(Vec<RawEvent>, usize), HarnessError> {
    let content = tokio::fs::read_to_string(path).await?;
    let mut events = Vec::new();
    let mut unreadable = 0;

    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event = serde_json::from_str::<DeadLetterRecord>(line)
            .map_err(DeadLetterError::from)
            .and_then(|record| record.original_event());
        match event {
            Ok(event) => events.push(event),
            Err(e) => {
                warn!(line = index + 1, error = %e, "Skipping unreadable dead-letter record");
                unreadable += 1;
            }
        }
    }

    Ok((events, unreadable))
}

/// Re-run the original events of a dead-letter file
///
/// Fails before touching anything when the configured dead-letter output is
/// the file being replayed.
pub async fn replay_dead_letters(
    config: &IngestionConfig,
    dead_letter_file: &Path,
    metrics: Arc<MetricsCollector>,
) -> Result<RunSummary, HarnessError> {
    if is_same_file(dead_letter_file, &config.dead_letter.path).await {
        return Err(HarnessError::ReplayIntoSource(dead_letter_file.to_path_buf()));
    }

    let (events, unreadable_lines) = read_dead_letter_events(dead_letter_file).await?;
    info!("Replaying {} dead-lettered events", events.len());

    let context = build_context(config, metrics).await?;
    let mut summary = RunSummary {
        unreadable_lines,
        ..Default::default()
    };

    for event in events {
        let outcome = EventPipelineRunner::new(context.clone(), Some(event.clone()))
            .run_main_pipeline(event)
            .await;
        summary.record(outcome);
    }

    Ok(summary)
}

/// Whether two paths name the same existing file
async fn is_same_file(a: &Path, b: &Path) -> bool {
    match (
        tokio::fs::canonicalize(a).await,
        tokio::fs::canonicalize(b).await,
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
