//! Event Pipeline - ingestion runner for analytics events
//!
//! Drives one event at a time through a fixed chain of processing steps,
//! recording per-step metrics and routing early failures to a dead-letter
//! queue so the original event can be replayed.
//!
//! # Overview
//!
//! - A closed registry of steps ([`pipeline::StepId`], [`pipeline::Step`])
//! - A single-use runner with a main entry point and a buffer-resume entry point
//! - Dead-letter records that preserve the raw event
//! - Pluggable metrics, error reporting and identity lookup
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use event_pipeline::dead_letter::JsonLinesDeadLetterPublisher;
//! use event_pipeline::event::RawEvent;
//! use event_pipeline::identity::InMemoryIdentityStore;
//! use event_pipeline::observability::MetricsCollector;
//! use event_pipeline::pipeline::{DryRunSteps, EventPipelineRunner, PipelineContext};
//! use chrono::Utc;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let dead_letter = JsonLinesDeadLetterPublisher::open("dead_letter.jsonl").await?;
//! let context = Arc::new(
//!     PipelineContext::new(
//!         Arc::new(DryRunSteps),
//!         Arc::new(InMemoryIdentityStore::new()),
//!         Arc::new(dead_letter),
//!     )
//!     .with_metrics(Arc::new(MetricsCollector::new())),
//! );
//!
//! let event = RawEvent::new("user-1", 2, "$pageview", Utc::now());
//! let outcome = EventPipelineRunner::new(context, Some(event.clone()))
//!     .run_main_pipeline(event)
//!     .await;
//! assert!(outcome.is_completed());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dead_letter;
pub mod error;
pub mod event;
pub mod harness;
pub mod identity;
pub mod observability;
pub mod pipeline;
pub mod reporting;
pub mod testing;

pub use config::{ConfigError, IngestionConfig};
pub use error::{PipelineError, PipelineResult};
pub use event::{NormalizedEvent, Person, RawEvent};
pub use pipeline::{
    EventPipelineRunner, PipelineContext, PipelineOutcome, PipelineState, PipelineSteps, Step,
    StepId, StepOutcome,
};
