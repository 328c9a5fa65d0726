//! Event ingestion pipeline
//!
//! [`steps`] holds the step registry and the stage trait, [`runner`] drives a
//! single event through it, and [`context`] carries the shared capabilities
//! every run is given.

pub mod context;
pub mod dry_run;
pub mod runner;
pub mod steps;

pub use context::{PipelineContext, StepTimeoutPolicy};
pub use dry_run::DryRunSteps;
pub use runner::{EventPipelineRunner, PipelineOutcome, PipelineState};
pub use steps::{PipelineSteps, Step, StepId, StepOutcome, ALL_STEPS, PRE_DURABILITY_STEPS};
