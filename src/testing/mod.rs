//! Testing utilities and mock implementations
//!
//! This module provides scripted steps and recording doubles for exercising
//! the pipeline runner without real plugins, storage or queues.

pub mod mocks;

pub use mocks::*;
