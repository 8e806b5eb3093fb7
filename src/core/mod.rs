//! Core domain model: pipelines, steps, results, and the run context

pub mod config;
pub mod context;
pub mod pipeline;
pub mod result;
pub mod step;
pub mod vars;

pub use config::PipelineConfig;
pub use context::Context;
pub use pipeline::{Pipeline, PipelineDescriptor, PipelineEntry, RunSummary};
pub use result::{CommandResult, ExitDetail};
pub use step::{Backoff, Command, Disposition, RunPolicy, Step, StepBody};
