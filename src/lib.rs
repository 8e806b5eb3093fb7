//! convoy - a deployment pipeline runner
//!
//! Pipelines are ordered lists of steps that run strictly one after
//! another: local shell commands, commands on remote hosts over SSH, and
//! in-process async functions. Every step goes through the same retry and
//! disposition machinery, and the whole run is observable through a single
//! event channel.
//!
//! ```no_run
//! use convoy::{PipelineDescriptor, Step};
//!
//! # async fn run() {
//! let pipeline = PipelineDescriptor::new("Release api")
//!     .global("branch", "main")
//!     .step(Step::local("Run tests", "npm test"))
//!     .step(Step::local("Build", "npm run build").with_working_directory("app"))
//!     .build();
//!
//! let summary = pipeline.run().await;
//! assert!(summary.success);
//! # }
//! ```

pub mod cli;
pub mod core;
pub mod events;
pub mod execution;

// Re-export the types most callers need
pub use crate::core::{
    Backoff, Command, CommandResult, Context, Disposition, ExitDetail, Pipeline, PipelineConfig,
    PipelineDescriptor, PipelineEntry, RunPolicy, RunSummary, Step, StepBody,
};
pub use crate::events::{EventBus, PipelineEvent, PipelineObserver, StepKind, StreamSource};
pub use crate::execution::virt::{virtual_fn, Emitter, VirtualFunction};
pub use crate::execution::{CancelToken, ExecOptions, RemoteConfig, StepError};
