//! Step execution: processors, retry engine, cancellation

pub mod cancel;
pub mod local;
pub mod remote;
pub mod retry;
pub mod virt;

pub use cancel::CancelToken;
pub use local::LocalProcessor;
pub use remote::{ConnectionStatus, RemoteConfig, RemoteProcessor};
pub use retry::StepError;
pub use virt::{Emitter, VirtualFunction, VirtualProcessor};

use crate::core::result::CommandResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Default cap on accumulated stdout/stderr per command (8 MiB)
pub const DEFAULT_MAX_BUFFER: usize = 8 * 1024 * 1024;

/// Execution options for a single processor call
///
/// Steps merge their own options over the pipeline-level defaults; unset
/// fields fall through to the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOptions {
    /// Hard limit on how long the call may run
    pub timeout: Option<Duration>,

    /// Extra environment variables for the spawned command
    pub env: HashMap<String, String>,

    /// Cap on accumulated output bytes
    pub max_buffer: Option<usize>,
}

impl ExecOptions {
    /// Merge these options over a set of defaults; fields set here win
    pub fn merged_under(&self, defaults: &ExecOptions) -> ExecOptions {
        let mut env = defaults.env.clone();
        env.extend(self.env.clone());

        ExecOptions {
            timeout: self.timeout.or(defaults.timeout),
            env,
            max_buffer: self.max_buffer.or(defaults.max_buffer),
        }
    }

    /// Timeout as an armed duration, `None` when absent or zero
    pub(crate) fn armed_timeout(&self) -> Option<Duration> {
        self.timeout.filter(|t| !t.is_zero())
    }
}

/// Capability shared by the command-driven processors (local and remote)
///
/// A single processor instance is not safe for concurrent overlapping
/// calls; the pipeline runs steps strictly sequentially and never issues
/// them.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Execute a finalized command string, streaming output events along
    /// the way
    async fn exec(
        &self,
        command: &str,
        options: &ExecOptions,
        cancel: &CancelToken,
    ) -> Result<CommandResult, ProcessorError>;
}

/// Infrastructure-level failure of a processor call
///
/// Non-zero exits are not errors at this level; they come back as non-ok
/// [`CommandResult`]s. Errors carry whatever output accumulated before the
/// failure.
#[derive(Debug, Clone, Error)]
#[error("{kind}")]
pub struct ProcessorError {
    pub kind: ProcessorErrorKind,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Error)]
pub enum ProcessorErrorKind {
    #[error("there was a problem trying to connect to the host {host}: {message}")]
    Connect { host: String, message: String },

    #[error("Remote command timeout")]
    RemoteTimeout,

    #[error("Network error")]
    Network,

    #[error("Local command timeout")]
    LocalTimeout,

    #[error("Virtual async function timeout")]
    VirtualTimeout,

    #[error("{0}")]
    Virtual(String),

    #[error("failed to spawn command: {0}")]
    Spawn(String),

    #[error("output exceeded the {0} byte buffer limit")]
    BufferExceeded(usize),

    #[error("Remote not configred or unmatching remoteId provided")]
    RemoteNotConfigured,

    #[error("command resolution failed: {0}")]
    CommandResolution(String),

    #[error("cancelled")]
    Cancelled,
}

impl ProcessorError {
    /// An error with no accumulated output
    pub fn bare(kind: ProcessorErrorKind) -> Self {
        Self {
            kind,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// An error preserving the output accumulated before the failure
    pub fn with_output(kind: ProcessorErrorKind, stdout: String, stderr: String) -> Self {
        Self { kind, stdout, stderr }
    }

    /// Normalize into the canonical result shape
    pub fn into_result(self) -> CommandResult {
        CommandResult::failure(self.kind.to_string(), self.stdout, self.stderr, None)
    }
}
