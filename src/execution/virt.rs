//! In-process async steps
//!
//! A virtual step runs a user-supplied async function instead of spawning a
//! process. The function receives the shared run context and an [`Emitter`]
//! it can use to stream output and observe cancellation.

use crate::core::context::Context;
use crate::core::result::CommandResult;
use crate::events::{EventBus, PipelineEvent, StreamSource};
use crate::execution::{CancelToken, ExecOptions, ProcessorError, ProcessorErrorKind};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Boxed future produced by a virtual step's function
pub type VirtualFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// The body of a virtual step
///
/// Resolving `Ok(())` counts as success; any error fails the attempt and is
/// subject to the step's retry and disposition policy like a command failure.
pub type VirtualFunction = Arc<dyn Fn(Arc<Context>, Emitter) -> VirtualFuture + Send + Sync>;

#[derive(Default)]
struct OutputBuffers {
    stdout: String,
    stderr: String,
}

/// Streaming handle passed to a virtual step's function
///
/// Everything written through it is forwarded as stream events and kept for
/// the step's final result.
#[derive(Clone)]
pub struct Emitter {
    events: EventBus,
    cancel: CancelToken,
    buffers: Arc<Mutex<OutputBuffers>>,
}

impl Emitter {
    fn new(events: EventBus, cancel: CancelToken) -> Self {
        Self {
            events,
            cancel,
            buffers: Arc::new(Mutex::new(OutputBuffers::default())),
        }
    }

    /// Write a chunk to the step's stdout stream
    pub fn stdout(&self, chunk: impl AsRef<str>) {
        let chunk = chunk.as_ref();
        self.buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stdout
            .push_str(chunk);
        self.events.emit(PipelineEvent::Stdout {
            source: StreamSource::Virtual,
            chunk: chunk.to_string(),
        });
    }

    /// Write a chunk to the step's stderr stream
    pub fn stderr(&self, chunk: impl AsRef<str>) {
        let chunk = chunk.as_ref();
        self.buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stderr
            .push_str(chunk);
        self.events.emit(PipelineEvent::Stderr {
            source: StreamSource::Virtual,
            chunk: chunk.to_string(),
        });
    }

    /// Whether the run has been cancelled; long-running functions should
    /// poll this between units of work
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn snapshot(&self) -> (String, String) {
        let buffers = self
            .buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        (buffers.stdout.clone(), buffers.stderr.clone())
    }
}

/// Drives virtual step functions with timeout and cancellation handling
#[derive(Debug)]
pub struct VirtualProcessor {
    events: EventBus,
}

impl VirtualProcessor {
    pub fn new(events: EventBus) -> Self {
        Self { events }
    }

    pub async fn exec(
        &self,
        function: &VirtualFunction,
        context: Arc<Context>,
        options: &ExecOptions,
        cancel: &CancelToken,
    ) -> Result<CommandResult, ProcessorError> {
        debug!("running virtual step function");

        let emitter = Emitter::new(self.events.clone(), cancel.clone());
        let future = function(context, emitter.clone());
        let mut handle = tokio::spawn(future);

        let timed = options.armed_timeout().is_some();
        let timeout = options
            .armed_timeout()
            .unwrap_or(Duration::from_secs(60 * 60 * 24 * 365));

        let outcome = tokio::select! {
            joined = &mut handle => joined,
            _ = tokio::time::sleep(timeout), if timed => {
                handle.abort();
                let (stdout, stderr) = emitter.snapshot();
                return Err(ProcessorError::with_output(
                    ProcessorErrorKind::VirtualTimeout,
                    stdout,
                    stderr,
                ));
            },
            _ = cancel.cancelled() => {
                handle.abort();
                let (stdout, stderr) = emitter.snapshot();
                return Err(ProcessorError::with_output(
                    ProcessorErrorKind::Cancelled,
                    stdout,
                    stderr,
                ));
            },
        };

        let (stdout, stderr) = emitter.snapshot();
        match outcome {
            Ok(Ok(())) => Ok(CommandResult::success(stdout, stderr, None)),
            Ok(Err(error)) => Err(ProcessorError::with_output(
                ProcessorErrorKind::Virtual(error.to_string()),
                stdout,
                stderr,
            )),
            Err(join_error) => Err(ProcessorError::with_output(
                ProcessorErrorKind::Virtual(format!("step function panicked: {join_error}")),
                stdout,
                stderr,
            )),
        }
    }
}

/// Wrap an async closure body into a [`VirtualFunction`]
pub fn virtual_fn<F, Fut>(f: F) -> VirtualFunction
where
    F: Fn(Arc<Context>, Emitter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |context, emitter| Box::pin(f(context, emitter)))
}
