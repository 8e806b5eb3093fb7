//! Pipeline lifecycle events and the observer surface
//!
//! Everything the engine does is reported through a single tagged event
//! channel. Steps and processors emit into an [`EventBus`]; the bus fans
//! each event out to subscribed handlers synchronously, in subscription
//! order, on the emitting task.

use crate::core::result::CommandResult;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

/// Which step variant emitted a step event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Local,
    Remote,
    Virtual,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepKind::Local => write!(f, "local"),
            StepKind::Remote => write!(f, "remote"),
            StepKind::Virtual => write!(f, "virtual"),
        }
    }
}

/// Which processor produced a stream chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    Local,
    Remote,
    Virtual,
}

/// Events that occur during a pipeline run
///
/// Per-step ordering guarantee: one `StepInit`, zero or more `StepRetry`,
/// then exactly one of `StepFinish` / `StepFail`.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    PipelineInit {
        run_id: Uuid,
        title: String,
        time: DateTime<Utc>,
    },
    PipelineHeader {
        title: String,
        time: DateTime<Utc>,
    },
    PipelineFinish {
        time: DateTime<Utc>,
    },
    PipelineFail {
        error: CommandResult,
        time: DateTime<Utc>,
    },
    StepInit {
        kind: StepKind,
        index: usize,
        title: String,
        command: Option<String>,
        working_directory: Option<String>,
        remote_id: Option<String>,
        time: DateTime<Utc>,
    },
    StepRetry {
        kind: StepKind,
        attempt: usize,
        time: DateTime<Utc>,
    },
    StepFinish {
        kind: StepKind,
        result: CommandResult,
        time: DateTime<Utc>,
    },
    StepFail {
        kind: StepKind,
        error: CommandResult,
        time: DateTime<Utc>,
    },
    Stdout {
        source: StreamSource,
        chunk: String,
    },
    Stderr {
        source: StreamSource,
        chunk: String,
    },
    RemoteConnecting {
        remote_id: String,
    },
    RemoteConnected {
        remote_id: String,
    },
    RemoteClosed {
        remote_id: String,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(&PipelineEvent) + Send + Sync>;

/// Fan-out channel for pipeline events
///
/// Cloning is cheap and clones share the same subscriber list.
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<Mutex<Vec<EventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a handler closure to every event
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&PipelineEvent) + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Attach an observer, dispatching each event to its hooks
    pub fn attach(&self, observer: Arc<dyn PipelineObserver>) {
        self.subscribe(move |event| dispatch(observer.as_ref(), event));
    }

    pub(crate) fn emit(&self, event: PipelineEvent) {
        let handlers = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for handler in handlers.iter() {
            handler(&event);
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

/// Polymorphic event listener with overridable no-op hooks
///
/// Implement only the hooks you care about; the rest default to doing
/// nothing.
#[allow(unused_variables)]
pub trait PipelineObserver: Send + Sync {
    fn pipeline_init(&self, run_id: Uuid, title: &str, time: DateTime<Utc>) {}
    fn pipeline_header(&self, title: &str, time: DateTime<Utc>) {}
    fn pipeline_finish(&self, time: DateTime<Utc>) {}
    fn pipeline_fail(&self, error: &CommandResult, time: DateTime<Utc>) {}

    #[allow(clippy::too_many_arguments)]
    fn step_init(
        &self,
        kind: StepKind,
        index: usize,
        title: &str,
        command: Option<&str>,
        working_directory: Option<&str>,
        remote_id: Option<&str>,
        time: DateTime<Utc>,
    ) {
    }
    fn step_retry(&self, kind: StepKind, attempt: usize, time: DateTime<Utc>) {}
    fn step_finish(&self, kind: StepKind, result: &CommandResult, time: DateTime<Utc>) {}
    fn step_fail(&self, kind: StepKind, error: &CommandResult, time: DateTime<Utc>) {}

    fn stdout(&self, source: StreamSource, chunk: &str) {}
    fn stderr(&self, source: StreamSource, chunk: &str) {}

    fn remote_connecting(&self, remote_id: &str) {}
    fn remote_connected(&self, remote_id: &str) {}
    fn remote_closed(&self, remote_id: &str) {}
}

/// Dispatch one event to the matching observer hook
pub fn dispatch(observer: &dyn PipelineObserver, event: &PipelineEvent) {
    match event {
        PipelineEvent::PipelineInit { run_id, title, time } => {
            observer.pipeline_init(*run_id, title, *time)
        }
        PipelineEvent::PipelineHeader { title, time } => observer.pipeline_header(title, *time),
        PipelineEvent::PipelineFinish { time } => observer.pipeline_finish(*time),
        PipelineEvent::PipelineFail { error, time } => observer.pipeline_fail(error, *time),
        PipelineEvent::StepInit {
            kind,
            index,
            title,
            command,
            working_directory,
            remote_id,
            time,
        } => observer.step_init(
            *kind,
            *index,
            title,
            command.as_deref(),
            working_directory.as_deref(),
            remote_id.as_deref(),
            *time,
        ),
        PipelineEvent::StepRetry { kind, attempt, time } => {
            observer.step_retry(*kind, *attempt, *time)
        }
        PipelineEvent::StepFinish { kind, result, time } => {
            observer.step_finish(*kind, result, *time)
        }
        PipelineEvent::StepFail { kind, error, time } => observer.step_fail(*kind, error, *time),
        PipelineEvent::Stdout { source, chunk } => observer.stdout(*source, chunk),
        PipelineEvent::Stderr { source, chunk } => observer.stderr(*source, chunk),
        PipelineEvent::RemoteConnecting { remote_id } => observer.remote_connecting(remote_id),
        PipelineEvent::RemoteConnected { remote_id } => observer.remote_connected(remote_id),
        PipelineEvent::RemoteClosed { remote_id } => observer.remote_closed(remote_id),
    }
}
