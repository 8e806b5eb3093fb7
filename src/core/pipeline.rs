//! Pipeline domain model
//!
//! A pipeline is an ordered list of entries (steps and section headers)
//! that runs strictly sequentially. `run` never returns an error: halts are
//! reported through events and folded into the returned [`RunSummary`].

use crate::core::context::Context;
use crate::core::result::CommandResult;
use crate::core::step::Step;
use crate::events::{EventBus, PipelineEvent, PipelineObserver};
use crate::execution::{
    CancelToken, ExecOptions, ProcessorError, ProcessorErrorKind, RemoteConfig,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// One position in the pipeline's ordered entry list
#[derive(Debug, Clone)]
pub enum PipelineEntry {
    Step(Step),
    /// A section marker; resets the step counter for the entries after it
    Header { title: String },
}

/// Everything needed to build a [`Pipeline`]
#[derive(Debug, Clone, Default)]
pub struct PipelineDescriptor {
    pub title: String,
    pub entries: Vec<PipelineEntry>,
    pub globals: HashMap<String, String>,
    pub remotes: HashMap<String, RemoteConfig>,
    pub local_options: ExecOptions,
    pub remote_options: ExecOptions,
    pub virtual_options: ExecOptions,
}

impl PipelineDescriptor {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn step(mut self, step: Step) -> Self {
        self.entries.push(PipelineEntry::Step(step));
        self
    }

    pub fn header(mut self, title: impl Into<String>) -> Self {
        self.entries.push(PipelineEntry::Header {
            title: title.into(),
        });
        self
    }

    pub fn global(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.globals.insert(key.into(), value.into());
        self
    }

    pub fn remote(mut self, id: impl Into<String>, config: RemoteConfig) -> Self {
        self.remotes.insert(id.into(), config);
        self
    }

    pub fn local_options(mut self, options: ExecOptions) -> Self {
        self.local_options = options;
        self
    }

    pub fn remote_options(mut self, options: ExecOptions) -> Self {
        self.remote_options = options;
        self
    }

    pub fn virtual_options(mut self, options: ExecOptions) -> Self {
        self.virtual_options = options;
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline::new(self)
    }
}

/// How a finished run went
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub success: bool,
    /// Steps that settled, counting the one that halted the run
    pub steps_run: usize,
    pub failure: Option<CommandResult>,
}

/// A sequential deployment pipeline
pub struct Pipeline {
    title: String,
    entries: Vec<PipelineEntry>,
    events: EventBus,
    context: Arc<Context>,
}

impl Pipeline {
    pub fn new(descriptor: PipelineDescriptor) -> Self {
        let events = EventBus::new();
        let context = Arc::new(Context::from_parts(
            events.clone(),
            descriptor.globals,
            descriptor.remotes,
            descriptor.local_options,
            descriptor.remote_options,
            descriptor.virtual_options,
        ));

        Self {
            title: descriptor.title,
            entries: descriptor.entries,
            events,
            context,
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Subscribe a closure to every run event
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&PipelineEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler);
    }

    /// Attach an observer to every run event
    pub fn attach(&self, observer: Arc<dyn PipelineObserver>) {
        self.events.attach(observer);
    }

    /// Run to completion with a fresh cancellation token
    pub async fn run(&self) -> RunSummary {
        self.run_with_cancel(&CancelToken::new()).await
    }

    /// Run every entry in order until one halts the pipeline
    ///
    /// Whatever happens, the finish event fires and every remote session is
    /// closed before this returns.
    pub async fn run_with_cancel(&self, cancel: &CancelToken) -> RunSummary {
        let run_id = Uuid::new_v4();
        info!(%run_id, title = %self.title, "pipeline starting");
        self.events.emit(PipelineEvent::PipelineInit {
            run_id,
            title: self.title.clone(),
            time: Utc::now(),
        });

        let mut index = 1usize;
        let mut steps_run = 0usize;
        let mut failure: Option<CommandResult> = None;

        for entry in &self.entries {
            if cancel.is_cancelled() {
                let error = ProcessorError::bare(ProcessorErrorKind::Cancelled).into_result();
                self.events.emit(PipelineEvent::PipelineFail {
                    error: error.clone(),
                    time: Utc::now(),
                });
                failure = Some(error);
                break;
            }

            match entry {
                PipelineEntry::Header { title } => {
                    self.events.emit(PipelineEvent::PipelineHeader {
                        title: title.clone(),
                        time: Utc::now(),
                    });
                    index = 1;
                }
                PipelineEntry::Step(step) => {
                    match step.run(&self.context, index, &self.events, cancel).await {
                        Ok(_) => {
                            steps_run += 1;
                            index += 1;
                        }
                        Err(halt) => {
                            steps_run += 1;
                            self.events.emit(PipelineEvent::PipelineFail {
                                error: halt.result.clone(),
                                time: Utc::now(),
                            });
                            failure = Some(halt.result);
                            break;
                        }
                    }
                }
            }
        }

        self.events
            .emit(PipelineEvent::PipelineFinish { time: Utc::now() });
        self.context.close_remotes().await;

        let success = failure.is_none();
        info!(%run_id, success, steps_run, "pipeline finished");
        RunSummary {
            run_id,
            success,
            steps_run,
            failure,
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("title", &self.title)
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}
