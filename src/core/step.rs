//! Step domain model
//!
//! A step pairs a body (what to run and where) with a policy (how its
//! outcome is judged) and execution options. Commands can be fixed strings
//! or functions of the run context, and both go through `:name:` variable
//! substitution right before execution.

use crate::core::context::Context;
use crate::core::result::CommandResult;
use crate::core::vars;
use crate::events::{EventBus, PipelineEvent, StepKind};
use crate::execution::retry::{run_with_retry, StepEvents};
use crate::execution::{
    CancelToken, ExecOptions, Processor, ProcessorError, ProcessorErrorKind, StepError,
    VirtualFunction,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// A command string, fixed up front or computed from the run context
#[derive(Clone)]
pub enum Command {
    Static(String),
    Dynamic(Arc<dyn Fn(&Context) -> anyhow::Result<String> + Send + Sync>),
}

impl Command {
    /// Produce the final command string, with `:name:` tokens substituted
    /// from the current globals
    pub(crate) fn resolve(&self, context: &Context) -> Result<String, ProcessorError> {
        let raw = match self {
            Command::Static(command) => command.clone(),
            Command::Dynamic(f) => f(context).map_err(|error| {
                ProcessorError::bare(ProcessorErrorKind::CommandResolution(error.to_string()))
            })?,
        };
        Ok(vars::substitute(&raw, &context.globals_snapshot()))
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Static(command) => f.debug_tuple("Static").field(command).finish(),
            Command::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

impl From<&str> for Command {
    fn from(command: &str) -> Self {
        Command::Static(command.to_string())
    }
}

impl From<String> for Command {
    fn from(command: String) -> Self {
        Command::Static(command)
    }
}

/// What to do with the pipeline after a step settles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    Continue,
    Terminate,
}

/// Delay schedule between retry attempts
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Backoff {
    #[default]
    None,
    Constant(Duration),
    Exponential {
        base: Duration,
    },
}

/// How a step's attempts and outcome are judged
///
/// The defaults give the intuitive behavior: no retries, success moves on,
/// failure halts the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPolicy {
    /// Re-attempts allowed after the first failure
    pub max_retries: usize,

    /// Applied when an attempt succeeds
    pub on_success: Disposition,

    /// Applied when the final attempt fails
    pub on_failure: Disposition,

    /// Delay between attempts
    pub backoff: Backoff,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            on_success: Disposition::Continue,
            on_failure: Disposition::Terminate,
            backoff: Backoff::None,
        }
    }
}

/// What a step runs and where
#[derive(Clone)]
pub enum StepBody {
    Local {
        command: Command,
        working_directory: Option<String>,
    },
    Remote {
        command: Command,
        /// Target remote; may be omitted when the pipeline configures
        /// exactly one remote
        remote_id: Option<String>,
        working_directory: Option<String>,
    },
    Virtual {
        function: VirtualFunction,
    },
}

impl StepBody {
    fn kind(&self) -> StepKind {
        match self {
            StepBody::Local { .. } => StepKind::Local,
            StepBody::Remote { .. } => StepKind::Remote,
            StepBody::Virtual { .. } => StepKind::Virtual,
        }
    }
}

impl std::fmt::Debug for StepBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepBody::Local {
                command,
                working_directory,
            } => f
                .debug_struct("Local")
                .field("command", command)
                .field("working_directory", working_directory)
                .finish(),
            StepBody::Remote {
                command,
                remote_id,
                working_directory,
            } => f
                .debug_struct("Remote")
                .field("command", command)
                .field("remote_id", remote_id)
                .field("working_directory", working_directory)
                .finish(),
            StepBody::Virtual { .. } => f.write_str("Virtual { .. }"),
        }
    }
}

/// A single runnable unit of the pipeline
#[derive(Debug, Clone)]
pub struct Step {
    pub title: String,
    pub body: StepBody,
    pub policy: RunPolicy,
    pub options: ExecOptions,
}

impl Step {
    pub fn local(title: impl Into<String>, command: impl Into<Command>) -> Self {
        Self {
            title: title.into(),
            body: StepBody::Local {
                command: command.into(),
                working_directory: None,
            },
            policy: RunPolicy::default(),
            options: ExecOptions::default(),
        }
    }

    pub fn remote(
        title: impl Into<String>,
        remote_id: impl Into<String>,
        command: impl Into<Command>,
    ) -> Self {
        Self {
            title: title.into(),
            body: StepBody::Remote {
                command: command.into(),
                remote_id: Some(remote_id.into()),
                working_directory: None,
            },
            policy: RunPolicy::default(),
            options: ExecOptions::default(),
        }
    }

    pub fn virtual_step(title: impl Into<String>, function: VirtualFunction) -> Self {
        Self {
            title: title.into(),
            body: StepBody::Virtual { function },
            policy: RunPolicy::default(),
            options: ExecOptions::default(),
        }
    }

    pub fn with_working_directory(mut self, dir: impl Into<String>) -> Self {
        match &mut self.body {
            StepBody::Local {
                working_directory, ..
            }
            | StepBody::Remote {
                working_directory, ..
            } => *working_directory = Some(dir.into()),
            StepBody::Virtual { .. } => {}
        }
        self
    }

    pub fn with_policy(mut self, policy: RunPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_options(mut self, options: ExecOptions) -> Self {
        self.options = options;
        self
    }

    fn working_directory(&self) -> Option<&str> {
        match &self.body {
            StepBody::Local {
                working_directory, ..
            }
            | StepBody::Remote {
                working_directory, ..
            } => working_directory.as_deref(),
            StepBody::Virtual { .. } => None,
        }
    }

    /// Run this step to a settled outcome
    ///
    /// An `Err` means the pipeline must halt; an `Ok` carries the result the
    /// run continues past, which is non-ok when an `on_failure: continue`
    /// disposition absorbed the failure.
    pub async fn run(
        &self,
        context: &Arc<Context>,
        index: usize,
        events: &EventBus,
        cancel: &CancelToken,
    ) -> Result<CommandResult, StepError> {
        let kind = self.body.kind();
        let step_events = StepEvents::new(events.clone(), kind);

        // resolve before announcing the step so the init event can carry
        // the final command string
        let command = match &self.body {
            StepBody::Local {
                command,
                working_directory,
            }
            | StepBody::Remote {
                command,
                working_directory,
                ..
            } => match command.resolve(context) {
                Ok(resolved) => Some(apply_working_directory(&resolved, working_directory)),
                Err(error) => {
                    let result = error.into_result();
                    events.emit(PipelineEvent::StepFail {
                        kind,
                        error: result.clone(),
                        time: Utc::now(),
                    });
                    return Err(StepError::failed(result));
                }
            },
            StepBody::Virtual { .. } => None,
        };

        // pick the target remote up front; the context default (set when
        // exactly one remote is configured) wins over the step's own id, and
        // a missing target halts before the step is announced
        let remote = match &self.body {
            StepBody::Remote { remote_id, .. } => {
                let target = context
                    .default_remote_id()
                    .or(remote_id.as_deref())
                    .map(str::to_string);
                match target.and_then(|id| context.remote(&id).map(|p| (id, p))) {
                    Some(selected) => Some(selected),
                    None => {
                        let result = ProcessorError::bare(ProcessorErrorKind::RemoteNotConfigured)
                            .into_result();
                        events.emit(PipelineEvent::StepFail {
                            kind,
                            error: result.clone(),
                            time: Utc::now(),
                        });
                        return Err(StepError::failed(result));
                    }
                }
            }
            _ => None,
        };

        events.emit(PipelineEvent::StepInit {
            kind,
            index,
            title: self.title.clone(),
            command: command.clone(),
            working_directory: self.working_directory().map(str::to_string),
            remote_id: remote.as_ref().map(|(id, _)| id.clone()),
            time: Utc::now(),
        });

        let outcome = match &self.body {
            StepBody::Local { .. } => {
                let options = self.options.merged_under(context.local_options());
                let command = command.unwrap_or_default();
                let processor = context.local();
                run_with_retry(&self.policy, &step_events, || {
                    let command = command.clone();
                    let options = options.clone();
                    async move { processor.exec(&command, &options, cancel).await }
                })
                .await
            }
            StepBody::Remote { .. } => {
                // selection settled before the init event
                let Some((_, processor)) = &remote else {
                    return Err(StepError::failed(
                        ProcessorError::bare(ProcessorErrorKind::RemoteNotConfigured).into_result(),
                    ));
                };
                let options = self.options.merged_under(context.remote_options());
                let command = command.unwrap_or_default();
                run_with_retry(&self.policy, &step_events, || {
                    let command = command.clone();
                    let options = options.clone();
                    async move { processor.exec(&command, &options, cancel).await }
                })
                .await
            }
            StepBody::Virtual { function } => {
                let options = self.options.merged_under(context.virtual_options());
                let processor = context.virtual_processor();
                run_with_retry(&self.policy, &step_events, || {
                    let function = function.clone();
                    let context = context.clone();
                    let options = options.clone();
                    async move {
                        processor
                            .exec(&function, context, &options, cancel)
                            .await
                    }
                })
                .await
            }
        };

        if let Ok(result) = &outcome {
            context.record_result(result.clone());
        }
        outcome
    }
}

fn apply_working_directory(command: &str, working_directory: &Option<String>) -> String {
    match working_directory {
        Some(dir) => format!("cd {dir} && {command}"),
        None => command.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::virt::virtual_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn context() -> Arc<Context> {
        Arc::new(Context::new(EventBus::new()))
    }

    #[test]
    fn test_static_command_substitutes_globals() {
        let context = context();
        context.set_global("branch", "main");
        let command = Command::from("git checkout :branch:");
        assert_eq!(
            command.resolve(&context).expect("resolves"),
            "git checkout main"
        );
    }

    #[test]
    fn test_dynamic_command_sees_the_context() {
        let context = context();
        context.set_global("app", "api");
        let command = Command::Dynamic(Arc::new(|ctx: &Context| {
            Ok(format!(
                "restart {}",
                ctx.global("app").unwrap_or_default()
            ))
        }));
        assert_eq!(command.resolve(&context).expect("resolves"), "restart api");
    }

    #[test]
    fn test_dynamic_command_error_maps_to_resolution_failure() {
        let command =
            Command::Dynamic(Arc::new(|_: &Context| anyhow::bail!("no release selected")));
        let err = command.resolve(&context()).expect_err("should fail");
        assert!(matches!(
            err.kind,
            ProcessorErrorKind::CommandResolution(_)
        ));
        assert!(err.to_string().contains("no release selected"));
    }

    #[test]
    fn test_working_directory_prefixes_with_cd() {
        assert_eq!(
            apply_working_directory("make deploy", &Some("app/current".to_string())),
            "cd app/current && make deploy"
        );
        assert_eq!(apply_working_directory("make deploy", &None), "make deploy");
    }

    #[test]
    fn test_policy_defaults() {
        let policy = RunPolicy::default();
        assert_eq!(policy.max_retries, 0);
        assert_eq!(policy.on_success, Disposition::Continue);
        assert_eq!(policy.on_failure, Disposition::Terminate);
        assert_eq!(policy.backoff, Backoff::None);
    }

    #[tokio::test]
    async fn test_local_step_runs_and_records_history() {
        let events = EventBus::new();
        let context = Arc::new(Context::new(events.clone()));
        let step = Step::local("greet", "echo hi");

        let result = step
            .run(&context, 1, &events, &CancelToken::new())
            .await
            .expect("echo should pass");

        assert!(result.ok);
        assert_eq!(result.stdout.trim(), "hi");
        assert_eq!(context.history().len(), 1);
    }

    #[tokio::test]
    async fn test_virtual_step_can_write_globals() {
        let events = EventBus::new();
        let context = Arc::new(Context::new(events.clone()));
        let step = Step::virtual_step(
            "pick release",
            virtual_fn(|ctx, _emitter| async move {
                ctx.set_global("release", "v42");
                Ok(())
            }),
        );

        step.run(&context, 1, &events, &CancelToken::new())
            .await
            .expect("function resolves");
        assert_eq!(context.global("release").as_deref(), Some("v42"));
    }

    #[tokio::test]
    async fn test_missing_remote_fails_without_running_anything() {
        let events = EventBus::new();
        let fails = Arc::new(AtomicUsize::new(0));
        let seen = fails.clone();
        events.subscribe(move |event| {
            if matches!(event, PipelineEvent::StepFail { .. }) {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        let context = Arc::new(Context::new(events.clone()));
        let step = Step::remote("restart", "ghost", "systemctl restart app");

        let err = step
            .run(&context, 1, &events, &CancelToken::new())
            .await
            .expect_err("unknown remote must fail");

        assert_eq!(
            err.to_string(),
            "Remote not configred or unmatching remoteId provided"
        );
        assert_eq!(fails.load(Ordering::SeqCst), 1);
        assert!(context.history().is_empty());
    }

    #[tokio::test]
    async fn test_omitted_remote_id_fails_when_no_remote_exists() {
        let events = EventBus::new();
        let context = Arc::new(Context::new(events.clone()));
        let step = Step {
            title: "restart".to_string(),
            body: StepBody::Remote {
                command: "systemctl restart app".into(),
                remote_id: None,
                working_directory: None,
            },
            policy: RunPolicy::default(),
            options: ExecOptions::default(),
        };

        let err = step
            .run(&context, 1, &events, &CancelToken::new())
            .await
            .expect_err("no remote to default to");
        assert_eq!(
            err.to_string(),
            "Remote not configred or unmatching remoteId provided"
        );
    }

    #[tokio::test]
    async fn test_dynamic_resolution_error_skips_init_and_retries() {
        let events = EventBus::new();
        let inits = Arc::new(AtomicUsize::new(0));
        let retries = Arc::new(AtomicUsize::new(0));
        let seen_inits = inits.clone();
        let seen_retries = retries.clone();
        events.subscribe(move |event| match event {
            PipelineEvent::StepInit { .. } => {
                seen_inits.fetch_add(1, Ordering::SeqCst);
            }
            PipelineEvent::StepRetry { .. } => {
                seen_retries.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        });

        let context = Arc::new(Context::new(events.clone()));
        let mut step = Step::local(
            "broken",
            Command::Dynamic(Arc::new(|_: &Context| anyhow::bail!("boom"))),
        );
        step.policy.max_retries = 5;

        let err = step
            .run(&context, 1, &events, &CancelToken::new())
            .await
            .expect_err("resolution failure halts");
        assert!(err.to_string().contains("boom"));
        assert_eq!(inits.load(Ordering::SeqCst), 0);
        assert_eq!(retries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_init_event_carries_the_resolved_command() {
        let events = EventBus::new();
        let commands = Arc::new(Mutex::new(Vec::new()));
        let seen = commands.clone();
        events.subscribe(move |event| {
            if let PipelineEvent::StepInit { command, .. } = event {
                seen.lock().unwrap().push(command.clone());
            }
        });

        let context = Arc::new(Context::new(events.clone()));
        context.set_global("name", "world");
        let step = Step::local("greet", "echo :name:").with_working_directory("/tmp");

        step.run(&context, 1, &events, &CancelToken::new())
            .await
            .expect("echo should pass");

        let seen = commands.lock().unwrap();
        assert_eq!(seen.as_slice(), [Some("cd /tmp && echo world".to_string())]);
    }
}
