//! Shared test utilities
#![allow(dead_code)]

use convoy::{Pipeline, PipelineEvent};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

/// Collects every event a pipeline emits, in order
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<PipelineEvent>>>,
}

impl EventLog {
    pub fn attach(pipeline: &Pipeline) -> Self {
        let log = Self::default();
        let events = log.events.clone();
        pipeline.subscribe(move |event| {
            events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event.clone());
        });
        log
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Compact names for order assertions
    pub fn names(&self) -> Vec<String> {
        self.events()
            .iter()
            .map(|event| match event {
                PipelineEvent::PipelineInit { .. } => "init".to_string(),
                PipelineEvent::PipelineHeader { .. } => "header".to_string(),
                PipelineEvent::PipelineFinish { .. } => "finish".to_string(),
                PipelineEvent::PipelineFail { .. } => "fail".to_string(),
                PipelineEvent::StepInit { index, .. } => format!("step_init:{index}"),
                PipelineEvent::StepRetry { attempt, .. } => format!("step_retry:{attempt}"),
                PipelineEvent::StepFinish { .. } => "step_finish".to_string(),
                PipelineEvent::StepFail { .. } => "step_fail".to_string(),
                PipelineEvent::Stdout { .. } => "stdout".to_string(),
                PipelineEvent::Stderr { .. } => "stderr".to_string(),
                PipelineEvent::RemoteConnecting { .. } => "remote_connecting".to_string(),
                PipelineEvent::RemoteConnected { .. } => "remote_connected".to_string(),
                PipelineEvent::RemoteClosed { .. } => "remote_closed".to_string(),
            })
            .collect()
    }

    /// Names with stream chunks filtered out, since their count depends on
    /// OS pipe buffering
    pub fn lifecycle_names(&self) -> Vec<String> {
        self.names()
            .into_iter()
            .filter(|name| name != "stdout" && name != "stderr")
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.names().iter().filter(|n| n.as_str() == name).count()
    }

    pub fn retries(&self) -> usize {
        self.names()
            .iter()
            .filter(|n| n.starts_with("step_retry"))
            .count()
    }
}

/// Shell command that fails until it has been invoked `failures` times,
/// tracking attempts in a counter file under `dir`
pub fn flaky_command(dir: &Path, failures: usize) -> String {
    let counter = dir.join("attempts").display().to_string();
    format!(
        "n=$(cat {counter} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {counter}; test $n -gt {failures}"
    )
}
