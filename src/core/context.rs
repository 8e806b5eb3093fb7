//! Shared run context
//!
//! One [`Context`] is built per pipeline and handed to every step as an
//! `Arc`. It owns the processors, the global variable bindings, the run
//! history, and the per-kind default execution options. Globals and history
//! sit behind mutexes so virtual step functions can read and write them
//! through the shared handle; the pipeline's strict sequential execution
//! keeps those updates ordered.

use crate::core::result::CommandResult;
use crate::events::EventBus;
use crate::execution::{
    ExecOptions, LocalProcessor, RemoteConfig, RemoteProcessor, VirtualProcessor,
};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

pub struct Context {
    events: EventBus,
    globals: Mutex<HashMap<String, String>>,
    history: Mutex<Vec<CommandResult>>,
    local: LocalProcessor,
    virtual_processor: VirtualProcessor,
    remotes: HashMap<String, RemoteProcessor>,
    /// Set when exactly one remote is configured; remote steps then target
    /// it without naming it
    default_remote_id: Option<String>,
    local_options: ExecOptions,
    remote_options: ExecOptions,
    virtual_options: ExecOptions,
}

impl Context {
    pub fn new(events: EventBus) -> Self {
        Self::from_parts(
            events,
            HashMap::new(),
            HashMap::new(),
            ExecOptions::default(),
            ExecOptions::default(),
            ExecOptions::default(),
        )
    }

    pub(crate) fn from_parts(
        events: EventBus,
        globals: HashMap<String, String>,
        remotes: HashMap<String, RemoteConfig>,
        local_options: ExecOptions,
        remote_options: ExecOptions,
        virtual_options: ExecOptions,
    ) -> Self {
        let remotes: HashMap<String, RemoteProcessor> = remotes
            .into_iter()
            .map(|(id, config)| {
                let processor = RemoteProcessor::new(id.clone(), config, events.clone());
                (id, processor)
            })
            .collect();

        let default_remote_id = match remotes.len() {
            1 => remotes.keys().next().cloned(),
            _ => None,
        };

        Self {
            local: LocalProcessor::new(events.clone()),
            virtual_processor: VirtualProcessor::new(events.clone()),
            events,
            globals: Mutex::new(globals),
            history: Mutex::new(Vec::new()),
            remotes,
            default_remote_id,
            local_options,
            remote_options,
            virtual_options,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Set or overwrite a global variable binding
    pub fn set_global(&self, key: impl Into<String>, value: impl Into<String>) {
        self.globals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
    }

    pub fn global(&self, key: &str) -> Option<String> {
        self.globals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Current bindings, cloned for substitution
    pub fn globals_snapshot(&self) -> HashMap<String, String> {
        self.globals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn record_result(&self, result: CommandResult) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(result);
    }

    /// Result of the most recently settled step, if any
    pub fn last_result(&self) -> Option<CommandResult> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    /// Results of every settled step so far, in run order
    pub fn history(&self) -> Vec<CommandResult> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn local(&self) -> &LocalProcessor {
        &self.local
    }

    pub(crate) fn virtual_processor(&self) -> &VirtualProcessor {
        &self.virtual_processor
    }

    pub(crate) fn remote(&self, id: &str) -> Option<&RemoteProcessor> {
        self.remotes.get(id)
    }

    pub(crate) fn default_remote_id(&self) -> Option<&str> {
        self.default_remote_id.as_deref()
    }

    pub fn remote_ids(&self) -> impl Iterator<Item = &str> {
        self.remotes.keys().map(String::as_str)
    }

    pub(crate) fn local_options(&self) -> &ExecOptions {
        &self.local_options
    }

    pub(crate) fn remote_options(&self) -> &ExecOptions {
        &self.remote_options
    }

    pub(crate) fn virtual_options(&self) -> &ExecOptions {
        &self.virtual_options
    }

    /// Close every remote session; safe to call when none are open
    pub async fn close_remotes(&self) {
        for remote in self.remotes.values() {
            remote.close().await;
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("remotes", &self.remotes.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
