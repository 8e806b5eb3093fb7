//! Pipeline configuration from YAML
//!
//! The config surface covers headers, local steps, and remote steps.
//! Virtual steps carry arbitrary Rust functions and are only available when
//! building a pipeline in code.

use crate::core::pipeline::{Pipeline, PipelineDescriptor, PipelineEntry};
use crate::core::step::{Backoff, Disposition, RunPolicy, Step, StepBody};
use crate::execution::{ExecOptions, RemoteConfig};
use anyhow::{bail, Context as _, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Top-level pipeline configuration loaded from YAML
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline title shown in events and console output
    #[serde(default = "default_title")]
    pub title: String,

    /// Initial `:name:` variable bindings
    #[serde(default)]
    pub globals: HashMap<String, String>,

    /// Remote hosts, keyed by the id steps refer to
    #[serde(default)]
    pub remotes: HashMap<String, RemoteConfig>,

    /// Default options for local steps
    #[serde(default)]
    pub local_options: ExecOptionsConfig,

    /// Default options for remote steps
    #[serde(default)]
    pub remote_options: ExecOptionsConfig,

    /// Default options for virtual steps added in code
    #[serde(default)]
    pub virtual_options: ExecOptionsConfig,

    /// Pipeline entries, in run order
    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

fn default_title() -> String {
    "Untitled".to_string()
}

/// Execution options as written in YAML
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecOptionsConfig {
    /// Timeout in milliseconds; absent or zero means unlimited
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Extra environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Cap on accumulated output bytes
    #[serde(default)]
    pub max_buffer: Option<usize>,
}

impl ExecOptionsConfig {
    pub fn to_options(&self) -> ExecOptions {
        ExecOptions {
            timeout: self.timeout_ms.map(Duration::from_millis),
            env: self.env.clone(),
            max_buffer: self.max_buffer,
        }
    }
}

/// Retry and disposition settings as written in YAML
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyConfig {
    /// Re-attempts after the first failure; negative values clamp to zero
    #[serde(default)]
    pub max_retries: Option<i64>,

    #[serde(default)]
    pub on_success: Option<Disposition>,

    #[serde(default)]
    pub on_failure: Option<Disposition>,

    #[serde(default)]
    pub backoff: Option<BackoffConfig>,
}

impl PolicyConfig {
    pub fn to_policy(&self) -> RunPolicy {
        let defaults = RunPolicy::default();
        RunPolicy {
            max_retries: self
                .max_retries
                .map(|n| n.max(0) as usize)
                .unwrap_or(defaults.max_retries),
            on_success: self.on_success.unwrap_or(defaults.on_success),
            on_failure: self.on_failure.unwrap_or(defaults.on_failure),
            backoff: self
                .backoff
                .as_ref()
                .map(BackoffConfig::to_backoff)
                .unwrap_or(defaults.backoff),
        }
    }
}

/// Backoff schedule as written in YAML
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackoffConfig {
    Constant { delay_ms: u64 },
    Exponential { base_ms: u64 },
}

impl BackoffConfig {
    fn to_backoff(&self) -> Backoff {
        match self {
            BackoffConfig::Constant { delay_ms } => {
                Backoff::Constant(Duration::from_millis(*delay_ms))
            }
            BackoffConfig::Exponential { base_ms } => Backoff::Exponential {
                base: Duration::from_millis(*base_ms),
            },
        }
    }
}

/// One pipeline entry as written in YAML
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StepConfig {
    Header {
        title: String,
    },
    Local {
        title: String,
        command: String,
        #[serde(default)]
        working_directory: Option<String>,
        #[serde(flatten)]
        policy: PolicyConfig,
        #[serde(flatten)]
        options: ExecOptionsConfig,
    },
    Remote {
        title: String,
        command: String,
        /// May be omitted when exactly one remote is configured
        #[serde(default)]
        remote_id: Option<String>,
        #[serde(default)]
        working_directory: Option<String>,
        #[serde(flatten)]
        policy: PolicyConfig,
        #[serde(flatten)]
        options: ExecOptionsConfig,
    },
}

impl PipelineConfig {
    /// Load and validate a configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading pipeline file {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Parse and validate a configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants the type system can't express
    pub fn validate(&self) -> Result<()> {
        for (id, remote) in &self.remotes {
            if remote.host.trim().is_empty() {
                bail!("remote '{id}' has an empty host");
            }
        }

        for (position, step) in self.steps.iter().enumerate() {
            match step {
                StepConfig::Header { title } => {
                    if title.trim().is_empty() {
                        bail!("header at position {} has an empty title", position + 1);
                    }
                }
                StepConfig::Local { title, command, .. } => {
                    if command.trim().is_empty() {
                        bail!("local step '{title}' has an empty command");
                    }
                }
                StepConfig::Remote {
                    title,
                    command,
                    remote_id,
                    ..
                } => {
                    if command.trim().is_empty() {
                        bail!("remote step '{title}' has an empty command");
                    }
                    match remote_id {
                        Some(remote_id) => {
                            if !self.remotes.contains_key(remote_id) {
                                bail!(
                                    "remote step '{title}' references unknown remote '{remote_id}'"
                                );
                            }
                        }
                        None => {
                            if self.remotes.len() != 1 {
                                bail!(
                                    "remote step '{title}' names no remote_id and {} remotes are configured",
                                    self.remotes.len()
                                );
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Convert into a runnable pipeline
    pub fn to_pipeline(&self) -> Pipeline {
        self.to_descriptor().build()
    }

    /// Convert into a descriptor, so callers can add virtual steps or
    /// further entries before building
    pub fn to_descriptor(&self) -> PipelineDescriptor {
        let entries = self
            .steps
            .iter()
            .map(|step| match step {
                StepConfig::Header { title } => PipelineEntry::Header {
                    title: title.clone(),
                },
                StepConfig::Local {
                    title,
                    command,
                    working_directory,
                    policy,
                    options,
                } => PipelineEntry::Step(Step {
                    title: title.clone(),
                    body: StepBody::Local {
                        command: command.clone().into(),
                        working_directory: working_directory.clone(),
                    },
                    policy: policy.to_policy(),
                    options: options.to_options(),
                }),
                StepConfig::Remote {
                    title,
                    command,
                    remote_id,
                    working_directory,
                    policy,
                    options,
                } => PipelineEntry::Step(Step {
                    title: title.clone(),
                    body: StepBody::Remote {
                        command: command.clone().into(),
                        remote_id: remote_id.clone(),
                        working_directory: working_directory.clone(),
                    },
                    policy: policy.to_policy(),
                    options: options.to_options(),
                }),
            })
            .collect();

        PipelineDescriptor {
            title: self.title.clone(),
            entries,
            globals: self.globals.clone(),
            remotes: self.remotes.clone(),
            local_options: self.local_options.to_options(),
            remote_options: self.remote_options.to_options(),
            virtual_options: self.virtual_options.to_options(),
        }
    }
}
