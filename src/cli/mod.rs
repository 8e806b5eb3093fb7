//! Command-line interface

pub mod output;

use clap::{Args, Parser, Subcommand};
use std::ffi::OsString;

/// Deployment pipeline runner
#[derive(Debug, Parser, Clone)]
#[command(name = "convoy")]
#[command(version = "0.1.0")]
#[command(about = "Run deployment pipelines across local and remote hosts", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run a pipeline file
    Run(RunCommand),

    /// Validate a pipeline file without running it
    Validate(ValidateCommand),
}

#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to the pipeline YAML file
    pub file: String,

    /// Set or override a global binding (repeatable)
    #[arg(short, long = "global", value_name = "KEY=VALUE")]
    pub globals: Vec<String>,

    /// Print step output as it streams
    #[arg(short, long)]
    pub stream: bool,
}

#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to the pipeline YAML file
    pub file: String,

    /// Print a machine-readable summary
    #[arg(long)]
    pub json: bool,
}

impl Cli {
    /// Parse CLI arguments from the environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}

/// Split a `KEY=VALUE` argument into its parts
pub fn parse_binding(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}
