//! Per-step command results

use serde::{Deserialize, Serialize};

/// Outcome of a single processor call
///
/// One canonical shape for all three processors: `ok` is the universal
/// success test, `exit` is present whenever a real process ran, and
/// `error` carries a human-readable message when `ok` is false.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandResult {
    /// Whether the call is considered successful
    pub ok: bool,

    /// Accumulated standard output
    pub stdout: String,

    /// Accumulated standard error
    pub stderr: String,

    /// Exit metadata, when a process actually ran
    pub exit: Option<ExitDetail>,

    /// Failure message, when `ok` is false
    pub error: Option<String>,
}

/// Exit metadata of a spawned process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExitDetail {
    /// Process exit code, absent when the process was killed by a signal
    pub code: Option<i32>,

    /// Terminating signal, when known
    pub signal: Option<String>,
}

impl CommandResult {
    /// Build a successful result
    pub fn success(stdout: String, stderr: String, exit: Option<ExitDetail>) -> Self {
        Self {
            ok: true,
            stdout,
            stderr,
            exit,
            error: None,
        }
    }

    /// Build a failed result
    pub fn failure(
        error: impl Into<String>,
        stdout: String,
        stderr: String,
        exit: Option<ExitDetail>,
    ) -> Self {
        Self {
            ok: false,
            stdout,
            stderr,
            exit,
            error: Some(error.into()),
        }
    }

    /// Exit code, when one was reported
    pub fn exit_code(&self) -> Option<i32> {
        self.exit.as_ref().and_then(|e| e.code)
    }
}

impl ExitDetail {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }
}
