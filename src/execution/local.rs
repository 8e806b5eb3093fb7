//! Local shell execution

use crate::core::result::{CommandResult, ExitDetail};
use crate::events::{EventBus, PipelineEvent, StreamSource};
use crate::execution::{
    CancelToken, ExecOptions, Processor, ProcessorError, ProcessorErrorKind, DEFAULT_MAX_BUFFER,
};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::debug;

/// Runs commands through `sh -c` on the host machine
///
/// Output is streamed chunk by chunk as `Stdout`/`Stderr` events while it
/// accumulates for the final result. `FORCE_COLOR=1` is set so tools keep
/// their colored output despite the piped stdio.
#[derive(Debug)]
pub struct LocalProcessor {
    events: EventBus,
}

impl LocalProcessor {
    pub fn new(events: EventBus) -> Self {
        Self { events }
    }

    fn emit_stdout(&self, chunk: &str) {
        self.events.emit(PipelineEvent::Stdout {
            source: StreamSource::Local,
            chunk: chunk.to_string(),
        });
    }

    fn emit_stderr(&self, chunk: &str) {
        self.events.emit(PipelineEvent::Stderr {
            source: StreamSource::Local,
            chunk: chunk.to_string(),
        });
    }
}

#[async_trait]
impl Processor for LocalProcessor {
    async fn exec(
        &self,
        command: &str,
        options: &ExecOptions,
        cancel: &CancelToken,
    ) -> Result<CommandResult, ProcessorError> {
        debug!(command, "spawning local command");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .env("FORCE_COLOR", "1")
            .envs(&options.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProcessorError::bare(ProcessorErrorKind::Spawn(e.to_string())))?;

        let mut stdout_pipe = child.stdout.take().ok_or_else(|| {
            ProcessorError::bare(ProcessorErrorKind::Spawn("stdout pipe missing".to_string()))
        })?;
        let mut stderr_pipe = child.stderr.take().ok_or_else(|| {
            ProcessorError::bare(ProcessorErrorKind::Spawn("stderr pipe missing".to_string()))
        })?;

        let max_buffer = options.max_buffer.unwrap_or(DEFAULT_MAX_BUFFER);
        let timed = options.armed_timeout().is_some();
        let deadline = Instant::now()
            + options
                .armed_timeout()
                .unwrap_or(Duration::from_secs(60 * 60 * 24 * 365));
        let timeout_sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(timeout_sleep);

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut stdout_buf = [0u8; 8192];
        let mut stderr_buf = [0u8; 8192];

        while stdout_open || stderr_open {
            tokio::select! {
                read = stdout_pipe.read(&mut stdout_buf), if stdout_open => match read {
                    Ok(0) | Err(_) => stdout_open = false,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&stdout_buf[..n]);
                        self.emit_stdout(&chunk);
                        stdout.push_str(&chunk);
                        if stdout.len() + stderr.len() > max_buffer {
                            let _ = child.kill().await;
                            return Err(ProcessorError::with_output(
                                ProcessorErrorKind::BufferExceeded(max_buffer),
                                stdout,
                                stderr,
                            ));
                        }
                    }
                },
                read = stderr_pipe.read(&mut stderr_buf), if stderr_open => match read {
                    Ok(0) | Err(_) => stderr_open = false,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&stderr_buf[..n]);
                        self.emit_stderr(&chunk);
                        stderr.push_str(&chunk);
                        if stdout.len() + stderr.len() > max_buffer {
                            let _ = child.kill().await;
                            return Err(ProcessorError::with_output(
                                ProcessorErrorKind::BufferExceeded(max_buffer),
                                stdout,
                                stderr,
                            ));
                        }
                    }
                },
                _ = &mut timeout_sleep, if timed => {
                    let _ = child.kill().await;
                    return Err(ProcessorError::with_output(
                        ProcessorErrorKind::LocalTimeout,
                        stdout,
                        stderr,
                    ));
                },
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(ProcessorError::with_output(
                        ProcessorErrorKind::Cancelled,
                        stdout,
                        stderr,
                    ));
                },
            }
        }

        // pipes are closed but the process may still be winding down
        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| {
                ProcessorError::with_output(
                    ProcessorErrorKind::Spawn(e.to_string()),
                    stdout.clone(),
                    stderr.clone(),
                )
            })?,
            _ = &mut timeout_sleep, if timed => {
                let _ = child.kill().await;
                return Err(ProcessorError::with_output(
                    ProcessorErrorKind::LocalTimeout,
                    stdout,
                    stderr,
                ));
            },
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(ProcessorError::with_output(
                    ProcessorErrorKind::Cancelled,
                    stdout,
                    stderr,
                ));
            },
        };

        if status.success() {
            return Ok(CommandResult::success(
                stdout,
                stderr,
                Some(ExitDetail::code(0)),
            ));
        }

        let (exit, message) = describe_failure(&status);
        Ok(CommandResult::failure(message, stdout, stderr, Some(exit)))
    }
}

fn describe_failure(status: &std::process::ExitStatus) -> (ExitDetail, String) {
    if let Some(code) = status.code() {
        return (
            ExitDetail::code(code),
            format!("command exited with code {code}"),
        );
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            let name = signal_name(signal);
            return (
                ExitDetail {
                    code: None,
                    signal: Some(name.clone()),
                },
                format!("command terminated by signal {name}"),
            );
        }
    }

    (
        ExitDetail {
            code: None,
            signal: None,
        },
        "command terminated abnormally".to_string(),
    )
}

#[cfg(unix)]
fn signal_name(signal: i32) -> String {
    match signal {
        1 => "SIGHUP".to_string(),
        2 => "SIGINT".to_string(),
        3 => "SIGQUIT".to_string(),
        6 => "SIGABRT".to_string(),
        9 => "SIGKILL".to_string(),
        13 => "SIGPIPE".to_string(),
        15 => "SIGTERM".to_string(),
        other => format!("SIG{other}"),
    }
}
