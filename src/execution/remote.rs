//! Remote execution over SSH
//!
//! Each remote host gets one processor owning one lazily-opened SSH
//! session. The session is established on the first command, reused across
//! subsequent commands, and torn down when the pipeline finishes or when a
//! command faults (timeout, lost connection). After a teardown the next
//! command transparently reconnects.

use crate::core::result::{CommandResult, ExitDetail};
use crate::events::{EventBus, PipelineEvent, StreamSource};
use crate::execution::{
    CancelToken, ExecOptions, Processor, ProcessorError, ProcessorErrorKind, DEFAULT_MAX_BUFFER,
};
use async_trait::async_trait;
use openssh::{KnownHosts, Session, SessionBuilder, Stdio};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Connection settings for one remote host
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    /// Hostname or address to connect to
    pub host: String,

    /// SSH port, defaulting to 22
    #[serde(default)]
    pub port: Option<u16>,

    /// Login user; the local username applies when unset
    #[serde(default)]
    pub username: Option<String>,

    /// Private key path; `~/.ssh/id_rsa` is tried when unset and present
    #[serde(default)]
    pub key_file: Option<PathBuf>,

    /// Keepalive probe interval in seconds
    #[serde(default)]
    pub keepalive_interval_secs: Option<u64>,

    /// Cap on how long connection establishment may take, in seconds
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
}

impl RemoteConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            username: None,
            key_file: None,
            keepalive_interval_secs: None,
            connect_timeout_secs: None,
        }
    }
}

fn default_key_file() -> Option<PathBuf> {
    let key = dirs::home_dir()?.join(".ssh").join("id_rsa");
    key.exists().then_some(key)
}

/// Lifecycle of a remote processor's SSH session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Closed,
    Connecting,
    Connected,
}

struct ConnectionState {
    status: ConnectionStatus,
    session: Option<Session>,
}

/// What a single remote command run produced
///
/// Faults carry the output gathered so far and require the session to be
/// reset before the processor is used again.
enum RunOutcome {
    Completed(CommandResult),
    Fault {
        kind: ProcessorErrorKind,
        stdout: String,
        stderr: String,
    },
}

/// Runs commands on one remote host over a reused SSH session
pub struct RemoteProcessor {
    id: String,
    config: RemoteConfig,
    events: EventBus,
    state: Mutex<ConnectionState>,
}

impl RemoteProcessor {
    pub fn new(id: impl Into<String>, config: RemoteConfig, events: EventBus) -> Self {
        Self {
            id: id.into(),
            config,
            events,
            state: Mutex::new(ConnectionState {
                status: ConnectionStatus::Closed,
                session: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.state.lock().await.status
    }

    /// Close the session if one is open; a no-op otherwise
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if let Some(session) = state.session.take() {
            if let Err(error) = session.close().await {
                warn!(remote_id = %self.id, %error, "error closing ssh session");
            }
            state.status = ConnectionStatus::Closed;
            self.events.emit(PipelineEvent::RemoteClosed {
                remote_id: self.id.clone(),
            });
        }
    }

    async fn connect(&self) -> Result<Session, openssh::Error> {
        let mut builder = SessionBuilder::default();
        builder.known_hosts_check(KnownHosts::Accept);
        if let Some(username) = &self.config.username {
            builder.user(username.clone());
        }
        if let Some(port) = self.config.port {
            builder.port(port);
        }
        if let Some(key) = self.config.key_file.clone().or_else(default_key_file) {
            builder.keyfile(key);
        }
        if let Some(secs) = self.config.keepalive_interval_secs {
            builder.server_alive_interval(Duration::from_secs(secs));
        }
        if let Some(secs) = self.config.connect_timeout_secs {
            builder.connect_timeout(Duration::from_secs(secs));
        }
        builder.connect(&self.config.host).await
    }

    async fn run_command(
        &self,
        session: &Session,
        command: &str,
        options: &ExecOptions,
        cancel: &CancelToken,
    ) -> RunOutcome {
        let command = prepend_env(command, options);
        debug!(remote_id = %self.id, command = %command, "running remote command");

        let mut child = match session
            .shell(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .await
        {
            Ok(child) => child,
            Err(_) => {
                return RunOutcome::Fault {
                    kind: ProcessorErrorKind::Network,
                    stdout: String::new(),
                    stderr: String::new(),
                }
            }
        };

        let mut stdout_pipe = match child.stdout().take() {
            Some(pipe) => pipe,
            None => {
                return RunOutcome::Fault {
                    kind: ProcessorErrorKind::Network,
                    stdout: String::new(),
                    stderr: String::new(),
                }
            }
        };
        let mut stderr_pipe = match child.stderr().take() {
            Some(pipe) => pipe,
            None => {
                return RunOutcome::Fault {
                    kind: ProcessorErrorKind::Network,
                    stdout: String::new(),
                    stderr: String::new(),
                }
            }
        };

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
                        self.events.emit(PipelineEvent::Stdout {
                            source: StreamSource::Remote,
                            chunk: chunk.to_string(),
                        });
                        stdout.push_str(&chunk);
                        if stdout.len() + stderr.len() > max_buffer {
                            return RunOutcome::Fault {
                                kind: ProcessorErrorKind::BufferExceeded(max_buffer),
                                stdout,
                                stderr,
                            };
                        }
                    }
                },
                read = stderr_pipe.read(&mut stderr_buf), if stderr_open => match read {
                    Ok(0) | Err(_) => stderr_open = false,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&stderr_buf[..n]);
                        self.events.emit(PipelineEvent::Stderr {
                            source: StreamSource::Remote,
                            chunk: chunk.to_string(),
                        });
                        stderr.push_str(&chunk);
                        if stdout.len() + stderr.len() > max_buffer {
                            return RunOutcome::Fault {
                                kind: ProcessorErrorKind::BufferExceeded(max_buffer),
                                stdout,
                                stderr,
                            };
                        }
                    }
                },
                _ = &mut timeout_sleep, if timed => {
                    return RunOutcome::Fault {
                        kind: ProcessorErrorKind::RemoteTimeout,
                        stdout,
                        stderr,
                    };
                },
                _ = cancel.cancelled() => {
                    return RunOutcome::Fault {
                        kind: ProcessorErrorKind::Cancelled,
                        stdout,
                        stderr,
                    };
                },
            }
        }

        let status = tokio::select! {
            waited = child.wait() => waited,
            _ = &mut timeout_sleep, if timed => {
                return RunOutcome::Fault {
                    kind: ProcessorErrorKind::RemoteTimeout,
                    stdout,
                    stderr,
                };
            },
            _ = cancel.cancelled() => {
                return RunOutcome::Fault {
                    kind: ProcessorErrorKind::Cancelled,
                    stdout,
                    stderr,
                };
            },
        };

        match status {
            Ok(status) => settle_exit_status(status, stdout, stderr),
            Err(_) => RunOutcome::Fault {
                kind: ProcessorErrorKind::Network,
                stdout,
                stderr,
            },
        }
    }
}

/// Map a finished command's exit status onto an outcome
///
/// A status with no exit code means the channel died under the command; that
/// is a network fault, not a command failure, and requires a session reset.
fn settle_exit_status(
    status: std::process::ExitStatus,
    stdout: String,
    stderr: String,
) -> RunOutcome {
    match status.code() {
        Some(0) => RunOutcome::Completed(CommandResult::success(
            stdout,
            stderr,
            Some(ExitDetail::code(0)),
        )),
        Some(code) => RunOutcome::Completed(CommandResult::failure(
            format!("command exited with code {code}"),
            stdout,
            stderr,
            Some(ExitDetail::code(code)),
        )),
        None => RunOutcome::Fault {
            kind: ProcessorErrorKind::Network,
            stdout,
            stderr,
        },
    }
}

#[async_trait]
impl Processor for RemoteProcessor {
    async fn exec(
        &self,
        command: &str,
        options: &ExecOptions,
        cancel: &CancelToken,
    ) -> Result<CommandResult, ProcessorError> {
        let mut state = self.state.lock().await;

        if state.session.is_none() {
            state.status = ConnectionStatus::Connecting;
            self.events.emit(PipelineEvent::RemoteConnecting {
                remote_id: self.id.clone(),
            });

            match self.connect().await {
                Ok(session) => {
                    state.session = Some(session);
                    state.status = ConnectionStatus::Connected;
                    self.events.emit(PipelineEvent::RemoteConnected {
                        remote_id: self.id.clone(),
                    });
                }
                Err(error) => {
                    state.status = ConnectionStatus::Closed;
                    return Err(ProcessorError::bare(ProcessorErrorKind::Connect {
                        host: self.config.host.clone(),
                        message: error.to_string(),
                    }));
                }
            }
        }

        let outcome = match state.session.as_ref() {
            Some(session) => self.run_command(session, command, options, cancel).await,
            None => RunOutcome::Fault {
                kind: ProcessorErrorKind::Network,
                stdout: String::new(),
                stderr: String::new(),
            },
        };

        match outcome {
            RunOutcome::Completed(result) => Ok(result),
            RunOutcome::Fault {
                kind,
                stdout,
                stderr,
            } => {
                // the session is no longer trustworthy; tear it down so the
                // next command reconnects
                if let Some(session) = state.session.take() {
                    if let Err(error) = session.close().await {
                        warn!(remote_id = %self.id, %error, "error closing ssh session");
                    }
                }
                state.status = ConnectionStatus::Closed;
                self.events.emit(PipelineEvent::RemoteClosed {
                    remote_id: self.id.clone(),
                });
                Err(ProcessorError::with_output(kind, stdout, stderr))
            }
        }
    }
}

impl std::fmt::Debug for RemoteProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProcessor")
            .field("id", &self.id)
            .field("host", &self.config.host)
            .finish_non_exhaustive()
    }
}

/// Turn the env map into `K='v'` assignments ahead of the command
fn prepend_env(command: &str, options: &ExecOptions) -> String {
    if options.env.is_empty() {
        return command.to_string();
    }

    let mut assignments: Vec<String> = options
        .env
        .iter()
        .map(|(key, value)| format!("{key}={}", shell_quote(value)))
        .collect();
    assignments.sort();
    format!("export {}; {command}", assignments.join(" "))
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecOptions;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn processor() -> RemoteProcessor {
        RemoteProcessor::new("web1", RemoteConfig::new("203.0.113.10"), EventBus::new())
    }

    #[tokio::test]
    async fn test_starts_closed() {
        assert_eq!(processor().status().await, ConnectionStatus::Closed);
    }

    #[tokio::test]
    async fn test_close_before_connect_emits_nothing() {
        let bus = EventBus::new();
        let closes = Arc::new(AtomicUsize::new(0));
        let seen = closes.clone();
        bus.subscribe(move |event| {
            if matches!(event, PipelineEvent::RemoteClosed { .. }) {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        let remote = RemoteProcessor::new("web1", RemoteConfig::new("203.0.113.10"), bus);
        remote.close().await;
        remote.close().await;

        assert_eq!(closes.load(Ordering::SeqCst), 0);
        assert_eq!(remote.status().await, ConnectionStatus::Closed);
    }

    #[test]
    fn test_env_prefix_is_quoted_and_sorted() {
        let options = ExecOptions {
            env: HashMap::from([
                ("B".to_string(), "two words".to_string()),
                ("A".to_string(), "it's".to_string()),
            ]),
            ..Default::default()
        };
        assert_eq!(
            prepend_env("deploy", &options),
            r"export A='it'\''s' B='two words'; deploy"
        );
    }

    #[test]
    fn test_no_env_leaves_command_untouched() {
        assert_eq!(
            prepend_env("uptime", &ExecOptions::default()),
            "uptime"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_without_a_code_is_a_network_fault() {
        use std::os::unix::process::ExitStatusExt;

        // killed by a signal, so there is no exit code
        let status = std::process::ExitStatus::from_raw(9);
        let outcome = settle_exit_status(status, "partial".to_string(), String::new());

        let RunOutcome::Fault { kind, stdout, .. } = outcome else {
            panic!("a dead channel must fault, not settle");
        };
        assert!(matches!(kind, ProcessorErrorKind::Network));
        assert_eq!(stdout, "partial");
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_codes_settle_as_results() {
        use std::os::unix::process::ExitStatusExt;

        let status = std::process::ExitStatus::from_raw(0);
        let RunOutcome::Completed(result) =
            settle_exit_status(status, "out".to_string(), String::new())
        else {
            panic!("a clean exit must settle");
        };
        assert!(result.ok);
        assert_eq!(result.exit_code(), Some(0));

        // wait status encodes the exit code in the high byte
        let status = std::process::ExitStatus::from_raw(3 << 8);
        let RunOutcome::Completed(result) =
            settle_exit_status(status, String::new(), String::new())
        else {
            panic!("a non-zero exit must settle");
        };
        assert!(!result.ok);
        assert_eq!(result.exit_code(), Some(3));
    }

    // exercises a real ssh connection; needs a reachable sshd and key auth
    #[tokio::test]
    #[ignore]
    async fn test_connects_runs_and_reuses_session() {
        let config = RemoteConfig {
            host: std::env::var("TEST_SSH_HOST").unwrap_or_else(|_| "localhost".to_string()),
            ..RemoteConfig::new("localhost")
        };
        let remote = RemoteProcessor::new("test", config, EventBus::new());

        let first = remote
            .exec("echo one", &ExecOptions::default(), &CancelToken::new())
            .await
            .expect("first command should run");
        assert_eq!(first.stdout.trim(), "one");
        assert_eq!(remote.status().await, ConnectionStatus::Connected);

        let second = remote
            .exec("echo two", &ExecOptions::default(), &CancelToken::new())
            .await
            .expect("second command should reuse the session");
        assert_eq!(second.stdout.trim(), "two");

        remote.close().await;
        assert_eq!(remote.status().await, ConnectionStatus::Closed);
    }

    #[tokio::test]
    #[ignore]
    async fn test_timeout_resets_the_session() {
        let config = RemoteConfig::new(
            std::env::var("TEST_SSH_HOST").unwrap_or_else(|_| "localhost".to_string()),
        );
        let remote = RemoteProcessor::new("test", config, EventBus::new());
        let options = ExecOptions {
            timeout: Some(Duration::from_millis(200)),
            ..Default::default()
        };

        let err = remote
            .exec("sleep 30", &options, &CancelToken::new())
            .await
            .expect_err("should time out");
        assert!(matches!(err.kind, ProcessorErrorKind::RemoteTimeout));
        assert_eq!(remote.status().await, ConnectionStatus::Closed);
    }

    #[tokio::test]
    #[ignore]
    async fn test_network_anomaly_resets_the_session() {
        let config = RemoteConfig::new(
            std::env::var("TEST_SSH_HOST").unwrap_or_else(|_| "localhost".to_string()),
        );
        let remote = RemoteProcessor::new("test", config, EventBus::new());

        // the remote shell killing itself leaves no exit code on the channel
        let err = remote
            .exec("kill -9 $$", &ExecOptions::default(), &CancelToken::new())
            .await
            .expect_err("a signalled shell should fault");
        assert!(matches!(err.kind, ProcessorErrorKind::Network));
        assert_eq!(remote.status().await, ConnectionStatus::Closed);

        let result = remote
            .exec("echo back", &ExecOptions::default(), &CancelToken::new())
            .await
            .expect("the next command should reconnect");
        assert_eq!(result.stdout.trim(), "back");
        assert_eq!(remote.status().await, ConnectionStatus::Connected);

        remote.close().await;
    }
}
