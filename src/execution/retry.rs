//! Retry / outcome engine shared by every step variant

use crate::core::result::CommandResult;
use crate::core::step::{Backoff, Disposition, RunPolicy};
use crate::events::{EventBus, PipelineEvent, StepKind};
use crate::execution::{ProcessorError, ProcessorErrorKind};
use chrono::Utc;
use std::future::Future;
use thiserror::Error;
use tracing::{debug, warn};

/// A step outcome that halts the pipeline
///
/// Carries the final attempt's result. `result.ok` is true when the halt
/// came from an `on_success: terminate` disposition (the success itself is
/// the halt condition).
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct StepError {
    pub message: String,
    pub result: CommandResult,
}

impl StepError {
    /// Failure outcome raised after the last attempt
    pub fn failed(result: CommandResult) -> Self {
        let message = result
            .error
            .clone()
            .unwrap_or_else(|| "step failed".to_string());
        Self { message, result }
    }

    /// Success outcome inverted by an `on_success: terminate` disposition
    pub fn halted_on_success(result: CommandResult) -> Self {
        Self {
            message: "step succeeded and its on_success disposition terminates the run"
                .to_string(),
            result,
        }
    }
}

impl From<ProcessorError> for StepError {
    fn from(err: ProcessorError) -> Self {
        Self::failed(err.into_result())
    }
}

/// Event emission scoped to one step's namespace
pub(crate) struct StepEvents {
    bus: EventBus,
    kind: StepKind,
}

impl StepEvents {
    pub(crate) fn new(bus: EventBus, kind: StepKind) -> Self {
        Self { bus, kind }
    }

    fn retry(&self, attempt: usize) {
        self.bus.emit(PipelineEvent::StepRetry {
            kind: self.kind,
            attempt,
            time: Utc::now(),
        });
    }

    fn finish(&self, result: &CommandResult) {
        self.bus.emit(PipelineEvent::StepFinish {
            kind: self.kind,
            result: result.clone(),
            time: Utc::now(),
        });
    }

    fn fail(&self, error: &CommandResult) {
        self.bus.emit(PipelineEvent::StepFail {
            kind: self.kind,
            error: error.clone(),
            time: Utc::now(),
        });
    }
}

/// Drive a processor call through the bounded-retry loop and apply the
/// step's disposition policy
///
/// Attempts run strictly one after another; each settles fully before the
/// next begins. Only the final attempt's outcome is surfaced; earlier
/// failures are observable through `StepRetry` events only.
pub(crate) async fn run_with_retry<F, Fut>(
    policy: &RunPolicy,
    events: &StepEvents,
    mut attempt_exec: F,
) -> Result<CommandResult, StepError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<CommandResult, ProcessorError>>,
{
    let max_retries = policy.max_retries;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            events.retry(attempt);
            if let Some(delay) = policy.backoff.delay_for(attempt) {
                tokio::time::sleep(delay).await;
            }
        }

        let result = match attempt_exec().await {
            Ok(result) => result,
            // cancellation is not a transient failure; stop re-attempting
            // no matter how much retry budget is left
            Err(err) if matches!(err.kind, ProcessorErrorKind::Cancelled) => {
                let result = err.into_result();
                events.fail(&result);
                return Err(StepError::failed(result));
            }
            Err(err) => err.into_result(),
        };

        if result.ok {
            return match policy.on_success {
                Disposition::Terminate => {
                    debug!("attempt {} succeeded; on_success terminates", attempt);
                    events.fail(&result);
                    Err(StepError::halted_on_success(result))
                }
                Disposition::Continue => {
                    events.finish(&result);
                    Ok(result)
                }
            };
        }

        if attempt == max_retries {
            return match policy.on_failure {
                Disposition::Continue => {
                    warn!(
                        "step failed after {} attempt(s); on_failure absorbs the error",
                        attempt + 1
                    );
                    events.finish(&result);
                    Ok(result)
                }
                Disposition::Terminate => {
                    events.fail(&result);
                    Err(StepError::failed(result))
                }
            };
        }

        debug!("attempt {} failed, retrying", attempt);
    }

    // the loop always returns on the final attempt
    unreachable!("retry loop exited without settling")
}

impl Backoff {
    /// Delay to apply before the given re-attempt (1-based)
    pub fn delay_for(&self, attempt: usize) -> Option<std::time::Duration> {
        match self {
            Backoff::None => None,
            Backoff::Constant(delay) => Some(*delay),
            Backoff::Exponential { base } => {
                let shift = attempt.saturating_sub(1).min(16) as u32;
                Some(base.saturating_mul(1u32 << shift))
            }
        }
    }
}
