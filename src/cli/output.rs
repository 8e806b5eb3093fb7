//! Console rendering of pipeline events

use crate::core::result::CommandResult;
use crate::events::{PipelineObserver, StepKind, StreamSource};
use chrono::{DateTime, Utc};
use console::Emoji;
use uuid::Uuid;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static PLUG: Emoji<'_, '_> = Emoji("🔌 ", "# ");

/// Prints pipeline events to the terminal
///
/// With `stream` enabled, raw stdout/stderr chunks are echoed as they
/// arrive; otherwise only lifecycle lines are printed.
pub struct ConsoleObserver {
    stream: bool,
}

impl ConsoleObserver {
    pub fn new(stream: bool) -> Self {
        Self { stream }
    }
}

impl PipelineObserver for ConsoleObserver {
    fn pipeline_init(&self, run_id: Uuid, title: &str, _time: DateTime<Utc>) {
        println!(
            "{} Running {} ({})",
            ROCKET,
            style(title).bold(),
            style(&run_id.to_string()[..8]).dim()
        );
    }

    fn pipeline_header(&self, title: &str, _time: DateTime<Utc>) {
        println!("\n{} {}", INFO, style(title).bold().underlined());
    }

    fn pipeline_finish(&self, _time: DateTime<Utc>) {
        println!();
    }

    fn pipeline_fail(&self, error: &CommandResult, _time: DateTime<Utc>) {
        println!("\n{} {}", CROSS, style(failure_summary(error)).red());
    }

    fn step_init(
        &self,
        kind: StepKind,
        index: usize,
        title: &str,
        command: Option<&str>,
        _working_directory: Option<&str>,
        remote_id: Option<&str>,
        _time: DateTime<Utc>,
    ) {
        let location = match remote_id {
            Some(id) => format!(" on {}", style(id).magenta()),
            None => String::new(),
        };
        println!(
            "{} {}. {}{} [{}]",
            SPINNER,
            index,
            style(title).cyan(),
            location,
            style(kind).dim()
        );
        if let Some(command) = command {
            println!("   {}", style(command).dim());
        }
    }

    fn step_retry(&self, _kind: StepKind, attempt: usize, _time: DateTime<Utc>) {
        println!("{} retry {}", WARN, style(attempt).yellow());
    }

    fn step_finish(&self, _kind: StepKind, result: &CommandResult, _time: DateTime<Utc>) {
        if result.ok {
            println!("{} {}", CHECK, style("done").green());
        } else {
            // an absorbed failure; the run keeps going
            let message = result.error.as_deref().unwrap_or("failed");
            println!("{} {} ({})", WARN, style("continuing").yellow(), message);
        }
    }

    fn step_fail(&self, _kind: StepKind, error: &CommandResult, _time: DateTime<Utc>) {
        let message = error.error.as_deref().unwrap_or("failed");
        println!("{} {}", CROSS, style(message).red());
        if !error.stderr.is_empty() && !self.stream {
            println!("{}", format_output(&error.stderr, 5));
        }
    }

    fn stdout(&self, _source: StreamSource, chunk: &str) {
        if self.stream {
            print!("{chunk}");
        }
    }

    fn stderr(&self, _source: StreamSource, chunk: &str) {
        if self.stream {
            eprint!("{chunk}");
        }
    }

    fn remote_connecting(&self, remote_id: &str) {
        println!("{} connecting to {}", PLUG, style(remote_id).magenta());
    }

    fn remote_connected(&self, remote_id: &str) {
        println!("{} connected to {}", PLUG, style(remote_id).magenta());
    }

    fn remote_closed(&self, remote_id: &str) {
        println!(
            "{} closed connection to {}",
            PLUG,
            style(remote_id).magenta()
        );
    }
}

/// One line describing why the run halted
///
/// A halting result can be a success when the step's `on_success`
/// disposition terminates the run; that case has no error message.
fn failure_summary(error: &CommandResult) -> String {
    if error.ok {
        "Pipeline halted: a step succeeded and its on_success disposition terminates the run"
            .to_string()
    } else {
        format!(
            "Pipeline failed: {}",
            error.error.as_deref().unwrap_or("unknown error")
        )
    }
}

/// Format output with truncation
pub fn format_output(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();

    if lines.len() <= max_lines {
        output.to_string()
    } else {
        let truncated = lines[..max_lines].join("\n");
        format!(
            "{}\n{} ({} more lines)",
            truncated,
            style("[truncated]").dim(),
            lines.len() - max_lines
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_summary_explains_an_inverted_success() {
        use crate::core::result::ExitDetail;

        let halt = CommandResult::success("out".to_string(), String::new(), Some(ExitDetail::code(0)));
        assert_eq!(
            failure_summary(&halt),
            "Pipeline halted: a step succeeded and its on_success disposition terminates the run"
        );

        let failed = CommandResult::failure(
            "command exited with code 2",
            String::new(),
            String::new(),
            Some(ExitDetail::code(2)),
        );
        assert_eq!(
            failure_summary(&failed),
            "Pipeline failed: command exited with code 2"
        );
    }

    #[test]
    fn test_short_output_is_untruncated() {
        assert_eq!(format_output("one\ntwo", 5), "one\ntwo");
    }

    #[test]
    fn test_long_output_is_truncated() {
        let output = (1..=10).map(|n| n.to_string()).collect::<Vec<_>>().join("\n");
        let formatted = format_output(&output, 3);
        assert!(formatted.starts_with("1\n2\n3\n"));
        assert!(formatted.contains("7 more lines"));
    }
}
