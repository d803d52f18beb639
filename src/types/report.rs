//! Execution reports.
//!
//! A report is one flattened string: captured stdout (with intercepted shell
//! output appended), then stderr on its own line when there was any, then the
//! failure description if the snippet raised or ran out of time.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// How a run ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Finished within the deadline without an uncaught error
    Completed,
    /// Raised an uncaught error or exited abnormally
    Failed,
    /// Deadline elapsed first
    TimedOut,
}

impl Outcome {
    /// Short name used in logs
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

/// Statistics from one execution
#[derive(Clone, Debug, Serialize)]
pub struct ExecutionStats {
    /// When the request was accepted
    pub started_at: DateTime<Utc>,
    /// Wall time from acceptance to report, in milliseconds
    pub duration_ms: u64,
    /// Bytes captured from stdout (before truncation marker)
    pub stdout_bytes: usize,
    /// Bytes captured from stderr (before truncation marker)
    pub stderr_bytes: usize,
    /// Bytes read back from intercepted shell commands (before truncation marker)
    pub shell_bytes: usize,
    /// Whether any captured channel hit the output limit
    pub truncated: bool,
}

impl ExecutionStats {
    /// Stats for a run that never dispatched a worker
    #[must_use]
    pub fn empty(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            duration_ms: 0,
            stdout_bytes: 0,
            stderr_bytes: 0,
            shell_bytes: 0,
            truncated: false,
        }
    }
}

/// The single report produced for every request
#[derive(Clone, Debug)]
pub struct ExecutionReport {
    /// Flattened report text returned to the caller
    pub body: String,
    /// How the run ended
    pub outcome: Outcome,
    /// Timing and capture statistics
    pub stats: ExecutionStats,
}

/// Failure description for a run that exceeded its budget
#[must_use]
pub fn timeout_description(timeout_secs: u64) -> String {
    format!("Execution timed out after {timeout_secs}s.")
}

/// Assembles a report body from the captured pieces
#[derive(Clone, Debug, Default)]
pub struct ReportBuilder {
    output: String,
    errors: String,
    failure: Option<String>,
}

impl ReportBuilder {
    /// Start an empty report
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append captured standard output
    #[must_use]
    pub fn stdout(mut self, text: &str) -> Self {
        self.output.push_str(text);
        self
    }

    /// Append output collected from intercepted shell commands.
    ///
    /// Shell output belongs to the output section and follows whatever the
    /// snippet printed directly.
    #[must_use]
    pub fn shell_output(mut self, text: &str) -> Self {
        self.output.push_str(text);
        self
    }

    /// Append captured standard error
    #[must_use]
    pub fn stderr(mut self, text: &str) -> Self {
        self.errors.push_str(text);
        self
    }

    /// Record the failure description (timeout message or sanitized trace)
    #[must_use]
    pub fn failure(mut self, description: impl Into<String>) -> Self {
        self.failure = Some(description.into());
        self
    }

    /// Flatten into the report body
    #[must_use]
    pub fn build(self) -> String {
        let mut body = self.output;
        if !self.errors.is_empty() {
            body.push('\n');
            body.push_str(&self.errors);
        }
        if let Some(failure) = self.failure {
            body.push_str(&failure);
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stdout_only_is_verbatim() {
        let body = ReportBuilder::new().stdout("hi\n").build();
        assert_eq!(body, "hi\n");
    }

    #[test]
    fn test_empty_report() {
        assert_eq!(ReportBuilder::new().build(), "");
    }

    #[test]
    fn test_shell_output_follows_stdout() {
        let body = ReportBuilder::new()
            .stdout("printed\n")
            .shell_output("hello\n")
            .build();
        assert_eq!(body, "printed\nhello\n");
    }

    #[test]
    fn test_stderr_is_newline_joined() {
        let body = ReportBuilder::new()
            .stdout("out\n")
            .stderr("warning\n")
            .build();
        assert_eq!(body, "out\n\nwarning\n");
    }

    #[test]
    fn test_failure_is_appended_last() {
        let body = ReportBuilder::new()
            .stdout("partial\n")
            .stderr("err\n")
            .failure(timeout_description(3))
            .build();
        assert_eq!(body, "partial\n\nerr\nExecution timed out after 3s.");
    }

    #[test]
    fn test_timeout_only() {
        let body = ReportBuilder::new().failure(timeout_description(1)).build();
        assert_eq!(body, "Execution timed out after 1s.");
    }

    #[test]
    fn test_outcome_names() {
        assert_eq!(Outcome::Completed.name(), "completed");
        assert_eq!(Outcome::TimedOut.name(), "timed_out");
        assert_eq!(
            serde_json::to_string(&Outcome::Failed).unwrap(),
            "\"failed\""
        );
    }
}
