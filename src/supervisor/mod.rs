//! Execution supervisor.
//!
//! Owns the lifecycle of one request: install interception, dispatch the
//! snippet on a dedicated worker, wait for it under the caller's deadline,
//! restore interception on every exit path and assemble the report.
//!
//! Snippet failures never surface as errors; they become report text. Only a
//! failure of the supervisor's own machinery (sinks, spawning, reaping) is
//! returned as [`SupervisorError`].

mod scope;
mod worker;

pub use scope::{trace_record_limit, InterceptionScope, Phase, Restored};
pub use worker::{CaptureBuffer, Worker, WorkerExit, TRUNCATION_MARKER};

use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::runtime::{PythonRuntime, SnippetRuntime, DEFAULT_PYTHON};
use crate::trace::TracePolicy;
use crate::types::{
    timeout_description, ExecutionReport, ExecutionRequest, ExecutionStats, Outcome,
    ReportBuilder, DEFAULT_TIMEOUT_SECS,
};
use worker::{lock_capture, shared_capture};

/// Supervisor errors
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The supervisor no longer accepts runs
    #[error("supervisor is shut down")]
    Closed,

    /// Capture sinks could not be created
    #[error("failed to install output interception: {0}")]
    Setup(#[source] std::io::Error),

    /// The worker process could not be started
    #[error("failed to spawn worker ({program}): {source}")]
    Spawn {
        /// Program that failed to start
        program: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The worker's exit status could not be collected
    #[error("failed waiting for worker: {0}")]
    Wait(#[source] std::io::Error),

    /// Capture sinks could not be read back or removed
    #[error("failed to restore output interception: {0}")]
    Teardown(#[source] std::io::Error),
}

/// Configuration for the supervisor
#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    /// Timeout used when a request does not carry one (seconds)
    pub default_timeout_secs: u64,
    /// Maximum runs holding interception at once
    pub max_concurrent: usize,
    /// Per-stream capture limit in bytes
    pub max_output_bytes: usize,
    /// Failure trace policy
    pub trace: TracePolicy,
    /// Interpreter used by the default runtime
    pub python: PathBuf,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_concurrent: 1,              // one request at a time
            max_output_bytes: 1024 * 1024, // 1 MiB per stream
            trace: TracePolicy::default(),
            python: PathBuf::from(DEFAULT_PYTHON),
        }
    }
}

/// Runs snippets and produces one report per request
pub struct Supervisor {
    config: SupervisorConfig,
    runtime: Arc<dyn SnippetRuntime>,
    permits: Arc<Semaphore>,
}

impl Supervisor {
    /// Create a supervisor backed by the configured Python interpreter
    #[must_use]
    pub fn new(config: SupervisorConfig) -> Self {
        let runtime = Arc::new(PythonRuntime::with_binary(config.python.clone()));
        Self::with_runtime(config, runtime)
    }

    /// Create a supervisor with a custom runtime
    #[must_use]
    pub fn with_runtime(config: SupervisorConfig, runtime: Arc<dyn SnippetRuntime>) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            config,
            runtime,
            permits,
        }
    }

    /// Get configuration
    #[must_use]
    pub const fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Shared handle to the runtime
    #[must_use]
    pub fn runtime(&self) -> Arc<dyn SnippetRuntime> {
        Arc::clone(&self.runtime)
    }

    /// Build a request, applying the default timeout when none is given
    #[must_use]
    pub fn request(&self, code: impl Into<String>, timeout_secs: Option<u64>) -> ExecutionRequest {
        ExecutionRequest::new(code, timeout_secs.unwrap_or(self.config.default_timeout_secs))
    }

    /// Stop accepting runs; in-flight runs finish normally
    pub fn close(&self) {
        self.permits.close();
    }

    /// Execute a request and return its report.
    ///
    /// # Errors
    /// Returns error only when interception cannot be installed or restored,
    /// or the worker cannot be started or reaped
    pub async fn run(&self, request: &ExecutionRequest) -> Result<ExecutionReport, SupervisorError> {
        let span = info_span!(
            "run",
            code = %request.digest(),
            timeout_secs = request.timeout_secs(),
        );
        self.run_inner(request).instrument(span).await
    }

    async fn run_inner(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionReport, SupervisorError> {
        let started_at = Utc::now();
        let start = Instant::now();

        if !request.has_budget() {
            info!(outcome = Outcome::TimedOut.name(), "zero budget, not dispatched");
            return Ok(ExecutionReport {
                body: timeout_description(0),
                outcome: Outcome::TimedOut,
                stats: ExecutionStats::empty(started_at),
            });
        }

        let limit = self.config.max_output_bytes;
        let mut scope = InterceptionScope::install(Arc::clone(&self.permits), limit).await?;
        let stdout_capture = shared_capture(limit);
        let stderr_capture = shared_capture(limit);

        let mut worker = match Worker::spawn(
            self.runtime.as_ref(),
            &self.config.trace,
            scope.sinks(),
            request.code(),
            &stdout_capture,
            &stderr_capture,
        ) {
            Ok(worker) => worker,
            Err(e) => {
                if let Err(teardown) = scope.restore().await {
                    warn!(error = %teardown, "restore after failed spawn also failed");
                }
                return Err(e);
            }
        };
        scope.advance(Phase::Dispatched);

        let exit = match worker.wait(request.timeout()).await {
            Ok(exit) => exit,
            Err(e) => {
                warn!(phase = ?scope.phase(), error = %e, "worker wait failed");
                worker.shutdown().await;
                if let Err(teardown) = scope.restore().await {
                    warn!(error = %teardown, "restore after failed wait also failed");
                }
                return Err(e);
            }
        };

        let (outcome, failure) = self.classify(&scope, exit, request.timeout_secs()).await;
        scope.advance(Phase::from_outcome(outcome));

        worker.shutdown().await;
        let restored = scope.restore().await?;

        // Failure text can carry an arbitrarily long exception message
        let failure = failure.map(|text| {
            let mut capture = CaptureBuffer::new(limit);
            capture.push(text.as_bytes());
            capture
        });

        let stdout = lock_capture(&stdout_capture);
        let stderr = lock_capture(&stderr_capture);
        let shell = &restored.shell;
        let mut builder = ReportBuilder::new()
            .stdout(&stdout.to_text())
            .shell_output(&shell.to_text());
        if !stderr.is_empty() {
            builder = builder.stderr(&stderr.to_text());
        }
        if let Some(failure) = &failure {
            builder = builder.failure(failure.to_text());
        }

        let stats = ExecutionStats {
            started_at,
            duration_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            stdout_bytes: stdout.len(),
            stderr_bytes: stderr.len(),
            shell_bytes: shell.len(),
            truncated: stdout.is_truncated()
                || stderr.is_truncated()
                || shell.is_truncated()
                || failure.as_ref().is_some_and(CaptureBuffer::is_truncated),
        };
        info!(
            outcome = outcome.name(),
            duration_ms = stats.duration_ms,
            stdout_bytes = stats.stdout_bytes,
            stderr_bytes = stats.stderr_bytes,
            shell_bytes = stats.shell_bytes,
            truncated = stats.truncated,
            "run finished"
        );
        debug!(phase = ?Phase::Reported, "phase");

        Ok(ExecutionReport {
            body: builder.build(),
            outcome,
            stats,
        })
    }

    async fn classify(
        &self,
        scope: &InterceptionScope,
        exit: WorkerExit,
        timeout_secs: u64,
    ) -> (Outcome, Option<String>) {
        let status = match exit {
            WorkerExit::TimedOut => {
                return (Outcome::TimedOut, Some(timeout_description(timeout_secs)));
            }
            WorkerExit::Finished(status) => status,
        };

        let trace_limit = trace_record_limit(
            self.config.max_output_bytes,
            self.config.trace.recorded_frames(),
        );
        match scope.take_trace(trace_limit).await {
            Ok(Some(trace)) => (Outcome::Failed, Some(self.config.trace.sanitize(&trace))),
            Ok(None) => match abnormal_exit(status) {
                Some(description) => (Outcome::Failed, Some(description)),
                None => (Outcome::Completed, None),
            },
            Err(e) => {
                warn!(error = %e, "worker left an unusable trace");
                (Outcome::Failed, Some(format!("Execution failed: {e}")))
            }
        }
    }
}

/// Failure description for a worker that died without recording a trace
fn abnormal_exit(status: ExitStatus) -> Option<String> {
    if status.success() {
        return None;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Some(format!("Execution terminated by signal {signal}."));
        }
    }
    status
        .code()
        .map(|code| format!("Execution exited with status {code}."))
}
