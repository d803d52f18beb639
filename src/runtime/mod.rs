//! Snippet runtimes.
//!
//! A runtime knows how to start a worker process for one snippet. The
//! supervisor owns everything around it: stdio pipes, the capture sinks, the
//! deadline and teardown. Workers read the snippet from stdin and find the
//! sink locations in their environment.

mod python;

pub use python::{PythonRuntime, DEFAULT_PYTHON};

use std::path::PathBuf;
use std::process::Command;

use crate::trace::TracePolicy;

/// Environment variable naming the file intercepted shell output is appended to
pub const SHELL_SINK_ENV: &str = "EXECUTOR_SHELL_SINK";

/// Environment variable naming the file an uncaught error is recorded in
pub const TRACE_SINK_ENV: &str = "EXECUTOR_TRACE_SINK";

/// Environment variable carrying the per-channel output limit in bytes
pub const OUTPUT_LIMIT_ENV: &str = "EXECUTOR_OUTPUT_LIMIT";

/// Per-call side channels a worker writes to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SinkPaths {
    /// Combined stdout/stderr of intercepted shell commands
    pub shell: PathBuf,
    /// Structured trace of an uncaught error, absent when none was raised
    pub trace: PathBuf,
}

/// Trait for snippet runtimes
pub trait SnippetRuntime: Send + Sync {
    /// Build the worker command.
    ///
    /// Stdio, the sink environment, the output limit and process grouping are
    /// applied by the supervisor afterwards.
    fn command(&self, policy: &TracePolicy) -> Command;

    /// Check if this runtime is available on the system
    fn is_available(&self) -> bool;

    /// Version string reported by the runtime, if it can be queried
    fn version(&self) -> Option<String>;

    /// Get the language name
    fn language_name(&self) -> &'static str;
}
