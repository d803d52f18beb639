//! Python snippet runtime.
//!
//! Each call starts a fresh interpreter. A small bootstrap reads the snippet
//! from stdin, swaps `os.system` for a wrapper that appends command output to
//! the shell sink, and executes the snippet as `__main__` in its own namespace.
//! An uncaught error is recorded as structured frames in the trace sink.

use std::path::{Path, PathBuf};
use std::process::Command;

use super::SnippetRuntime;
use crate::trace::{TracePolicy, FRAME_FIELD_LIMIT};

const BOOTSTRAP: &str = include_str!("bootstrap.py");

// Compiles the bootstrap under the supervisor identity so its frames can be
// told apart from the snippet's.
const LOADER: &str = "import os\nexec(compile(os.environ.pop('EXECUTOR_BOOTSTRAP'), os.environ.pop('EXECUTOR_SUPERVISOR_IDENTITY'), 'exec'))\n";

/// Default interpreter looked up on `PATH`
pub const DEFAULT_PYTHON: &str = "python3";

/// Python runtime for snippets
#[derive(Clone, Debug)]
pub struct PythonRuntime {
    binary: PathBuf,
}

impl PythonRuntime {
    /// Create a runtime using `python3` from `PATH`
    #[must_use]
    pub fn new() -> Self {
        Self::with_binary(DEFAULT_PYTHON)
    }

    /// Create a runtime using a specific interpreter
    #[must_use]
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Interpreter path
    #[must_use]
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn version_output(&self) -> Option<std::process::Output> {
        Command::new(&self.binary)
            .arg("--version")
            .output()
            .ok()
            .filter(|output| output.status.success())
    }
}

impl Default for PythonRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl SnippetRuntime for PythonRuntime {
    fn command(&self, policy: &TracePolicy) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .arg("-u")
            .arg("-c")
            .arg(LOADER)
            .env("EXECUTOR_BOOTSTRAP", BOOTSTRAP)
            .env("EXECUTOR_SUPERVISOR_IDENTITY", &policy.supervisor_identity)
            .env("EXECUTOR_SNIPPET_IDENTITY", &policy.snippet_identity)
            .env("EXECUTOR_TRACE_FRAMES", policy.recorded_frames().to_string())
            .env("EXECUTOR_TRACE_FIELD_LIMIT", FRAME_FIELD_LIMIT.to_string())
            .env("PYTHONIOENCODING", "utf-8")
            .env("PYTHONDONTWRITEBYTECODE", "1");
        command
    }

    fn is_available(&self) -> bool {
        self.version_output().is_some()
    }

    fn version(&self) -> Option<String> {
        let output = self.version_output()?;
        // Older interpreters print the version on stderr
        let text = if output.stdout.is_empty() {
            output.stderr
        } else {
            output.stdout
        };
        let version = String::from_utf8_lossy(&text).trim().to_string();
        (!version.is_empty()).then_some(version)
    }

    fn language_name(&self) -> &'static str {
        "python"
    }
}
