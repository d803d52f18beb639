//! Tracebacks recorded by the worker and the policy that sanitizes them.
//!
//! The worker bootstrap writes an uncaught exception as structured frames
//! rather than preformatted text. Filtering then works on frame identity
//! instead of string matching: frames that belong to the supervisor's own
//! bootstrap are dropped, only the innermost frames are kept, and the
//! synthetic identity the snippet was compiled under never reaches the report.

use serde::Deserialize;
use thiserror::Error;

/// Innermost frames kept in a report
pub const DEFAULT_TRACE_DEPTH: usize = 5;

/// Filename the worker bootstrap is compiled under
pub const SUPERVISOR_IDENTITY: &str = "<supervisor>";

/// Filename the snippet is compiled under
pub const SNIPPET_IDENTITY: &str = "<snippet>";

/// Frames a worker records beyond `depth`, covering its own bootstrap frames
pub const SUPERVISOR_FRAME_ALLOWANCE: usize = 2;

/// Longest filename, function name or source line a worker records per frame
pub const FRAME_FIELD_LIMIT: usize = 256;

const TRACEBACK_HEADER: &str = "Traceback (most recent call last):\n";

/// Trace decoding errors
#[derive(Debug, Error)]
pub enum TraceError {
    /// The worker wrote something that is not a trace record
    #[error("malformed trace record: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The trace sink exists but could not be read
    #[error("unreadable trace record: {0}")]
    Unreadable(#[from] std::io::Error),

    /// The record is larger than any trace the worker writes
    #[error("trace record exceeds {limit} bytes")]
    TooLarge {
        /// Largest accepted record
        limit: usize,
    },
}

/// One stack frame, outermost first within a [`RawTrace`]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Frame {
    /// Source identity (a path, or a synthetic name like `<snippet>`)
    pub filename: String,
    /// 1-based line number
    pub lineno: u32,
    /// Function name, `<module>` for top-level code
    pub name: String,
    /// Source line, empty when unavailable
    #[serde(default)]
    pub line: String,
}

/// An uncaught exception as recorded by the worker
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct RawTrace {
    /// Stack frames from the catching frame down to the raise point
    pub frames: Vec<Frame>,
    /// Exception description lines (type, message, syntax error caret)
    pub exception: Vec<String>,
}

impl RawTrace {
    /// Decode a trace record
    ///
    /// # Errors
    /// Returns error if the record is not valid JSON of the expected shape
    pub fn from_json(bytes: &[u8]) -> Result<Self, TraceError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Truncation and identity-stripping policy for failure descriptions
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TracePolicy {
    /// Innermost frames to keep after supervisor frames are removed
    pub depth: usize,
    /// Frames with this filename belong to the supervisor and are dropped
    pub supervisor_identity: String,
    /// Synthetic filename of the snippet, stripped from rendered frames
    pub snippet_identity: String,
}

impl Default for TracePolicy {
    fn default() -> Self {
        Self {
            depth: DEFAULT_TRACE_DEPTH,
            supervisor_identity: SUPERVISOR_IDENTITY.to_string(),
            snippet_identity: SNIPPET_IDENTITY.to_string(),
        }
    }
}

impl TracePolicy {
    /// Policy with a custom depth and the default identities
    #[must_use]
    pub fn with_depth(depth: usize) -> Self {
        Self {
            depth,
            ..Self::default()
        }
    }

    /// Innermost frames a worker needs to record so that [`Self::sanitize`]
    /// still finds `depth` frames after dropping supervisor frames
    #[must_use]
    pub const fn recorded_frames(&self) -> usize {
        self.depth.saturating_add(SUPERVISOR_FRAME_ALLOWANCE)
    }

    /// Render a trace as a failure description.
    ///
    /// The result reads like a standalone program's traceback: snippet frames
    /// appear as `line 3, in f` (or `line 1:` at module level) and the
    /// exception lines close it out.
    #[must_use]
    pub fn sanitize(&self, trace: &RawTrace) -> String {
        let frames: Vec<&Frame> = trace
            .frames
            .iter()
            .filter(|frame| frame.filename != self.supervisor_identity)
            .collect();
        let kept = &frames[frames.len().saturating_sub(self.depth)..];

        let mut out = String::new();
        if !kept.is_empty() {
            out.push_str(TRACEBACK_HEADER);
            for frame in kept {
                self.render_frame(frame, &mut out);
            }
        }
        for line in &trace.exception {
            out.push_str(&self.strip_identity(line));
        }

        out.trim().to_string()
    }

    fn render_frame(&self, frame: &Frame, out: &mut String) {
        let location = if frame.filename == self.snippet_identity {
            if frame.name == "<module>" {
                format!("  line {}:\n", frame.lineno)
            } else {
                format!("  line {}, in {}\n", frame.lineno, frame.name)
            }
        } else {
            format!(
                "  File \"{}\", line {}, in {}\n",
                frame.filename, frame.lineno, frame.name
            )
        };
        out.push_str(&location);

        let source = frame.line.trim();
        if !source.is_empty() {
            out.push_str("    ");
            out.push_str(source);
            out.push('\n');
        }
    }

    // Syntax errors carry their own `File "<snippet>", line N` line.
    fn strip_identity(&self, line: &str) -> String {
        line.replace(&format!("File \"{}\", ", self.snippet_identity), "")
    }
}
