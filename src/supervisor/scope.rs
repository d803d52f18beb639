//! Call-scoped interception.
//!
//! An [`InterceptionScope`] is acquired before a worker is dispatched and
//! restored after the wait resolves. Holding one means holding an exclusion
//! permit and a private directory with the capture sinks. Dropping a scope
//! that was never restored still releases both.
//!
//! Sinks are files the snippet can write without limit, so they are read back
//! through the same bound as the piped streams.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use super::worker::CaptureBuffer;
use super::SupervisorError;
use crate::runtime::SinkPaths;
use crate::trace::{RawTrace, TraceError, FRAME_FIELD_LIMIT};
use crate::types::Outcome;

// A JSON-escaped character takes at most six bytes; a one-character line
// adds three more for its quotes and separator.
const TRACE_BYTES_PER_CHAR: usize = 9;
// One frame object with every field at FRAME_FIELD_LIMIT, escaped.
const TRACE_BYTES_PER_FRAME: usize = 3 * 6 * FRAME_FIELD_LIMIT + 256;
const TRACE_RECORD_OVERHEAD: usize = 64 * 1024;

/// Largest trace record a worker writes when it clips exception text to
/// `output_limit` characters and keeps `frames` frames
#[must_use]
pub const fn trace_record_limit(output_limit: usize, frames: usize) -> usize {
    output_limit
        .saturating_add(1)
        .saturating_mul(TRACE_BYTES_PER_CHAR)
        .saturating_add(frames.saturating_mul(TRACE_BYTES_PER_FRAME))
        .saturating_add(TRACE_RECORD_OVERHEAD)
}

/// Lifecycle of one call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Nothing acquired yet
    Idle,
    /// Permit held and sinks created
    Intercepting,
    /// Worker running
    Dispatched,
    /// Worker finished without an error
    Completed,
    /// Worker raised or exited abnormally
    Failed,
    /// Deadline elapsed
    TimedOut,
    /// Sinks read back and removed, permit released
    Restored,
    /// Report handed to the caller
    Reported,
}

impl Phase {
    /// Whether `next` is a legal successor of `self`
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Intercepting)
                | (Self::Intercepting | Self::Dispatched, Self::Restored)
                | (Self::Intercepting, Self::Dispatched)
                | (
                    Self::Dispatched,
                    Self::Completed | Self::Failed | Self::TimedOut
                )
                | (Self::Completed | Self::Failed | Self::TimedOut, Self::Restored)
                | (Self::Restored, Self::Reported)
        )
    }

    /// Phase reached when a run ends with `outcome`
    #[must_use]
    pub const fn from_outcome(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Completed => Self::Completed,
            Outcome::Failed => Self::Failed,
            Outcome::TimedOut => Self::TimedOut,
        }
    }
}

/// What restoration hands back
#[derive(Debug)]
pub struct Restored {
    /// What intercepted shell commands wrote, bounded like the piped streams
    pub shell: CaptureBuffer,
}

/// Exclusive, call-scoped ownership of the capture sinks
pub struct InterceptionScope {
    _permit: OwnedSemaphorePermit,
    dir: Option<TempDir>,
    sinks: SinkPaths,
    output_limit: usize,
    phase: Phase,
}

impl InterceptionScope {
    /// Wait for the exclusion permit, then create fresh sinks. Shell output is
    /// read back up to `output_limit` bytes.
    ///
    /// # Errors
    /// Returns error if the supervisor is closed or the sinks cannot be created
    pub async fn install(
        permits: Arc<Semaphore>,
        output_limit: usize,
    ) -> Result<Self, SupervisorError> {
        let permit = permits
            .acquire_owned()
            .await
            .map_err(|_| SupervisorError::Closed)?;

        let dir = tempfile::Builder::new()
            .prefix("python-executor-")
            .tempdir()
            .map_err(SupervisorError::Setup)?;
        let sinks = SinkPaths {
            shell: dir.path().join("shell.log"),
            trace: dir.path().join("trace.json"),
        };

        let mut scope = Self {
            _permit: permit,
            dir: Some(dir),
            sinks,
            output_limit,
            phase: Phase::Idle,
        };
        scope.advance(Phase::Intercepting);
        Ok(scope)
    }

    /// Sink locations for the worker
    #[must_use]
    pub const fn sinks(&self) -> &SinkPaths {
        &self.sinks
    }

    /// Current phase
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Move to the next phase
    pub fn advance(&mut self, next: Phase) {
        if !self.phase.can_advance_to(next) {
            warn!(from = ?self.phase, to = ?next, "unexpected phase transition");
        }
        debug!(from = ?self.phase, to = ?next, "phase");
        self.phase = next;
    }

    /// Read the trace the worker recorded, if it recorded one. At most
    /// `limit` bytes are read (see [`trace_record_limit`]).
    ///
    /// # Errors
    /// Returns error if the record exists but cannot be read, is larger than
    /// `limit`, or cannot be decoded
    pub async fn take_trace(&self, limit: usize) -> Result<Option<RawTrace>, TraceError> {
        let Some(record) = read_bounded(&self.sinks.trace, limit).await? else {
            return Ok(None);
        };
        if record.is_truncated() {
            return Err(TraceError::TooLarge { limit });
        }
        RawTrace::from_json(record.as_bytes()).map(Some)
    }

    /// Read back intercepted shell output, remove the sinks and release the
    /// permit.
    ///
    /// # Errors
    /// Returns error if the sinks cannot be read or removed
    pub async fn restore(mut self) -> Result<Restored, SupervisorError> {
        self.advance(Phase::Restored);

        let limit = self.output_limit;
        let shell = read_bounded(&self.sinks.shell, limit)
            .await
            .map_err(SupervisorError::Teardown)?
            .unwrap_or_else(|| CaptureBuffer::new(limit));

        if let Some(dir) = self.dir.take() {
            tokio::task::spawn_blocking(move || dir.close())
                .await
                .map_err(|e| SupervisorError::Teardown(std::io::Error::other(e)))?
                .map_err(SupervisorError::Teardown)?;
        }

        Ok(Restored { shell })
    }
}

/// Read at most `limit` bytes of a sink, noting whether more was there.
/// A sink the worker never created reads as `None`.
async fn read_bounded(path: &Path, limit: usize) -> std::io::Result<Option<CaptureBuffer>> {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut bytes = Vec::new();
    let window = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    file.take(window).read_to_end(&mut bytes).await?;

    let mut capture = CaptureBuffer::new(limit);
    capture.push(&bytes);
    Ok(Some(capture))
}

impl Drop for InterceptionScope {
    fn drop(&mut self) {
        if self.phase != Phase::Restored {
            warn!(phase = ?self.phase, "interception scope dropped before restore");
        }
        // Any remaining TempDir removes itself here
    }
}
