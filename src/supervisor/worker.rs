//! Worker processes: spawning, bounded stream capture and termination.

use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::SupervisorError;
use crate::runtime::{
    SinkPaths, SnippetRuntime, OUTPUT_LIMIT_ENV, SHELL_SINK_ENV, TRACE_SINK_ENV,
};
use crate::trace::TracePolicy;

/// Marker appended to a stream that hit the output limit
pub const TRUNCATION_MARKER: &str = "\n[output truncated]\n";

/// How long readers may keep draining after the worker is gone
const DRAIN_GRACE: Duration = Duration::from_millis(250);

const READ_CHUNK: usize = 8192;

/// Bounded in-memory capture of one worker stream
#[derive(Debug)]
pub struct CaptureBuffer {
    data: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl CaptureBuffer {
    /// Create an empty buffer holding at most `limit` bytes
    #[must_use]
    pub const fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            truncated: false,
        }
    }

    /// Append a chunk, dropping whatever does not fit
    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.data.len());
        if chunk.len() > room {
            self.data.extend_from_slice(&chunk[..room]);
            self.truncated = true;
        } else {
            self.data.extend_from_slice(chunk);
        }
    }

    /// Most bytes this buffer holds
    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes held
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing was captured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Raw bytes held, without the truncation marker
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Whether input was dropped at the limit
    #[must_use]
    pub const fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Decode as text, marking truncation
    #[must_use]
    pub fn to_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.data).into_owned();
        if self.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

/// A capture buffer shared between a reader task and the supervisor
pub type SharedCapture = Arc<Mutex<CaptureBuffer>>;

/// Create a shared capture buffer
#[must_use]
pub fn shared_capture(limit: usize) -> SharedCapture {
    Arc::new(Mutex::new(CaptureBuffer::new(limit)))
}

/// Lock a capture buffer, recovering from a poisoned lock
pub fn lock_capture(capture: &SharedCapture) -> MutexGuard<'_, CaptureBuffer> {
    capture.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How the wait on a worker resolved
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerExit {
    /// The worker exited on its own
    Finished(ExitStatus),
    /// The deadline elapsed and the worker was killed
    TimedOut,
}

/// One worker process and its stream readers
pub struct Worker {
    child: Child,
    pid: Option<u32>,
    readers: Vec<JoinHandle<()>>,
}

impl Worker {
    /// Start a worker for `code`, piping its stdout and stderr into the
    /// given buffers. The worker is told the stdout buffer's limit so it can
    /// clip what it records in the trace sink.
    ///
    /// # Errors
    /// Returns error if the process cannot be spawned
    pub fn spawn(
        runtime: &dyn SnippetRuntime,
        policy: &TracePolicy,
        sinks: &SinkPaths,
        code: &str,
        stdout: &SharedCapture,
        stderr: &SharedCapture,
    ) -> Result<Self, SupervisorError> {
        let mut std_command = runtime.command(policy);
        let program = std_command.get_program().to_string_lossy().into_owned();
        std_command
            .env(SHELL_SINK_ENV, &sinks.shell)
            .env(TRACE_SINK_ENV, &sinks.trace)
            .env(OUTPUT_LIMIT_ENV, lock_capture(stdout).limit().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Own process group so shell commands started by the snippet die with it
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_command.process_group(0);
        }

        let mut command = Command::from(std_command);
        command.kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|source| SupervisorError::Spawn { program, source })?;
        let pid = child.id();
        debug!(?pid, "worker spawned");

        let mut readers = Vec::with_capacity(3);
        if let Some(stdin) = child.stdin.take() {
            readers.push(feed_stdin(stdin, code.to_owned()));
        }
        if let Some(out) = child.stdout.take() {
            readers.push(spawn_reader(out, Arc::clone(stdout)));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(spawn_reader(err, Arc::clone(stderr)));
        }

        Ok(Self {
            child,
            pid,
            readers,
        })
    }

    /// Wait for the worker with `deadline` as the limit, killing it when the
    /// deadline elapses first.
    ///
    /// Either way the worker's process group is killed before the worker is
    /// reaped, while its pid still names the group.
    ///
    /// # Errors
    /// Returns error if the process status cannot be collected
    pub async fn wait(&mut self, deadline: Duration) -> Result<WorkerExit, SupervisorError> {
        match tokio::time::timeout(deadline, self.exited()).await {
            Ok(Ok(())) => {
                self.kill_group();
                let status = self.child.wait().await.map_err(SupervisorError::Wait)?;
                self.pid = None;
                Ok(WorkerExit::Finished(status))
            }
            Ok(Err(e)) => Err(SupervisorError::Wait(e)),
            Err(_) => {
                self.terminate().await?;
                Ok(WorkerExit::TimedOut)
            }
        }
    }

    /// Kill the worker's process group and reap the worker.
    ///
    /// # Errors
    /// Returns error if the worker cannot be reaped
    pub async fn terminate(&mut self) -> Result<(), SupervisorError> {
        self.kill_group();
        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "worker already gone");
        }
        self.child.wait().await.map_err(SupervisorError::Wait)?;
        self.pid = None;
        Ok(())
    }

    /// Resolve once the worker has exited, leaving it unreaped
    #[cfg(target_os = "linux")]
    async fn exited(&mut self) -> std::io::Result<()> {
        use nix::errno::Errno;
        use nix::sys::wait::{waitid, Id, WaitPidFlag};
        use nix::unistd::Pid;

        let Some(pid) = self.pid.and_then(|pid| i32::try_from(pid).ok()) else {
            return self.child.wait().await.map(drop);
        };
        tokio::task::spawn_blocking(move || loop {
            match waitid(
                Id::Pid(Pid::from_raw(pid)),
                WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT,
            ) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => {}
                Err(e) => return Err(std::io::Error::from(e)),
            }
        })
        .await
        .map_err(std::io::Error::other)?
    }

    /// Resolve once the worker has exited. Without a non-reaping wait the
    /// pid is released here and the group is left to `kill_on_drop`.
    #[cfg(not(target_os = "linux"))]
    async fn exited(&mut self) -> std::io::Result<()> {
        self.child.wait().await?;
        self.pid = None;
        Ok(())
    }

    /// Tear the worker down: kill anything left in its process group if the
    /// worker was never reaped, and give the readers a short grace period to
    /// collect buffered output.
    pub async fn shutdown(mut self) {
        self.kill_group();
        for reader in &mut self.readers {
            if tokio::time::timeout(DRAIN_GRACE, &mut *reader).await.is_err() {
                debug!("stream reader still busy after grace period, aborting");
                reader.abort();
            }
        }
        self.pid = None;
    }

    #[cfg(unix)]
    fn kill_group(&self) {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid.and_then(|pid| i32::try_from(pid).ok()) else {
            return;
        };
        match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(pid, error = %e, "failed to kill worker process group"),
        }
    }

    #[cfg(not(unix))]
    fn kill_group(&self) {}
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.kill_group();
        for reader in &self.readers {
            reader.abort();
        }
    }
}

fn feed_stdin(mut stdin: tokio::process::ChildStdin, code: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = stdin.write_all(code.as_bytes()).await {
            debug!(error = %e, "worker closed stdin early");
        }
    })
}

fn spawn_reader<R>(mut stream: R, capture: SharedCapture) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => lock_capture(&capture).push(&chunk[..n]),
                Err(e) => {
                    debug!(error = %e, "worker stream read failed");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ShellRuntime;

    impl SnippetRuntime for ShellRuntime {
        fn command(&self, _policy: &TracePolicy) -> std::process::Command {
            std::process::Command::new("sh")
        }

        fn is_available(&self) -> bool {
            true
        }

        fn version(&self) -> Option<String> {
            None
        }

        fn language_name(&self) -> &'static str {
            "sh"
        }
    }

    fn spawn_shell(script: &str, stdout: &SharedCapture) -> Worker {
        let dir = std::env::temp_dir();
        let sinks = SinkPaths {
            shell: dir.join("python-executor-worker-test-shell.log"),
            trace: dir.join("python-executor-worker-test-trace.json"),
        };
        let stderr = shared_capture(1024);
        Worker::spawn(
            &ShellRuntime,
            &TracePolicy::default(),
            &sinks,
            script,
            stdout,
            &stderr,
        )
        .unwrap()
    }

    /// Whether `pid` is gone or only a zombie awaiting its new parent
    #[cfg(target_os = "linux")]
    fn is_dead(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .is_some_and(|rest| rest.trim_start().starts_with('Z')),
            Err(_) => true,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_group_is_killed_before_worker_is_reaped() {
        let stdout = shared_capture(1024);
        let mut worker = spawn_shell("sleep 30 &\necho $!\nexit 0", &stdout);

        let exit = worker.wait(Duration::from_secs(10)).await.unwrap();
        // The leader exited on its own; the group kill did not change its status
        match exit {
            WorkerExit::Finished(status) => assert!(status.success(), "{status:?}"),
            WorkerExit::TimedOut => panic!("worker timed out"),
        }
        assert!(worker.pid.is_none());

        let mut background = String::new();
        for _ in 0..200 {
            background = lock_capture(&stdout).to_text().trim().to_string();
            if !background.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!background.is_empty(), "background pid never printed");

        let mut dead = false;
        for _ in 0..200 {
            dead = is_dead(&background);
            if dead {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(dead, "background process {background} survived");
        worker.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_reaps_worker() {
        let stdout = shared_capture(1024);
        let mut worker = spawn_shell("sleep 30", &stdout);

        let exit = worker.wait(Duration::from_millis(200)).await.unwrap();
        assert_eq!(exit, WorkerExit::TimedOut);
        assert!(worker.pid.is_none());
        worker.shutdown().await;
    }

    #[test]
    fn test_capture_within_limit() {
        let mut buffer = CaptureBuffer::new(16);
        buffer.push(b"hello ");
        buffer.push(b"world");

        assert_eq!(buffer.len(), 11);
        assert!(!buffer.is_truncated());
        assert_eq!(buffer.to_text(), "hello world");
    }

    #[test]
    fn test_capture_truncates_at_limit() {
        let mut buffer = CaptureBuffer::new(8);
        buffer.push(b"0123456789");
        buffer.push(b"more");

        assert_eq!(buffer.len(), 8);
        assert!(buffer.is_truncated());
        assert_eq!(buffer.to_text(), format!("01234567{TRUNCATION_MARKER}"));
    }

    #[test]
    fn test_capture_lossy_utf8() {
        let mut buffer = CaptureBuffer::new(64);
        buffer.push(&[b'o', b'k', 0xff]);

        assert_eq!(buffer.to_text(), "ok\u{fffd}");
    }

    #[test]
    fn test_empty_capture() {
        let buffer = CaptureBuffer::new(4);
        assert!(buffer.is_empty());
        assert_eq!(buffer.to_text(), "");
    }

    #[test]
    fn test_raw_bytes_exclude_marker() {
        let mut buffer = CaptureBuffer::new(2);
        buffer.push(b"abc");
        assert_eq!(buffer.as_bytes(), b"ab");
    }
}
