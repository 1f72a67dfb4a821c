//! Lifecycle management for the external streamer process.
//!
//! The streamer is treated as a collaborator with an explicit lifecycle:
//! spawn with its output captured to a log file, poll for readiness by
//! validating the ring it creates, observe liveness without blocking, and
//! terminate idempotently. A [`StreamerProcess`] is shared between the
//! streaming tasks through an `Arc`; whichever owner drops last performs the
//! kill, and an explicit [`stop`](StreamerProcess::stop) is always safe to
//! call earlier.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, StreamError};
use crate::params::StreamerInvocation;
use crate::ring::SampleRing;

/// Wall-clock bound on the ring-open polling phase.
pub const RING_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between ring-open attempts.
const RING_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How much of the streamer log to attach to startup failures.
const LOG_TAIL_BYTES: u64 = 2048;

struct ChildState {
    child: Option<Child>,
    /// Set once the child has been reaped, by whichever call observed it.
    exit: Option<ExitStatus>,
}

/// Handle to a spawned streamer process.
pub struct StreamerProcess {
    state: Mutex<ChildState>,
    log_path: PathBuf,
}

impl StreamerProcess {
    /// Spawn the streamer with stdout and stderr redirected to `log_path`.
    pub fn spawn(invocation: &StreamerInvocation, log_path: PathBuf) -> Result<Arc<Self>> {
        let log = File::create(&log_path)?;
        let log_err = log.try_clone()?;

        let child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()?;

        info!(
            program = %invocation.program.display(),
            pid = child.id(),
            log = %log_path.display(),
            "spawned streamer process"
        );

        Ok(Arc::new(Self {
            state: Mutex::new(ChildState {
                child: Some(child),
                exit: None,
            }),
            log_path,
        }))
    }

    /// Non-blocking liveness probe. Returns the exit status once the process
    /// has terminated, reaping it on the first observation.
    pub fn poll_exit(&self) -> Option<ExitStatus> {
        let mut state = self.state.lock();
        if let Some(status) = state.exit {
            return Some(status);
        }
        let child = state.child.as_mut()?;
        match child.try_wait() {
            Ok(None) => None,
            Ok(Some(status)) => {
                debug!(%status, "streamer process exited");
                state.child = None;
                state.exit = Some(status);
                Some(status)
            }
            Err(e) => {
                warn!("failed to poll streamer process: {e}");
                None
            }
        }
    }

    /// Whether the process is still running.
    pub fn is_running(&self) -> bool {
        self.poll_exit().is_none()
    }

    /// Terminate the process if it is still running, then reap it.
    /// Idempotent: later calls (including the `Drop` backstop) are no-ops.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if let Some(mut child) = state.child.take() {
            if let Err(e) = child.kill() {
                warn!("failed to kill streamer process: {e}");
            }
            match child.wait() {
                Ok(status) => {
                    info!(%status, "stopped streamer process");
                    state.exit = Some(status);
                }
                Err(e) => warn!("error reaping streamer process: {e}"),
            }
        }
    }

    /// The last [`LOG_TAIL_BYTES`] of the streamer log, for diagnostics.
    pub fn log_tail(&self) -> String {
        fn tail(path: &Path) -> std::io::Result<String> {
            let mut file = File::open(path)?;
            let len = file.metadata()?.len();
            file.seek(SeekFrom::Start(len.saturating_sub(LOG_TAIL_BYTES)))?;
            let mut buf = String::new();
            file.read_to_string(&mut buf)?;
            Ok(buf)
        }
        tail(&self.log_path).unwrap_or_else(|e| format!("<log unavailable: {e}>"))
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }
}

impl Drop for StreamerProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Wait for the streamer to create a valid ring at `path`.
///
/// Polls the filesystem and ring header until the ring opens and validates,
/// the process exits, or [`RING_OPEN_TIMEOUT`] elapses. `RingAbsent`,
/// `RingTooSmall` and `RingMalformed` are expected while the peer is still
/// initialising and are retried; any other error aborts the wait.
pub(crate) fn wait_for_ring(path: &Path, process: &StreamerProcess) -> Result<SampleRing> {
    let deadline = Instant::now() + RING_OPEN_TIMEOUT;
    loop {
        match SampleRing::open(path) {
            Ok(ring) => return Ok(ring),
            Err(e) if e.retryable_during_open() => {
                if let Some(status) = process.poll_exit() {
                    return Err(StreamError::ProcessFailedToStart {
                        status,
                        log_tail: process.log_tail(),
                    });
                }
                if Instant::now() >= deadline {
                    return Err(StreamError::OpenTimeout {
                        path: path.to_path_buf(),
                        waited: RING_OPEN_TIMEOUT,
                    });
                }
                std::thread::sleep(RING_POLL_INTERVAL);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Default log file path for one streamer session.
pub(crate) fn default_log_path(log_dir: Option<&Path>, role: &str) -> PathBuf {
    let dir = log_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(std::env::temp_dir);
    let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
    dir.join(format!(
        "iqbridge-{role}-{stamp}-{pid}.log",
        pid = std::process::id()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(args: &[&str]) -> StreamerInvocation {
        StreamerInvocation::new("/bin/sh", args.iter().map(|s| s.to_string()).collect())
    }

    fn log_path(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        dir.path().join(name)
    }

    #[test]
    fn test_spawn_and_observe_exit() {
        let dir = tempfile::tempdir().unwrap();
        let process =
            StreamerProcess::spawn(&invocation(&["-c", "exit 3"]), log_path(&dir, "a.log"))
                .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let status = loop {
            if let Some(status) = process.poll_exit() {
                break status;
            }
            assert!(Instant::now() < deadline, "child never exited");
            std::thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(status.code(), Some(3));
        assert!(!process.is_running());

        // Exit status is cached once observed.
        assert_eq!(process.poll_exit().unwrap().code(), Some(3));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let process =
            StreamerProcess::spawn(&invocation(&["-c", "sleep 30"]), log_path(&dir, "b.log"))
                .unwrap();
        assert!(process.is_running());
        process.stop();
        assert!(!process.is_running());
        process.stop();
        process.stop();
    }

    #[test]
    fn test_log_tail_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let process = StreamerProcess::spawn(
            &invocation(&["-c", "echo boot failed: no device >&2; exit 1"]),
            log_path(&dir, "c.log"),
        )
        .unwrap();
        while process.is_running() {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(process.log_tail().contains("boot failed: no device"));
    }

    #[test]
    fn test_wait_for_ring_reports_dead_process() {
        let dir = tempfile::tempdir().unwrap();
        let process = StreamerProcess::spawn(
            &invocation(&["-c", "echo no ring for you; exit 7"]),
            log_path(&dir, "d.log"),
        )
        .unwrap();
        let err = wait_for_ring(&dir.path().join("never.ring"), &process).unwrap_err();
        match err {
            StreamError::ProcessFailedToStart { status, log_tail } => {
                assert_eq!(status.code(), Some(7));
                assert!(log_tail.contains("no ring for you"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_wait_for_ring_succeeds_once_created() {
        let dir = tempfile::tempdir().unwrap();
        let ring_path = dir.path().join("late.ring");
        // Peer that creates a valid ring after a short delay, then lingers.
        let script = format!(
            "sleep 0.1; head -c 64 /dev/zero > {p}.tmp; \
             printf '\\004\\000\\000\\000\\002\\000\\000\\000\\001\\000\\000\\000\\004\\000\\000\\000' \
               | dd of={p}.tmp bs=1 seek=24 conv=notrunc 2>/dev/null; \
             head -c 32 /dev/zero >> {p}.tmp; mv {p}.tmp {p}; sleep 30",
            p = ring_path.display()
        );
        let process =
            StreamerProcess::spawn(&invocation(&["-c", &script]), log_path(&dir, "e.log"))
                .unwrap();
        let ring = wait_for_ring(&ring_path, &process).unwrap();
        assert_eq!(ring.chunk_size(), 4);
        assert_eq!(ring.num_slots(), 2);
        assert_eq!(ring.num_channels(), 1);
        process.stop();
    }
}
