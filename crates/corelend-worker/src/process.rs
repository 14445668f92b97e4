//! The worker OS process.
//!
//! Spawned with piped output. Two reader tasks drain stdout and stderr,
//! log every line, and feed [`Liveness`]: any line counts as a sign of
//! life, failure keywords bump the consecutive failure count and
//! completion keywords clear it.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use corelend_core::{WorkerConfig, epoch_secs};

use crate::error::{WorkerError, WorkerResult};

const FAILURE_MARKERS: &[&str] = &["ERROR", "FAILED", "BAD_WORK_UNIT", "EXCEPTION"];
const COMPLETION_MARKERS: &[&str] = &["FINISHED_UNIT", "Completed", "WORK_ACK"];
const WARNING_MARKERS: &[&str] = &["WARNING"];
const LIFECYCLE_MARKERS: &[&str] = &[
    "Started",
    "Starting",
    "Connecting",
    "Downloading",
    "Uploading",
    "Paused",
    "Unpaused",
];

/// Category of a single worker output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    Failure,
    Warning,
    Completion,
    Lifecycle,
    Other,
}

pub fn classify_line(line: &str) -> LineClass {
    let has = |markers: &[&str]| markers.iter().any(|m| line.contains(m));
    if has(FAILURE_MARKERS) {
        LineClass::Failure
    } else if has(WARNING_MARKERS) {
        LineClass::Warning
    } else if has(COMPLETION_MARKERS) {
        LineClass::Completion
    } else if has(LIFECYCLE_MARKERS) {
        LineClass::Lifecycle
    } else {
        LineClass::Other
    }
}

/// Liveness bookkeeping shared between the output readers and the
/// supervisor.
#[derive(Debug, Default)]
pub struct Liveness {
    last_live: AtomicU64,
    failures: AtomicU32,
}

impl Liveness {
    pub fn touch(&self) {
        self.last_live.store(epoch_secs(), Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }

    pub fn last_live(&self) -> u64 {
        self.last_live.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.failures.store(0, Ordering::Relaxed);
        self.touch();
    }

    fn observe(&self, line: &str, source: &'static str, verbose: bool) {
        self.touch();
        match classify_line(line) {
            LineClass::Failure => {
                self.record_failure();
                error!(source, "worker: {line}");
            }
            LineClass::Warning => warn!(source, "worker: {line}"),
            LineClass::Completion => {
                self.record_success();
                info!(source, "worker: {line}");
            }
            LineClass::Lifecycle => info!(source, "worker: {line}"),
            LineClass::Other if verbose => info!(source, "worker: {line}"),
            LineClass::Other => debug!(source, "worker: {line}"),
        }
    }
}

/// How to launch the worker binary.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub work_dir: PathBuf,
    pub verbose: bool,
}

impl From<&WorkerConfig> for LaunchSpec {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            args: config.args.clone(),
            work_dir: config.work_dir.clone(),
            verbose: config.verbose,
        }
    }
}

/// A single worker process, possibly not running.
pub struct WorkerProcess {
    spec: LaunchSpec,
    liveness: Arc<Liveness>,
    child: Option<Child>,
    readers: Vec<JoinHandle<()>>,
    started_at: Option<Instant>,
}

impl WorkerProcess {
    pub fn new(spec: LaunchSpec, liveness: Arc<Liveness>) -> Self {
        Self {
            spec,
            liveness,
            child: None,
            readers: Vec::new(),
            started_at: None,
        }
    }

    /// Launch the worker unless it is already running. Returns its pid.
    pub fn spawn(&mut self) -> WorkerResult<u32> {
        if self.is_running()
            && let Some(pid) = self.pid()
        {
            return Ok(pid);
        }

        std::fs::create_dir_all(&self.spec.work_dir).map_err(|source| WorkerError::Spawn {
            binary: self.spec.binary.clone(),
            source,
        })?;

        let mut child = Command::new(&self.spec.binary)
            .args(&self.spec.args)
            .current_dir(&self.spec.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WorkerError::Spawn {
                binary: self.spec.binary.clone(),
                source,
            })?;

        self.abort_readers();
        if let Some(stdout) = child.stdout.take() {
            self.readers.push(tokio::spawn(drain_output(
                stdout,
                "stdout",
                self.spec.verbose,
                self.liveness.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            self.readers.push(tokio::spawn(drain_output(
                stderr,
                "stderr",
                self.spec.verbose,
                self.liveness.clone(),
            )));
        }

        let pid = child.id().unwrap_or_default();
        info!(
            pid,
            binary = %self.spec.binary.display(),
            work_dir = %self.spec.work_dir.display(),
            "worker process started"
        );

        self.liveness.touch();
        self.child = Some(child);
        self.started_at = Some(Instant::now());
        Ok(pid)
    }

    /// Whether the process is still alive. Reaps it if it exited.
    pub fn is_running(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                warn!(%status, "worker process exited");
                self.child = None;
                self.started_at = None;
                false
            }
            Err(e) => {
                warn!(error = %e, "failed to poll worker process");
                false
            }
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Time since the current process was launched.
    pub fn uptime(&self) -> Option<Duration> {
        self.started_at.map(|t| t.elapsed())
    }

    /// Ask the process to exit, and kill it if it is still alive after
    /// `timeout`. Returns `true` if it exited on its own.
    pub async fn terminate(&mut self, timeout: Duration) -> bool {
        let Some(mut child) = self.child.take() else {
            return true;
        };
        self.started_at = None;

        let graceful = match child.id() {
            Some(pid) => {
                send_sigterm(pid);
                match tokio::time::timeout(timeout, child.wait()).await {
                    Ok(Ok(status)) => {
                        info!(pid, %status, "worker process stopped");
                        true
                    }
                    Ok(Err(e)) => {
                        warn!(pid, error = %e, "failed waiting for worker process");
                        false
                    }
                    Err(_) => {
                        warn!(pid, timeout_secs = timeout.as_secs(), "worker did not exit, killing");
                        if let Err(e) = child.kill().await {
                            error!(pid, error = %e, "failed to kill worker process");
                        }
                        false
                    }
                }
            }
            // Already reaped.
            None => true,
        };

        self.abort_readers();
        graceful
    }

    fn abort_readers(&mut self) {
        for reader in self.readers.drain(..) {
            reader.abort();
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.abort_readers();
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    // SAFETY: kill has no memory-safety preconditions; a stale pid only
    // yields ESRCH.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        debug!(pid, "SIGTERM delivery failed");
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

async fn drain_output<R>(stream: R, source: &'static str, verbose: bool, liveness: Arc<Liveness>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => liveness.observe(&line, source, verbose),
            Ok(None) => break,
            Err(e) => {
                debug!(source, error = %e, "worker output stream failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert_eq!(classify_line("ERROR: core crashed"), LineClass::Failure);
        assert_eq!(classify_line("WU01:FS00:Upload FAILED"), LineClass::Failure);
        assert_eq!(classify_line("WARNING: low disk"), LineClass::Warning);
        assert_eq!(classify_line("FahCore returned: FINISHED_UNIT"), LineClass::Completion);
        assert_eq!(classify_line("Downloading 12MiB"), LineClass::Lifecycle);
        assert_eq!(classify_line("Step 1000 of 50000"), LineClass::Other);
    }

    #[test]
    fn liveness_counts_failures_until_success() {
        let liveness = Liveness::default();
        liveness.observe("ERROR one", "stdout", false);
        liveness.observe("ERROR two", "stderr", false);
        assert_eq!(liveness.failures(), 2);
        assert!(liveness.last_live() > 0);
        liveness.observe("FINISHED_UNIT", "stdout", false);
        assert_eq!(liveness.failures(), 0);
    }

    fn sh(script: &str, dir: &std::path::Path) -> WorkerProcess {
        WorkerProcess::new(
            LaunchSpec {
                binary: PathBuf::from("sh"),
                args: vec!["-c".to_string(), script.to_string()],
                work_dir: dir.to_path_buf(),
                verbose: false,
            },
            Arc::new(Liveness::default()),
        )
    }

    #[tokio::test]
    async fn spawn_and_terminate() {
        let dir = tempfile::tempdir().unwrap();
        let mut process = sh("exec sleep 60", dir.path());
        let pid = process.spawn().unwrap();
        assert!(pid > 0);
        assert!(process.is_running());
        assert_eq!(process.spawn().unwrap(), pid);

        assert!(process.terminate(Duration::from_secs(5)).await);
        assert!(!process.is_running());
        assert_eq!(process.pid(), None);
    }

    #[tokio::test]
    async fn output_feeds_liveness() {
        let dir = tempfile::tempdir().unwrap();
        let liveness = Arc::new(Liveness::default());
        let mut process = WorkerProcess::new(
            LaunchSpec {
                binary: PathBuf::from("sh"),
                args: vec!["-c".into(), "echo 'ERROR a'; echo 'ERROR b' >&2".into()],
                work_dir: dir.path().to_path_buf(),
                verbose: true,
            },
            liveness.clone(),
        );
        process.spawn().unwrap();

        for _ in 0..50 {
            if liveness.failures() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(liveness.failures(), 2);
    }

    #[tokio::test]
    async fn exit_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let mut process = sh("exit 3", dir.path());
        process.spawn().unwrap();
        for _ in 0..100 {
            if !process.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!process.is_running());
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut process = WorkerProcess::new(
            LaunchSpec {
                binary: PathBuf::from("/nonexistent/worker-binary"),
                args: vec![],
                work_dir: dir.path().to_path_buf(),
                verbose: false,
            },
            Arc::new(Liveness::default()),
        );
        assert!(matches!(process.spawn(), Err(WorkerError::Spawn { .. })));
    }
}
