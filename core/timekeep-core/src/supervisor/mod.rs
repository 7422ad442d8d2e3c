//! Worker process supervision.
//!
//! The desktop client's data API is served by a locally spawned worker. This
//! module owns that process for its whole life:
//!
//! ```text
//!            start()                marker on stdout
//! Stopped ───────────▶ Starting ─────────────────────▶ Ready
//!    ▲                    │ timeout / early exit          │ unexpected exit
//!    │                    ▼                               ▼
//!    └──── stop() ◀─── Crashed ◀──────────────────────────┘
//!    └──── stop() ◀─── Stopping ◀── stop() from Starting/Ready
//! ```
//!
//! # Ownership
//!
//! The `Child` handle never leaves the supervisor. Other components ask
//! [`ProcessSupervisor::is_running`] instead of signalling the worker.
//!
//! # Failed starts
//!
//! A start that times out leaves the worker in `Crashed` with its handle still
//! held, since the process may be alive. `stop()` reaps it; a later `start()`
//! reaps it first as well. There is no automatic restart after a crash.

mod terminator;

pub use terminator::{platform_terminator, ProcessTerminator, SignalTerminator, TreeTerminator};

use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::error::ProcessError;

pub const SUPERVISED_ENV: &str = "TIMEKEEP_SUPERVISED";
pub const DEFAULT_READINESS_MARKERS: [&str; 3] =
    ["Worker ready", "Server running on", "Listening on"];
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(200);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Starting,
    Ready,
    Stopping,
    Crashed,
}

/// How to launch the worker and how long to wait on it.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
    pub readiness_markers: Vec<String>,
    pub start_timeout: Duration,
    pub grace_period: Duration,
}

impl WorkerSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
            readiness_markers: DEFAULT_READINESS_MARKERS
                .iter()
                .map(|marker| marker.to_string())
                .collect(),
            start_timeout: DEFAULT_START_TIMEOUT,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn readiness_markers<I, S>(mut self, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.readiness_markers = markers.into_iter().map(Into::into).collect();
        self
    }

    fn is_ready_line(&self, line: &str) -> bool {
        self.readiness_markers
            .iter()
            .any(|marker| !marker.is_empty() && line.contains(marker.as_str()))
    }
}

struct Inner {
    state: WorkerState,
    child: Option<Child>,
    // Bumped whenever a start or stop begins, so stale monitors and
    // interrupted starts can tell they no longer own the worker.
    generation: u64,
}

enum StdoutSignal {
    Ready(String),
    Closed,
}

pub struct ProcessSupervisor {
    spec: Arc<WorkerSpec>,
    terminator: Box<dyn ProcessTerminator>,
    inner: Arc<Mutex<Inner>>,
}

impl ProcessSupervisor {
    pub fn new(spec: WorkerSpec) -> Self {
        Self::with_terminator(spec, platform_terminator())
    }

    pub fn with_terminator(spec: WorkerSpec, terminator: Box<dyn ProcessTerminator>) -> Self {
        Self {
            spec: Arc::new(spec),
            terminator,
            inner: Arc::new(Mutex::new(Inner {
                state: WorkerState::Stopped,
                child: None,
                generation: 0,
            })),
        }
    }

    pub fn state(&self) -> WorkerState {
        lock_inner(&self.inner).state
    }

    pub fn is_running(&self) -> bool {
        self.state() == WorkerState::Ready
    }

    pub fn pid(&self) -> Option<u32> {
        lock_inner(&self.inner).child.as_ref().map(Child::id)
    }

    pub fn start(&self) -> Result<(), ProcessError> {
        let (generation, leftover) = {
            let mut inner = lock_inner(&self.inner);
            match inner.state {
                WorkerState::Starting | WorkerState::Ready | WorkerState::Stopping => {
                    return Err(ProcessError::AlreadyRunning { state: inner.state });
                }
                WorkerState::Stopped | WorkerState::Crashed => {}
            }
            inner.state = WorkerState::Starting;
            inner.generation += 1;
            (inner.generation, inner.child.take())
        };

        if let Some(child) = leftover {
            warn!(pid = child.id(), "Reaping worker left over from a failed start");
            self.terminate(child);
        }

        let mut command = Command::new(&self.spec.program);
        command
            .args(&self.spec.args)
            .envs(self.spec.env.iter().map(|(key, value)| (key, value)))
            .env(SUPERVISED_ENV, "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.spec.current_dir {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                let mut inner = lock_inner(&self.inner);
                if inner.generation == generation {
                    inner.state = WorkerState::Stopped;
                }
                error!(
                    error = %source,
                    program = %self.spec.program.display(),
                    "Failed to spawn worker"
                );
                return Err(ProcessError::Spawn {
                    program: self.spec.program.clone(),
                    source,
                });
            }
        };

        let pid = child.id();
        info!(pid, program = %self.spec.program.display(), "Worker spawned");

        let (signal_tx, signal_rx) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_stdout_scanner(stdout, Arc::clone(&self.spec), signal_tx);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_logger(stderr);
        }
        {
            let mut inner = lock_inner(&self.inner);
            if inner.generation != generation {
                drop(inner);
                warn!(pid, "Stop requested while spawning; terminating worker");
                self.terminate(child);
                return Err(ProcessError::Crashed {
                    status: "stopped before readiness".to_string(),
                });
            }
            inner.child = Some(child);
        }

        let deadline = Instant::now() + self.spec.start_timeout;
        let outcome = match signal_rx.recv_timeout(self.spec.start_timeout) {
            Ok(StdoutSignal::Ready(line)) => Ok(line),
            Ok(StdoutSignal::Closed) | Err(RecvTimeoutError::Disconnected) => {
                Err(self.await_exit_until(deadline))
            }
            Err(RecvTimeoutError::Timeout) => Err(None),
        };

        let mut inner = lock_inner(&self.inner);
        if inner.generation != generation {
            return Err(ProcessError::Crashed {
                status: "stopped before readiness".to_string(),
            });
        }

        match outcome {
            Ok(line) => {
                inner.state = WorkerState::Ready;
                info!(pid, marker_line = %line.trim(), "Worker ready");
                spawn_exit_monitor(Arc::clone(&self.inner), generation);
                Ok(())
            }
            Err(Some(status)) => {
                inner.state = WorkerState::Crashed;
                inner.child = None;
                error!(pid, status = %status, "Worker exited before readiness");
                Err(ProcessError::Crashed { status })
            }
            Err(None) => {
                inner.state = WorkerState::Crashed;
                warn!(
                    pid,
                    timeout_ms = self.spec.start_timeout.as_millis() as u64,
                    "Worker readiness timed out"
                );
                Err(ProcessError::StartTimeout {
                    timeout: self.spec.start_timeout,
                })
            }
        }
    }

    /// Stops the worker: graceful request, grace period, then forced kill.
    /// Never fails; problems are logged.
    pub fn stop(&self) {
        let child = {
            let mut inner = lock_inner(&self.inner);
            if matches!(inner.state, WorkerState::Stopped | WorkerState::Stopping) {
                return;
            }
            inner.generation += 1;
            match inner.child.take() {
                Some(child) => {
                    inner.state = WorkerState::Stopping;
                    child
                }
                None => {
                    inner.state = WorkerState::Stopped;
                    return;
                }
            }
        };

        self.terminate(child);

        let mut inner = lock_inner(&self.inner);
        if inner.state == WorkerState::Stopping {
            inner.state = WorkerState::Stopped;
        }
    }

    fn terminate(&self, mut child: Child) {
        let pid = child.id();
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid, status = %status, "Worker already exited");
                return;
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, pid, "Failed to poll worker before stop"),
        }

        if let Err(err) = self.terminator.request_shutdown(&child) {
            warn!(
                error = %err,
                pid,
                terminator = self.terminator.name(),
                "Graceful shutdown request failed"
            );
        }

        let deadline = Instant::now() + self.spec.grace_period;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    info!(pid, status = %status, "Worker stopped");
                    return;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, pid, "Failed to poll worker during shutdown");
                    break;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(STOP_POLL_INTERVAL.min(deadline - now));
        }

        warn!(
            pid,
            grace_ms = self.spec.grace_period.as_millis() as u64,
            "Worker ignored shutdown request; forcing kill"
        );
        if let Err(err) = self.terminator.force_kill(&mut child) {
            warn!(error = %err, pid, "Forced kill failed");
        }
        if let Err(err) = child.wait() {
            warn!(error = %err, pid, "Failed to reap worker");
        }
    }

    /// After stdout closed early: the exit status if the worker died before
    /// `deadline`, `None` if it is still alive.
    fn await_exit_until(&self, deadline: Instant) -> Option<String> {
        loop {
            {
                let mut inner = lock_inner(&self.inner);
                let child = inner.child.as_mut()?;
                match child.try_wait() {
                    Ok(Some(status)) => return Some(status.to_string()),
                    Ok(None) => {}
                    Err(err) => return Some(err.to_string()),
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(STOP_POLL_INTERVAL);
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock_inner(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn spawn_stdout_scanner<R>(stdout: R, spec: Arc<WorkerSpec>, signal: Sender<StdoutSignal>)
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = BufReader::new(stdout);
        let mut buffer = Vec::new();
        let mut signalled = false;
        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buffer);
                    debug!(target: "timekeep::worker", line = %line.trim_end(), "worker stdout");
                    if !signalled && spec.is_ready_line(&line) {
                        signalled = true;
                        let _ = signal.send(StdoutSignal::Ready(line.into_owned()));
                    }
                }
                Err(err) => {
                    warn!(error = %err, "Failed to read worker stdout");
                    break;
                }
            }
        }
        if !signalled {
            let _ = signal.send(StdoutSignal::Closed);
        }
    });
}

fn spawn_stderr_logger<R>(stderr: R)
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let reader = BufReader::new(stderr);
        for line in reader.split(b'\n') {
            match line {
                Ok(bytes) => {
                    let line = String::from_utf8_lossy(&bytes);
                    if !line.trim().is_empty() {
                        warn!(target: "timekeep::worker", line = %line.trim_end(), "worker stderr");
                    }
                }
                Err(_) => break,
            }
        }
    });
}

fn spawn_exit_monitor(inner: Arc<Mutex<Inner>>, generation: u64) {
    thread::spawn(move || loop {
        thread::sleep(EXIT_POLL_INTERVAL);
        let mut guard = lock_inner(&inner);
        if guard.generation != generation || guard.state != WorkerState::Ready {
            return;
        }
        let Some(child) = guard.child.as_mut() else {
            return;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                error!(pid = child.id(), status = %status, "Worker exited unexpectedly");
                guard.child = None;
                guard.state = WorkerState::Crashed;
                return;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "Failed to poll worker liveness");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_matches_any_marker_substring() {
        let spec = WorkerSpec::new("worker").readiness_markers(["Listening on", ""]);
        assert!(spec.is_ready_line("INFO Listening on 127.0.0.1:4010\n"));
        assert!(!spec.is_ready_line("INFO booting\n"));
    }

    #[test]
    fn default_spec_uses_known_markers() {
        let spec = WorkerSpec::new("worker");
        assert!(spec.is_ready_line("Worker ready (pid 12)"));
        assert_eq!(spec.start_timeout, DEFAULT_START_TIMEOUT);
        assert_eq!(spec.grace_period, DEFAULT_GRACE_PERIOD);
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let supervisor = ProcessSupervisor::new(WorkerSpec::new("worker"));
        supervisor.stop();
        supervisor.stop();
        assert_eq!(supervisor.state(), WorkerState::Stopped);
        assert!(!supervisor.is_running());
        assert_eq!(supervisor.pid(), None);
    }

    #[test]
    fn spawn_failure_returns_to_stopped() {
        let supervisor =
            ProcessSupervisor::new(WorkerSpec::new("/nonexistent/timekeep-worker-binary"));
        let err = supervisor.start().expect_err("spawn should fail");
        assert!(matches!(err, ProcessError::Spawn { .. }));
        assert_eq!(supervisor.state(), WorkerState::Stopped);
    }
}
