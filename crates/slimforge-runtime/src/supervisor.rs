//! Polling supervisor for long-running external commands.
//!
//! The supervisor never blocks on `wait()`: it polls `try_wait` so it can
//! emit heartbeats, honour a wall-clock timeout, and react to a
//! cancellation token between polls. Timeouts and cancellation are
//! reported as an [`Outcome`], not as errors.

use crate::cancel::CancellationToken;
use crate::command::CommandSpec;
use crate::RuntimeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::process::{Child, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const GRACE_POLL: Duration = Duration::from_millis(25);
const OUTPUT_DRAIN: Duration = Duration::from_secs(2);
const DIAGNOSTIC_LIMIT: usize = 400;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorPolicy {
    pub timeout: Option<Duration>,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub grace_period: Duration,
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self {
            timeout: None,
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(30),
            grace_period: Duration::from_secs(5),
        }
    }
}

/// How a supervised process ended. Assigned exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Completed { code: i32 },
    TimedOut,
    Cancelled,
    StillRunning,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        matches!(self, Outcome::Completed { code: 0 })
    }

    /// `TimedOut` and `Cancelled` both mean "this step was skipped".
    pub fn is_skip(self) -> bool {
        matches!(self, Outcome::TimedOut | Outcome::Cancelled)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Completed { code } => write!(f, "exited with code {code}"),
            Outcome::TimedOut => f.write_str("timed out"),
            Outcome::Cancelled => f.write_str("cancelled"),
            Outcome::StillRunning => f.write_str("still running"),
        }
    }
}

/// A process under supervision.
#[derive(Debug, Clone)]
pub struct SupervisedProcess {
    pub command: CommandSpec,
    pub started: Instant,
    pub policy: SupervisorPolicy,
    outcome: Outcome,
}

impl SupervisedProcess {
    pub fn new(command: CommandSpec, policy: SupervisorPolicy) -> Self {
        Self {
            command,
            started: Instant::now(),
            policy,
            outcome: Outcome::StillRunning,
        }
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Record the terminal outcome. Returns `false` if one was already set.
    pub fn settle(&mut self, outcome: Outcome) -> bool {
        if self.outcome != Outcome::StillRunning || outcome == Outcome::StillRunning {
            return false;
        }
        self.outcome = outcome;
        true
    }
}

/// Result of a supervised run: outcome plus captured output.
#[derive(Debug, Clone)]
pub struct SupervisedRun {
    pub command: CommandSpec,
    pub pid: u32,
    pub outcome: Outcome,
    pub elapsed: Duration,
    pub stdout: String,
    pub stderr: String,
}

impl SupervisedRun {
    /// Short human-readable failure context: stderr if present, else stdout.
    pub fn diagnostic(&self) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let text = source
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if text.chars().count() > DIAGNOSTIC_LIMIT {
            let cut: String = text.chars().take(DIAGNOSTIC_LIMIT).collect();
            format!("{cut}...")
        } else {
            text
        }
    }

    /// Require exit code 0.
    pub fn into_success(self) -> Result<Self, RuntimeError> {
        self.into_success_with(|code| code == 0)
    }

    /// Require an exit code accepted by `ok`. Skipped runs are errors here.
    pub fn into_success_with(self, ok: impl Fn(i32) -> bool) -> Result<Self, RuntimeError> {
        match self.outcome {
            Outcome::Completed { code } if ok(code) => Ok(self),
            Outcome::Completed { code } => Err(RuntimeError::CommandFailed {
                program: self.command.program().to_owned(),
                code,
                diagnostic: self.diagnostic(),
            }),
            outcome => Err(RuntimeError::CommandInterrupted {
                program: self.command.program().to_owned(),
                outcome,
            }),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessSupervisor {
    policy: SupervisorPolicy,
}

impl ProcessSupervisor {
    pub fn new(policy: SupervisorPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SupervisorPolicy {
        &self.policy
    }

    /// Same polling behaviour with a different wall-clock limit.
    #[must_use]
    pub fn with_timeout(&self, timeout: Option<Duration>) -> Self {
        Self {
            policy: SupervisorPolicy {
                timeout,
                ..self.policy.clone()
            },
        }
    }

    /// Spawn `spec` and supervise it until it exits, times out, or `cancel` fires.
    ///
    /// Only a failure to start the process (or to query it) is an error.
    pub fn run(
        &self,
        spec: &CommandSpec,
        cancel: &dyn CancellationToken,
    ) -> Result<SupervisedRun, RuntimeError> {
        let mut cmd = spec.to_command()?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| RuntimeError::SpawnFailed {
            program: spec.program().to_owned(),
            source,
        })?;
        let pid = child.id();
        debug!("spawned {spec} (pid {pid})");

        let (tx, rx) = mpsc::channel();
        let mut output = OutputBuffer::default();
        output.open += spawn_reader(child.stdout.take(), Stream::Stdout, tx.clone());
        output.open += spawn_reader(child.stderr.take(), Stream::Stderr, tx);

        let mut process = SupervisedProcess::new(spec.clone(), self.policy.clone());
        if let Err(e) = self.supervise(&mut child, &mut process, cancel, &rx, &mut output) {
            let _ = force_kill(&mut child);
            return Err(e.into());
        }
        output.drain(&rx, OUTPUT_DRAIN);

        let elapsed = process.elapsed();
        let outcome = process.outcome();
        match outcome {
            Outcome::Completed { code } => debug!("{} exited with code {code} after {}", spec.program(), format_duration(elapsed)),
            other => info!("{} {other} after {}", spec.program(), format_duration(elapsed)),
        }

        Ok(SupervisedRun {
            command: spec.clone(),
            pid,
            outcome,
            elapsed,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn supervise(
        &self,
        child: &mut Child,
        process: &mut SupervisedProcess,
        cancel: &dyn CancellationToken,
        rx: &Receiver<Chunk>,
        output: &mut OutputBuffer,
    ) -> std::io::Result<()> {
        let policy = &self.policy;
        let program = process.command.program().to_owned();
        let mut next_heartbeat = policy.heartbeat_interval;

        loop {
            output.collect(rx);

            if let Some(status) = child.try_wait()? {
                process.settle(Outcome::Completed {
                    code: exit_code(status),
                });
                return Ok(());
            }

            let elapsed = process.elapsed();

            if cancel.is_cancelled() {
                info!("cancellation requested; stopping {program} (pid {})", child.id());
                terminate(child, policy.grace_period)?;
                process.settle(Outcome::Cancelled);
                return Ok(());
            }

            if let Some(limit) = policy.timeout {
                if elapsed >= limit {
                    warn!(
                        "{program} exceeded its {} limit; killing pid {}",
                        format_duration(limit),
                        child.id()
                    );
                    force_kill(child)?;
                    process.settle(Outcome::TimedOut);
                    return Ok(());
                }
            }

            if elapsed >= next_heartbeat {
                info!("{}", heartbeat_message(&program, elapsed, policy.timeout));
                next_heartbeat += policy.heartbeat_interval;
            }

            let mut nap = policy.poll_interval;
            if let Some(limit) = policy.timeout {
                nap = nap.min(limit.saturating_sub(elapsed));
            }
            thread::sleep(nap.max(Duration::from_millis(1)));
        }
    }
}

/// Heartbeat text: elapsed time and, when bounded, time remaining.
pub fn heartbeat_message(program: &str, elapsed: Duration, timeout: Option<Duration>) -> String {
    match timeout {
        Some(limit) => format!(
            "still waiting on {program}: {} elapsed, {} remaining",
            format_duration(elapsed),
            format_duration(limit.saturating_sub(elapsed))
        ),
        None => format!(
            "still waiting on {program}: {} elapsed, no time limit",
            format_duration(elapsed)
        ),
    }
}

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h{:02}m{:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else if secs > 0 {
        format!("{secs}s")
    } else {
        format!("{}ms", d.as_millis())
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Ask the child to exit, wait up to `grace`, then kill it.
fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<()> {
    request_terminate(child);
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        thread::sleep(GRACE_POLL);
    }
    warn!(
        "pid {} still running after {} grace period, killing",
        child.id(),
        format_duration(grace)
    );
    force_kill(child)
}

#[cfg(unix)]
fn request_terminate(child: &mut Child) {
    let Ok(pid) = i32::try_from(child.id()) else {
        let _ = child.kill();
        return;
    };
    debug!("sending SIGTERM to pid {pid}");
    // SAFETY: kill() with a valid pid and signal is safe; pid validated via i32::try_from above.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(pid, libc::SIGTERM) };
    if ret != 0 {
        let errno = std::io::Error::last_os_error();
        if errno.raw_os_error() != Some(libc::ESRCH) {
            warn!("failed to send SIGTERM to pid {pid}: {errno}");
        }
    }
}

#[cfg(not(unix))]
fn request_terminate(child: &mut Child) {
    let _ = child.kill();
}

/// Kill and reap. An already-exited child is not an error.
fn force_kill(child: &mut Child) -> std::io::Result<()> {
    if child.try_wait()?.is_none() {
        if let Err(e) = child.kill() {
            if e.kind() != std::io::ErrorKind::InvalidInput {
                return Err(e);
            }
        }
    }
    child.wait()?;
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

enum Chunk {
    Data(Stream, Vec<u8>),
    Eof,
}

#[derive(Default)]
struct OutputBuffer {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    open: usize,
}

impl OutputBuffer {
    fn push(&mut self, chunk: Chunk) {
        match chunk {
            Chunk::Data(Stream::Stdout, bytes) => self.stdout.extend_from_slice(&bytes),
            Chunk::Data(Stream::Stderr, bytes) => self.stderr.extend_from_slice(&bytes),
            Chunk::Eof => self.open = self.open.saturating_sub(1),
        }
    }

    fn collect(&mut self, rx: &Receiver<Chunk>) {
        loop {
            match rx.try_recv() {
                Ok(chunk) => self.push(chunk),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return,
            }
        }
    }

    /// Wait for both pipes to close, bounded by `limit`. A grandchild that
    /// inherited the pipes can keep them open after the child is gone.
    fn drain(&mut self, rx: &Receiver<Chunk>, limit: Duration) {
        let deadline = Instant::now() + limit;
        while self.open > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(chunk) => self.push(chunk),
                Err(_) => {
                    debug!("output pipes still open after {}, giving up", format_duration(limit));
                    return;
                }
            }
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    source: Option<R>,
    stream: Stream,
    tx: Sender<Chunk>,
) -> usize {
    let Some(mut source) = source else {
        return 0;
    };
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match source.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(Chunk::Data(stream, buf[..n].to_vec())).is_err() {
                        return;
                    }
                }
            }
        }
        let _ = tx.send(Chunk::Eof);
    });
    1
}
