//! Thin OS process-control seam: spawning, signalling and exit observation. No policy.

mod os;

use std::{fmt, io, process::ExitStatus, time::Duration};

use async_trait::async_trait;
use tokio::{io::AsyncRead, sync::oneshot};
use tracing::debug;

pub use os::OsProcessControl;

use crate::ServiceDefinition;

pub type Pid = u32;

/// Captured output stream of a spawned process.
pub type OutputReader = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// Cooperative termination request (SIGTERM).
    Terminate,
    /// Unconditional termination (SIGKILL).
    Kill,
}

/// How a process ended. Both fields are `None` when the status could not be observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessExit {
    pub const fn with_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub const fn with_signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub const fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    /// Exit code zero. Anything else, including death by signal, is a crash.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Exited(ProcessExit),
    TimedOut,
}

/// A freshly spawned child.
///
/// `exited` resolves exactly once, after spawn returned, when the child exits out of band.
pub struct SpawnedProcess {
    pub pid: Pid,
    pub exited: oneshot::Receiver<ProcessExit>,
    pub stdout: Option<OutputReader>,
    pub stderr: Option<OutputReader>,
}

impl SpawnedProcess {
    pub fn new(pid: Pid, exited: oneshot::Receiver<ProcessExit>) -> Self {
        Self {
            pid,
            exited,
            stdout: None,
            stderr: None,
        }
    }

    #[must_use]
    pub fn with_output(mut self, stdout: Option<OutputReader>, stderr: Option<OutputReader>) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }
}

impl fmt::Debug for SpawnedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnedProcess")
            .field("pid", &self.pid)
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish_non_exhaustive()
    }
}

/// OS process-control facade used by the supervisor.
///
/// Implementations must treat signals to processes that are already gone as successful no-ops.
#[async_trait]
pub trait ProcessControl: Send + Sync + 'static {
    /// Launches `definition.command` with its args, working directory and environment overrides.
    async fn spawn(&self, definition: &ServiceDefinition) -> io::Result<SpawnedProcess>;

    async fn signal(&self, pid: Pid, signal: SignalKind) -> io::Result<()>;

    async fn is_alive(&self, pid: Pid) -> bool;

    async fn wait_for_exit(&self, pid: Pid, timeout: Duration) -> ExitOutcome;

    /// Every descendant of `pid`, deepest first.
    async fn list_child_pids(&self, pid: Pid) -> Vec<Pid>;

    /// Signals all descendants of `pid`, then `pid` itself.
    async fn signal_tree(&self, pid: Pid, signal: SignalKind) -> io::Result<()> {
        for child in self.list_child_pids(pid).await {
            if let Err(err) = self.signal(child, signal).await {
                debug!(pid = child, error = %err, ?signal, "failed to signal descendant");
            }
        }
        self.signal(pid, signal).await
    }
}
