use std::{collections::HashMap, io, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use sysinfo::{ProcessesToUpdate, System};
use tokio::{
    process::Command,
    sync::{oneshot, watch, Mutex},
    time::{sleep, timeout_at, Instant},
};
use tracing::{debug, info, warn};

use super::{ExitOutcome, OutputReader, Pid, ProcessControl, ProcessExit, SignalKind, SpawnedProcess};
use crate::ServiceDefinition;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// [`ProcessControl`] backed by the host OS.
///
/// Children are reaped by a background task per process, which is what delivers out-of-band
/// exits. Processes this instance did not spawn (adopted after a supervisor restart) can still
/// be signalled and waited on; their exit is detected by polling and reported as
/// [`ProcessExit::unknown`].
pub struct OsProcessControl {
    exits: Arc<Mutex<HashMap<Pid, watch::Receiver<Option<ProcessExit>>>>>,
    system: Mutex<System>,
}

impl OsProcessControl {
    pub fn new() -> Self {
        Self {
            exits: Arc::new(Mutex::new(HashMap::new())),
            system: Mutex::new(System::new()),
        }
    }

    /// Exit state of a child spawned by this instance, `None` for foreign pids.
    async fn own_child_alive(&self, pid: Pid) -> Option<bool> {
        self.exits
            .lock()
            .await
            .get(&pid)
            .map(|rx| rx.borrow().is_none())
    }
}

impl Default for OsProcessControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Pids that would address a process group or wrap around are never signalled.
fn raw_pid(pid: Pid) -> io::Result<i32> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Ok(raw),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to address pid {pid}"),
        )),
    }
}

fn collect_descendants(system: &System, parent: Pid, result: &mut Vec<Pid>) {
    for (pid, process) in system.processes() {
        let child = pid.as_u32();
        if process.parent().map(|ppid| ppid.as_u32()) == Some(parent) && !result.contains(&child)
        {
            collect_descendants(system, child, result);
            result.push(child);
        }
    }
}

#[async_trait]
impl ProcessControl for OsProcessControl {
    async fn spawn(&self, definition: &ServiceDefinition) -> io::Result<SpawnedProcess> {
        let mut command = Command::new(&definition.command);
        command
            .args(&definition.args)
            .envs(&definition.environment_overrides)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &definition.working_directory {
            command.current_dir(dir);
        }
        // Own process group: terminal signals aimed at the supervisor do not reach services.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("spawned process has no pid"))?;
        let stdout = child.stdout.take().map(|out| Box::new(out) as OutputReader);
        let stderr = child.stderr.take().map(|err| Box::new(err) as OutputReader);

        let (exit_tx, exit_rx) = watch::channel(None);
        let (notify_tx, notify_rx) = oneshot::channel();
        {
            let mut exits = self.exits.lock().await;
            exits.retain(|_, rx| rx.borrow().is_none());
            exits.insert(pid, exit_rx);
        }

        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => ProcessExit::from(status),
                Err(err) => {
                    warn!(pid, error = %err, "failed to observe process exit");
                    ProcessExit::unknown()
                }
            };
            debug!(pid, %exit, "process exited");
            exit_tx.send_replace(Some(exit));
            let _ = notify_tx.send(exit);
        });

        info!(
            pid,
            command = %definition.command,
            args = ?definition.args,
            "spawned process"
        );
        Ok(SpawnedProcess::new(pid, notify_rx).with_output(stdout, stderr))
    }

    #[cfg(unix)]
    async fn signal(&self, pid: Pid, signal: SignalKind) -> io::Result<()> {
        use nix::{
            errno::Errno,
            sys::signal::{kill, Signal},
            unistd::Pid as NixPid,
        };

        let target = NixPid::from_raw(raw_pid(pid)?);
        let sig = match signal {
            SignalKind::Terminate => Signal::SIGTERM,
            SignalKind::Kill => Signal::SIGKILL,
        };
        match kill(target, sig) {
            Ok(()) => {
                debug!(pid, ?signal, "delivered signal");
                Ok(())
            }
            Err(Errno::ESRCH) => {
                debug!(pid, ?signal, "process already gone");
                Ok(())
            }
            Err(errno) => Err(io::Error::from(errno)),
        }
    }

    #[cfg(not(unix))]
    async fn signal(&self, pid: Pid, signal: SignalKind) -> io::Result<()> {
        raw_pid(pid)?;
        let target = sysinfo::Pid::from_u32(pid);
        let mut system = self.system.lock().await;
        system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        // No cooperative termination here; both kinds end the process.
        if let Some(process) = system.process(target) {
            if !process.kill() {
                return Err(io::Error::other(format!("failed to terminate pid {pid}")));
            }
            debug!(pid, ?signal, "terminated process");
        }
        Ok(())
    }

    async fn is_alive(&self, pid: Pid) -> bool {
        if let Some(alive) = self.own_child_alive(pid).await {
            return alive;
        }
        if raw_pid(pid).is_err() {
            return false;
        }

        #[cfg(unix)]
        {
            use nix::{errno::Errno, sys::signal::kill, unistd::Pid as NixPid};

            let exists = matches!(
                kill(NixPid::from_raw(pid as i32), None),
                Ok(()) | Err(Errno::EPERM)
            );
            if !exists {
                return false;
            }
        }

        // An exited process nobody reaped yet still answers signals.
        let target = sysinfo::Pid::from_u32(pid);
        let mut system = self.system.lock().await;
        system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        match system.process(target) {
            Some(process) => process.status() != sysinfo::ProcessStatus::Zombie,
            None => cfg!(unix),
        }
    }

    async fn wait_for_exit(&self, pid: Pid, timeout: Duration) -> ExitOutcome {
        let deadline = Instant::now() + timeout;
        let receiver = self.exits.lock().await.get(&pid).cloned();

        if let Some(mut rx) = receiver {
            match timeout_at(deadline, rx.wait_for(Option::is_some)).await {
                Ok(Ok(exit)) => {
                    if let Some(exit) = *exit {
                        return ExitOutcome::Exited(exit);
                    }
                }
                // Reaper is gone, fall back to polling.
                Ok(Err(_)) => {}
                Err(_) => return ExitOutcome::TimedOut,
            }
        }

        loop {
            if !self.is_alive(pid).await {
                return ExitOutcome::Exited(ProcessExit::unknown());
            }
            let now = Instant::now();
            if now >= deadline {
                return ExitOutcome::TimedOut;
            }
            sleep(EXIT_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn list_child_pids(&self, pid: Pid) -> Vec<Pid> {
        let mut system = self.system.lock().await;
        system.refresh_processes(ProcessesToUpdate::All, true);
        let mut descendants = Vec::new();
        collect_descendants(&system, pid, &mut descendants);
        descendants
    }
}
