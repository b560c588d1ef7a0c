#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    io,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::{broadcast, oneshot, watch};

use service_supervisor::{
    ExitOutcome, LogLine, LogSink, Pid, ProcessControl, ProcessExit, ProcessSupervisor,
    ServiceDefinition, ServiceName, ServiceRecord, ServiceStatus, SignalKind, SpawnedProcess,
    SupervisorBuilder, SupervisorEvent,
};

/// Scripted in-memory process table.
///
/// Processes live until a test calls [`MockProcessControl::exit`] or a signal ends them.
/// `Terminate` ends a process with signal 15 and `Kill` with signal 9 unless the service was
/// told to ignore them. Pids registered with `add_external` are alive foreign processes, as
/// left behind by a previous supervisor.
#[derive(Clone, Default)]
pub struct MockProcessControl {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    next_pid: Pid,
    processes: HashMap<Pid, MockProcess>,
    spawned: Vec<(ServiceName, Pid)>,
    signals: Vec<(Pid, SignalKind)>,
    fail_spawn: HashSet<ServiceName>,
    exit_on_spawn: HashMap<ServiceName, i32>,
    ignore_term: HashSet<ServiceName>,
    unkillable: HashSet<ServiceName>,
    external: HashSet<Pid>,
}

struct MockProcess {
    service: ServiceName,
    exit: watch::Sender<Option<ProcessExit>>,
    notify: Option<oneshot::Sender<ProcessExit>>,
}

impl MockState {
    fn finish(&mut self, pid: Pid, exit: ProcessExit) {
        if let Some(process) = self.processes.get_mut(&pid) {
            if process.exit.borrow().is_some() {
                return;
            }
            process.exit.send_replace(Some(exit));
            if let Some(notify) = process.notify.take() {
                let _ = notify.send(exit);
            }
        }
    }
}

impl MockProcessControl {
    pub fn new() -> Self {
        let mock = Self::default();
        mock.state.lock().unwrap().next_pid = 10_000;
        mock
    }

    pub fn fail_spawn(&self, service: &str) {
        self.state.lock().unwrap().fail_spawn.insert(service.into());
    }

    /// Every process of `service` exits with `code` right after being spawned.
    pub fn exit_on_spawn(&self, service: &str, code: i32) {
        self.state
            .lock()
            .unwrap()
            .exit_on_spawn
            .insert(service.into(), code);
    }

    pub fn ignore_term(&self, service: &str) {
        self.state.lock().unwrap().ignore_term.insert(service.into());
    }

    /// Processes of `service` survive every signal.
    pub fn unkillable(&self, service: &str) {
        self.state.lock().unwrap().unkillable.insert(service.into());
    }

    pub fn add_external(&self, pid: Pid) {
        self.state.lock().unwrap().external.insert(pid);
    }

    pub fn remove_external(&self, pid: Pid) {
        self.state.lock().unwrap().external.remove(&pid);
    }

    /// Ends a spawned process out of band.
    pub fn exit(&self, pid: Pid, exit: ProcessExit) {
        self.state.lock().unwrap().finish(pid, exit);
    }

    pub fn spawn_count(&self, service: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .spawned
            .iter()
            .filter(|(name, _)| name == service)
            .count()
    }

    pub fn spawned_pids(&self, service: &str) -> Vec<Pid> {
        self.state
            .lock()
            .unwrap()
            .spawned
            .iter()
            .filter(|(name, _)| name == service)
            .map(|(_, pid)| *pid)
            .collect()
    }

    pub fn signals_to(&self, pid: Pid) -> Vec<SignalKind> {
        self.state
            .lock()
            .unwrap()
            .signals
            .iter()
            .filter(|(target, _)| *target == pid)
            .map(|(_, signal)| *signal)
            .collect()
    }
}

#[async_trait]
impl ProcessControl for MockProcessControl {
    async fn spawn(&self, definition: &ServiceDefinition) -> io::Result<SpawnedProcess> {
        let mut state = self.state.lock().unwrap();
        if state.fail_spawn.contains(&definition.name) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{}: command not found", definition.command),
            ));
        }

        let pid = state.next_pid;
        state.next_pid += 1;
        let (exit, _) = watch::channel(None);
        let (notify, exited) = oneshot::channel();
        state.processes.insert(
            pid,
            MockProcess {
                service: definition.name.clone(),
                exit,
                notify: Some(notify),
            },
        );
        state.spawned.push((definition.name.clone(), pid));
        if let Some(code) = state.exit_on_spawn.get(&definition.name).copied() {
            state.finish(pid, ProcessExit::with_code(code));
        }
        Ok(SpawnedProcess::new(pid, exited))
    }

    async fn signal(&self, pid: Pid, signal: SignalKind) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.signals.push((pid, signal));
        if state.external.remove(&pid) {
            return Ok(());
        }
        let Some(service) = state.processes.get(&pid).map(|p| p.service.clone()) else {
            return Ok(());
        };
        if state.unkillable.contains(&service) {
            return Ok(());
        }
        match signal {
            SignalKind::Terminate if state.ignore_term.contains(&service) => {}
            SignalKind::Terminate => state.finish(pid, ProcessExit::with_signal(15)),
            SignalKind::Kill => state.finish(pid, ProcessExit::with_signal(9)),
        }
        Ok(())
    }

    async fn is_alive(&self, pid: Pid) -> bool {
        let state = self.state.lock().unwrap();
        match state.processes.get(&pid) {
            Some(process) => process.exit.borrow().is_none(),
            None => state.external.contains(&pid),
        }
    }

    async fn wait_for_exit(&self, pid: Pid, timeout: Duration) -> ExitOutcome {
        let receiver = self
            .state
            .lock()
            .unwrap()
            .processes
            .get(&pid)
            .map(|process| process.exit.subscribe());

        if let Some(mut rx) = receiver {
            return match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
                Ok(Ok(exit)) => ExitOutcome::Exited((*exit).unwrap_or(ProcessExit::unknown())),
                _ => ExitOutcome::TimedOut,
            };
        }

        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if !self.is_alive(pid).await {
                return ExitOutcome::Exited(ProcessExit::unknown());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        ExitOutcome::TimedOut
    }

    async fn list_child_pids(&self, _pid: Pid) -> Vec<Pid> {
        Vec::new()
    }
}

/// Collects captured output lines.
#[derive(Clone, Default)]
pub struct RecordingSink {
    lines: Arc<Mutex<Vec<LogLine>>>,
}

impl RecordingSink {
    pub fn lines(&self) -> Vec<LogLine> {
        self.lines.lock().unwrap().clone()
    }
}

impl LogSink for RecordingSink {
    fn write(&self, line: LogLine) {
        self.lines.lock().unwrap().push(line);
    }
}

pub fn supervisor_with(mock: &MockProcessControl, state_dir: &Path) -> ProcessSupervisor {
    SupervisorBuilder::new(state_dir)
        .with_process_control(mock.clone())
        .with_liveness_poll_interval(Duration::from_millis(50))
        .build()
        .unwrap()
}

/// A definition with short delays, for use with [`MockProcessControl`].
pub fn service(name: &str) -> ServiceDefinition {
    ServiceDefinition::new(name, "mock-binary")
        .with_restart_delay(Duration::from_millis(100))
        .with_graceful_shutdown_timeout(Duration::from_secs(1))
        .with_force_kill_timeout(Duration::from_millis(500))
}

/// Waits until the record of `name` satisfies `predicate` and returns it.
pub async fn wait_for(
    supervisor: &ProcessSupervisor,
    name: &str,
    predicate: impl FnMut(&ServiceRecord) -> bool,
) -> ServiceRecord {
    let mut rx = supervisor.watch(name).await.unwrap();
    let record = tokio::time::timeout(Duration::from_secs(60), rx.wait_for(predicate))
        .await
        .expect("timed out waiting for service record")
        .expect("service actor went away")
        .clone();
    record
}

pub async fn wait_for_status(
    supervisor: &ProcessSupervisor,
    name: &str,
    status: ServiceStatus,
) -> ServiceRecord {
    wait_for(supervisor, name, |record| record.status == status).await
}

/// Events received so far, without waiting.
pub fn drain(rx: &mut broadcast::Receiver<SupervisorEvent>) -> Vec<SupervisorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Kinds of the events received so far, for ordering assertions.
pub fn kinds(events: &[SupervisorEvent]) -> Vec<&'static str> {
    events.iter().map(SupervisorEvent::kind).collect()
}

pub fn read_pid_file(state_dir: &Path, name: &str) -> Option<String> {
    std::fs::read_to_string(state_dir.join(format!("{name}.pid"))).ok()
}
