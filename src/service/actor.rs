use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{interval, sleep, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    health::HealthMonitor,
    log_sink::{pump, OutputStream},
    process::{ExitOutcome, Pid, ProcessExit, SignalKind},
    supervisor::SupervisorContext,
    RestartDecision, RestartPolicy, ServiceDefinition, ServiceName, ServiceRecord, ServiceStatus,
    SupervisorError, SupervisorEvent,
};

pub(crate) type Reply<T> = oneshot::Sender<Result<T, SupervisorError>>;

/// Messages processed one at a time by a service's actor.
#[derive(Debug)]
pub(crate) enum ServiceCommand {
    Start(Reply<()>),
    Stop { force: bool, reply: Reply<()> },
    Restart(Reply<()>),
    /// Takes ownership of a live process found during recovery. Replies `false` if busy.
    Adopt { pid: Pid, reply: Reply<bool> },
    /// Force stops, then terminates the actor.
    Unregister(Reply<()>),
    // Internal notifications, tagged with the generation of the process they concern.
    Exited { generation: u64, exit: ProcessExit },
    Unhealthy { generation: u64, reason: String },
    RestartDue { generation: u64 },
}

/// Single writer of one service's [`ServiceRecord`].
///
/// Every transition runs inside this actor, so transitions of one service never interleave
/// while different services proceed in parallel. Background work (exit observation, health
/// checks, restart timers) reports back through the command queue; stale reports are dropped
/// by comparing generations, which change whenever the attached process changes.
pub(crate) struct ServiceActor {
    definition: Arc<ServiceDefinition>,
    policy: RestartPolicy,
    record: ServiceRecord,
    record_tx: watch::Sender<ServiceRecord>,
    generation: u64,
    health: Option<HealthMonitor>,
    process_token: Option<CancellationToken>,
    token: CancellationToken,
    ctx: Arc<SupervisorContext>,
    tx: mpsc::UnboundedSender<ServiceCommand>,
    rx: mpsc::UnboundedReceiver<ServiceCommand>,
}

impl ServiceActor {
    /// Spawns the actor for `definition` and returns its command queue and record feed.
    pub(crate) fn spawn(
        definition: Arc<ServiceDefinition>,
        ctx: Arc<SupervisorContext>,
        parent: &CancellationToken,
    ) -> (
        mpsc::UnboundedSender<ServiceCommand>,
        watch::Receiver<ServiceRecord>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let record = ServiceRecord::new(definition.clone());
        let (record_tx, record_rx) = watch::channel(record.clone());
        let actor = Self {
            policy: RestartPolicy::from(definition.as_ref()),
            definition,
            record,
            record_tx,
            generation: 0,
            health: None,
            process_token: None,
            token: parent.child_token(),
            ctx,
            tx: tx.clone(),
            rx,
        };
        tokio::spawn(actor.run());
        (tx, record_rx)
    }

    async fn run(mut self) {
        loop {
            let command = tokio::select! {
                _ = self.token.cancelled() => break,
                command = self.rx.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            if !self.handle(command).await {
                break;
            }
        }
        self.invalidate();
        self.token.cancel();
        debug!(service = %self.definition.name, "service actor finished");
    }

    /// Returns `false` once the actor should exit.
    async fn handle(&mut self, command: ServiceCommand) -> bool {
        match command {
            ServiceCommand::Start(reply) => {
                let result = self.start().await;
                let _ = reply.send(result);
            }
            ServiceCommand::Stop { force, reply } => {
                let result = self.stop(force).await;
                let _ = reply.send(result);
            }
            ServiceCommand::Restart(reply) => {
                let result = self.restart().await;
                let _ = reply.send(result);
            }
            ServiceCommand::Adopt { pid, reply } => {
                let adopted = self.adopt(pid).await;
                let _ = reply.send(Ok(adopted));
            }
            ServiceCommand::Unregister(reply) => {
                let result = self.stop(true).await;
                let done = result.is_ok();
                let _ = reply.send(result);
                if done {
                    return false;
                }
            }
            ServiceCommand::Exited { generation, exit } => {
                if generation == self.generation && self.record.status.is_running() {
                    self.on_exit(exit).await;
                }
            }
            ServiceCommand::Unhealthy { generation, reason } => {
                if generation == self.generation && self.record.status.is_running() {
                    self.on_unhealthy(reason).await;
                }
            }
            ServiceCommand::RestartDue { generation } => {
                if generation == self.generation && self.record.status == ServiceStatus::Crashed {
                    self.auto_restart().await;
                }
            }
        }
        true
    }

    fn name(&self) -> ServiceName {
        self.definition.name.clone()
    }

    fn publish(&self) {
        self.record_tx.send_replace(self.record.clone());
    }

    fn transition(&mut self, status: ServiceStatus) {
        debug!(service = %self.definition.name, from = %self.record.status, to = %status, "transition");
        self.record.status = status;
        self.publish();
    }

    fn emit(&self, event: SupervisorEvent) {
        self.ctx.events.emit(event);
    }

    /// Detaches the current process: disarms health checks, stops its observers and makes any
    /// report already in flight stale.
    fn invalidate(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.health = None;
        if let Some(token) = self.process_token.take() {
            token.cancel();
        }
    }

    fn attach(&mut self, pid: Pid) -> (u64, CancellationToken) {
        self.invalidate();
        self.record.pid = Some(pid);
        self.record.start_time = Some(Utc::now());
        let token = self.token.child_token();
        self.process_token = Some(token.clone());
        (self.generation, token)
    }

    fn arm_health(&mut self, generation: u64) {
        let Some(check) = self.definition.health_check.clone() else {
            return;
        };
        let tx = self.tx.clone();
        self.health = Some(HealthMonitor::arm(
            &self.definition.name,
            check,
            self.definition.health_check_interval,
            self.definition.health_check_timeout,
            &self.token,
            move |err| {
                let _ = tx.send(ServiceCommand::Unhealthy {
                    generation,
                    reason: err.to_string(),
                });
            },
        ));
    }

    async fn persist_pid(&self, pid: Pid) {
        if let Err(err) = self.ctx.store.write(&self.definition.name, pid).await {
            warn!(service = %self.definition.name, pid, error = %err, "failed to persist pid");
            self.emit(SupervisorEvent::Error {
                service: self.name(),
                message: format!("failed to persist pid {pid}: {err}"),
            });
        }
    }

    async fn forget_pid(&self) {
        if let Err(err) = self.ctx.store.remove(&self.definition.name).await {
            warn!(service = %self.definition.name, error = %err, "failed to remove pid record");
            self.emit(SupervisorEvent::Error {
                service: self.name(),
                message: format!("failed to remove pid record: {err}"),
            });
        }
    }

    async fn start(&mut self) -> Result<(), SupervisorError> {
        match self.record.status {
            ServiceStatus::Running => {
                debug!(service = %self.definition.name, "already running");
                return Ok(());
            }
            ServiceStatus::Starting | ServiceStatus::Stopping => {
                return Err(SupervisorError::InvalidState {
                    name: self.name(),
                    operation: "start",
                    status: self.record.status,
                });
            }
            // Supersedes the pending automatic restart.
            ServiceStatus::Crashed => self.invalidate(),
            ServiceStatus::Stopped | ServiceStatus::Failed => {}
        }
        self.launch().await
    }

    async fn launch(&mut self) -> Result<(), SupervisorError> {
        self.transition(ServiceStatus::Starting);
        self.emit(SupervisorEvent::Starting {
            service: self.name(),
        });

        let spawned = match self.ctx.process.spawn(&self.definition).await {
            Ok(spawned) => spawned,
            Err(source) => {
                error!(service = %self.definition.name, error = %source, "failed to spawn service");
                let message = format!("failed to spawn: {source}");
                self.record.pid = None;
                self.record.last_error = Some(message.clone());
                self.transition(ServiceStatus::Failed);
                self.emit(SupervisorEvent::Error {
                    service: self.name(),
                    message,
                });
                return Err(SupervisorError::Spawn {
                    name: self.name(),
                    source,
                });
            }
        };

        let pid = spawned.pid;
        let (generation, process_token) = self.attach(pid);

        let tx = self.tx.clone();
        let exited = spawned.exited;
        tokio::spawn(async move {
            tokio::select! {
                _ = process_token.cancelled() => {}
                exit = exited => {
                    let exit = exit.unwrap_or(ProcessExit::unknown());
                    let _ = tx.send(ServiceCommand::Exited { generation, exit });
                }
            }
        });

        for (stream, reader) in [
            (OutputStream::Stdout, spawned.stdout),
            (OutputStream::Stderr, spawned.stderr),
        ] {
            if let Some(reader) = reader {
                pump(
                    self.name(),
                    stream,
                    reader,
                    self.ctx.log_sink.clone(),
                    self.token.clone(),
                );
            }
        }

        self.persist_pid(pid).await;
        self.arm_health(generation);
        self.transition(ServiceStatus::Running);
        info!(service = %self.definition.name, pid, "service started");
        self.emit(SupervisorEvent::Started {
            service: self.name(),
            pid,
        });
        Ok(())
    }

    async fn adopt(&mut self, pid: Pid) -> bool {
        if !self.record.status.is_settled() {
            return false;
        }
        let (generation, process_token) = self.attach(pid);

        // Not our child: its exit can only be noticed by polling.
        let process = self.ctx.process.clone();
        let period = self
            .ctx
            .liveness_poll_interval
            .max(Duration::from_millis(1));
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let mut ticks = interval(period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = process_token.cancelled() => return,
                    _ = ticks.tick() => {}
                }
                if !process.is_alive(pid).await {
                    let _ = tx.send(ServiceCommand::Exited {
                        generation,
                        exit: ProcessExit::unknown(),
                    });
                    return;
                }
            }
        });

        self.arm_health(generation);
        self.transition(ServiceStatus::Running);
        info!(service = %self.definition.name, pid, "adopted running service");
        self.emit(SupervisorEvent::Started {
            service: self.name(),
            pid,
        });
        true
    }

    async fn stop(&mut self, force: bool) -> Result<(), SupervisorError> {
        match self.record.status {
            ServiceStatus::Stopped | ServiceStatus::Failed => Ok(()),
            ServiceStatus::Crashed => {
                self.invalidate();
                info!(service = %self.definition.name, "cancelled pending restart");
                self.transition(ServiceStatus::Stopped);
                self.emit(SupervisorEvent::Stopped {
                    service: self.name(),
                    exit: None,
                });
                Ok(())
            }
            ServiceStatus::Starting | ServiceStatus::Running | ServiceStatus::Stopping => {
                let Some(pid) = self.record.pid else {
                    self.invalidate();
                    self.transition(ServiceStatus::Stopped);
                    return Ok(());
                };
                let exit = self.terminate(pid, force).await?;
                self.record.pid = None;
                self.forget_pid().await;
                info!(service = %self.definition.name, %exit, "service stopped");
                self.transition(ServiceStatus::Stopped);
                self.emit(SupervisorEvent::Stopped {
                    service: self.name(),
                    exit: Some(exit),
                });
                Ok(())
            }
        }
    }

    async fn restart(&mut self) -> Result<(), SupervisorError> {
        self.stop(false).await?;
        self.record.restart_count = self.record.restart_count.saturating_add(1);
        self.record.last_restart_time = Some(Utc::now());
        info!(
            service = %self.definition.name,
            restart_count = self.record.restart_count,
            "restarting service on request"
        );
        self.launch().await
    }

    /// Graceful then forced termination of `pid`. Leaves the record in `stopping`; the caller
    /// settles it on success.
    async fn terminate(&mut self, pid: Pid, force: bool) -> Result<ProcessExit, SupervisorError> {
        self.invalidate();
        self.transition(ServiceStatus::Stopping);
        self.emit(SupervisorEvent::Stopping {
            service: self.name(),
            pid,
        });
        let process = self.ctx.process.clone();

        if !force {
            match process.signal(pid, SignalKind::Terminate).await {
                Ok(()) => {
                    let timeout = self.definition.graceful_shutdown_timeout;
                    match process.wait_for_exit(pid, timeout).await {
                        ExitOutcome::Exited(exit) => return Ok(exit),
                        ExitOutcome::TimedOut => warn!(
                            service = %self.definition.name,
                            pid,
                            ?timeout,
                            "graceful shutdown timed out, force killing"
                        ),
                    }
                }
                Err(err) => warn!(
                    service = %self.definition.name,
                    pid,
                    error = %err,
                    "graceful shutdown request failed, force killing"
                ),
            }
        }

        if let Err(source) = process.signal_tree(pid, SignalKind::Kill).await {
            let err = SupervisorError::Signal {
                name: self.name(),
                pid,
                source,
            };
            self.fail_shutdown(&err);
            return Err(err);
        }

        let timeout = self.definition.force_kill_timeout;
        match process.wait_for_exit(pid, timeout).await {
            ExitOutcome::Exited(exit) => Ok(exit),
            ExitOutcome::TimedOut => {
                let err = SupervisorError::ShutdownTimeout {
                    name: self.name(),
                    pid,
                    timeout,
                };
                self.fail_shutdown(&err);
                Err(err)
            }
        }
    }

    fn fail_shutdown(&mut self, err: &SupervisorError) {
        error!(service = %self.definition.name, error = %err, "process left running");
        self.record.last_error = Some(err.to_string());
        self.publish();
        self.emit(SupervisorEvent::Error {
            service: self.name(),
            message: err.to_string(),
        });
    }

    async fn on_exit(&mut self, exit: ProcessExit) {
        self.invalidate();
        self.record.pid = None;
        self.forget_pid().await;

        if exit.success() {
            info!(service = %self.definition.name, %exit, "service exited");
            self.transition(ServiceStatus::Stopped);
            self.emit(SupervisorEvent::Stopped {
                service: self.name(),
                exit: Some(exit),
            });
            return;
        }

        warn!(
            service = %self.definition.name,
            %exit,
            restart_count = self.record.restart_count,
            "service crashed"
        );
        self.crashed(exit, format!("process exited with {exit}"));
    }

    async fn on_unhealthy(&mut self, reason: String) {
        let Some(pid) = self.record.pid else {
            return;
        };
        self.emit(SupervisorEvent::Unhealthy {
            service: self.name(),
            reason: reason.clone(),
        });
        match self.terminate(pid, true).await {
            Ok(exit) => {
                self.record.pid = None;
                self.forget_pid().await;
                self.crashed(exit, format!("unhealthy: {reason}"));
            }
            // Already reported; the service stays `stopping` without a restart.
            Err(err) => debug!(service = %self.definition.name, error = %err, "unhealthy service survived"),
        }
    }

    /// Enters `crashed` and applies the restart policy.
    fn crashed(&mut self, exit: ProcessExit, reason: String) {
        self.record.last_error = Some(reason);
        self.transition(ServiceStatus::Crashed);
        self.emit(SupervisorEvent::Crashed {
            service: self.name(),
            exit,
            restart_count: self.record.restart_count,
        });

        match self.policy.decide(self.record.restart_count) {
            RestartDecision::Restart { delay } => {
                let attempt = self.record.restart_count.saturating_add(1);
                info!(service = %self.definition.name, attempt, ?delay, "restart scheduled");
                self.emit(SupervisorEvent::AutoRestartScheduled {
                    service: self.name(),
                    attempt,
                    delay,
                });
                let generation = self.generation;
                let tx = self.tx.clone();
                let token = self.token.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = sleep(delay) => {
                            let _ = tx.send(ServiceCommand::RestartDue { generation });
                        }
                    }
                });
            }
            RestartDecision::GiveUp => {
                warn!(
                    service = %self.definition.name,
                    restart_count = self.record.restart_count,
                    "not restarting service"
                );
                self.transition(ServiceStatus::Stopped);
                self.emit(SupervisorEvent::Stopped {
                    service: self.name(),
                    exit: Some(exit),
                });
            }
        }
    }

    async fn auto_restart(&mut self) {
        self.record.restart_count = self.record.restart_count.saturating_add(1);
        self.record.last_restart_time = Some(Utc::now());
        info!(
            service = %self.definition.name,
            attempt = self.record.restart_count,
            "restarting crashed service"
        );
        if let Err(err) = self.launch().await {
            debug!(service = %self.definition.name, error = %err, "automatic restart failed");
        }
    }
}
