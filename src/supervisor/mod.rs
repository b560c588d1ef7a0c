pub(crate) mod builder;
pub(crate) mod handle;

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use futures::future::join_all;
use tokio::sync::{broadcast, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    events::EventBus,
    log_sink::LogSink,
    process::{Pid, ProcessControl},
    supervisor::handle::ServiceHandle,
    PidStore, ServiceDefinition, ServiceName, ServiceRecord, StateStoreError, SupervisorError,
    SupervisorEvent,
};

/// Collaborators shared by every service actor.
pub(crate) struct SupervisorContext {
    pub(crate) process: Arc<dyn ProcessControl>,
    pub(crate) store: PidStore,
    pub(crate) events: EventBus,
    pub(crate) log_sink: Arc<dyn LogSink>,
    pub(crate) liveness_poll_interval: Duration,
}

/// Outcome of a best-effort batch operation such as [`ProcessSupervisor::start_all`].
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<ServiceName>,
    pub failed: Vec<(ServiceName, SupervisorError)>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    fn collect(results: Vec<(ServiceName, Result<(), SupervisorError>)>) -> Self {
        let mut report = Self::default();
        for (name, result) in results {
            match result {
                Ok(()) => report.succeeded.push(name),
                Err(err) => report.failed.push((name, err)),
            }
        }
        report.succeeded.sort();
        report.failed.sort_by(|(a, _), (b, _)| a.cmp(b));
        report
    }
}

/// What [`ProcessSupervisor::recover_from_durable_state`] did with each PID record.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Registered services whose recorded process is still alive, now `running` again.
    pub adopted: Vec<(ServiceName, Pid)>,
    /// Registered services whose record named a dead or unusable pid. The record was deleted.
    pub stale: Vec<ServiceName>,
    /// Records without a registered service. Deleted.
    pub orphaned: Vec<ServiceName>,
}

/// Keeps a set of OS processes alive.
///
/// Each registered service is driven by its own actor, so transitions of one service are
/// serialized (a `stop` issued while a `start` is pending waits for it) while unrelated
/// services proceed in parallel. Cloning is cheap and every clone controls the same services.
///
/// Build one with [`SupervisorBuilder`](crate::SupervisorBuilder).
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: Arc<SupervisorContext>,
    services: RwLock<HashMap<ServiceName, ServiceHandle>>,
    token: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Actors stop with the last handle; running processes are left alone and can be
        // recovered from their PID records.
        self.token.cancel();
    }
}

impl ProcessSupervisor {
    pub(crate) fn new(
        ctx: Arc<SupervisorContext>,
        services: HashMap<ServiceName, ServiceHandle>,
        token: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                services: RwLock::new(services),
                token,
            }),
        }
    }

    async fn handle(&self, name: &str) -> Result<ServiceHandle, SupervisorError> {
        self.inner
            .services
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| SupervisorError::unknown(name))
    }

    async fn handles(&self) -> Vec<(ServiceName, ServiceHandle)> {
        self.inner
            .services
            .read()
            .await
            .iter()
            .map(|(name, handle)| (name.clone(), handle.clone()))
            .collect()
    }

    /// Adds a `stopped` service. Never starts it.
    pub async fn register(&self, definition: ServiceDefinition) -> Result<(), SupervisorError> {
        definition.validate()?;
        let name = definition.name.clone();
        {
            let mut services = self.inner.services.write().await;
            if services.contains_key(&name) {
                return Err(SupervisorError::DuplicateService { name });
            }
            let handle = ServiceHandle::spawn(
                Arc::new(definition),
                self.inner.ctx.clone(),
                &self.inner.token,
            );
            services.insert(name.clone(), handle);
        }
        info!(service = %name, "registered service");
        self.inner
            .ctx
            .events
            .emit(SupervisorEvent::Registered { service: name });
        Ok(())
    }

    /// Force stops the service if needed, then forgets it and its PID record.
    ///
    /// If the process cannot be killed the service stays registered and the error is returned.
    pub async fn unregister(&self, name: &str) -> Result<(), SupervisorError> {
        let handle = self.handle(name).await?;
        handle.unregister().await?;
        self.inner.services.write().await.remove(name);
        self.inner
            .ctx
            .store
            .remove(name)
            .await
            .map_err(|source| SupervisorError::StateStore {
                name: name.to_string(),
                source,
            })?;
        info!(service = %name, "unregistered service");
        Ok(())
    }

    /// Starts the service. Already running services are left alone.
    pub async fn start(&self, name: &str) -> Result<(), SupervisorError> {
        self.handle(name).await?.start().await
    }

    /// Stops the service, gracefully unless `force` is set.
    ///
    /// Fails with [`SupervisorError::ShutdownTimeout`] when the process outlives the force kill;
    /// the service then stays `stopping`.
    pub async fn stop(&self, name: &str, force: bool) -> Result<(), SupervisorError> {
        self.handle(name).await?.stop(force).await
    }

    /// Graceful stop followed by a start. Counts as a restart for the restart budget.
    pub async fn restart(&self, name: &str) -> Result<(), SupervisorError> {
        self.handle(name).await?.restart().await
    }

    pub async fn status(&self, name: &str) -> Result<ServiceRecord, SupervisorError> {
        Ok(self.handle(name).await?.snapshot())
    }

    /// Snapshots of every registered service.
    pub async fn statuses(&self) -> BTreeMap<ServiceName, ServiceRecord> {
        self.inner
            .services
            .read()
            .await
            .iter()
            .map(|(name, handle)| (name.clone(), handle.snapshot()))
            .collect()
    }

    /// Feed of the service's record, updated on every transition.
    pub async fn watch(&self, name: &str) -> Result<watch::Receiver<ServiceRecord>, SupervisorError> {
        Ok(self.handle(name).await?.watch())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.ctx.events.subscribe()
    }

    pub fn pid_store(&self) -> &PidStore {
        &self.inner.ctx.store
    }

    /// Starts every registered service concurrently. One failure does not prevent the others.
    pub async fn start_all(&self) -> BatchReport {
        let handles = self.handles().await;
        self.start_each(handles).await
    }

    /// Starts the `stopped` services marked `auto_start`.
    pub async fn start_auto_services(&self) -> BatchReport {
        let handles = self
            .handles()
            .await
            .into_iter()
            .filter(|(_, handle)| {
                let record = handle.snapshot();
                record.definition.auto_start && record.status.is_stopped()
            })
            .collect();
        self.start_each(handles).await
    }

    async fn start_each(&self, handles: Vec<(ServiceName, ServiceHandle)>) -> BatchReport {
        let results = join_all(
            handles
                .into_iter()
                .map(|(name, handle)| async move { (name, handle.start().await) }),
        )
        .await;
        let report = BatchReport::collect(results);
        if !report.is_success() {
            warn!(failed = report.failed.len(), "some services failed to start");
        }
        report
    }

    /// Stops every registered service concurrently. One failure does not prevent the others.
    pub async fn stop_all(&self, force: bool) -> BatchReport {
        let handles = self.handles().await;
        let results = join_all(
            handles
                .into_iter()
                .map(|(name, handle)| async move { (name, handle.stop(force).await) }),
        )
        .await;
        let report = BatchReport::collect(results);
        if !report.is_success() {
            warn!(failed = report.failed.len(), "some services failed to stop");
        }
        report
    }

    /// Re-synchronizes with processes started by a previous supervisor instance.
    ///
    /// Meant to run once, after registering services and before anything else. Every PID
    /// record is checked against the live process table: live processes of registered services
    /// are adopted (`running`, `start_time` set to now), everything else is deleted. Only a
    /// failure to enumerate the records is an error; per-record problems are logged.
    pub async fn recover_from_durable_state(&self) -> Result<RecoveryReport, StateStoreError> {
        let ctx = &self.inner.ctx;
        let mut report = RecoveryReport::default();

        for name in ctx.store.list_recorded().await? {
            let Ok(handle) = self.handle(&name).await else {
                info!(service = %name, "removing pid record of unregistered service");
                self.discard(&name).await;
                report.orphaned.push(name);
                continue;
            };

            let pid = match ctx.store.read(&name).await {
                Ok(pid) => pid,
                Err(err) => {
                    warn!(service = %name, error = %err, "unusable pid record");
                    None
                }
            };

            let live = match pid {
                Some(pid) => ctx.process.is_alive(pid).await.then_some(pid),
                None => None,
            };
            let Some(pid) = live else {
                info!(service = %name, ?pid, "removing stale pid record");
                self.discard(&name).await;
                report.stale.push(name);
                continue;
            };

            match handle.adopt(pid).await {
                Ok(true) => report.adopted.push((name, pid)),
                Ok(false) => {
                    debug!(service = %name, pid, "service has a process of its own, keeping its record");
                }
                Err(err) => warn!(service = %name, error = %err, "failed to adopt process"),
            }
        }

        info!(
            adopted = report.adopted.len(),
            stale = report.stale.len(),
            orphaned = report.orphaned.len(),
            "recovered from durable state"
        );
        Ok(report)
    }

    async fn discard(&self, name: &str) {
        if let Err(err) = self.inner.ctx.store.remove(name).await {
            warn!(service = %name, error = %err, "failed to remove pid record");
        }
    }

    /// Stops every service, then shuts the supervisor down.
    ///
    /// Afterwards every service operation fails with [`SupervisorError::UnknownService`].
    /// Processes that could not be stopped are reported and left running.
    pub async fn shutdown(&self, force: bool) -> BatchReport {
        let report = self.stop_all(force).await;
        self.inner.services.write().await.clear();
        self.inner.token.cancel();
        info!(leaked = report.failed.len(), "supervisor shut down");
        report
    }
}
