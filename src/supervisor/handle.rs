use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    process::Pid,
    service::actor::{Reply, ServiceActor, ServiceCommand},
    supervisor::SupervisorContext,
    ServiceDefinition, ServiceName, ServiceRecord, SupervisorError,
};

/// Registry entry: the command queue of one service actor plus its record feed.
#[derive(Debug, Clone)]
pub(crate) struct ServiceHandle {
    name: ServiceName,
    tx: mpsc::UnboundedSender<ServiceCommand>,
    record: watch::Receiver<ServiceRecord>,
}

impl ServiceHandle {
    pub(crate) fn spawn(
        definition: Arc<ServiceDefinition>,
        ctx: Arc<SupervisorContext>,
        parent: &CancellationToken,
    ) -> Self {
        let name = definition.name.clone();
        let (tx, record) = ServiceActor::spawn(definition, ctx, parent);
        Self { name, tx, record }
    }

    /// Sends a command and waits for the actor's answer. A gone actor means the service was
    /// unregistered in the meantime.
    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> ServiceCommand,
    ) -> Result<T, SupervisorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(command(reply_tx))
            .map_err(|_| SupervisorError::unknown(&self.name))?;
        reply_rx
            .await
            .map_err(|_| SupervisorError::unknown(&self.name))?
    }

    pub(crate) async fn start(&self) -> Result<(), SupervisorError> {
        self.request(ServiceCommand::Start).await
    }

    pub(crate) async fn stop(&self, force: bool) -> Result<(), SupervisorError> {
        self.request(|reply| ServiceCommand::Stop { force, reply })
            .await
    }

    pub(crate) async fn restart(&self) -> Result<(), SupervisorError> {
        self.request(ServiceCommand::Restart).await
    }

    pub(crate) async fn adopt(&self, pid: Pid) -> Result<bool, SupervisorError> {
        self.request(|reply| ServiceCommand::Adopt { pid, reply })
            .await
    }

    pub(crate) async fn unregister(&self) -> Result<(), SupervisorError> {
        self.request(ServiceCommand::Unregister).await
    }

    pub(crate) fn snapshot(&self) -> ServiceRecord {
        self.record.borrow().clone()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<ServiceRecord> {
        self.record.clone()
    }
}
