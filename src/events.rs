use std::time::Duration;

use tokio::sync::broadcast;
use tracing::trace;

use crate::{process::ProcessExit, ServiceName};

/// Lifecycle notifications published by the supervisor.
///
/// Subscribers receive them through [`ProcessSupervisor::subscribe`](crate::ProcessSupervisor::subscribe).
/// Publishing never blocks the supervisor: a subscriber that falls behind misses events and
/// sees `RecvError::Lagged`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Registered {
        service: ServiceName,
    },
    Starting {
        service: ServiceName,
    },
    Started {
        service: ServiceName,
        pid: u32,
    },
    Stopping {
        service: ServiceName,
        pid: u32,
    },
    /// `exit` is `None` when the service was stopped without a process (pending restart cancelled).
    Stopped {
        service: ServiceName,
        exit: Option<ProcessExit>,
    },
    Crashed {
        service: ServiceName,
        exit: ProcessExit,
        restart_count: u32,
    },
    Unhealthy {
        service: ServiceName,
        reason: String,
    },
    AutoRestartScheduled {
        service: ServiceName,
        attempt: u32,
        delay: Duration,
    },
    Error {
        service: ServiceName,
        message: String,
    },
}

impl SupervisorEvent {
    pub fn service(&self) -> &str {
        match self {
            Self::Registered { service }
            | Self::Starting { service }
            | Self::Started { service, .. }
            | Self::Stopping { service, .. }
            | Self::Stopped { service, .. }
            | Self::Crashed { service, .. }
            | Self::Unhealthy { service, .. }
            | Self::AutoRestartScheduled { service, .. }
            | Self::Error { service, .. } => service,
        }
    }

    /// Stable event name, e.g. `"autoRestartScheduled"`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "registered",
            Self::Starting { .. } => "starting",
            Self::Started { .. } => "started",
            Self::Stopping { .. } => "stopping",
            Self::Stopped { .. } => "stopped",
            Self::Crashed { .. } => "crashed",
            Self::Unhealthy { .. } => "unhealthy",
            Self::AutoRestartScheduled { .. } => "autoRestartScheduled",
            Self::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<SupervisorEvent>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub(crate) fn emit(&self, event: SupervisorEvent) {
        trace!(service = %event.service(), kind = event.kind(), "publishing event");
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.tx.subscribe()
    }
}
