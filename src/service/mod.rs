pub(crate) mod actor;

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};

use crate::{process::Pid, ServiceDefinition};

/// Lifecycle state of a registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// Exited unexpectedly or failed its health check; a restart may be pending.
    Crashed,
    /// Could not be spawned.
    Failed,
}

impl ServiceStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Whether no process belongs to the service and none is about to be spawned.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Crashed => write!(f, "crashed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Point-in-time copy of a service's state.
///
/// Returned by [`ProcessSupervisor::status`](crate::ProcessSupervisor::status); changing it has no
/// effect on the supervisor.
#[derive(Debug, Clone)]
pub struct ServiceRecord {
    pub definition: Arc<ServiceDefinition>,
    pub status: ServiceStatus,
    pub pid: Option<Pid>,
    /// Approximate for processes adopted during recovery.
    pub start_time: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub last_restart_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ServiceRecord {
    pub(crate) fn new(definition: Arc<ServiceDefinition>) -> Self {
        Self {
            definition,
            status: ServiceStatus::Stopped,
            pid: None,
            start_time: None,
            restart_count: 0,
            last_restart_time: None,
            last_error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn uptime(&self) -> Option<chrono::Duration> {
        match (self.status, self.start_time) {
            (ServiceStatus::Running, Some(started)) => Some(Utc::now() - started),
            _ => None,
        }
    }
}
