use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::{ServiceName, ServiceStatus};

/// Errors surfaced by [`ProcessSupervisor`](crate::ProcessSupervisor) operations.
///
/// Every variant carries the name of the service it concerns. Only crash-induced restarts are
/// retried by the supervisor; everything here is reported to the caller as-is.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("service `{name}` is not registered")]
    UnknownService { name: ServiceName },

    #[error("service `{name}` is already registered")]
    DuplicateService { name: ServiceName },

    #[error("invalid definition for service `{name}`: {reason}")]
    InvalidDefinition { name: ServiceName, reason: String },

    #[error("failed to spawn service `{name}`: {source}")]
    Spawn {
        name: ServiceName,
        #[source]
        source: io::Error,
    },

    /// The process survived a force kill. It is left running and needs an operator.
    #[error("service `{name}` (pid {pid}) is still alive {timeout:?} after a force kill")]
    ShutdownTimeout {
        name: ServiceName,
        pid: u32,
        timeout: Duration,
    },

    #[error("failed to signal service `{name}` (pid {pid}): {source}")]
    Signal {
        name: ServiceName,
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("service `{name}` cannot {operation} while {status}")]
    InvalidState {
        name: ServiceName,
        operation: &'static str,
        status: ServiceStatus,
    },

    #[error("pid record for service `{name}` is unusable: {source}")]
    StateStore {
        name: ServiceName,
        #[source]
        source: StateStoreError,
    },
}

impl SupervisorError {
    /// Name of the service the error relates to.
    pub fn service_name(&self) -> &str {
        match self {
            Self::UnknownService { name }
            | Self::DuplicateService { name }
            | Self::InvalidDefinition { name, .. }
            | Self::Spawn { name, .. }
            | Self::ShutdownTimeout { name, .. }
            | Self::Signal { name, .. }
            | Self::InvalidState { name, .. }
            | Self::StateStore { name, .. } => name,
        }
    }

    /// Whether the error left a process behind that the supervisor could not reclaim.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ShutdownTimeout { .. })
    }

    pub(crate) fn unknown(name: &str) -> Self {
        Self::UnknownService {
            name: name.to_string(),
        }
    }
}

/// Errors raised by the [`PidStore`](crate::PidStore).
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} does not contain a process id: {content:?}", path.display())]
    Corrupt { path: PathBuf, content: String },
}
