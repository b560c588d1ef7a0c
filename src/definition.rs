use std::{collections::HashMap, fmt, path::PathBuf, sync::Arc, time::Duration};

use crate::{health::HealthCheck, Backoff, SupervisorError};

pub type ServiceName = String;

/// Declarative description of a process to keep alive.
///
/// A definition is immutable once registered. Build one with [`ServiceDefinition::new`] and the
/// `with_*` setters:
///
/// ```rust
/// use std::time::Duration;
/// use service_supervisor::ServiceDefinition;
///
/// let definition = ServiceDefinition::new("cache", "redis-server")
///     .with_args(["--port", "6380"])
///     .with_env("REDIS_LOG", "verbose")
///     .with_max_restarts(3)
///     .with_restart_delay(Duration::from_millis(500));
/// assert_eq!(definition.args, vec!["--port", "6380"]);
/// ```
#[derive(Clone)]
pub struct ServiceDefinition {
    /// Unique key in the supervisor registry, also the PID file stem.
    pub name: ServiceName,
    pub command: String,
    pub args: Vec<String>,
    /// `None` inherits the supervisor's working directory.
    pub working_directory: Option<PathBuf>,
    /// Merged over the supervisor's own environment.
    pub environment_overrides: HashMap<String, String>,
    pub auto_start: bool,
    pub auto_restart: bool,
    pub max_restarts: u32,
    pub restart_delay: Duration,
    pub restart_backoff: Backoff,
    pub graceful_shutdown_timeout: Duration,
    pub force_kill_timeout: Duration,
    pub health_check: Option<Arc<dyn HealthCheck>>,
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
}

impl ServiceDefinition {
    pub fn new(name: impl Into<ServiceName>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            working_directory: None,
            environment_overrides: HashMap::new(),
            auto_start: false,
            auto_restart: true,
            max_restarts: 5,
            restart_delay: Duration::from_secs(1),
            restart_backoff: Backoff::Fixed,
            graceful_shutdown_timeout: Duration::from_secs(5),
            force_kill_timeout: Duration::from_secs(2),
            health_check: None,
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment_overrides.insert(key.into(), value.into());
        self
    }

    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn with_auto_restart(mut self, auto_restart: bool) -> Self {
        self.auto_restart = auto_restart;
        self
    }

    pub fn with_max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn with_restart_backoff(mut self, backoff: Backoff) -> Self {
        self.restart_backoff = backoff;
        self
    }

    pub fn with_graceful_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_shutdown_timeout = timeout;
        self
    }

    pub fn with_force_kill_timeout(mut self, timeout: Duration) -> Self {
        self.force_kill_timeout = timeout;
        self
    }

    /// Installs a periodic health predicate, evaluated every `interval` while the service runs.
    pub fn with_health_check(mut self, check: impl HealthCheck, interval: Duration) -> Self {
        self.health_check = Some(Arc::new(check));
        self.health_check_interval = interval;
        self
    }

    /// Upper bound for a single health predicate evaluation.
    pub fn with_health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout = timeout;
        self
    }

    /// Rejects definitions the supervisor cannot run or persist.
    pub(crate) fn validate(&self) -> Result<(), SupervisorError> {
        let reason = if self.name.is_empty() {
            Some("name must not be empty")
        } else if self.name == "." || self.name == ".." {
            Some("name must not be a relative path component")
        } else if self.name.contains(['/', '\\', '\0']) {
            Some("name must not contain path separators or NUL")
        } else if self.command.trim().is_empty() {
            Some("command must not be empty")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(SupervisorError::InvalidDefinition {
                name: self.name.clone(),
                reason: reason.to_string(),
            }),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for ServiceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDefinition")
            .field("name", &self.name)
            .field("command", &self.command)
            .field("args", &self.args)
            .field("working_directory", &self.working_directory)
            .field("environment_overrides", &self.environment_overrides)
            .field("auto_start", &self.auto_start)
            .field("auto_restart", &self.auto_restart)
            .field("max_restarts", &self.max_restarts)
            .field("restart_delay", &self.restart_delay)
            .field("restart_backoff", &self.restart_backoff)
            .field("graceful_shutdown_timeout", &self.graceful_shutdown_timeout)
            .field("force_kill_timeout", &self.force_kill_timeout)
            .field("health_check", &self.health_check.is_some())
            .field("health_check_interval", &self.health_check_interval)
            .field("health_check_timeout", &self.health_check_timeout)
            .finish()
    }
}
