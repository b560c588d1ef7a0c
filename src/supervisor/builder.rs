use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{
    events::EventBus,
    log_sink::{LogSink, TracingLogSink},
    process::{OsProcessControl, ProcessControl},
    supervisor::{handle::ServiceHandle, SupervisorContext},
    PidStore, ProcessSupervisor, ServiceDefinition, SupervisorError,
};

/// Builds a [`ProcessSupervisor`] with configurable collaborators.
///
/// Only the PID directory is required. Processes are controlled through the OS and captured
/// output goes to `tracing` unless replaced.
pub struct SupervisorBuilder {
    state_dir: PathBuf,
    process_control: Option<Arc<dyn ProcessControl>>,
    log_sink: Option<Arc<dyn LogSink>>,
    event_capacity: usize,
    liveness_poll_interval: Duration,
    services: Vec<ServiceDefinition>,
}

impl SupervisorBuilder {
    /// Creates a builder storing PID records under `state_dir`, with default settings.
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            process_control: None,
            log_sink: None,
            event_capacity: 256,
            liveness_poll_interval: Duration::from_millis(500),
            services: Vec::new(),
        }
    }

    /// Replaces the OS process control, mostly useful for tests.
    pub fn with_process_control(mut self, control: impl ProcessControl) -> Self {
        self.process_control = Some(Arc::new(control));
        self
    }

    /// Sets where captured stdout/stderr lines are written.
    pub fn with_log_sink(mut self, sink: impl LogSink) -> Self {
        self.log_sink = Some(Arc::new(sink));
        self
    }

    /// Sets how many events a subscriber may fall behind before it starts missing some.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Sets how often adopted processes are checked for liveness.
    pub fn with_liveness_poll_interval(mut self, interval: Duration) -> Self {
        self.liveness_poll_interval = interval;
        self
    }

    /// Registers a service as part of the build.
    pub fn with_service(mut self, definition: ServiceDefinition) -> Self {
        self.services.push(definition);
        self
    }

    pub fn with_services(mut self, definitions: impl IntoIterator<Item = ServiceDefinition>) -> Self {
        self.services.extend(definitions);
        self
    }

    /// Constructs the supervisor. Must be called within a Tokio runtime.
    ///
    /// Fails on invalid or duplicate service definitions. No process is started.
    pub fn build(self) -> Result<ProcessSupervisor, SupervisorError> {
        let mut definitions = HashMap::with_capacity(self.services.len());
        for definition in self.services {
            definition.validate()?;
            if definitions.contains_key(&definition.name) {
                return Err(SupervisorError::DuplicateService {
                    name: definition.name,
                });
            }
            definitions.insert(definition.name.clone(), Arc::new(definition));
        }

        let ctx = Arc::new(SupervisorContext {
            process: self
                .process_control
                .unwrap_or_else(|| Arc::new(OsProcessControl::new())),
            store: PidStore::new(self.state_dir),
            events: EventBus::new(self.event_capacity),
            log_sink: self.log_sink.unwrap_or_else(|| Arc::new(TracingLogSink)),
            liveness_poll_interval: self.liveness_poll_interval,
        });
        let token = CancellationToken::new();
        let services = definitions
            .into_iter()
            .map(|(name, definition)| {
                let handle = ServiceHandle::spawn(definition, ctx.clone(), &token);
                (name, handle)
            })
            .collect();

        Ok(ProcessSupervisor::new(ctx, services, token))
    }
}
