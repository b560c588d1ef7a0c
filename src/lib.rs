//! # service-supervisor
//!
//! `service-supervisor` keeps OS processes alive.
//! It starts them, notices when they exit or stop answering health checks, restarts them with
//! bounded retries, stops them gracefully or forcibly, and picks up where it left off after
//! the supervisor itself restarts.
//!
//! ## Install
//!
//! ```bash
//! cargo add service-supervisor
//! ```
//!
//! ## Quick example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use service_supervisor::{ServiceDefinition, SupervisorBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let supervisor = SupervisorBuilder::new("/run/my-app")
//!         .with_service(
//!             ServiceDefinition::new("web", "python3")
//!                 .with_args(["-m", "http.server", "8080"])
//!                 .with_auto_start(true)
//!                 .with_health_check(
//!                     || async { anyhow::Ok(std::net::TcpStream::connect("127.0.0.1:8080").is_ok()) },
//!                     Duration::from_secs(10),
//!                 ),
//!         )
//!         .build()?;
//!
//!     supervisor.recover_from_durable_state().await?; // adopt what survived our last run
//!     supervisor.start_auto_services().await;
//!
//!     tokio::signal::ctrl_c().await?;
//!     supervisor.shutdown(false).await;
//!     Ok(())
//! }
//! ```
//!
//! ## What you get
//!
//! * **Automatic restarts**: crashed or unhealthy services are relaunched up to `max_restarts` times.
//! * **Graceful shutdown**: SIGTERM first, SIGKILL for the whole process tree after a timeout.
//! * **Crash recovery**: PID records let a new supervisor adopt processes that outlived the old one.
//! * **Observability**: lifecycle events over a broadcast channel, captured output through a `LogSink`.
//!
//! ## API overview
//!
//! | ProcessSupervisor method           | Purpose                                                      |
//! | ---------------------------------- | ------------------------------------------------------------ |
//! | `register(definition)`             | Add a `stopped` service                                      |
//! | `start(name)` / `stop(name, force)`| Drive one service                                            |
//! | `restart(name)`                    | Stop then start, counting towards the restart budget         |
//! | `status(name)` / `statuses()`      | Snapshot of one or all `ServiceRecord`s                      |
//! | `watch(name)`                      | Await transitions of one service                             |
//! | `start_all()` / `stop_all(force)`  | Best-effort batch operations                                 |
//! | `recover_from_durable_state()`     | Adopt live processes, delete stale PID records               |
//! | `subscribe()`                      | Receive `SupervisorEvent`s                                   |
//! | `shutdown(force)`                  | Stop everything and retire the supervisor                    |

pub use definition::{ServiceDefinition, ServiceName};
pub use error::{StateStoreError, SupervisorError};
pub use events::SupervisorEvent;
pub use health::{HealthCheck, HealthCheckError};
pub use log_sink::{LogLine, LogSink, OutputStream, TracingLogSink};
pub use policy::{Backoff, RestartDecision, RestartPolicy};
pub use process::{
    ExitOutcome, OsProcessControl, OutputReader, Pid, ProcessControl, ProcessExit, SignalKind,
    SpawnedProcess,
};
pub use service::{ServiceRecord, ServiceStatus};
pub use state_store::PidStore;
pub use supervisor::{builder::SupervisorBuilder, BatchReport, ProcessSupervisor, RecoveryReport};

mod definition;
mod error;
mod events;
mod health;
mod log_sink;
mod policy;
mod process;
mod service;
mod state_store;
mod supervisor;
