mod common;

use std::time::Duration;

use tempfile::TempDir;
use tokio::time::{pause, sleep};

use service_supervisor::{Backoff, ProcessExit, ServiceStatus, SupervisorEvent};

use common::{
    drain, kinds, read_pid_file, service, supervisor_with, wait_for, wait_for_status,
    MockProcessControl,
};

#[tokio::test]
async fn test_crash_is_restarted_after_delay() {
    pause();
    let dir = TempDir::new().unwrap();
    let mock = MockProcessControl::new();
    let supervisor = supervisor_with(&mock, dir.path());
    supervisor.register(service("api")).await.unwrap();
    supervisor.start("api").await.unwrap();
    let first = supervisor.status("api").await.unwrap().pid.unwrap();
    let mut events = supervisor.subscribe();

    mock.exit(first, ProcessExit::with_code(1));
    let record = wait_for(&supervisor, "api", |record| {
        record.status == ServiceStatus::Running && record.restart_count == 1
    })
    .await;

    let second = record.pid.unwrap();
    assert_ne!(first, second);
    assert!(record.last_restart_time.is_some());
    assert_eq!(read_pid_file(dir.path(), "api"), Some(second.to_string()));

    let events = drain(&mut events);
    assert_eq!(
        kinds(&events),
        ["crashed", "autoRestartScheduled", "starting", "started"]
    );
    assert_eq!(
        events[0],
        SupervisorEvent::Crashed {
            service: "api".into(),
            exit: ProcessExit::with_code(1),
            restart_count: 0,
        }
    );
    assert_eq!(
        events[1],
        SupervisorEvent::AutoRestartScheduled {
            service: "api".into(),
            attempt: 1,
            delay: Duration::from_millis(100),
        }
    );
}

#[tokio::test]
async fn test_crash_loop_gives_up_after_max_restarts() {
    pause();
    let dir = TempDir::new().unwrap();
    let mock = MockProcessControl::new();
    mock.exit_on_spawn("flaky", 1);
    let supervisor = supervisor_with(&mock, dir.path());
    supervisor
        .register(service("flaky").with_max_restarts(3))
        .await
        .unwrap();
    let mut events = supervisor.subscribe();

    supervisor.start("flaky").await.unwrap();
    let record = wait_for(&supervisor, "flaky", |record| {
        record.status == ServiceStatus::Stopped && record.restart_count == 3
    })
    .await;

    assert_eq!(record.pid, None);
    assert!(record.last_error.is_some());
    assert_eq!(read_pid_file(dir.path(), "flaky"), None);

    sleep(Duration::from_secs(10)).await;
    assert_eq!(mock.spawn_count("flaky"), 4);

    let events = drain(&mut events);
    let crash_counts: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            SupervisorEvent::Crashed { restart_count, .. } => Some(*restart_count),
            _ => None,
        })
        .collect();
    assert_eq!(crash_counts, [0, 1, 2, 3]);
    assert_eq!(
        events.iter().filter(|e| e.kind() == "autoRestartScheduled").count(),
        3
    );
    assert_eq!(events.last().map(SupervisorEvent::kind), Some("stopped"));
}

#[tokio::test]
async fn test_auto_restart_disabled() {
    pause();
    let dir = TempDir::new().unwrap();
    let mock = MockProcessControl::new();
    mock.exit_on_spawn("once", 2);
    let supervisor = supervisor_with(&mock, dir.path());
    supervisor
        .register(service("once").with_auto_restart(false))
        .await
        .unwrap();
    let mut events = supervisor.subscribe();

    supervisor.start("once").await.unwrap();
    let record = wait_for(&supervisor, "once", |record| {
        record.status == ServiceStatus::Stopped && record.last_error.is_some()
    })
    .await;

    assert_eq!(record.restart_count, 0);
    sleep(Duration::from_secs(5)).await;
    assert_eq!(mock.spawn_count("once"), 1);
    assert_eq!(
        kinds(&drain(&mut events)),
        ["starting", "started", "crashed", "stopped"]
    );
}

#[tokio::test]
async fn test_stop_cancels_pending_restart() {
    pause();
    let dir = TempDir::new().unwrap();
    let mock = MockProcessControl::new();
    let supervisor = supervisor_with(&mock, dir.path());
    supervisor
        .register(service("api").with_restart_delay(Duration::from_secs(10)))
        .await
        .unwrap();
    supervisor.start("api").await.unwrap();
    let pid = supervisor.status("api").await.unwrap().pid.unwrap();

    mock.exit(pid, ProcessExit::with_signal(11));
    wait_for_status(&supervisor, "api", ServiceStatus::Crashed).await;
    supervisor.stop("api", false).await.unwrap();
    assert_eq!(
        supervisor.status("api").await.unwrap().status,
        ServiceStatus::Stopped
    );

    sleep(Duration::from_secs(30)).await;
    assert_eq!(mock.spawn_count("api"), 1);
    assert_eq!(
        supervisor.status("api").await.unwrap().status,
        ServiceStatus::Stopped
    );
}

#[tokio::test]
async fn test_start_during_pending_restart_supersedes_it() {
    pause();
    let dir = TempDir::new().unwrap();
    let mock = MockProcessControl::new();
    let supervisor = supervisor_with(&mock, dir.path());
    supervisor
        .register(service("api").with_restart_delay(Duration::from_secs(10)))
        .await
        .unwrap();
    supervisor.start("api").await.unwrap();
    let pid = supervisor.status("api").await.unwrap().pid.unwrap();

    mock.exit(pid, ProcessExit::with_code(1));
    wait_for_status(&supervisor, "api", ServiceStatus::Crashed).await;
    supervisor.start("api").await.unwrap();

    sleep(Duration::from_secs(30)).await;
    let record = supervisor.status("api").await.unwrap();
    assert_eq!(record.status, ServiceStatus::Running);
    assert_eq!(record.restart_count, 0);
    assert_eq!(mock.spawn_count("api"), 2);
}

#[tokio::test]
async fn test_exit_after_stop_is_not_a_crash() {
    pause();
    let dir = TempDir::new().unwrap();
    let mock = MockProcessControl::new();
    let supervisor = supervisor_with(&mock, dir.path());
    supervisor.register(service("api")).await.unwrap();
    supervisor.start("api").await.unwrap();
    let mut events = supervisor.subscribe();

    supervisor.stop("api", false).await.unwrap();
    sleep(Duration::from_secs(5)).await;

    assert!(!kinds(&drain(&mut events)).contains(&"crashed"));
    assert_eq!(mock.spawn_count("api"), 1);
}

#[tokio::test]
async fn test_exponential_backoff_doubles_delay() {
    pause();
    let dir = TempDir::new().unwrap();
    let mock = MockProcessControl::new();
    mock.exit_on_spawn("flaky", 1);
    let supervisor = supervisor_with(&mock, dir.path());
    supervisor
        .register(
            service("flaky")
                .with_max_restarts(3)
                .with_restart_backoff(Backoff::Exponential { max_exponent: 10 }),
        )
        .await
        .unwrap();
    let mut events = supervisor.subscribe();

    supervisor.start("flaky").await.unwrap();
    wait_for(&supervisor, "flaky", |record| {
        record.status == ServiceStatus::Stopped && record.restart_count == 3
    })
    .await;

    let delays: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            SupervisorEvent::AutoRestartScheduled { delay, .. } => Some(delay),
            _ => None,
        })
        .collect();
    assert_eq!(
        delays,
        [
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400)
        ]
    );
}

#[tokio::test]
async fn test_manual_restart_consumes_restart_budget() {
    pause();
    let dir = TempDir::new().unwrap();
    let mock = MockProcessControl::new();
    let supervisor = supervisor_with(&mock, dir.path());
    supervisor
        .register(service("api").with_max_restarts(1))
        .await
        .unwrap();
    supervisor.start("api").await.unwrap();
    supervisor.restart("api").await.unwrap();
    let pid = supervisor.status("api").await.unwrap().pid.unwrap();

    mock.exit(pid, ProcessExit::with_code(1));
    let record = wait_for(&supervisor, "api", |record| {
        record.status == ServiceStatus::Stopped
    })
    .await;

    assert_eq!(record.restart_count, 1);
    assert_eq!(mock.spawn_count("api"), 2);
}

#[tokio::test]
async fn test_services_are_supervised_independently() {
    pause();
    let dir = TempDir::new().unwrap();
    let mock = MockProcessControl::new();
    mock.exit_on_spawn("flaky", 1);
    let supervisor = supervisor_with(&mock, dir.path());
    supervisor
        .register(service("flaky").with_max_restarts(2))
        .await
        .unwrap();
    supervisor.register(service("steady")).await.unwrap();

    supervisor.start_all().await;
    wait_for(&supervisor, "flaky", |record| {
        record.status == ServiceStatus::Stopped && record.restart_count == 2
    })
    .await;

    let steady = supervisor.status("steady").await.unwrap();
    assert_eq!(steady.status, ServiceStatus::Running);
    assert_eq!(steady.restart_count, 0);
    assert_eq!(mock.spawn_count("steady"), 1);
}
