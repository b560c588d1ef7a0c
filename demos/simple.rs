use std::time::Duration;

use service_supervisor::{ServiceDefinition, SupervisorBuilder, SupervisorEvent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Build the supervisor with two services
    let supervisor = SupervisorBuilder::new(std::env::temp_dir().join("service-supervisor-demo"))
        .with_service(
            ServiceDefinition::new("ticker", "sh")
                .with_args(["-c", "while true; do echo tick; sleep 1; done"])
                .with_auto_start(true),
        )
        .with_service(
            ServiceDefinition::new("flaky", "sh")
                .with_args(["-c", "echo 'flaky is up'; sleep 2; exit 1"])
                .with_auto_start(true)
                .with_max_restarts(2)
                .with_restart_delay(Duration::from_secs(1)),
        )
        .build()?;

    // Print every lifecycle event
    let mut events = supervisor.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SupervisorEvent::Started { service, pid } => println!("🚀 {service} started ({pid})"),
                SupervisorEvent::Crashed { service, exit, .. } => println!("💥 {service} crashed: {exit}"),
                SupervisorEvent::Stopped { service, .. } => println!("🛑 {service} stopped"),
                other => println!("{other:?}"),
            }
        }
    });

    // Pick up anything a previous run left behind, then start
    let recovered = supervisor.recover_from_durable_state().await?;
    if !recovered.adopted.is_empty() {
        println!("Adopted {:?}", recovered.adopted);
    }
    supervisor.start_auto_services().await;

    // Let flaky burn through its restarts
    tokio::time::sleep(Duration::from_secs(10)).await;
    for (name, record) in supervisor.statuses().await {
        println!("{name}: {} after {} restarts", record.status, record.restart_count);
    }

    let report = supervisor.shutdown(false).await;
    println!("All services stopped! 🫡 ({} failed)", report.failed.len());
    Ok(())
}
