use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// A liveness predicate evaluated periodically while a service is running.
///
/// Returning `Ok(false)` or an error both mark the service unhealthy. Closures returning a
/// future of `anyhow::Result<bool>` implement this trait directly:
///
/// ```rust
/// use std::time::Duration;
/// use service_supervisor::ServiceDefinition;
///
/// let definition = ServiceDefinition::new("api", "api-server")
///     .with_health_check(|| async { anyhow::Ok(true) }, Duration::from_secs(10));
/// assert!(definition.health_check.is_some());
/// ```
#[async_trait]
pub trait HealthCheck: Send + Sync + 'static {
    async fn check(&self) -> anyhow::Result<bool>;
}

#[async_trait]
impl<F, Fut> HealthCheck for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
{
    async fn check(&self) -> anyhow::Result<bool> {
        (self)().await
    }
}

/// Why a health evaluation reported the service as unhealthy.
///
/// Never returned to callers; it only travels in `unhealthy` notifications and logs.
#[derive(Debug, Error)]
pub enum HealthCheckError {
    #[error("health check reported unhealthy")]
    Unhealthy,
    #[error("health check failed: {0:#}")]
    Failed(anyhow::Error),
    #[error("health check did not answer within {0:?}")]
    TimedOut(Duration),
}

async fn evaluate(check: &dyn HealthCheck, timeout: Duration) -> Result<(), HealthCheckError> {
    match tokio::time::timeout(timeout, check.check()).await {
        Ok(Ok(true)) => Ok(()),
        Ok(Ok(false)) => Err(HealthCheckError::Unhealthy),
        Ok(Err(err)) => Err(HealthCheckError::Failed(err)),
        Err(_) => Err(HealthCheckError::TimedOut(timeout)),
    }
}

/// Periodic evaluation of one service's health predicate.
///
/// Disarmed when dropped. At most one evaluation is in flight; ticks missed while an
/// evaluation is pending are skipped.
#[derive(Debug)]
pub(crate) struct HealthMonitor {
    token: CancellationToken,
}

impl HealthMonitor {
    /// Arms the monitor. `on_unhealthy` is called at most once, after which the monitor stops.
    pub(crate) fn arm<F>(
        service: &str,
        check: Arc<dyn HealthCheck>,
        interval: Duration,
        timeout: Duration,
        parent: &CancellationToken,
        on_unhealthy: F,
    ) -> Self
    where
        F: FnOnce(HealthCheckError) + Send + 'static,
    {
        let token = parent.child_token();
        let task_token = token.clone();
        let service = service.to_string();
        // tokio intervals panic on a zero period.
        let interval = interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + interval, interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => return,
                    _ = ticks.tick() => {}
                }
                let verdict = tokio::select! {
                    _ = task_token.cancelled() => return,
                    verdict = evaluate(check.as_ref(), timeout) => verdict,
                };
                match verdict {
                    Ok(()) => trace!(service = %service, "health check passed"),
                    Err(err) => {
                        warn!(service = %service, error = %err, "health check failed");
                        on_unhealthy(err);
                        return;
                    }
                }
            }
        });

        Self { token }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
