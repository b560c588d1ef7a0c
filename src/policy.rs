use std::time::Duration;

use crate::ServiceDefinition;

/// How the delay between consecutive restarts evolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Wait `restart_delay` before every attempt.
    #[default]
    Fixed,
    /// Wait `restart_delay * 2^min(restart_count, max_exponent)`.
    Exponential { max_exponent: u32 },
}

/// Outcome of a [`RestartPolicy::decide`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Restart { delay: Duration },
    GiveUp,
}

impl RestartDecision {
    pub fn is_restart(&self) -> bool {
        matches!(self, Self::Restart { .. })
    }
}

/// Pure restart decision for a crashed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub auto_restart: bool,
    pub max_restarts: u32,
    pub restart_delay: Duration,
    pub backoff: Backoff,
}

impl RestartPolicy {
    /// Decides whether a service that already restarted `restart_count` times may restart again.
    pub fn decide(&self, restart_count: u32) -> RestartDecision {
        if !self.auto_restart || restart_count >= self.max_restarts {
            return RestartDecision::GiveUp;
        }
        RestartDecision::Restart {
            delay: self.delay_for(restart_count),
        }
    }

    pub fn delay_for(&self, restart_count: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.restart_delay,
            Backoff::Exponential { max_exponent } => {
                let factor = 2u32.saturating_pow(restart_count.min(max_exponent));
                self.restart_delay.saturating_mul(factor)
            }
        }
    }
}

impl From<&ServiceDefinition> for RestartPolicy {
    fn from(definition: &ServiceDefinition) -> Self {
        Self {
            auto_restart: definition.auto_restart,
            max_restarts: definition.max_restarts,
            restart_delay: definition.restart_delay,
            backoff: definition.restart_backoff,
        }
    }
}
