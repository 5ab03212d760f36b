//! Handler options and failure policies.

use std::str::FromStr;
use std::time::Duration;

use order_store::StatusGuard;

/// Default time budget for persisting and forwarding one create request.
pub const DEFAULT_CREATE_DEADLINE: Duration = Duration::from_secs(1);

/// What happens to a create request that could not be fulfilled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CreateFailurePolicy {
    /// Acknowledge and drop the request. Failures are only logged and counted.
    #[default]
    Drop,
    /// Reject without requeue so the broker dead-letters the request.
    DeadLetter,
}

impl FromStr for CreateFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(CreateFailurePolicy::Drop),
            "dead-letter" | "deadletter" | "dead_letter" => Ok(CreateFailurePolicy::DeadLetter),
            other => Err(format!(
                "unknown create failure policy '{other}', expected 'drop' or 'dead-letter'"
            )),
        }
    }
}

/// Tunables shared by the three handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerOptions {
    /// Budget for begin, insert, publish and commit of one create request.
    pub create_deadline: Duration,
    pub create_failure_policy: CreateFailurePolicy,
    /// Precondition on the status updates made by rollbacks and completions.
    pub status_guard: StatusGuard,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            create_deadline: DEFAULT_CREATE_DEADLINE,
            create_failure_policy: CreateFailurePolicy::default(),
            status_guard: StatusGuard::default(),
        }
    }
}

impl HandlerOptions {
    pub fn with_create_deadline(mut self, deadline: Duration) -> Self {
        self.create_deadline = deadline;
        self
    }

    pub fn with_create_failure_policy(mut self, policy: CreateFailurePolicy) -> Self {
        self.create_failure_policy = policy;
        self
    }

    pub fn with_status_guard(mut self, guard: StatusGuard) -> Self {
        self.status_guard = guard;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = HandlerOptions::default();
        assert_eq!(options.create_deadline, Duration::from_secs(1));
        assert_eq!(options.create_failure_policy, CreateFailurePolicy::Drop);
        assert_eq!(options.status_guard, StatusGuard::Unconditional);
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("drop".parse(), Ok(CreateFailurePolicy::Drop));
        assert_eq!("Dead-Letter".parse(), Ok(CreateFailurePolicy::DeadLetter));
        assert!("retry".parse::<CreateFailurePolicy>().is_err());
    }
}
