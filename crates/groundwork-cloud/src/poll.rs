//! Bounded readiness/deletion polling
//!
//! Long-running provider transitions (a database becoming available, a stack
//! deleting) are watched with a fixed-interval poll that logs a "still
//! waiting" heartbeat every Nth attempt, escalates severity the longer it
//! waits, and gives up with a distinct timeout error after a bounded number
//! of attempts.

use crate::api::ApiError;
use crate::error::{CloudError, Result};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub interval: Duration,

    /// Attempt ceiling; beyond this the wait fails with
    /// [`CloudError::PollTimeout`]
    pub max_attempts: u32,

    /// Emit a visible heartbeat every Nth poll
    pub heartbeat_every: u32,

    /// Attempt after which heartbeats escalate to WARN
    pub escalate_after: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            max_attempts: 240,
            heartbeat_every: 20,
            escalate_after: 80,
        }
    }
}

impl PollPolicy {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
            ..Self::default()
        }
    }

    /// Whether the heartbeat for a given 1-based attempt is user-visible.
    pub fn is_heartbeat(&self, attempt: u32) -> bool {
        self.heartbeat_every > 0 && attempt % self.heartbeat_every == 1
    }
}

/// One probe observation.
pub enum PollOutcome<T> {
    /// The resource reached the state we were waiting for
    Ready(T),

    /// Keep waiting
    Pending,

    /// The provider reported a terminal failure state
    Failed(String),
}

/// Poll `probe` until it reports ready, failed, or the policy's attempt
/// ceiling is reached.
///
/// Transient probe errors are expected to have been absorbed by the endpoint
/// the probe calls through; an `ApiError` here is terminal for the wait.
pub async fn wait_for<T, F, Fut>(subject: &str, policy: &PollPolicy, mut probe: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<PollOutcome<T>, ApiError>>,
{
    for attempt in 1..=policy.max_attempts {
        match probe().await {
            Ok(PollOutcome::Ready(value)) => {
                tracing::debug!(subject, attempt, "wait complete");
                return Ok(value);
            }
            Ok(PollOutcome::Pending) => {
                if policy.is_heartbeat(attempt) {
                    if attempt >= policy.escalate_after {
                        tracing::warn!(subject, attempt, "still waiting");
                    } else {
                        tracing::info!(subject, attempt, "still waiting");
                    }
                } else {
                    tracing::debug!(subject, attempt, "still waiting");
                }
            }
            Ok(PollOutcome::Failed(reason)) => {
                return Err(CloudError::WaitFailed {
                    subject: subject.to_string(),
                    reason,
                })
            }
            Err(err) => return Err(err.into()),
        }

        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }

    Err(CloudError::PollTimeout {
        subject: subject.to_string(),
        attempts: policy.max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(1),
            max_attempts,
            heartbeat_every: 2,
            escalate_after: 3,
        }
    }

    #[tokio::test]
    async fn test_ready_after_pending() {
        let count = AtomicU32::new(0);
        let policy = fast_policy(10);
        let result = wait_for("db-1", &policy, || {
            let n = count.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Ok(PollOutcome::Pending)
                } else {
                    Ok(PollOutcome::Ready("available"))
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, "available");
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_timeout_is_distinct_from_provider_failure() {
        let policy = fast_policy(3);
        let err = wait_for::<(), _, _>("db-1", &policy, || async { Ok(PollOutcome::Pending) })
            .await
            .unwrap_err();
        match err {
            CloudError::PollTimeout { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected PollTimeout, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_provider_reported_failure_stops_immediately() {
        let count = AtomicU32::new(0);
        let policy = fast_policy(10);
        let err = wait_for::<(), _, _>("stack-1", &policy, || {
            count.fetch_add(1, Ordering::SeqCst);
            async { Ok(PollOutcome::Failed("CREATE_FAILED".to_string())) }
        })
        .await
        .unwrap_err();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(err.to_string().contains("CREATE_FAILED"));
    }

    #[test]
    fn test_heartbeat_cadence() {
        let policy = fast_policy(10);
        assert!(policy.is_heartbeat(1));
        assert!(!policy.is_heartbeat(2));
        assert!(policy.is_heartbeat(3));
    }
}
