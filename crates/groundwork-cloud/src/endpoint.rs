//! Resilient provider endpoint
//!
//! Wraps a [`ProviderApi`] with tiered-backoff retry for transient errors so
//! that resource controllers never have to spray retry loops through their
//! provisioning logic. Permanent errors propagate untouched on the first
//! occurrence.

use crate::api::{ApiError, ProviderApi};
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Tiered backoff schedule for transient provider errors.
///
/// Attempts 1 and 2 wait a short fixed delay; attempts up to `long_after`
/// wait a medium jittered delay; everything beyond waits a long jittered
/// delay. Log severity escalates with the same thresholds. The exact numbers
/// are policy, not contract - callers tune them per provider.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub short_delay: Duration,
    pub medium_delay: Duration,
    pub long_delay: Duration,

    /// First attempt (1-based) that uses the medium tier
    pub medium_after: u32,

    /// First attempt that uses the long tier
    pub long_after: u32,

    /// Jitter applied to the medium and long tiers, as a fraction of the
    /// base delay
    pub jitter_frac: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            short_delay: Duration::from_secs(5),
            medium_delay: Duration::from_secs(20),
            long_delay: Duration::from_secs(40),
            medium_after: 3,
            long_after: 10,
            jitter_frac: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Base delay for a given 1-based attempt number, before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt >= self.long_after {
            self.long_delay
        } else if attempt >= self.medium_after {
            self.medium_delay
        } else {
            self.short_delay
        }
    }

    /// Delay for a given attempt with jitter applied. The short tier is
    /// deliberately un-jittered.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if attempt < self.medium_after || self.jitter_frac <= 0.0 {
            return base;
        }
        let spread = base.as_secs_f64() * self.jitter_frac;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
    }
}

/// A resilient client for one provider service in one region.
///
/// Retry state is local to each call; the endpoint itself is safe to share
/// across every concurrent orchestration path.
pub struct Endpoint {
    api: Arc<dyn ProviderApi>,
    backoff: BackoffPolicy,
}

impl Endpoint {
    pub fn new(api: Arc<dyn ProviderApi>, backoff: BackoffPolicy) -> Self {
        Self { api, backoff }
    }

    pub fn with_default_backoff(api: Arc<dyn ProviderApi>) -> Self {
        Self::new(api, BackoffPolicy::default())
    }

    pub fn api(&self) -> &dyn ProviderApi {
        self.api.as_ref()
    }

    /// Invoke an operation, retrying transient errors without an attempt
    /// ceiling. Bounded retry budgets are the caller's concern - readiness
    /// polling loops impose their own ceiling and bound total wall-clock
    /// time.
    pub async fn call(&self, operation: &str, args: Value) -> Result<Value, ApiError> {
        self.call_inner(operation, args, None).await
    }

    /// Invoke an operation, retrying transient errors at most `max_attempts`
    /// times in total before surfacing the last error.
    pub async fn call_capped(
        &self,
        operation: &str,
        args: Value,
        max_attempts: u32,
    ) -> Result<Value, ApiError> {
        self.call_inner(operation, args, Some(max_attempts.max(1))).await
    }

    async fn call_inner(
        &self,
        operation: &str,
        args: Value,
        cap: Option<u32>,
    ) -> Result<Value, ApiError> {
        let provider = self.api.provider();
        let service = self.api.service();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            tracing::debug!(provider, service, operation, attempt, "calling provider endpoint");

            match self.api.invoke(operation, args.clone()).await {
                Ok(value) => {
                    tracing::debug!(provider, service, operation, attempt, "endpoint call succeeded");
                    return Ok(value);
                }
                Err(err) if err.is_transient() => {
                    if let Some(cap) = cap {
                        if attempt >= cap {
                            tracing::warn!(
                                provider,
                                service,
                                operation,
                                attempt,
                                code = %err.code,
                                "exhausted retry budget for transient error"
                            );
                            return Err(err);
                        }
                    }

                    let delay = self.backoff.delay(attempt);
                    if attempt >= self.backoff.long_after {
                        tracing::warn!(
                            provider, service, operation, attempt,
                            code = %err.code,
                            delay_secs = delay.as_secs_f64(),
                            "transient provider error, still retrying"
                        );
                    } else if attempt >= self.backoff.medium_after {
                        tracing::info!(
                            provider, service, operation, attempt,
                            code = %err.code,
                            delay_secs = delay.as_secs_f64(),
                            "transient provider error, retrying"
                        );
                    } else {
                        tracing::debug!(
                            provider, service, operation, attempt,
                            code = %err.code,
                            delay_secs = delay.as_secs_f64(),
                            "transient provider error, retrying"
                        );
                    }
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    tracing::debug!(
                        provider, service, operation, attempt,
                        code = %err.code,
                        "permanent provider error"
                    );
                    return Err(err);
                }
            }
        }
    }
}

/// Session-owned cache of endpoints, one per provider+service+region.
///
/// Replaces process-wide client singletons: the registry is constructed once
/// per deploy session and passed by reference to every resource controller.
#[derive(Default)]
pub struct EndpointRegistry {
    endpoints: Mutex<HashMap<(String, String, String), Arc<Endpoint>>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the endpoint for (provider, service, region), constructing it
    /// with `factory` on first use.
    pub fn get_or_insert_with(
        &self,
        provider: &str,
        service: &str,
        region: &str,
        factory: impl FnOnce() -> Endpoint,
    ) -> Arc<Endpoint> {
        let key = (provider.to_string(), service.to_string(), region.to_string());
        self.endpoints
            .lock()
            .unwrap()
            .entry(key)
            .or_insert_with(|| Arc::new(factory()))
            .clone()
    }

    /// Pre-register an endpoint (used by tests to inject mock transports).
    pub fn register(&self, provider: &str, service: &str, region: &str, endpoint: Arc<Endpoint>) {
        let key = (provider.to_string(), service.to_string(), region.to_string());
        self.endpoints.lock().unwrap().insert(key, endpoint);
    }

    pub fn get(&self, provider: &str, service: &str, region: &str) -> Option<Arc<Endpoint>> {
        let key = (provider.to_string(), service.to_string(), region.to_string());
        self.endpoints.lock().unwrap().get(&key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::mock::MockApi;
    use serde_json::json;

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy {
            short_delay: Duration::from_millis(1),
            medium_delay: Duration::from_millis(2),
            long_delay: Duration::from_millis(3),
            ..BackoffPolicy::default()
        }
    }

    #[test]
    fn test_backoff_tiers() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.base_delay(1), Duration::from_secs(5));
        assert_eq!(policy.base_delay(2), Duration::from_secs(5));
        assert_eq!(policy.base_delay(3), Duration::from_secs(20));
        assert_eq!(policy.base_delay(9), Duration::from_secs(20));
        assert_eq!(policy.base_delay(10), Duration::from_secs(40));
        assert_eq!(policy.base_delay(50), Duration::from_secs(40));
    }

    #[test]
    fn test_jitter_stays_within_spread() {
        let policy = BackoffPolicy::default();
        for _ in 0..100 {
            let d = policy.delay(5).as_secs_f64();
            assert!((15.0..=25.0).contains(&d), "delay {} outside jitter band", d);
        }
        // Short tier is fixed
        assert_eq!(policy.delay(1), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_transient_error_is_retried_not_returned() {
        let api = Arc::new(MockApi::new("aws", "ec2"));
        api.stage_err(
            "DescribeInstances",
            ApiError::transient("DescribeInstances", "Throttling", "slow down"),
        );
        api.stage_ok("DescribeInstances", json!({"ok": true}));

        let endpoint = Endpoint::new(api.clone(), fast_backoff());
        let resp = endpoint.call("DescribeInstances", json!({})).await.unwrap();
        assert_eq!(resp["ok"], true);
        assert_eq!(api.call_count("DescribeInstances"), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_propagates_with_zero_retries() {
        let api = Arc::new(MockApi::new("aws", "ec2"));
        api.stage_err(
            "RunInstances",
            ApiError::permanent("RunInstances", "UnauthorizedOperation", "no"),
        );

        let endpoint = Endpoint::new(api.clone(), fast_backoff());
        let err = endpoint.call("RunInstances", json!({})).await.unwrap_err();
        assert_eq!(err.code, "UnauthorizedOperation");
        assert_eq!(api.call_count("RunInstances"), 1);
    }

    #[tokio::test]
    async fn test_capped_call_returns_error_after_budget() {
        let api = Arc::new(MockApi::new("aws", "elb"));
        for _ in 0..5 {
            api.stage_err(
                "CreateLoadBalancer",
                ApiError::transient("CreateLoadBalancer", "Throttling", "slow down"),
            );
        }

        let endpoint = Endpoint::new(api.clone(), fast_backoff());
        let err = endpoint
            .call_capped("CreateLoadBalancer", json!({}), 3)
            .await
            .unwrap_err();
        assert_eq!(err.code, "Throttling");
        assert_eq!(api.call_count("CreateLoadBalancer"), 3);
    }

    #[test]
    fn test_registry_reuses_endpoint_per_key() {
        let registry = EndpointRegistry::new();
        let a = registry.get_or_insert_with("aws", "ec2", "us-east-1", || {
            Endpoint::with_default_backoff(Arc::new(MockApi::new("aws", "ec2")))
        });
        let b = registry.get_or_insert_with("aws", "ec2", "us-east-1", || {
            panic!("factory must not run twice for the same key")
        });
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.get("aws", "ec2", "eu-west-1").is_none());
    }
}
