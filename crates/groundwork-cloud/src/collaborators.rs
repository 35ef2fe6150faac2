//! Collaborator seams: credentials, DNS registration, node configuration
//!
//! These are the points where the engine touches systems it does not own.
//! Each is a small trait so controllers can be exercised against in-memory
//! stand-ins.

use crate::error::{CloudError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// Opaque credential material for one provider account.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    material: HashMap<String, String>,
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.material.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.material.get(key).map(String::as_str)
    }

    /// Fetch a required field, failing with a credentials error naming it.
    pub fn require(&self, provider: &str, key: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| {
            CloudError::Credentials(provider.to_string(), format!("missing field '{key}'"))
        })
    }
}

/// Source of provider credentials.
///
/// Failures here are permanent; retrying a fetch that failed for a missing
/// or malformed credential set only delays the inevitable.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn fetch(&self, provider: &str, account: &str) -> Result<Credentials>;
}

/// Fixed in-memory credential set, for tests and single-account sessions.
#[derive(Default)]
pub struct StaticCredentialStore {
    sets: HashMap<(String, String), Credentials>,
}

impl StaticCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, provider: &str, account: &str, creds: Credentials) {
        self.sets
            .insert((provider.to_string(), account.to_string()), creds);
    }
}

#[async_trait]
impl CredentialStore for StaticCredentialStore {
    async fn fetch(&self, provider: &str, account: &str) -> Result<Credentials> {
        self.sets
            .get(&(provider.to_string(), account.to_string()))
            .cloned()
            .ok_or_else(|| {
                CloudError::Credentials(
                    provider.to_string(),
                    format!("no credentials for account '{account}'"),
                )
            })
    }
}

/// DNS record registration for newly created resources.
#[async_trait]
pub trait DnsRegistrar: Send + Sync {
    async fn upsert_record(&self, name: &str, target: &str) -> Result<()>;
    async fn delete_record(&self, name: &str) -> Result<()>;
}

/// Registrar that does nothing; used when no DNS backend is configured.
pub struct NoopDns;

#[async_trait]
impl DnsRegistrar for NoopDns {
    async fn upsert_record(&self, _name: &str, _target: &str) -> Result<()> {
        Ok(())
    }

    async fn delete_record(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}

/// Register a DNS record for a resource that just came up.
///
/// DNS is best-effort by default: a failure is logged and swallowed so one
/// bad zone update cannot fail an otherwise healthy creation. With
/// `sync_wait` the caller needs the record before proceeding, so the error
/// propagates.
pub async fn register_dns(
    dns: &dyn DnsRegistrar,
    name: &str,
    target: &str,
    sync_wait: bool,
) -> Result<()> {
    match dns.upsert_record(name, target).await {
        Ok(()) => Ok(()),
        Err(err) if !sync_wait => {
            tracing::warn!(name, target, error = %err, "DNS registration failed, continuing");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// A reachable node handed off to post-creation configuration.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    pub physical_id: String,
    pub name: String,
    pub address: String,
    pub private_address: Option<String>,
}

/// Post-creation configuration hook (package installs, config convergence).
#[async_trait]
pub trait ConfigAgent: Send + Sync {
    async fn converge(&self, node: &NodeHandle) -> Result<()>;
}

/// Agent that records handoffs without doing anything.
#[derive(Default)]
pub struct NoopAgent {
    converged: Mutex<Vec<String>>,
}

impl NoopAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn converged(&self) -> Vec<String> {
        self.converged.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl ConfigAgent for NoopAgent {
    async fn converge(&self, node: &NodeHandle) -> Result<()> {
        self.converged
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(node.physical_id.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingDns;

    #[async_trait]
    impl DnsRegistrar for FailingDns {
        async fn upsert_record(&self, _name: &str, _target: &str) -> Result<()> {
            Err(CloudError::Dns("zone unavailable".to_string()))
        }

        async fn delete_record(&self, _name: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dns_failure_swallowed_unless_sync() {
        let dns = FailingDns;
        register_dns(&dns, "db.example.com", "10.0.0.5", false)
            .await
            .unwrap();
        let err = register_dns(&dns, "db.example.com", "10.0.0.5", true)
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Dns(_)));
    }

    #[tokio::test]
    async fn test_static_store_misses_are_permanent_errors() {
        let mut store = StaticCredentialStore::new();
        store.insert(
            "gcp",
            "main",
            Credentials::new().with("token", "abc"),
        );
        let creds = store.fetch("gcp", "main").await.unwrap();
        assert_eq!(creds.require("gcp", "token").unwrap(), "abc");
        assert!(creds.require("gcp", "project").is_err());
        assert!(store.fetch("gcp", "other").await.is_err());
    }
}
