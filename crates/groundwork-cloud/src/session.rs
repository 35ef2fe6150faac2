//! Deploy session context and shared services
//!
//! One `DeployContext` identifies a provisioning run; `Services` bundles the
//! session-owned shared state (ledger, endpoint registry, locks, DNS) that
//! every resource controller receives by reference. Nothing here is global:
//! two sessions in one process never share state.

use crate::collaborators::{DnsRegistrar, NoopDns};
use crate::endpoint::EndpointRegistry;
use crate::ledger::Ledger;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

/// Identity of one provisioning run. Immutable once provisioning begins.
#[derive(Debug, Clone)]
pub struct DeployContext {
    /// Unique deployment id, the universal ownership key
    pub deploy_id: String,

    /// Address of the controlling orchestrator instance, when known
    pub master_ip: Option<String>,

    /// Cloud account identifier, used where a provider needs ARN-style
    /// resource names
    pub account_id: Option<String>,

    /// When this run started
    pub started_at: DateTime<Utc>,
}

impl DeployContext {
    pub fn new(deploy_id: impl Into<String>) -> Self {
        Self {
            deploy_id: deploy_id.into(),
            master_ip: None,
            account_id: None,
            started_at: Utc::now(),
        }
    }

    pub fn with_master_ip(mut self, master_ip: impl Into<String>) -> Self {
        self.master_ip = Some(master_ip.into());
        self
    }

    pub fn with_account_id(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    /// Derive a cloud-side resource name from a logical name:
    /// `<deploy-id>-<NAME>`, sanitized to letters, digits and hyphens,
    /// optionally truncated to `max_len`.
    pub fn resource_name(&self, logical_name: &str, max_len: Option<usize>) -> String {
        let mut name = format!("{}-{}", self.deploy_id, logical_name.to_uppercase());
        name = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
            .collect();
        if let Some(max) = max_len {
            name.truncate(max);
            while name.ends_with('-') {
                name.pop();
            }
        }
        name
    }
}

/// Per-physical-resource-id mutual exclusion.
///
/// Two orchestration paths must never concurrently create, groom or destroy
/// the same physical id. Guards are owned so they can be held across awaits
/// and are released on every exit path, including errors.
#[derive(Default)]
pub struct ResourceLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ResourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, physical_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            locks
                .entry(physical_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Shared handles passed to every resource controller in a session.
pub struct Services {
    pub context: DeployContext,
    pub ledger: Arc<Ledger>,
    pub locks: Arc<ResourceLocks>,
    pub endpoints: Arc<EndpointRegistry>,
    pub dns: Arc<dyn DnsRegistrar>,
}

impl Services {
    pub fn new(context: DeployContext) -> Arc<Self> {
        Arc::new(Self {
            context,
            ledger: Arc::new(Ledger::new()),
            locks: Arc::new(ResourceLocks::new()),
            endpoints: Arc::new(EndpointRegistry::new()),
            dns: Arc::new(NoopDns),
        })
    }

    pub fn with_dns(context: DeployContext, dns: Arc<dyn DnsRegistrar>) -> Arc<Self> {
        Arc::new(Self {
            context,
            ledger: Arc::new(Ledger::new()),
            locks: Arc::new(ResourceLocks::new()),
            endpoints: Arc::new(EndpointRegistry::new()),
            dns,
        })
    }
}
