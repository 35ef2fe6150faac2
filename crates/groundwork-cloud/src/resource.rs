//! Resource model
//!
//! Descriptors are the user-declared, pre-creation specification of a
//! resource; capabilities are the static per-kind scheduling flags the
//! dependency scheduler reads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The resource kinds the engine can provision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Stack,
    LoadBalancer,
    Database,
    Instance,
}

impl ResourceKind {
    /// Ledger category name for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Stack => "stack",
            ResourceKind::LoadBalancer => "load_balancer",
            ResourceKind::Database => "database",
            ResourceKind::Instance => "instance",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static scheduling capabilities of a resource kind, registered with the
/// dependency scheduler alongside its controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Dependents must block until this resource finishes creating.
    pub deps_wait_on_my_creation: bool,

    /// This resource must block until its declared dependencies finish.
    pub waits_on_parent_completion: bool,
}

/// A declared dependency on another resource in the same deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub kind: ResourceKind,
    pub name: String,
}

/// The user-declared specification of one resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub kind: ResourceKind,

    /// Logical name, unique within the deployment
    pub name: String,

    /// Provider region override; controllers fall back to their session
    /// default when unset
    #[serde(default)]
    pub region: Option<String>,

    #[serde(default)]
    pub depends_on: Vec<Dependency>,

    /// Provider-specific configuration
    #[serde(default)]
    pub config: Value,
}

impl ResourceDescriptor {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            region: None,
            depends_on: Vec::new(),
            config: Value::Object(Default::default()),
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_dependency(mut self, kind: ResourceKind, name: impl Into<String>) -> Self {
        self.depends_on.push(Dependency {
            kind,
            name: name.into(),
        });
        self
    }

    /// Get a configuration value as a specific type.
    pub fn get_config<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.config
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Deserialize the whole config block into a controller's config type.
    pub fn parse_config<T: serde::de::DeserializeOwned>(&self) -> crate::error::Result<T> {
        serde_json::from_value(self.config.clone()).map_err(|e| {
            crate::error::CloudError::InvalidConfig(format!(
                "{} '{}': {e}",
                self.kind, self.name
            ))
        })
    }
}

/// Provider-observed lifecycle state of a physical resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Absent,
    Creating,
    Available,
    CreateFailed,
    Deleting,
    Deleted,
    DeleteFailed,
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceStatus::Absent => "absent",
            ResourceStatus::Creating => "creating",
            ResourceStatus::Available => "available",
            ResourceStatus::CreateFailed => "create_failed",
            ResourceStatus::Deleting => "deleting",
            ResourceStatus::Deleted => "deleted",
            ResourceStatus::DeleteFailed => "delete_failed",
        };
        f.write_str(s)
    }
}

/// A provider-owned object as observed through its API.
#[derive(Debug, Clone)]
pub struct PhysicalResource {
    /// Provider-assigned identifier
    pub id: String,

    pub status: ResourceStatus,

    pub tags: Vec<crate::tags::Tag>,

    /// Raw provider description
    pub attributes: Value,
}

/// Options for a cleanup sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupOptions {
    /// Log intended deletions without deleting anything
    pub noop: bool,

    /// Match deployment-owned resources regardless of which orchestrator
    /// instance created them
    pub ignoremaster: bool,

    /// Block until asynchronous deletions reach a terminal state
    pub wait: bool,

    /// Skip final snapshots for kinds that support them (databases)
    pub skip_snapshots: bool,
}

/// Result of a cleanup sweep over one or more resource kinds.
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    /// Physical ids that matched the deployment and were eligible for
    /// deletion (also populated in noop mode)
    pub candidates: Vec<String>,

    /// Physical ids actually deleted
    pub deleted: Vec<String>,

    /// Per-resource failures (id, reason); never abort the wider sweep
    pub failed: Vec<(String, String)>,
}

impl CleanupReport {
    pub fn merge(&mut self, other: CleanupReport) {
        self.candidates.extend(other.candidates);
        self.deleted.extend(other.deleted);
        self.failed.extend(other.failed);
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_descriptor_get_config() {
        let desc = ResourceDescriptor::new(ResourceKind::Database, "maindb").with_config(json!({
            "engine": "postgres",
            "storage": 100,
        }));
        assert_eq!(desc.get_config::<String>("engine").unwrap(), "postgres");
        assert_eq!(desc.get_config::<i64>("storage").unwrap(), 100);
        assert!(desc.get_config::<String>("missing").is_none());
    }

    #[test]
    fn test_kind_roundtrip() {
        let kind: ResourceKind = serde_json::from_str("\"load_balancer\"").unwrap();
        assert_eq!(kind, ResourceKind::LoadBalancer);
        assert_eq!(kind.to_string(), "load_balancer");
    }
}
