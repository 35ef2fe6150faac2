//! Resource controller trait
//!
//! One controller per resource kind. A controller knows how to create its
//! kind from a descriptor, find live instances of it, and sweep a
//! deployment's instances away. Controllers receive their collaborators
//! (endpoints, ledger, locks, deploy context) at construction and the trait
//! stays free of provider detail.

use crate::error::Result;
use crate::resource::{
    Capabilities, CleanupOptions, CleanupReport, PhysicalResource, ResourceDescriptor,
    ResourceKind,
};
use async_trait::async_trait;

/// Search criteria for [`ResourceController::find`].
///
/// All populated fields must match; an empty criteria set matches nothing.
#[derive(Debug, Clone, Default)]
pub struct FindCriteria {
    pub name: Option<String>,
    pub id: Option<String>,
    /// Kind-specific secondary key (e.g. a database's endpoint address).
    pub secondary: Option<String>,
    pub tag: Option<(String, String)>,
}

impl FindCriteria {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn by_tag(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            tag: Some((key.into(), value.into())),
            ..Self::default()
        }
    }

    pub fn with_secondary(mut self, secondary: impl Into<String>) -> Self {
        self.secondary = Some(secondary.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.id.is_none() && self.secondary.is_none() && self.tag.is_none()
    }
}

/// Lifecycle driver for one resource kind.
#[async_trait]
pub trait ResourceController: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// Scheduling behavior of this kind relative to its dependents.
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Create the resource, block until it is usable, record it in the
    /// ledger, and return its physical id.
    ///
    /// Dependencies named by the descriptor are resolved through the ledger;
    /// a missing dependency fails with
    /// [`CloudError::DependencyNotFound`](crate::CloudError::DependencyNotFound)
    /// before any provider call is made.
    async fn create(&self, descriptor: &ResourceDescriptor) -> Result<String>;

    /// Locate a live resource. Returns `Ok(None)` when nothing matches.
    async fn find(&self, criteria: &FindCriteria) -> Result<Option<PhysicalResource>>;

    /// Delete every instance of this kind belonging to `deploy_id`.
    ///
    /// Failures to delete individual resources are collected in the report
    /// rather than aborting the sweep.
    async fn cleanup(&self, deploy_id: &str, options: &CleanupOptions) -> Result<CleanupReport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_criteria_builders() {
        let c = FindCriteria::by_name("db-main").with_secondary("db-main.example.com");
        assert_eq!(c.name.as_deref(), Some("db-main"));
        assert_eq!(c.secondary.as_deref(), Some("db-main.example.com"));
        assert!(c.id.is_none());
        assert!(!c.is_empty());
        assert!(FindCriteria::default().is_empty());
    }
}
