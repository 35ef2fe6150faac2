//! Deployment ownership tags
//!
//! Every physical resource created by the engine carries the canonical tag
//! set, and the [`matches_deployment`] predicate is the single authority on
//! whether cleanup may touch a resource.

use crate::session::DeployContext;
use serde::{Deserialize, Serialize};

/// Tag key binding a resource to its owning deployment id.
pub const TAG_DEPLOY_ID: &str = "gw-deploy-id";

/// Tag key recording the orchestrator instance that created the resource.
pub const TAG_MASTER_IP: &str = "gw-master-ip";

/// Conventional display-name tag key.
pub const TAG_NAME: &str = "Name";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// The canonical ownership tag set for a resource in this deployment.
pub fn standard_tags(context: &DeployContext, resource_name: &str) -> Vec<Tag> {
    let mut tags = vec![
        Tag::new(TAG_DEPLOY_ID, &context.deploy_id),
        Tag::new(TAG_NAME, context.resource_name(resource_name, None)),
    ];
    if let Some(master_ip) = &context.master_ip {
        tags.push(Tag::new(TAG_MASTER_IP, master_ip));
    }
    tags
}

/// Whether a physical resource belongs to the given deployment.
///
/// Requires an exact match on the deployment-id tag. The master-identity tag
/// must also match the current orchestrator unless `ignoremaster` is set
/// (used when repairing a deployment from a different orchestrator instance
/// than the one that created it).
pub fn matches_deployment(
    tags: &[Tag],
    deploy_id: &str,
    master_ip: Option<&str>,
    ignoremaster: bool,
) -> bool {
    let deploy_match = tags
        .iter()
        .any(|t| t.key == TAG_DEPLOY_ID && t.value == deploy_id);
    if !deploy_match {
        return false;
    }
    if ignoremaster {
        return true;
    }
    match master_ip {
        Some(ip) => tags.iter().any(|t| t.key == TAG_MASTER_IP && t.value == ip),
        // No master identity recorded for this session; the deploy-id match
        // alone decides.
        None => true,
    }
}

/// Deprecated last-resort ownership check by name prefix, for resources
/// created before tagging existed. Callers must only consult this when the
/// resource has no tags at all, and must log the deprecation warning.
pub fn matches_name_fallback(resource_name: &str, deploy_id: &str) -> bool {
    !deploy_id.is_empty() && resource_name.starts_with(deploy_id)
}
