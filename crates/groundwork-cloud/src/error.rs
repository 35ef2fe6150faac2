//! Core error types for the provisioning engine

use crate::api::ApiError;
use crate::resource::ResourceKind;
use thiserror::Error;

/// Errors surfaced by the orchestration core and resource controllers
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("provider API error: {0}")]
    Api(#[from] ApiError),

    #[error("{kind} '{name}': dependency {dep_kind} '{dep_name}' not found in deployment ledger")]
    DependencyNotFound {
        kind: ResourceKind,
        name: String,
        dep_kind: ResourceKind,
        dep_name: String,
    },

    #[error("{kind} '{name}' creation failed: {reason}")]
    CreationFailed {
        kind: ResourceKind,
        name: String,
        reason: String,
    },

    #[error("deletion of {id} failed: {reason}")]
    DeletionFailed { id: String, reason: String },

    #[error("timed out waiting for {subject} after {attempts} polls")]
    PollTimeout { subject: String, attempts: u32 },

    #[error("{subject} entered a terminal failure state: {reason}")]
    WaitFailed { subject: String, reason: String },

    #[error("credentials for provider {0} unavailable: {1}")]
    Credentials(String, String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no controller registered for resource kind {0}")]
    UnknownKind(ResourceKind),

    #[error("ledger store error: {0}")]
    Store(String),

    #[error("DNS registration failed: {0}")]
    Dns(String),

    #[error("configuration agent failed on {node}: {reason}")]
    ConfigAgent { node: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CloudError {
    /// Whether this error is a dependency-resolution failure (never retried).
    pub fn is_dependency_error(&self) -> bool {
        matches!(self, CloudError::DependencyNotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;
