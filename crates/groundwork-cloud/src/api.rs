//! Provider API seam
//!
//! Every cloud provider is reached through a single `invoke(operation, args)`
//! entry point backed by a provider-specific operation table. The transient /
//! permanent split on [`ApiError`] is what drives the retry executor in
//! [`crate::endpoint`].

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Classification of a provider API failure.
///
/// Transient errors (rate limiting, internal service errors, eventual
/// consistency races) are absorbed by the endpoint retry loop. Permanent
/// errors (bad parameters, authorization failures, unexpected not-found)
/// propagate immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

/// A failure returned by a provider API call, already classified.
#[derive(Error, Debug, Clone)]
#[error("{operation} failed ({code}): {message}")]
pub struct ApiError {
    /// The operation that was being invoked
    pub operation: String,

    /// Provider error code (e.g. "Throttling", "NotFound")
    pub code: String,

    /// Human-readable message from the provider
    pub message: String,

    /// Transient/permanent classification
    pub class: ErrorClass,
}

impl ApiError {
    pub fn transient(
        operation: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation: operation.into(),
            code: code.into(),
            message: message.into(),
            class: ErrorClass::Transient,
        }
    }

    pub fn permanent(
        operation: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation: operation.into(),
            code: code.into(),
            message: message.into(),
            class: ErrorClass::Permanent,
        }
    }

    /// A not-found error. Permanent, but callers that expect a resource to
    /// vanish (deletion polls, expired operation handles) can treat it as a
    /// terminal success via [`ApiError::is_not_found`].
    pub fn not_found(operation: impl Into<String>, what: impl Into<String>) -> Self {
        Self::permanent(operation, "NotFound", what)
    }

    /// An operation name missing from the provider's lookup table.
    pub fn unknown_operation(operation: impl Into<String>) -> Self {
        let operation = operation.into();
        let message = format!("operation '{}' is not in the provider's table", operation);
        Self::permanent(operation, "UnknownOperation", message)
    }

    pub fn is_transient(&self) -> bool {
        self.class == ErrorClass::Transient
    }

    /// Provider not-found codes vary ("NotFound", "DBInstanceNotFound",
    /// "InvalidGroup.NotFound"); match on the suffix convention.
    pub fn is_not_found(&self) -> bool {
        self.code.contains("NotFound")
    }
}

/// A cloud provider's API surface behind one dynamic call interface.
///
/// Implementations hold one provider service (e.g. AWS ELB in one region)
/// and forward `invoke` through an explicit operation lookup table. Unknown
/// operations must fail with [`ApiError::unknown_operation`] rather than
/// being passed through blindly.
///
/// Implementations must be safe for concurrent use; any retry or polling
/// state belongs to the caller, not the API object.
#[async_trait]
pub trait ProviderApi: Send + Sync {
    /// Provider name, e.g. "aws" or "gcp"
    fn provider(&self) -> &str;

    /// Service within the provider, e.g. "elb", "rds", "compute"
    fn service(&self) -> &str;

    /// Invoke a named provider operation with JSON arguments.
    async fn invoke(&self, operation: &str, args: Value) -> std::result::Result<Value, ApiError>;
}
