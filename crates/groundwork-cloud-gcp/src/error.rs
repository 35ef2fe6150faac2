//! Google Cloud HTTP status classification
//!
//! The compute transport reports every failure as an [`ApiError`]; the
//! mapping from HTTP status to transient/permanent/not-found lives here.

use groundwork_cloud::ApiError;

/// Classify an HTTP status + error body from the compute API.
///
/// 429 and 5xx are provider-side pressure and retryable. 404 maps to
/// not-found so callers can treat vanished resources as already deleted.
/// Everything else in 4xx is a request problem and will not improve with
/// retries.
pub fn classify_status(operation: &str, status: u16, message: &str) -> ApiError {
    if status == 429 || status >= 500 {
        ApiError::transient(operation, &format!("Http{status}"), message)
    } else if status == 404 {
        ApiError::not_found(operation, message)
    } else {
        ApiError::permanent(operation, &format!("Http{status}"), message)
    }
}
