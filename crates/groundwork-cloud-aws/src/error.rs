//! AWS error classification
//!
//! Everything the `aws` CLI reports is folded into [`ApiError`] so the
//! endpoint retry executor can act on it; the classification tables here
//! decide transient vs permanent.

use groundwork_cloud::ApiError;

/// Codes AWS returns when the service itself is struggling. Always worth
/// retrying.
const THROTTLE_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "InternalError",
    "InternalFailure",
    "ServiceUnavailable",
    "Unavailable",
    "RequestTimeout",
    "RequestExpired",
];

/// Codes that show up when referencing a resource another call just created.
/// The resource usually materializes within a few seconds, so these are
/// retried like throttles.
const RACE_CODES: &[&str] = &[
    "InvalidGroup.NotFound",
    "InvalidSecurityGroupID.NotFound",
    "InvalidSubnetID.NotFound",
    "InvalidVpcID.NotFound",
    "InvalidParameterValue",
    "InvalidDBInstanceState",
    "DBSubnetGroupNotFoundFault",
];

/// Classify an AWS error code + message into an [`ApiError`].
pub fn classify(operation: &str, code: &str, message: &str) -> ApiError {
    if THROTTLE_CODES.contains(&code) || RACE_CODES.contains(&code) {
        ApiError::transient(operation, code, message)
    } else if code.contains("NotFound")
        || (code == "ValidationError" && message.contains("does not exist"))
    {
        // CloudFormation reports a missing stack as a ValidationError.
        ApiError::not_found(operation, message)
    } else {
        ApiError::permanent(operation, code, message)
    }
}

/// Parse the stderr of a failed `aws` invocation.
///
/// The CLI reports service errors as
/// `An error occurred (Code) when calling the Operation operation: message`.
/// Anything not in that shape (usage errors, missing binary PATH noise) is
/// treated as permanent.
pub fn parse_cli_error(operation: &str, stderr: &str) -> ApiError {
    let stderr = stderr.trim();
    if let Some(rest) = stderr.split("An error occurred (").nth(1) {
        if let Some((code, tail)) = rest.split_once(')') {
            let message = tail
                .split_once(':')
                .map(|(_, m)| m.trim())
                .unwrap_or(tail.trim());
            return classify(operation, code, message);
        }
    }
    ApiError::permanent(operation, "CliError", stderr)
}
