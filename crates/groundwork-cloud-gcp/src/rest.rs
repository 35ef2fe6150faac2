//! Google Compute Engine REST transport
//!
//! Direct JSON REST implementation against the compute v1 API with Bearer
//! token authentication. Mutating calls return long-running operations;
//! `invoke` absorbs those by polling the operation until `DONE` so callers
//! see one synchronous-looking call per operation name.

use crate::error::classify_status;
use async_trait::async_trait;
use groundwork_cloud::{ApiError, ProviderApi};
use serde_json::Value;
use std::time::Duration;

const COMPUTE_API_BASE: &str = "https://compute.googleapis.com/compute/v1";

/// How long an operation may stay pending before we give up on it.
const OPERATION_POLL_CAP: u32 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Get,
    Post,
    Delete,
}

/// Operation table for the compute service. Placeholders in the path are
/// filled from the invoke arguments; `{project}` comes from the transport.
const COMPUTE_OPS: &[(&str, Method, &str)] = &[
    ("InsertInstance", Method::Post, "/projects/{project}/zones/{zone}/instances"),
    ("GetInstance", Method::Get, "/projects/{project}/zones/{zone}/instances/{name}"),
    ("ListInstances", Method::Get, "/projects/{project}/zones/{zone}/instances"),
    ("DeleteInstance", Method::Delete, "/projects/{project}/zones/{zone}/instances/{name}"),
    (
        "SetInstanceLabels",
        Method::Post,
        "/projects/{project}/zones/{zone}/instances/{name}/setLabels",
    ),
    ("ListDisks", Method::Get, "/projects/{project}/zones/{zone}/disks"),
    ("DeleteDisk", Method::Delete, "/projects/{project}/zones/{zone}/disks/{name}"),
    ("GetZoneOperation", Method::Get, "/projects/{project}/zones/{zone}/operations/{name}"),
];

fn lookup(operation: &str) -> Option<(Method, &'static str)> {
    COMPUTE_OPS
        .iter()
        .find(|(name, _, _)| *name == operation)
        .map(|(_, method, path)| (*method, *path))
}

/// Fill path placeholders from the project id and the invoke args.
fn build_path(template: &str, project: &str, args: &Value) -> Result<String, String> {
    let mut path = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        path.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(|| "unbalanced placeholder".to_string())?;
        let key = &after[..close];
        let value = if key == "project" {
            Some(project)
        } else {
            args.get(key).and_then(Value::as_str)
        };
        match value {
            Some(v) => path.push_str(v),
            None => return Err(format!("missing argument '{key}'")),
        }
        rest = &after[close + 1..];
    }
    path.push_str(rest);
    Ok(path)
}

/// What one poll of a pending operation tells us.
#[derive(Debug, PartialEq, Eq)]
enum OperationStep {
    Pending,
    Done,
}

/// Interpret the result of fetching a long-running operation. A vanished
/// operation means it completed and was garbage collected, so `notFound` on
/// the poll counts as done. An operation that finished with an embedded
/// error block is a permanent failure.
fn operation_step(
    fetched: Result<Value, ApiError>,
) -> Result<OperationStep, ApiError> {
    match fetched {
        Ok(op) => {
            if let Some(err) = op.get("error").and_then(|e| e.get("errors")).and_then(Value::as_array)
            {
                let detail = err
                    .iter()
                    .filter_map(|e| e.get("message").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(ApiError::permanent(
                    "GetZoneOperation",
                    err.first()
                        .and_then(|e| e.get("code"))
                        .and_then(Value::as_str)
                        .unwrap_or("OperationFailed"),
                    detail,
                ));
            }
            match op.get("status").and_then(Value::as_str) {
                Some("DONE") => Ok(OperationStep::Done),
                _ => Ok(OperationStep::Pending),
            }
        }
        Err(err) if err.is_not_found() => Ok(OperationStep::Done),
        Err(err) => Err(err),
    }
}

/// An operation that never reached `DONE` within the poll cap. Permanent:
/// the mutating call that produced it already went through, so letting the
/// endpoint retry executor re-issue it would duplicate the mutation.
fn operation_timeout(name: &str) -> ApiError {
    ApiError::permanent(
        "GetZoneOperation",
        "OperationTimeout",
        format!("operation {name} did not reach DONE"),
    )
}

/// Compute Engine transport for one project.
pub struct ComputeRest {
    client: reqwest::Client,
    project: String,
    access_token: String,
    poll_interval: Duration,
}

impl ComputeRest {
    pub fn new(project: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            project: project.into(),
            access_token: access_token.into(),
            poll_interval: Duration::from_secs(7),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn send(
        &self,
        operation: &str,
        method: Method,
        path: &str,
        args: &Value,
    ) -> Result<Value, ApiError> {
        let url = format!("{COMPUTE_API_BASE}{path}");
        let mut request = match method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
            Method::Delete => self.client.delete(&url),
        };
        request = request.bearer_auth(&self.access_token);
        if let Some(filter) = args.get("filter").and_then(Value::as_str).filter(|f| !f.is_empty()) {
            request = request.query(&[("filter", filter)]);
        }
        if method == Method::Post {
            let body = args.get("body").cloned().unwrap_or_else(|| Value::Object(Default::default()));
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ApiError::transient(operation, "Network", e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::transient(operation, "Network", e.to_string()))?;
        let parsed: Value = if body.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(&body)
                .map_err(|e| ApiError::permanent(operation, "MalformedResponse", e.to_string()))?
        };

        if !(200..300).contains(&status) {
            let message = parsed
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or(body.trim());
            return Err(classify_status(operation, status, message));
        }
        Ok(parsed)
    }

    /// Wait out a long-running zone operation returned by a mutating call.
    async fn absorb_operation(&self, op: &Value) -> Result<(), ApiError> {
        let name = match op.get("name").and_then(Value::as_str) {
            Some(name) => name.to_string(),
            None => return Ok(()),
        };
        let zone = op
            .get("zone")
            .and_then(Value::as_str)
            .and_then(|z| z.rsplit('/').next())
            .unwrap_or_default()
            .to_string();
        if operation_step(Ok(op.clone()))? == OperationStep::Done {
            return Ok(());
        }

        let (method, template) = match lookup("GetZoneOperation") {
            Some(spec) => spec,
            None => return Ok(()),
        };
        let args = serde_json::json!({"zone": zone, "name": name});
        let path = build_path(template, &self.project, &args)
            .map_err(|reason| ApiError::permanent("GetZoneOperation", "MissingArgument", reason))?;

        for _ in 0..OPERATION_POLL_CAP {
            tokio::time::sleep(self.poll_interval).await;
            let fetched = self.send("GetZoneOperation", method, &path, &args).await;
            match operation_step(fetched)? {
                OperationStep::Done => return Ok(()),
                OperationStep::Pending => {
                    tracing::debug!(operation = %name, "compute operation still pending");
                }
            }
        }
        Err(operation_timeout(&name))
    }
}

#[async_trait]
impl ProviderApi for ComputeRest {
    fn provider(&self) -> &str {
        "gcp"
    }

    fn service(&self) -> &str {
        "compute"
    }

    async fn invoke(&self, operation: &str, args: Value) -> Result<Value, ApiError> {
        let (method, template) = lookup(operation).ok_or_else(|| ApiError::unknown_operation(operation))?;
        let path = build_path(template, &self.project, &args)
            .map_err(|reason| ApiError::permanent(operation, "MissingArgument", reason))?;
        let response = self.send(operation, method, &path, &args).await?;

        if response.get("kind").and_then(Value::as_str) == Some("compute#operation") {
            self.absorb_operation(&response).await?;
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builds_paths_from_args() {
        let args = json!({"zone": "us-central1-a", "name": "web-1"});
        let path = build_path(
            "/projects/{project}/zones/{zone}/instances/{name}",
            "my-proj",
            &args,
        )
        .unwrap();
        assert_eq!(path, "/projects/my-proj/zones/us-central1-a/instances/web-1");
    }

    #[test]
    fn missing_path_argument_is_reported() {
        let err = build_path(
            "/projects/{project}/zones/{zone}/instances",
            "my-proj",
            &json!({}),
        )
        .unwrap_err();
        assert!(err.contains("zone"));
    }

    #[test]
    fn unknown_operation_is_rejected() {
        assert!(lookup("ResizeInstance").is_none());
        assert!(lookup("InsertInstance").is_some());
    }

    #[test]
    fn vanished_operation_counts_as_done() {
        let step = operation_step(Err(ApiError::not_found(
            "GetZoneOperation",
            "operation-1234",
        )))
        .unwrap();
        assert_eq!(step, OperationStep::Done);
    }

    #[test]
    fn pending_and_done_statuses() {
        let pending = operation_step(Ok(json!({"status": "RUNNING"}))).unwrap();
        assert_eq!(pending, OperationStep::Pending);
        let done = operation_step(Ok(json!({"status": "DONE"}))).unwrap();
        assert_eq!(done, OperationStep::Done);
    }

    #[test]
    fn stuck_operation_is_not_retried() {
        let err = operation_timeout("operation-1234");
        assert_eq!(err.class, groundwork_cloud::ErrorClass::Permanent);
        assert_eq!(err.code, "OperationTimeout");
    }

    #[test]
    fn failed_operation_surfaces_error_detail() {
        let err = operation_step(Ok(json!({
            "status": "DONE",
            "error": {"errors": [{"code": "QUOTA_EXCEEDED", "message": "CPUS quota"}]}
        })))
        .unwrap_err();
        assert!(err.message.contains("CPUS quota"));
        assert_eq!(err.code, "QUOTA_EXCEEDED");
    }
}
