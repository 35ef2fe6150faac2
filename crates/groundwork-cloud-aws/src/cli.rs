//! aws CLI wrapper
//!
//! One `AwsCli` instance binds a single service in a single region and
//! exposes it through the dynamic [`ProviderApi`] call surface. Each
//! service carries an explicit operation table mapping API operation names
//! to CLI subcommands; an operation missing from the table is rejected up
//! front instead of being shelled out blindly.

use crate::error::parse_cli_error;
use async_trait::async_trait;
use groundwork_cloud::{ApiError, ProviderApi};
use serde_json::Value;
use std::process::Stdio;
use tokio::process::Command;

/// (API operation, CLI subcommand) table for one service.
type OpTable = &'static [(&'static str, &'static str)];

const ELB_OPS: OpTable = &[
    ("CreateLoadBalancer", "create-load-balancer"),
    ("DeleteLoadBalancer", "delete-load-balancer"),
    ("DescribeLoadBalancers", "describe-load-balancers"),
    ("ConfigureHealthCheck", "configure-health-check"),
    (
        "ModifyLoadBalancerAttributes",
        "modify-load-balancer-attributes",
    ),
    ("AddTags", "add-tags"),
    ("DescribeTags", "describe-tags"),
    (
        "RegisterInstancesWithLoadBalancer",
        "register-instances-with-load-balancer",
    ),
    (
        "CreateLBCookieStickinessPolicy",
        "create-lb-cookie-stickiness-policy",
    ),
    (
        "CreateAppCookieStickinessPolicy",
        "create-app-cookie-stickiness-policy",
    ),
    (
        "SetLoadBalancerPoliciesOfListener",
        "set-load-balancer-policies-of-listener",
    ),
];

const RDS_OPS: OpTable = &[
    ("CreateDBInstance", "create-db-instance"),
    ("DeleteDBInstance", "delete-db-instance"),
    ("DescribeDBInstances", "describe-db-instances"),
    ("ModifyDBInstance", "modify-db-instance"),
    ("CreateDBSnapshot", "create-db-snapshot"),
    ("DescribeDBSnapshots", "describe-db-snapshots"),
    (
        "RestoreDBInstanceFromDBSnapshot",
        "restore-db-instance-from-db-snapshot",
    ),
    (
        "CreateDBInstanceReadReplica",
        "create-db-instance-read-replica",
    ),
    ("CreateDBSubnetGroup", "create-db-subnet-group"),
    ("DeleteDBSubnetGroup", "delete-db-subnet-group"),
    ("AddTagsToResource", "add-tags-to-resource"),
    ("ListTagsForResource", "list-tags-for-resource"),
];

const CLOUDFORMATION_OPS: OpTable = &[
    ("CreateStack", "create-stack"),
    ("DeleteStack", "delete-stack"),
    ("DescribeStacks", "describe-stacks"),
    ("DescribeStackEvents", "describe-stack-events"),
    ("DescribeStackResources", "describe-stack-resources"),
];

const EC2_OPS: OpTable = &[
    ("DescribeInstances", "describe-instances"),
    ("DescribeSecurityGroups", "describe-security-groups"),
    ("DescribeSubnets", "describe-subnets"),
    ("DescribeVpcs", "describe-vpcs"),
    ("CreateTags", "create-tags"),
];

fn table_for(service: &str) -> Option<OpTable> {
    match service {
        "elb" => Some(ELB_OPS),
        "rds" => Some(RDS_OPS),
        "cloudformation" => Some(CLOUDFORMATION_OPS),
        "ec2" => Some(EC2_OPS),
        _ => None,
    }
}

/// Look up the CLI subcommand for an operation.
pub fn subcommand(service: &str, operation: &str) -> Option<&'static str> {
    table_for(service)?
        .iter()
        .find(|(op, _)| *op == operation)
        .map(|(_, sub)| *sub)
}

/// aws CLI wrapper for one (service, region) pair.
pub struct AwsCli {
    service: String,
    region: String,
}

impl AwsCli {
    pub fn new(service: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            region: region.into(),
        }
    }

    async fn run(&self, operation: &str, sub: &str, args: &Value) -> Result<Value, ApiError> {
        let mut cmd = Command::new("aws");
        cmd.arg("--region")
            .arg(&self.region)
            .arg("--output")
            .arg("json")
            .arg(&self.service)
            .arg(sub);

        let has_args = args.as_object().map(|o| !o.is_empty()).unwrap_or(false);
        let rendered;
        if has_args {
            rendered = args.to_string();
            cmd.arg("--cli-input-json").arg(&rendered);
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        tracing::debug!(
            service = %self.service,
            region = %self.region,
            operation,
            "Running: aws {} {}",
            self.service,
            sub
        );

        let output = cmd.output().await.map_err(|e| {
            ApiError::permanent(operation, "CliSpawnFailed", e.to_string())
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(parse_cli_error(operation, &stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            // Mutating calls like delete-load-balancer print nothing.
            return Ok(Value::Object(Default::default()));
        }
        serde_json::from_str(stdout.trim())
            .map_err(|e| ApiError::permanent(operation, "MalformedOutput", e.to_string()))
    }
}

#[async_trait]
impl ProviderApi for AwsCli {
    fn provider(&self) -> &str {
        "aws"
    }

    fn service(&self) -> &str {
        &self.service
    }

    async fn invoke(&self, operation: &str, args: Value) -> Result<Value, ApiError> {
        let Some(sub) = subcommand(&self.service, operation) else {
            return Err(ApiError::unknown_operation(operation));
        };
        self.run(operation, sub, &args).await
    }
}
