//! CloudFormation stack controller
//!
//! A stack is the bootstrap resource of a deployment: it usually carries the
//! VPC, subnets and security groups everything else references. After the
//! stack reaches CREATE_COMPLETE the controller walks its resources, tags
//! them with the deployment ownership set, and records the interesting ones
//! (instances, security groups, subnets, VPCs) in the ledger under names the
//! dependent controllers can resolve.

use crate::cli::AwsCli;
use async_trait::async_trait;
use groundwork_cloud::poll::{wait_for, PollOutcome, PollPolicy};
use groundwork_cloud::{
    matches_deployment, standard_tags, Capabilities, CleanupOptions, CleanupReport, CloudError,
    Endpoint, FindCriteria, PhysicalResource, ResourceController, ResourceDescriptor,
    ResourceKind, ResourceStatus, Result, Services, Tag, TAG_NAME,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct StackParameter {
    parameter_key: String,
    parameter_value: String,
}

#[derive(Debug, Default, Deserialize)]
struct StackConfig {
    #[serde(default)]
    template_body: Option<String>,
    #[serde(default)]
    template_url: Option<String>,
    #[serde(default)]
    parameters: Vec<StackParameter>,
    /// CloudFormation OnFailure behavior ("ROLLBACK", "DELETE", "DO_NOTHING")
    #[serde(default)]
    on_failure: Option<String>,
}

pub struct StackController {
    services: Arc<Services>,
    region: String,
    poll: PollPolicy,
}

impl StackController {
    pub fn new(services: Arc<Services>, region: impl Into<String>) -> Self {
        Self {
            services,
            region: region.into(),
            poll: PollPolicy::default(),
        }
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    fn endpoint(&self) -> Arc<Endpoint> {
        self.services
            .endpoints
            .get_or_insert_with("aws", "cloudformation", &self.region, || {
                Endpoint::with_default_backoff(Arc::new(AwsCli::new(
                    "cloudformation",
                    &self.region,
                )))
            })
    }

    fn ec2(&self) -> Arc<Endpoint> {
        self.services
            .endpoints
            .get_or_insert_with("aws", "ec2", &self.region, || {
                Endpoint::with_default_backoff(Arc::new(AwsCli::new("ec2", &self.region)))
            })
    }

    async fn describe_stack(&self, endpoint: &Endpoint, stack_name: &str) -> Result<Option<Value>> {
        match endpoint
            .call("DescribeStacks", json!({"StackName": stack_name}))
            .await
        {
            Ok(resp) => Ok(resp
                .get("Stacks")
                .and_then(Value::as_array)
                .and_then(|a| a.first())
                .cloned()),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn wait_terminal(&self, endpoint: &Endpoint, stack_name: &str) -> Result<String> {
        let subject = format!("stack {stack_name}");
        wait_for(&subject, &self.poll, || async move {
            let resp = endpoint
                .call("DescribeStacks", json!({"StackName": stack_name}))
                .await?;
            let status = resp
                .get("Stacks")
                .and_then(Value::as_array)
                .and_then(|a| a.first())
                .and_then(|s| s.get("StackStatus"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if status == "CREATE_IN_PROGRESS" || status.is_empty() {
                Ok(PollOutcome::Pending)
            } else {
                Ok(PollOutcome::Ready(status))
            }
        })
        .await
    }

    /// CloudFormation buries the real failure in per-resource status
    /// reasons; pull them out so the operator sees more than CREATE_FAILED.
    async fn log_stack_errors(&self, endpoint: &Endpoint, stack_name: &str) {
        let resp = endpoint
            .call("DescribeStackResources", json!({"StackName": stack_name}))
            .await;
        let resources = match resp {
            Ok(resp) => resp
                .get("StackResources")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            Err(err) => {
                tracing::error!(stack_name, error = %err, "could not fetch stack resources");
                return;
            }
        };
        tracing::error!(stack_name, "stack creation failed");
        for resource in resources {
            let resource_type = resource.get("ResourceType").and_then(Value::as_str);
            let status = resource.get("ResourceStatus").and_then(Value::as_str);
            let reason = resource.get("ResourceStatusReason").and_then(Value::as_str);
            tracing::error!(resource_type, status, reason, "stack resource status");
        }
    }

    /// Tag each created sub-resource and record the ones dependents resolve
    /// through the ledger.
    async fn absorb_stack_resources(
        &self,
        endpoint: &Endpoint,
        descriptor: &ResourceDescriptor,
        stack_name: &str,
    ) -> Result<()> {
        let resp = endpoint
            .call("DescribeStackResources", json!({"StackName": stack_name}))
            .await?;
        let resources = resp
            .get("StackResources")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let ec2 = self.ec2();

        for resource in resources {
            let Some(physical_id) = resource
                .get("PhysicalResourceId")
                .and_then(Value::as_str)
            else {
                continue;
            };
            let logical_id = resource
                .get("LogicalResourceId")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let resource_type = resource
                .get("ResourceType")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let entry_name = format!("{}-{}", descriptor.name, logical_id);

            let kind = match resource_type {
                "AWS::EC2::Instance" => Some(ResourceKind::Instance.as_str()),
                "AWS::EC2::SecurityGroup" => Some("security_group"),
                "AWS::EC2::Subnet" => Some("subnet"),
                "AWS::EC2::VPC" => Some("vpc"),
                "AWS::EC2::InternetGateway" | "AWS::EC2::RouteTable" => None,
                _ => {
                    tracing::debug!(resource_type, physical_id, "skipping stack resource");
                    continue;
                }
            };

            // Taggable infrastructure gets the ownership set plus a
            // stack-scoped display name.
            let mut tags = standard_tags(&self.services.context, &descriptor.name);
            let display = format!(
                "{}-{}-{}",
                self.services.context.deploy_id, descriptor.name, logical_id
            );
            tags.retain(|t| t.key != TAG_NAME);
            tags.push(Tag::new(TAG_NAME, display));
            ec2.call(
                "CreateTags",
                json!({
                    "Resources": [physical_id],
                    "Tags": tags.iter().map(|t| json!({"Key": t.key, "Value": t.value})).collect::<Vec<_>>(),
                }),
            )
            .await?;

            let Some(kind) = kind else { continue };
            let metadata = match kind {
                "instance" => {
                    // Dependents want addresses, not just the id.
                    let desc = ec2
                        .call("DescribeInstances", json!({"InstanceIds": [physical_id]}))
                        .await?;
                    let instance = desc
                        .pointer("/Reservations/0/Instances/0")
                        .cloned()
                        .unwrap_or_default();
                    json!({
                        "stack": descriptor.name,
                        "id": physical_id,
                        "private_ip": instance.get("PrivateIpAddress"),
                        "public_ip": instance.get("PublicIpAddress"),
                        "private_dns": instance.get("PrivateDnsName"),
                    })
                }
                "security_group" => json!({"stack": descriptor.name, "group_id": physical_id}),
                "subnet" => json!({"stack": descriptor.name, "id": physical_id}),
                "vpc" => json!({"stack": descriptor.name, "id": physical_id}),
                _ => continue,
            };
            self.services.ledger.notify(kind, &entry_name, metadata).await;
        }
        Ok(())
    }

    async fn compensate(&self, endpoint: &Endpoint, stack_name: &str) {
        tracing::warn!(stack_name, "deleting failed stack");
        if let Err(err) = endpoint
            .call_capped("DeleteStack", json!({"StackName": stack_name}), 3)
            .await
        {
            tracing::error!(stack_name, error = %err, "failed to delete stack");
        }
    }

    fn stack_name(&self, logical_name: &str) -> String {
        self.services
            .context
            .resource_name(logical_name, Some(128))
            .replace(['_', '.'], "-")
    }
}

fn physical_from(stack: &Value) -> PhysicalResource {
    let status = match stack.get("StackStatus").and_then(Value::as_str) {
        Some("CREATE_COMPLETE") | Some("UPDATE_COMPLETE") => ResourceStatus::Available,
        Some("CREATE_IN_PROGRESS") => ResourceStatus::Creating,
        Some("DELETE_IN_PROGRESS") => ResourceStatus::Deleting,
        Some("DELETE_COMPLETE") => ResourceStatus::Deleted,
        Some("CREATE_FAILED") => ResourceStatus::CreateFailed,
        Some("DELETE_FAILED") => ResourceStatus::DeleteFailed,
        _ => ResourceStatus::Creating,
    };
    PhysicalResource {
        id: stack
            .get("StackName")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        status,
        tags: stack
            .get("Tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(|t| {
                        Some(Tag::new(
                            t.get("Key")?.as_str()?,
                            t.get("Value")?.as_str()?,
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default(),
        attributes: stack.clone(),
    }
}

#[async_trait]
impl ResourceController for StackController {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Stack
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            deps_wait_on_my_creation: true,
            waits_on_parent_completion: false,
        }
    }

    async fn create(&self, descriptor: &ResourceDescriptor) -> Result<String> {
        let config: StackConfig = descriptor.parse_config()?;
        if config.template_body.is_none() && config.template_url.is_none() {
            return Err(CloudError::InvalidConfig(format!(
                "stack '{}' needs template_body or template_url",
                descriptor.name
            )));
        }
        let endpoint = self.endpoint();
        let stack_name = self.stack_name(&descriptor.name);
        let tags = standard_tags(&self.services.context, &descriptor.name);

        let mut request = json!({
            "StackName": stack_name,
            "Tags": tags.iter().map(|t| json!({"Key": t.key, "Value": t.value})).collect::<Vec<_>>(),
            "Parameters": config
                .parameters
                .iter()
                .map(|p| json!({"ParameterKey": p.parameter_key, "ParameterValue": p.parameter_value}))
                .collect::<Vec<_>>(),
        });
        if let Some(body) = &config.template_body {
            request["TemplateBody"] = json!(body);
        } else if let Some(url) = &config.template_url {
            request["TemplateURL"] = json!(url);
        }
        if let Some(on_failure) = &config.on_failure {
            request["OnFailure"] = json!(on_failure);
        }

        let _guard = self.services.locks.lock(&stack_name).await;
        tracing::info!(stack_name, region = %self.region, "creating stack");
        endpoint.call("CreateStack", request).await?;

        let status = self.wait_terminal(&endpoint, &stack_name).await?;
        if status != "CREATE_COMPLETE" {
            self.log_stack_errors(&endpoint, &stack_name).await;
            self.compensate(&endpoint, &stack_name).await;
            return Err(CloudError::CreationFailed {
                kind: ResourceKind::Stack,
                name: descriptor.name.clone(),
                reason: format!("stack ended in state {status}"),
            });
        }

        if let Err(err) = self
            .absorb_stack_resources(&endpoint, descriptor, &stack_name)
            .await
        {
            // The stack itself is healthy; record it even if tagging one of
            // its members hiccuped.
            tracing::error!(stack_name, error = %err, "error processing created stack resources");
        }

        self.services
            .ledger
            .notify(
                ResourceKind::Stack.as_str(),
                &descriptor.name,
                json!({"stack_name": stack_name, "region": self.region}),
            )
            .await;
        tracing::info!(stack_name, "stack complete");
        Ok(stack_name)
    }

    async fn find(&self, criteria: &FindCriteria) -> Result<Option<PhysicalResource>> {
        if criteria.is_empty() {
            return Ok(None);
        }
        let endpoint = self.endpoint();

        let mut id = criteria.id.clone();
        if let Some(name) = &criteria.name {
            if let Some(meta) = self
                .services
                .ledger
                .lookup(ResourceKind::Stack.as_str(), name)
                .await
            {
                if id.is_none() {
                    id = meta
                        .get("stack_name")
                        .and_then(Value::as_str)
                        .map(String::from);
                }
            }
        }
        if let Some(id) = &id {
            if let Some(stack) = self.describe_stack(&endpoint, id).await? {
                return Ok(Some(physical_from(&stack)));
            }
        }
        if let Some((key, value)) = &criteria.tag {
            let resp = endpoint.call("DescribeStacks", json!({})).await?;
            let stacks = resp
                .get("Stacks")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for stack in &stacks {
                let found = physical_from(stack);
                if found.tags.iter().any(|t| &t.key == key && &t.value == value) {
                    return Ok(Some(found));
                }
            }
        }
        Ok(None)
    }

    async fn cleanup(&self, deploy_id: &str, options: &CleanupOptions) -> Result<CleanupReport> {
        let endpoint = self.endpoint();
        let master_ip = self.services.context.master_ip.as_deref();
        let mut report = CleanupReport::default();

        let resp = endpoint.call("DescribeStacks", json!({})).await?;
        let stacks = resp
            .get("Stacks")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for stack in stacks {
            let physical = physical_from(&stack);
            if physical.id.is_empty()
                || !matches_deployment(&physical.tags, deploy_id, master_ip, options.ignoremaster)
            {
                continue;
            }
            let stack_name = physical.id.clone();
            report.candidates.push(stack_name.clone());
            if options.noop {
                tracing::info!(stack_name, "would delete stack");
                continue;
            }

            let _guard = self.services.locks.lock(&stack_name).await;
            if physical.status != ResourceStatus::Deleting {
                tracing::info!(stack_name, "deleting stack");
                if let Err(err) = endpoint
                    .call("DeleteStack", json!({"StackName": stack_name.clone()}))
                    .await
                {
                    if !err.is_not_found() {
                        report.failed.push((stack_name.clone(), err.to_string()));
                        continue;
                    }
                }
            }

            if options.wait {
                let subject = format!("deletion of stack {stack_name}");
                let ep = &endpoint;
                let name = stack_name.as_str();
                let wait = wait_for(&subject, &self.poll, || async move {
                    // A vanished stack reads as successful deletion.
                    match self.describe_stack(ep, name).await {
                        Ok(None) => Ok(PollOutcome::Ready(())),
                        Ok(Some(stack)) => {
                            match stack.get("StackStatus").and_then(Value::as_str) {
                                Some("DELETE_COMPLETE") => Ok(PollOutcome::Ready(())),
                                Some("DELETE_FAILED") => Ok(PollOutcome::Failed(
                                    stack
                                        .get("StackStatusReason")
                                        .and_then(Value::as_str)
                                        .unwrap_or("DELETE_FAILED")
                                        .to_string(),
                                )),
                                _ => Ok(PollOutcome::Pending),
                            }
                        }
                        Err(CloudError::Api(err)) => Err(err),
                        Err(err) => Ok(PollOutcome::Failed(err.to_string())),
                    }
                })
                .await;
                if let Err(err) = wait {
                    report.failed.push((stack_name.clone(), err.to_string()));
                    continue;
                }
            }
            report.deleted.push(stack_name);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use groundwork_cloud::mock::MockApi;
    use groundwork_cloud::{BackoffPolicy, DeployContext};
    use std::time::Duration;

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy {
            short_delay: Duration::from_millis(1),
            medium_delay: Duration::from_millis(1),
            long_delay: Duration::from_millis(1),
            ..BackoffPolicy::default()
        }
    }

    fn fast_poll() -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(1),
            max_attempts: 20,
            heartbeat_every: 5,
            escalate_after: 10,
        }
    }

    fn harness() -> (Arc<Services>, Arc<MockApi>, Arc<MockApi>, StackController) {
        let services = Services::new(DeployContext::new("demo-1234"));
        let cfn = Arc::new(MockApi::new("aws", "cloudformation"));
        let ec2 = Arc::new(MockApi::new("aws", "ec2"));
        services.endpoints.register(
            "aws",
            "cloudformation",
            "us-east-1",
            Arc::new(Endpoint::new(cfn.clone(), fast_backoff())),
        );
        services.endpoints.register(
            "aws",
            "ec2",
            "us-east-1",
            Arc::new(Endpoint::new(ec2.clone(), fast_backoff())),
        );
        let controller =
            StackController::new(services.clone(), "us-east-1").with_poll_policy(fast_poll());
        (services, cfn, ec2, controller)
    }

    fn descriptor() -> ResourceDescriptor {
        ResourceDescriptor::new(ResourceKind::Stack, "net")
            .with_region("us-east-1")
            .with_config(json!({"template_body": "{}"}))
    }

    fn stack_status(status: &str) -> Value {
        json!({"Stacks": [{"StackName": "demo-1234-NET", "StackStatus": status}]})
    }

    #[tokio::test]
    async fn test_create_records_sub_resources() {
        let (services, cfn, ec2, controller) = harness();
        cfn.stage_ok("CreateStack", json!({"StackId": "arn:stack/demo"}));
        cfn.stage_ok("DescribeStacks", stack_status("CREATE_IN_PROGRESS"));
        cfn.stage_ok("DescribeStacks", stack_status("CREATE_COMPLETE"));
        cfn.stage_ok(
            "DescribeStackResources",
            json!({"StackResources": [
                {"ResourceType": "AWS::EC2::SecurityGroup", "LogicalResourceId": "WebSG",
                 "PhysicalResourceId": "sg-111"},
                {"ResourceType": "AWS::EC2::Subnet", "LogicalResourceId": "SubnetA",
                 "PhysicalResourceId": "subnet-222"},
                {"ResourceType": "AWS::EC2::Route", "LogicalResourceId": "Route",
                 "PhysicalResourceId": "r-333"}
            ]}),
        );

        let id = controller.create(&descriptor()).await.unwrap();
        assert_eq!(id, "demo-1234-NET");

        // Both taggable resources were tagged, the route was skipped.
        assert_eq!(ec2.calls_for("CreateTags").len(), 2);
        let sg = services
            .ledger
            .lookup("security_group", "net-WebSG")
            .await
            .unwrap();
        assert_eq!(sg["group_id"], json!("sg-111"));
        assert!(services.ledger.lookup("subnet", "net-SubnetA").await.is_some());
        assert!(services.ledger.lookup("stack", "net").await.is_some());
    }

    #[tokio::test]
    async fn test_create_failed_logs_and_compensates() {
        let (_services, cfn, _ec2, controller) = harness();
        cfn.stage_ok("CreateStack", json!({}));
        cfn.stage_ok("DescribeStacks", stack_status("CREATE_FAILED"));
        cfn.stage_ok(
            "DescribeStackResources",
            json!({"StackResources": [
                {"ResourceType": "AWS::EC2::VPC", "ResourceStatus": "CREATE_FAILED",
                 "ResourceStatusReason": "The maximum number of VPCs has been reached"}
            ]}),
        );
        cfn.stage_ok("DeleteStack", json!({}));

        let err = controller.create(&descriptor()).await.unwrap_err();
        assert!(matches!(err, CloudError::CreationFailed { .. }));
        assert_eq!(cfn.calls_for("DeleteStack").len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_wait_tolerates_vanished_stack() {
        let (_services, cfn, _ec2, controller) = harness();
        cfn.stage_ok(
            "DescribeStacks",
            json!({"Stacks": [{
                "StackName": "demo-1234-NET",
                "StackStatus": "CREATE_COMPLETE",
                "Tags": [{"Key": "gw-deploy-id", "Value": "demo-1234"}]
            }]}),
        );
        cfn.stage_ok("DeleteStack", json!({}));
        cfn.stage_ok("DescribeStacks", stack_status("DELETE_IN_PROGRESS"));
        // The CLI layer classifies "Stack ... does not exist" as not-found.
        cfn.stage_err(
            "DescribeStacks",
            groundwork_cloud::ApiError::not_found(
                "DescribeStacks",
                "Stack with id demo-1234-NET does not exist",
            ),
        );

        let report = controller
            .cleanup(
                "demo-1234",
                &CleanupOptions {
                    wait: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(report.deleted, vec!["demo-1234-NET"]);
        assert!(report.failed.is_empty());
    }
}
