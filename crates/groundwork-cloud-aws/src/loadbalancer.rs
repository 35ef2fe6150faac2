//! Classic ELB load balancer controller

use crate::cli::AwsCli;
use async_trait::async_trait;
use groundwork_cloud::{
    matches_deployment, matches_name_fallback, standard_tags, Capabilities, CleanupOptions,
    CleanupReport, CloudError, Endpoint, FindCriteria, PhysicalResource, ResourceController,
    ResourceDescriptor, ResourceKind, ResourceStatus, Result, Services, Tag,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Retry budget for eventual-consistency races on a fresh create (a
/// security group that another controller created seconds ago).
const CREATE_RETRY_CAP: u32 = 8;

#[derive(Debug, Deserialize)]
struct Listener {
    lb_port: u16,
    lb_protocol: String,
    instance_port: u16,
    instance_protocol: String,
    #[serde(default)]
    ssl_certificate_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HealthCheck {
    target: String,
    interval: u32,
    timeout: u32,
    unhealthy_threshold: u32,
    healthy_threshold: u32,
}

#[derive(Debug, Deserialize)]
struct StickinessPolicy {
    name: String,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    cookie: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LoadBalancerConfig {
    #[serde(default)]
    listeners: Vec<Listener>,
    #[serde(default)]
    zones: Vec<String>,
    /// Logical names of security groups created earlier in this deployment
    #[serde(default)]
    security_groups: Vec<String>,
    #[serde(default)]
    subnets: Vec<String>,
    #[serde(default)]
    private: bool,
    #[serde(default)]
    healthcheck: Option<HealthCheck>,
    #[serde(default)]
    cross_zone: bool,
    #[serde(default)]
    idle_timeout: Option<u64>,
    #[serde(default)]
    connection_draining_timeout: Option<i64>,
    #[serde(default)]
    lb_cookie_stickiness_policy: Option<StickinessPolicy>,
    #[serde(default)]
    app_cookie_stickiness_policy: Option<StickinessPolicy>,
    /// Logical names of instances to register after creation
    #[serde(default)]
    instances: Vec<String>,
    #[serde(default)]
    dns_sync_wait: bool,
}

pub struct LoadBalancerController {
    services: Arc<Services>,
    region: String,
}

impl LoadBalancerController {
    pub fn new(services: Arc<Services>, region: impl Into<String>) -> Self {
        Self {
            services,
            region: region.into(),
        }
    }

    fn endpoint(&self) -> Arc<Endpoint> {
        self.services
            .endpoints
            .get_or_insert_with("aws", "elb", &self.region, || {
                Endpoint::with_default_backoff(Arc::new(AwsCli::new("elb", &self.region)))
            })
    }

    async fn resolve_security_groups(
        &self,
        descriptor: &ResourceDescriptor,
        logical: &[String],
    ) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(logical.len());
        for name in logical {
            let meta = self
                .services
                .ledger
                .lookup("security_group", name)
                .await
                .ok_or_else(|| CloudError::DependencyNotFound {
                    kind: ResourceKind::LoadBalancer,
                    name: descriptor.name.clone(),
                    dep_kind: ResourceKind::Stack,
                    dep_name: name.clone(),
                })?;
            match meta.get("group_id").and_then(Value::as_str) {
                Some(id) => ids.push(id.to_string()),
                None => {
                    return Err(CloudError::InvalidConfig(format!(
                        "security group '{name}' has no group_id in its deployment record"
                    )))
                }
            }
        }
        Ok(ids)
    }

    fn build_create_request(
        &self,
        lb_name: &str,
        config: &LoadBalancerConfig,
        security_group_ids: &[String],
        tags: &[Tag],
    ) -> Value {
        let listeners: Vec<Value> = config
            .listeners
            .iter()
            .map(|l| {
                let mut listener = json!({
                    "LoadBalancerPort": l.lb_port,
                    "Protocol": l.lb_protocol,
                    "InstancePort": l.instance_port,
                    "InstanceProtocol": l.instance_protocol,
                });
                if let Some(cert) = &l.ssl_certificate_id {
                    listener["SSLCertificateId"] = json!(cert);
                }
                listener
            })
            .collect();

        let mut request = json!({
            "LoadBalancerName": lb_name,
            "Listeners": listeners,
            "Tags": tags.iter().map(aws_tag).collect::<Vec<_>>(),
        });

        if config.subnets.is_empty() {
            request["AvailabilityZones"] = json!(config.zones);
        } else {
            request["Subnets"] = json!(config.subnets);
            request["SecurityGroups"] = json!(security_group_ids);
            if config.private {
                request["Scheme"] = json!("internal");
            }
        }
        request
    }

    /// Post-create configuration. Any failure here leaves a live but
    /// half-configured balancer, which the caller compensates for.
    async fn configure(
        &self,
        endpoint: &Endpoint,
        lb_name: &str,
        dns_name: &str,
        config: &LoadBalancerConfig,
    ) -> Result<()> {
        if let Some(hc) = &config.healthcheck {
            tracing::info!(lb_name, target = %hc.target, "configuring custom health check");
            endpoint
                .call(
                    "ConfigureHealthCheck",
                    json!({
                        "LoadBalancerName": lb_name,
                        "HealthCheck": {
                            "Target": hc.target,
                            "Interval": hc.interval,
                            "Timeout": hc.timeout,
                            "UnhealthyThreshold": hc.unhealthy_threshold,
                            "HealthyThreshold": hc.healthy_threshold,
                        }
                    }),
                )
                .await?;
        }

        if config.cross_zone {
            tracing::info!(dns_name, "enabling cross-zone load balancing");
            self.modify_attributes(
                endpoint,
                lb_name,
                json!({"CrossZoneLoadBalancing": {"Enabled": true}}),
            )
            .await?;
        }

        if let Some(idle) = config.idle_timeout {
            tracing::info!(dns_name, idle_timeout = idle, "setting idle timeout");
            self.modify_attributes(
                endpoint,
                lb_name,
                json!({"ConnectionSettings": {"IdleTimeout": idle}}),
            )
            .await?;
        }

        if let Some(draining) = config.connection_draining_timeout {
            let attrs = if draining >= 0 {
                tracing::info!(dns_name, timeout = draining, "setting connection draining");
                json!({"ConnectionDraining": {"Enabled": true, "Timeout": draining}})
            } else {
                tracing::info!(dns_name, "disabling connection draining");
                json!({"ConnectionDraining": {"Enabled": false}})
            };
            self.modify_attributes(endpoint, lb_name, attrs).await?;
        }

        if let Some(policy) = &config.lb_cookie_stickiness_policy {
            let mut request = json!({
                "LoadBalancerName": lb_name,
                "PolicyName": policy.name,
            });
            if let Some(timeout) = policy.timeout {
                request["CookieExpirationPeriod"] = json!(timeout);
            }
            endpoint.call("CreateLBCookieStickinessPolicy", request).await?;
            self.attach_listener_policy(endpoint, lb_name, &policy.name, config)
                .await?;
        }

        if let Some(policy) = &config.app_cookie_stickiness_policy {
            let cookie = policy.cookie.clone().ok_or_else(|| {
                CloudError::InvalidConfig(
                    "app cookie stickiness policy requires a cookie name".to_string(),
                )
            })?;
            endpoint
                .call(
                    "CreateAppCookieStickinessPolicy",
                    json!({
                        "LoadBalancerName": lb_name,
                        "PolicyName": policy.name,
                        "CookieName": cookie,
                    }),
                )
                .await?;
            self.attach_listener_policy(endpoint, lb_name, &policy.name, config)
                .await?;
        }

        Ok(())
    }

    async fn modify_attributes(
        &self,
        endpoint: &Endpoint,
        lb_name: &str,
        attributes: Value,
    ) -> Result<()> {
        endpoint
            .call(
                "ModifyLoadBalancerAttributes",
                json!({
                    "LoadBalancerName": lb_name,
                    "LoadBalancerAttributes": attributes,
                }),
            )
            .await?;
        Ok(())
    }

    /// Stickiness policies only apply to HTTP(S) listeners.
    async fn attach_listener_policy(
        &self,
        endpoint: &Endpoint,
        lb_name: &str,
        policy_name: &str,
        config: &LoadBalancerConfig,
    ) -> Result<()> {
        for listener in &config.listeners {
            let proto = listener.lb_protocol.to_ascii_uppercase();
            if proto == "HTTP" || proto == "HTTPS" {
                endpoint
                    .call(
                        "SetLoadBalancerPoliciesOfListener",
                        json!({
                            "LoadBalancerName": lb_name,
                            "LoadBalancerPort": listener.lb_port,
                            "PolicyNames": [policy_name],
                        }),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn register_instances(
        &self,
        endpoint: &Endpoint,
        descriptor: &ResourceDescriptor,
        lb_name: &str,
        logical: &[String],
    ) -> Result<()> {
        if logical.is_empty() {
            return Ok(());
        }
        let mut instance_ids = Vec::with_capacity(logical.len());
        for name in logical {
            let meta = self
                .services
                .ledger
                .lookup(ResourceKind::Instance.as_str(), name)
                .await
                .ok_or_else(|| CloudError::DependencyNotFound {
                    kind: ResourceKind::LoadBalancer,
                    name: descriptor.name.clone(),
                    dep_kind: ResourceKind::Instance,
                    dep_name: name.clone(),
                })?;
            if let Some(id) = meta.get("id").and_then(Value::as_str) {
                instance_ids.push(json!({"InstanceId": id}));
            }
        }
        endpoint
            .call(
                "RegisterInstancesWithLoadBalancer",
                json!({
                    "LoadBalancerName": lb_name,
                    "Instances": instance_ids,
                }),
            )
            .await?;
        Ok(())
    }

    /// Best-effort removal of a balancer we created but failed to finish.
    async fn compensate(&self, endpoint: &Endpoint, lb_name: &str) {
        tracing::warn!(lb_name, "removing partially created load balancer");
        if let Err(err) = endpoint
            .call_capped(
                "DeleteLoadBalancer",
                json!({"LoadBalancerName": lb_name}),
                3,
            )
            .await
        {
            tracing::error!(lb_name, error = %err, "failed to remove partial load balancer");
        }
    }

    async fn describe_all(&self, endpoint: &Endpoint) -> Result<Vec<Value>> {
        let resp = endpoint
            .call("DescribeLoadBalancers", json!({}))
            .await?;
        Ok(resp
            .get("LoadBalancerDescriptions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    async fn tags_of(&self, endpoint: &Endpoint, lb_name: &str) -> Result<Vec<Tag>> {
        let resp = endpoint
            .call("DescribeTags", json!({"LoadBalancerNames": [lb_name]}))
            .await?;
        let tags = resp
            .get("TagDescriptions")
            .and_then(Value::as_array)
            .and_then(|d| d.first())
            .and_then(|d| d.get("Tags"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(tags
            .iter()
            .filter_map(|t| {
                Some(Tag::new(
                    t.get("Key")?.as_str()?,
                    t.get("Value")?.as_str()?,
                ))
            })
            .collect())
    }
}

fn aws_tag(tag: &Tag) -> Value {
    json!({"Key": tag.key, "Value": tag.value})
}

fn physical_from(description: &Value) -> PhysicalResource {
    PhysicalResource {
        id: description
            .get("LoadBalancerName")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        status: ResourceStatus::Available,
        tags: Vec::new(),
        attributes: description.clone(),
    }
}

#[async_trait]
impl ResourceController for LoadBalancerController {
    fn kind(&self) -> ResourceKind {
        ResourceKind::LoadBalancer
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            deps_wait_on_my_creation: true,
            waits_on_parent_completion: false,
        }
    }

    async fn create(&self, descriptor: &ResourceDescriptor) -> Result<String> {
        let config: LoadBalancerConfig = descriptor.parse_config()?;
        let endpoint = self.endpoint();

        // ELB names: 32 chars, letters/digits/hyphens.
        let lb_name = self
            .services
            .context
            .resource_name(&descriptor.name, Some(32));

        let security_group_ids = self
            .resolve_security_groups(descriptor, &config.security_groups)
            .await?;
        let tags = standard_tags(&self.services.context, &descriptor.name);
        let request = self.build_create_request(&lb_name, &config, &security_group_ids, &tags);

        let _guard = self.services.locks.lock(&lb_name).await;

        tracing::info!(lb_name, region = %self.region, "creating load balancer");
        let resp = endpoint
            .call_capped("CreateLoadBalancer", request, CREATE_RETRY_CAP)
            .await?;
        let dns_name = resp
            .get("DNSName")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        tracing::info!(lb_name, dns_name, "load balancer is up");

        if let Err(err) = self
            .configure(&endpoint, &lb_name, &dns_name, &config)
            .await
        {
            self.compensate(&endpoint, &lb_name).await;
            return Err(err);
        }

        if let Err(err) = self
            .register_instances(&endpoint, descriptor, &lb_name, &config.instances)
            .await
        {
            self.compensate(&endpoint, &lb_name).await;
            return Err(err);
        }

        if let Err(err) = groundwork_cloud::collaborators::register_dns(
            self.services.dns.as_ref(),
            &lb_name.to_lowercase(),
            &dns_name,
            config.dns_sync_wait,
        )
        .await
        {
            self.compensate(&endpoint, &lb_name).await;
            return Err(err);
        }

        self.services
            .ledger
            .notify(
                ResourceKind::LoadBalancer.as_str(),
                &descriptor.name,
                json!({
                    "awsname": lb_name,
                    "dns": dns_name,
                    "security_groups": security_group_ids,
                }),
            )
            .await;

        Ok(lb_name)
    }

    async fn find(&self, criteria: &FindCriteria) -> Result<Option<PhysicalResource>> {
        if criteria.is_empty() {
            return Ok(None);
        }
        let endpoint = self.endpoint();

        // A logical name resolves through the deployment record first.
        let mut id = criteria.id.clone();
        let mut dns = criteria.secondary.clone();
        if let Some(name) = &criteria.name {
            if let Some(meta) = self
                .services
                .ledger
                .lookup(ResourceKind::LoadBalancer.as_str(), name)
                .await
            {
                if id.is_none() {
                    id = meta.get("awsname").and_then(Value::as_str).map(String::from);
                }
                if dns.is_none() {
                    dns = meta.get("dns").and_then(Value::as_str).map(String::from);
                }
            }
        }

        let descriptions = self.describe_all(&endpoint).await?;
        if let Some(id) = &id {
            if let Some(lb) = descriptions
                .iter()
                .find(|lb| lb.get("LoadBalancerName").and_then(Value::as_str) == Some(id))
            {
                return Ok(Some(physical_from(lb)));
            }
        }
        if let Some(dns) = &dns {
            if let Some(lb) = descriptions
                .iter()
                .find(|lb| lb.get("DNSName").and_then(Value::as_str) == Some(dns))
            {
                return Ok(Some(physical_from(lb)));
            }
        }
        if let Some((key, value)) = &criteria.tag {
            for lb in &descriptions {
                let Some(lb_name) = lb.get("LoadBalancerName").and_then(Value::as_str) else {
                    continue;
                };
                let tags = self.tags_of(&endpoint, lb_name).await?;
                if tags.iter().any(|t| &t.key == key && &t.value == value) {
                    let mut found = physical_from(lb);
                    found.tags = tags;
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

        for lb in self.describe_all(&endpoint).await? {
            let Some(lb_name) = lb.get("LoadBalancerName").and_then(Value::as_str) else {
                continue;
            };
            let tags = self.tags_of(&endpoint, lb_name).await?;

            let owned = if matches_deployment(&tags, deploy_id, master_ip, options.ignoremaster) {
                true
            } else if tags.is_empty() && matches_name_fallback(lb_name, deploy_id) {
                tracing::warn!(
                    lb_name,
                    "removing load balancer by name match (tags unavailable); this fallback is deprecated"
                );
                true
            } else {
                false
            };
            if !owned {
                continue;
            }

            report.candidates.push(lb_name.to_string());
            if options.noop {
                tracing::info!(lb_name, "would remove load balancer");
                continue;
            }

            let _guard = self.services.locks.lock(lb_name).await;
            if let Err(err) = self.services.dns.delete_record(&lb_name.to_lowercase()).await {
                tracing::warn!(lb_name, error = %err, "failed to remove DNS record");
            }
            tracing::info!(lb_name, "removing load balancer");
            match endpoint
                .call("DeleteLoadBalancer", json!({"LoadBalancerName": lb_name}))
                .await
            {
                Ok(_) => report.deleted.push(lb_name.to_string()),
                Err(err) if err.is_not_found() => report.deleted.push(lb_name.to_string()),
                Err(err) => report.failed.push((lb_name.to_string(), err.to_string())),
            }
        }
        Ok(report)
    }
}
