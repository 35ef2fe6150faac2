//! Compute Engine instance controller

use crate::rest::ComputeRest;
use async_trait::async_trait;
use groundwork_cloud::collaborators::{register_dns, ConfigAgent, Credentials, NodeHandle};
use groundwork_cloud::{
    wait_for, Capabilities, CleanupOptions, CleanupReport, CloudError, Endpoint,
    FindCriteria, PhysicalResource, PollOutcome, PollPolicy, ResourceController,
    ResourceDescriptor, ResourceKind, ResourceStatus, Result, Services, Tag, TAG_DEPLOY_ID,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Compensating deletes get a small retry budget of their own.
const COMPENSATE_RETRY_CAP: u32 = 3;

#[derive(Debug, Deserialize)]
struct DiskSpec {
    device: String,
    size_gb: u64,
}

#[derive(Debug, Deserialize)]
struct InstanceConfig {
    machine_type: String,
    image: String,
    #[serde(default)]
    network: Option<String>,
    #[serde(default)]
    subnetwork: Option<String>,
    #[serde(default)]
    associate_public_ip: bool,
    #[serde(default)]
    can_ip_forward: bool,
    #[serde(default = "default_boot_disk_gb")]
    boot_disk_size_gb: u64,
    /// Additional persistent disks, created alongside the instance but not
    /// auto-deleted with it
    #[serde(default)]
    disks: Vec<DiskSpec>,
    #[serde(default)]
    dns_sync_wait: bool,
}

fn default_boot_disk_gb() -> u64 {
    10
}

/// Compute names must be RFC1035: lowercase letter first, then lowercase
/// letters, digits and hyphens.
fn gce_name(raw: &str) -> String {
    let mut name: String = raw
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' { c } else { '-' })
        .collect();
    while name.starts_with(|c: char| !c.is_ascii_lowercase()) && !name.is_empty() {
        name.remove(0);
    }
    name.truncate(61);
    while name.ends_with('-') {
        name.pop();
    }
    name
}

/// Label values allow only lowercase letters, digits, hyphens and
/// underscores, capped at 63 characters.
fn label_value(raw: &str) -> String {
    let mut value: String = raw
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    value.truncate(63);
    value
}

fn device_name(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '-' })
        .collect()
}

pub struct InstanceController {
    services: Arc<Services>,
    project: String,
    zone: String,
    access_token: String,
    poll: PollPolicy,
    agent: Option<Arc<dyn ConfigAgent>>,
}

impl InstanceController {
    pub fn new(
        services: Arc<Services>,
        project: impl Into<String>,
        zone: impl Into<String>,
        credentials: &Credentials,
    ) -> Result<Self> {
        let access_token = credentials.require("gcp", "access_token")?.to_string();
        Ok(Self {
            services,
            project: project.into(),
            zone: zone.into(),
            access_token,
            poll: PollPolicy::default(),
            agent: None,
        })
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_agent(mut self, agent: Arc<dyn ConfigAgent>) -> Self {
        self.agent = Some(agent);
        self
    }

    fn endpoint(&self) -> Arc<Endpoint> {
        self.services
            .endpoints
            .get_or_insert_with("gcp", "compute", &self.zone, || {
                Endpoint::with_default_backoff(Arc::new(ComputeRest::new(
                    &self.project,
                    &self.access_token,
                )))
            })
    }

    fn deploy_labels(&self, node_name: &str) -> Map<String, Value> {
        let mut labels = Map::new();
        labels.insert(
            TAG_DEPLOY_ID.to_string(),
            Value::String(label_value(&self.services.context.deploy_id)),
        );
        labels.insert("name".to_string(), Value::String(label_value(node_name)));
        labels
    }

    fn build_insert_request(&self, config: &InstanceConfig, node_name: &str) -> Value {
        let mut disks = vec![json!({
            "autoDelete": true,
            "boot": true,
            "mode": "READ_WRITE",
            "type": "PERSISTENT",
            "initializeParams": {
                "sourceImage": config.image,
                "diskSizeGb": config.boot_disk_size_gb,
                "diskType": format!(
                    "projects/{}/zones/{}/diskTypes/pd-standard",
                    self.project, self.zone
                ),
            }
        })];
        for disk in &config.disks {
            let device = device_name(&disk.device);
            disks.push(json!({
                "autoDelete": false,
                "boot": false,
                "deviceName": device,
                "mode": "READ_WRITE",
                "type": "PERSISTENT",
                "initializeParams": {
                    "diskName": gce_name(&format!("{node_name}-{device}")),
                    "diskSizeGb": disk.size_gb,
                    "description": self.services.context.deploy_id,
                }
            }));
        }

        let mut iface = Map::new();
        if let Some(network) = &config.network {
            iface.insert("network".to_string(), Value::String(network.clone()));
        }
        if let Some(subnetwork) = &config.subnetwork {
            iface.insert("subnetwork".to_string(), Value::String(subnetwork.clone()));
        }
        if config.associate_public_ip {
            iface.insert(
                "accessConfigs".to_string(),
                json!([{"type": "ONE_TO_ONE_NAT", "name": "External NAT"}]),
            );
        }

        json!({
            "name": node_name,
            "description": self.services.context.deploy_id,
            "machineType": format!("zones/{}/machineTypes/{}", self.zone, config.machine_type),
            "canIpForward": config.can_ip_forward,
            "labels": self.deploy_labels(node_name),
            "disks": disks,
            "networkInterfaces": [Value::Object(iface)],
        })
    }

    async fn get_instance(&self, endpoint: &Endpoint, name: &str) -> Result<Option<Value>> {
        match endpoint
            .call("GetInstance", json!({"zone": self.zone, "name": name}))
            .await
        {
            Ok(instance) if instance.get("name").is_some() => Ok(Some(instance)),
            Ok(_) => Ok(None),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn wait_running(&self, endpoint: &Endpoint, name: &str) -> Result<Value> {
        let subject = format!("instance {name}");
        wait_for(&subject, &self.poll, || async move {
            let instance = endpoint
                .call("GetInstance", json!({"zone": self.zone, "name": name}))
                .await?;
            let status = instance
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            match status.as_str() {
                "RUNNING" => Ok(PollOutcome::Ready(instance)),
                "TERMINATED" | "STOPPING" | "SUSPENDED" => {
                    Ok(PollOutcome::Failed(format!("instance entered {status}")))
                }
                _ => Ok(PollOutcome::Pending),
            }
        })
        .await
    }

    async fn compensate(&self, endpoint: &Endpoint, name: &str) {
        tracing::warn!(instance = name, "rolling back failed instance creation");
        if let Err(err) = endpoint
            .call_capped(
                "DeleteInstance",
                json!({"zone": self.zone, "name": name}),
                COMPENSATE_RETRY_CAP,
            )
            .await
        {
            if !err.is_not_found() {
                tracing::error!(instance = name, error = %err, "rollback delete failed");
            }
        }
    }

    fn addresses(instance: &Value) -> (Vec<String>, Vec<String>) {
        let mut private_ips = Vec::new();
        let mut public_ips = Vec::new();
        if let Some(ifaces) = instance.get("networkInterfaces").and_then(Value::as_array) {
            for iface in ifaces {
                if let Some(ip) = iface.get("networkIP").and_then(Value::as_str) {
                    private_ips.push(ip.to_string());
                }
                if let Some(configs) = iface.get("accessConfigs").and_then(Value::as_array) {
                    for config in configs {
                        if let Some(ip) = config.get("natIP").and_then(Value::as_str) {
                            public_ips.push(ip.to_string());
                        }
                    }
                }
            }
        }
        (private_ips, public_ips)
    }

    fn physical_from(instance: &Value) -> PhysicalResource {
        let name = instance
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let status = match instance.get("status").and_then(Value::as_str) {
            Some("RUNNING") => ResourceStatus::Available,
            Some("PROVISIONING") | Some("STAGING") => ResourceStatus::Creating,
            Some("STOPPING") => ResourceStatus::Deleting,
            Some("TERMINATED") => ResourceStatus::Deleted,
            _ => ResourceStatus::Creating,
        };
        let tags = instance
            .get("labels")
            .and_then(Value::as_object)
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| Tag::new(k, v)))
                    .collect()
            })
            .unwrap_or_default();
        PhysicalResource {
            id: name,
            status,
            tags,
            attributes: instance.clone(),
        }
    }

    async fn finish_create(
        &self,
        endpoint: &Endpoint,
        descriptor: &ResourceDescriptor,
        node_name: &str,
    ) -> Result<()> {
        let instance = self.wait_running(endpoint, node_name).await?;
        let (private_ips, public_ips) = Self::addresses(&instance);

        let address = public_ips
            .first()
            .or_else(|| private_ips.first())
            .cloned()
            .unwrap_or_default();
        let config: InstanceConfig = descriptor.parse_config()?;
        if !address.is_empty() {
            register_dns(
                self.services.dns.as_ref(),
                node_name,
                &address,
                config.dns_sync_wait,
            )
            .await?;
        }

        if let Some(agent) = &self.agent {
            let node = NodeHandle {
                physical_id: node_name.to_string(),
                name: descriptor.name.clone(),
                address: address.clone(),
                private_address: private_ips.first().cloned(),
            };
            agent
                .converge(&node)
                .await
                .map_err(|err| CloudError::ConfigAgent {
                    node: node_name.to_string(),
                    reason: err.to_string(),
                })?;
        }

        self.services
            .ledger
            .notify(
                "instance",
                &descriptor.name,
                json!({
                    "name": node_name,
                    "zone": self.zone,
                    "private_ips": private_ips,
                    "public_ips": public_ips,
                }),
            )
            .await;
        Ok(())
    }

    async fn list_by_filter(&self, endpoint: &Endpoint, filter: &str) -> Result<Vec<Value>> {
        let resp = endpoint
            .call("ListInstances", json!({"zone": self.zone, "filter": filter}))
            .await?;
        Ok(resp
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl ResourceController for InstanceController {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Instance
    }

    fn capabilities(&self) -> Capabilities {
        // An instance boots against its network and firewall surroundings,
        // so it waits for its parents to finish completely.
        Capabilities {
            deps_wait_on_my_creation: false,
            waits_on_parent_completion: true,
        }
    }

    async fn create(&self, descriptor: &ResourceDescriptor) -> Result<String> {
        let config: InstanceConfig = descriptor.parse_config()?;
        let node_name = gce_name(&self.services.context.resource_name(&descriptor.name, None));
        let endpoint = self.endpoint();

        let _guard = self.services.locks.lock(&node_name).await;

        tracing::info!(instance = %node_name, zone = %self.zone, "creating instance");
        let request = self.build_insert_request(&config, &node_name);
        endpoint
            .call("InsertInstance", json!({"zone": self.zone, "body": request}))
            .await
            .map_err(|err| CloudError::CreationFailed {
                kind: ResourceKind::Instance,
                name: descriptor.name.clone(),
                reason: err.to_string(),
            })?;

        if let Err(err) = self.finish_create(&endpoint, descriptor, &node_name).await {
            self.compensate(&endpoint, &node_name).await;
            return Err(err);
        }
        Ok(node_name)
    }

    async fn find(&self, criteria: &FindCriteria) -> Result<Option<PhysicalResource>> {
        let endpoint = self.endpoint();

        if let Some(name) = &criteria.name {
            if let Some(meta) = self.services.ledger.lookup("instance", name).await {
                if let Some(node) = meta.get("name").and_then(Value::as_str) {
                    if let Some(instance) = self.get_instance(&endpoint, node).await? {
                        return Ok(Some(Self::physical_from(&instance)));
                    }
                }
            }
        }

        if let Some(id) = &criteria.id {
            if let Some(instance) = self.get_instance(&endpoint, id).await? {
                return Ok(Some(Self::physical_from(&instance)));
            }
        }

        // Secondary key is an IP address, either side of the NAT.
        if let Some(ip) = &criteria.secondary {
            for instance in self.list_by_filter(&endpoint, "").await? {
                let (private_ips, public_ips) = Self::addresses(&instance);
                if private_ips.iter().any(|p| p == ip) || public_ips.iter().any(|p| p == ip) {
                    return Ok(Some(Self::physical_from(&instance)));
                }
            }
        }

        if let Some((key, value)) = &criteria.tag {
            let filter = format!("labels.{} eq {}", key, label_value(value));
            if let Some(instance) = self.list_by_filter(&endpoint, &filter).await?.first() {
                return Ok(Some(Self::physical_from(instance)));
            }
        }

        Ok(None)
    }

    async fn cleanup(&self, deploy_id: &str, options: &CleanupOptions) -> Result<CleanupReport> {
        let endpoint = self.endpoint();
        let mut report = CleanupReport::default();
        let filter = format!("description eq {deploy_id}");

        for instance in self.list_by_filter(&endpoint, &filter).await? {
            let name = match instance.get("name").and_then(Value::as_str) {
                Some(name) => name.to_string(),
                None => continue,
            };
            report.candidates.push(name.clone());
            if options.noop {
                tracing::info!(instance = %name, "would terminate instance");
                continue;
            }

            let _guard = self.services.locks.lock(&name).await;
            tracing::info!(instance = %name, "terminating instance");
            if let Err(err) = self.services.dns.delete_record(&name).await {
                tracing::warn!(instance = %name, error = %err, "DNS record removal failed");
            }
            match endpoint
                .call("DeleteInstance", json!({"zone": self.zone, "name": name}))
                .await
            {
                Ok(_) => report.deleted.push(name),
                Err(err) if err.is_not_found() => report.deleted.push(name),
                Err(err) => report.failed.push((name, err.to_string())),
            }
        }

        // Disks created with the deployment but not auto-deleted with their
        // instance linger; sweep them by the same ownership filter.
        let disks = match endpoint
            .call("ListDisks", json!({"zone": self.zone, "filter": filter}))
            .await
        {
            Ok(resp) => resp
                .get("items")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            Err(err) if err.is_not_found() => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        for disk in disks {
            let name = match disk.get("name").and_then(Value::as_str) {
                Some(name) => name.to_string(),
                None => continue,
            };
            report.candidates.push(name.clone());
            if options.noop {
                tracing::info!(disk = %name, "would delete disk");
                continue;
            }
            tracing::info!(disk = %name, "deleting disk");
            match endpoint
                .call("DeleteDisk", json!({"zone": self.zone, "name": name}))
                .await
            {
                Ok(_) => report.deleted.push(name),
                Err(err) if err.is_not_found() => {
                    tracing::debug!(disk = %name, "disk already deleting");
                    report.deleted.push(name);
                }
                Err(err) => report.failed.push((name, err.to_string())),
            }
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

    fn harness() -> (Arc<Services>, Arc<MockApi>, InstanceController) {
        let services = Services::new(DeployContext::new("demo-1234"));
        let mock = Arc::new(MockApi::new("gcp", "compute"));
        services.endpoints.register(
            "gcp",
            "compute",
            "us-central1-a",
            Arc::new(Endpoint::new(mock.clone(), fast_backoff())),
        );
        let creds = Credentials::new().with("access_token", "test-token");
        let controller =
            InstanceController::new(services.clone(), "my-proj", "us-central1-a", &creds)
                .unwrap()
                .with_poll_policy(fast_poll());
        (services, mock, controller)
    }

    fn running_instance(name: &str) -> Value {
        json!({
            "name": name,
            "status": "RUNNING",
            "networkInterfaces": [{
                "networkIP": "10.0.0.5",
                "accessConfigs": [{"natIP": "34.1.2.3"}]
            }],
            "labels": {"gw-deploy-id": "demo-1234"}
        })
    }

    #[test]
    fn test_name_and_label_rules() {
        assert_eq!(gce_name("demo-1234-WEB"), "demo-1234-web");
        assert_eq!(gce_name("9lives_db."), "lives-db");
        assert_eq!(label_value("Demo.1234"), "demo-1234");
        assert_eq!(device_name("xvd f"), "xvd-f");
    }

    #[tokio::test]
    async fn test_create_waits_for_running_and_notifies() {
        let (services, mock, controller) = harness();
        let node = "demo-1234-web";
        mock.stage_ok("InsertInstance", json!({"kind": "compute#operation", "status": "DONE"}));
        mock.stage_ok("GetInstance", json!({"name": node, "status": "PROVISIONING"}));
        mock.stage_ok("GetInstance", running_instance(node));

        let descriptor = ResourceDescriptor::new(ResourceKind::Instance, "web").with_config(
            json!({"machine_type": "n1-standard-1", "image": "projects/debian-cloud/global/images/family/debian-12", "associate_public_ip": true}),
        );
        let id = controller.create(&descriptor).await.unwrap();
        assert_eq!(id, node);

        let insert = &mock.calls_for("InsertInstance")[0];
        let body = insert.get("body").unwrap();
        assert_eq!(body.get("description").and_then(Value::as_str), Some("demo-1234"));
        assert_eq!(
            body.pointer("/labels/gw-deploy-id").and_then(Value::as_str),
            Some("demo-1234")
        );
        assert_eq!(
            body.pointer("/disks/0/autoDelete").and_then(Value::as_bool),
            Some(true)
        );
        assert!(body.pointer("/networkInterfaces/0/accessConfigs").is_some());

        let meta = services.ledger.lookup("instance", "web").await.unwrap();
        assert_eq!(meta.pointer("/public_ips/0").and_then(Value::as_str), Some("34.1.2.3"));
        assert_eq!(meta.pointer("/private_ips/0").and_then(Value::as_str), Some("10.0.0.5"));
    }

    #[tokio::test]
    async fn test_failed_boot_rolls_back() {
        let (_services, mock, controller) = harness();
        mock.stage_ok("InsertInstance", json!({"kind": "compute#operation", "status": "DONE"}));
        mock.stage_ok("GetInstance", json!({"name": "demo-1234-web", "status": "TERMINATED"}));

        let descriptor = ResourceDescriptor::new(ResourceKind::Instance, "web").with_config(
            json!({"machine_type": "n1-standard-1", "image": "img"}),
        );
        let err = controller.create(&descriptor).await.unwrap_err();
        assert!(matches!(err, CloudError::WaitFailed { .. }));
        assert_eq!(mock.call_count("DeleteInstance"), 1);
    }

    #[tokio::test]
    async fn test_extra_disks_are_not_auto_deleted() {
        let (_services, mock, controller) = harness();
        mock.stage_ok("InsertInstance", json!({"kind": "compute#operation", "status": "DONE"}));
        mock.stage_ok("GetInstance", running_instance("demo-1234-db"));

        let descriptor = ResourceDescriptor::new(ResourceKind::Instance, "db").with_config(
            json!({
                "machine_type": "n1-standard-2",
                "image": "img",
                "disks": [{"device": "data", "size_gb": 200}]
            }),
        );
        controller.create(&descriptor).await.unwrap();

        let body = mock.calls_for("InsertInstance")[0].get("body").unwrap().clone();
        assert_eq!(body.pointer("/disks/1/autoDelete").and_then(Value::as_bool), Some(false));
        assert_eq!(
            body.pointer("/disks/1/initializeParams/description")
                .and_then(Value::as_str),
            Some("demo-1234")
        );
        assert_eq!(
            body.pointer("/disks/1/initializeParams/diskSizeGb")
                .and_then(Value::as_u64),
            Some(200)
        );
    }

    #[tokio::test]
    async fn test_agent_handoff_after_available() {
        use groundwork_cloud::collaborators::NoopAgent;

        let (_services, mock, controller) = harness();
        let agent = Arc::new(NoopAgent::new());
        let controller = controller.with_agent(agent.clone());
        mock.stage_ok("InsertInstance", json!({"kind": "compute#operation", "status": "DONE"}));
        mock.stage_ok("GetInstance", running_instance("demo-1234-app"));

        let descriptor = ResourceDescriptor::new(ResourceKind::Instance, "app").with_config(
            json!({"machine_type": "n1-standard-1", "image": "img"}),
        );
        controller.create(&descriptor).await.unwrap();
        assert_eq!(agent.converged(), vec!["demo-1234-app".to_string()]);
    }

    #[tokio::test]
    async fn test_find_by_ip() {
        let (_services, mock, controller) = harness();
        mock.stage_ok("ListInstances", json!({"items": [running_instance("demo-1234-web")]}));

        let found = controller
            .find(&FindCriteria::default().with_secondary("34.1.2.3"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, "demo-1234-web");
        assert_eq!(found.status, ResourceStatus::Available);
    }

    #[tokio::test]
    async fn test_cleanup_sweeps_instances_and_loose_disks() {
        let (_services, mock, controller) = harness();
        mock.stage_ok("ListInstances", json!({"items": [running_instance("demo-1234-web")]}));
        mock.stage_ok("DeleteInstance", json!({"kind": "compute#operation", "status": "DONE"}));
        mock.stage_ok("ListDisks", json!({"items": [{"name": "demo-1234-db-data"}]}));
        mock.stage_ok("DeleteDisk", json!({"kind": "compute#operation", "status": "DONE"}));

        let report = controller
            .cleanup("demo-1234", &CleanupOptions::default())
            .await
            .unwrap();
        assert_eq!(report.candidates, vec!["demo-1234-web", "demo-1234-db-data"]);
        assert_eq!(report.deleted.len(), 2);
        assert!(report.is_clean());

        let filter = mock.calls_for("ListInstances")[0]
            .get("filter")
            .and_then(Value::as_str)
            .unwrap()
            .to_string();
        assert_eq!(filter, "description eq demo-1234");
    }

    #[tokio::test]
    async fn test_cleanup_noop_lists_without_deleting() {
        let (_services, mock, controller) = harness();
        mock.stage_ok("ListInstances", json!({"items": [running_instance("demo-1234-web")]}));
        mock.stage_ok("ListDisks", json!({"items": []}));

        let options = CleanupOptions {
            noop: true,
            ..CleanupOptions::default()
        };
        let report = controller.cleanup("demo-1234", &options).await.unwrap();
        assert_eq!(report.candidates, vec!["demo-1234-web"]);
        assert!(report.deleted.is_empty());
        assert_eq!(mock.call_count("DeleteInstance"), 0);
    }
}
