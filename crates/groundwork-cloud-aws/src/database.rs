//! RDS database controller
//!
//! Handles the four creation styles (`new`, `existing`, `existing_snapshot`,
//! `new_snapshot`), the engine-specific naming constraints RDS imposes on
//! identifiers, schema names and master usernames, subnet group placement,
//! read replicas, and tag-scoped cleanup.

use crate::cli::AwsCli;
use async_trait::async_trait;
use groundwork_cloud::poll::{wait_for, PollOutcome, PollPolicy};
use groundwork_cloud::{
    collaborators::register_dns, matches_deployment, matches_name_fallback, standard_tags,
    Capabilities, CleanupOptions, CleanupReport, CloudError, Endpoint, FindCriteria,
    PhysicalResource, ResourceController, ResourceDescriptor, ResourceKind, ResourceStatus,
    Result, Services, Tag,
};
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

const CREATE_RETRY_CAP: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreationStyle {
    #[default]
    New,
    /// Adopt a database that already exists; record it, create nothing
    Existing,
    /// Restore from the most recent snapshot of an existing database
    ExistingSnapshot,
    /// Snapshot an existing database now, then restore from that snapshot
    NewSnapshot,
}

impl CreationStyle {
    fn as_str(self) -> &'static str {
        match self {
            CreationStyle::New => "new",
            CreationStyle::Existing => "existing",
            CreationStyle::ExistingSnapshot => "existing_snapshot",
            CreationStyle::NewSnapshot => "new_snapshot",
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReadReplicaConfig {
    name: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    storage_type: Option<String>,
    #[serde(default)]
    iops: Option<u64>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    publicly_accessible: bool,
    #[serde(default)]
    source_identifier: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DatabaseConfig {
    #[serde(default)]
    creation_style: CreationStyle,
    /// Source identifier for the existing/snapshot styles
    #[serde(default)]
    identifier: Option<String>,
    engine: String,
    #[serde(default)]
    engine_version: Option<String>,
    /// Instance class, e.g. "db.m5.large"
    size: String,
    #[serde(default)]
    storage: Option<u64>,
    #[serde(default)]
    storage_type: Option<String>,
    #[serde(default)]
    iops: Option<u64>,
    #[serde(default)]
    storage_encrypted: bool,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    multi_az: bool,
    #[serde(default)]
    backup_retention_period: Option<u32>,
    #[serde(default)]
    preferred_backup_window: Option<String>,
    #[serde(default)]
    preferred_maintenance_window: Option<String>,
    /// Subnet ids or logical subnet names from this deployment
    #[serde(default)]
    subnets: Vec<String>,
    /// Logical security group names from this deployment
    #[serde(default)]
    security_groups: Vec<String>,
    #[serde(default)]
    publicly_accessible: bool,
    #[serde(default)]
    allow_major_version_upgrade: bool,
    #[serde(default)]
    read_replica: Option<ReadReplicaConfig>,
    #[serde(default)]
    dns_sync_wait: bool,
}

/// Engine-specific default schema name constraints. SQL Server instances
/// cannot take one at all.
fn db_name_for_engine(engine: &str, basename: &str) -> Option<String> {
    if engine.starts_with("oracle") {
        Some(truncate(basename, 8))
    } else if engine.starts_with("sqlserver") {
        None
    } else if engine.starts_with("mysql") {
        Some(truncate(basename, 64))
    } else {
        Some(basename.to_string())
    }
}

/// Engine-specific master username constraints.
fn master_user_for_engine(engine: &str, basename: &str) -> String {
    let alnum: String = basename.chars().filter(char::is_ascii_alphanumeric).collect();
    let limit = if engine.starts_with("oracle") {
        30
    } else if engine.starts_with("sqlserver") {
        128
    } else if engine.starts_with("mysql") {
        16
    } else {
        usize::MAX
    };
    truncate(&alnum, limit)
}

/// Engine-specific instance identifier constraints: must start with a
/// letter, hyphens allowed (except SQL Server), bounded length, no trailing
/// hyphen.
fn identifier_for_engine(engine: &str, basename: &str) -> String {
    let (kept, limit): (String, usize) = if engine.starts_with("sqlserver") {
        (basename.chars().filter(char::is_ascii_alphabetic).collect(), 15)
    } else {
        (
            basename
                .chars()
                .skip_while(|c| !c.is_ascii_alphabetic())
                .collect(),
            63,
        )
    };
    let mut id = truncate(&kept, limit).replace('_', "-");
    while id.ends_with('-') {
        id.pop();
    }
    id
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Alternating consonant/vowel password with a numeric tail, for databases
/// declared without one. Recorded in the deployment ledger.
fn pronounceable_password(len: usize) -> String {
    const CONSONANTS: &[u8] = b"bcdfghjklmnpqrstvwz";
    const VOWELS: &[u8] = b"aeiou";
    let mut rng = rand::thread_rng();
    let mut out = String::with_capacity(len);
    for i in 0..len.saturating_sub(2) {
        let pool = if i % 2 == 0 { CONSONANTS } else { VOWELS };
        out.push(pool[rng.gen_range(0..pool.len())] as char);
    }
    for _ in 0..2 {
        out.push(char::from_digit(rng.gen_range(0..10), 10).unwrap_or('0'));
    }
    out
}

pub struct DatabaseController {
    services: Arc<Services>,
    region: String,
    poll: PollPolicy,
}

impl DatabaseController {
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
            .get_or_insert_with("aws", "rds", &self.region, || {
                Endpoint::with_default_backoff(Arc::new(AwsCli::new("rds", &self.region)))
            })
    }

    async fn describe_instance(
        &self,
        endpoint: &Endpoint,
        identifier: &str,
    ) -> Result<Option<Value>> {
        match endpoint
            .call(
                "DescribeDBInstances",
                json!({"DBInstanceIdentifier": identifier}),
            )
            .await
        {
            Ok(resp) => Ok(resp
                .get("DBInstances")
                .and_then(Value::as_array)
                .and_then(|a| a.first())
                .cloned()),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn wait_available(&self, endpoint: &Endpoint, identifier: &str) -> Result<Value> {
        let subject = format!("database {identifier}");
        wait_for(&subject, &self.poll, || async move {
            let resp = endpoint
                .call(
                    "DescribeDBInstances",
                    json!({"DBInstanceIdentifier": identifier}),
                )
                .await?;
            let Some(instance) = resp
                .get("DBInstances")
                .and_then(Value::as_array)
                .and_then(|a| a.first())
            else {
                return Ok(PollOutcome::Pending);
            };
            match instance.get("DBInstanceStatus").and_then(Value::as_str) {
                Some("available") => Ok(PollOutcome::Ready(instance.clone())),
                Some("failed") | Some("incompatible-parameters") => Ok(PollOutcome::Failed(
                    format!("database entered state {:?}", instance["DBInstanceStatus"]),
                )),
                _ => Ok(PollOutcome::Pending),
            }
        })
        .await
    }

    /// Snapshot an existing database and wait for it to become usable.
    async fn create_snapshot(&self, endpoint: &Endpoint, source: &str) -> Result<String> {
        let snap_id = format!(
            "{}-{}",
            self.services.context.resource_name(source, Some(50)),
            chrono::Utc::now().format("%M%S")
        )
        .to_lowercase();
        tracing::info!(source, snap_id, "creating database snapshot");
        endpoint
            .call_capped(
                "CreateDBSnapshot",
                json!({
                    "DBSnapshotIdentifier": snap_id,
                    "DBInstanceIdentifier": source,
                }),
                CREATE_RETRY_CAP,
            )
            .await?;

        let subject = format!("snapshot of {source}");
        let snap = snap_id.as_str();
        wait_for(&subject, &self.poll, || async move {
            let resp = endpoint
                .call(
                    "DescribeDBSnapshots",
                    json!({"DBSnapshotIdentifier": snap}),
                )
                .await?;
            let status = resp
                .get("DBSnapshots")
                .and_then(Value::as_array)
                .and_then(|a| a.first())
                .and_then(|s| s.get("Status"))
                .and_then(Value::as_str);
            match status {
                Some("available") => Ok(PollOutcome::Ready(())),
                Some("failed") => Ok(PollOutcome::Failed("snapshot failed".to_string())),
                _ => Ok(PollOutcome::Pending),
            }
        })
        .await?;
        Ok(snap_id)
    }

    /// Most recent snapshot of `source`, if any.
    async fn latest_snapshot(&self, endpoint: &Endpoint, source: &str) -> Result<Option<String>> {
        let resp = match endpoint
            .call(
                "DescribeDBSnapshots",
                json!({"DBInstanceIdentifier": source}),
            )
            .await
        {
            Ok(resp) => resp,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut snapshots: Vec<&Value> = resp
            .get("DBSnapshots")
            .and_then(Value::as_array)
            .map(|a| a.iter().collect())
            .unwrap_or_default();
        snapshots.sort_by_key(|s| {
            s.get("SnapshotCreateTime")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        });
        Ok(snapshots
            .last()
            .and_then(|s| s.get("DBSnapshotIdentifier"))
            .and_then(Value::as_str)
            .map(String::from))
    }

    async fn resolve_subnet_ids(&self, names: &[String]) -> Vec<String> {
        let mut ids = Vec::with_capacity(names.len());
        for name in names {
            // Logical subnet names from this deployment resolve through the
            // ledger; anything else is taken as a literal subnet id.
            match self.services.ledger.lookup("subnet", name).await {
                Some(meta) => {
                    if let Some(id) = meta.get("id").and_then(Value::as_str) {
                        ids.push(id.to_string());
                    }
                }
                None => ids.push(name.clone()),
            }
        }
        ids
    }

    async fn resolve_security_groups(
        &self,
        descriptor: &ResourceDescriptor,
        names: &[String],
    ) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(names.len());
        for name in names {
            let meta = self
                .services
                .ledger
                .lookup("security_group", name)
                .await
                .ok_or_else(|| CloudError::DependencyNotFound {
                    kind: ResourceKind::Database,
                    name: descriptor.name.clone(),
                    dep_kind: ResourceKind::Stack,
                    dep_name: name.clone(),
                })?;
            if let Some(id) = meta.get("group_id").and_then(Value::as_str) {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }

    async fn create_subnet_group(
        &self,
        endpoint: &Endpoint,
        group_name: &str,
        subnet_ids: &[String],
        tags: &[Tag],
    ) -> Result<()> {
        tracing::info!(group_name, "creating database subnet group");
        endpoint
            .call_capped(
                "CreateDBSubnetGroup",
                json!({
                    "DBSubnetGroupName": group_name,
                    "DBSubnetGroupDescription": self.services.context.deploy_id,
                    "SubnetIds": subnet_ids,
                    "Tags": tags.iter().map(aws_tag).collect::<Vec<_>>(),
                }),
                CREATE_RETRY_CAP,
            )
            .await?;
        Ok(())
    }

    /// Best-effort teardown of a database that failed mid-creation. Issued
    /// exactly once before the original error propagates.
    async fn compensate(&self, endpoint: &Endpoint, identifier: &str) {
        tracing::warn!(identifier, "removing partially created database");
        if let Err(err) = endpoint
            .call_capped(
                "DeleteDBInstance",
                json!({
                    "DBInstanceIdentifier": identifier,
                    "SkipFinalSnapshot": true,
                }),
                3,
            )
            .await
        {
            tracing::error!(identifier, error = %err, "failed to remove partial database");
        }
    }

    async fn notify(
        &self,
        logical_name: &str,
        instance: &Value,
        password: Option<&str>,
        style: CreationStyle,
    ) {
        let endpoint_addr = instance
            .pointer("/Endpoint/Address")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let port = instance.pointer("/Endpoint/Port").and_then(Value::as_u64);
        self.services
            .ledger
            .notify(
                ResourceKind::Database.as_str(),
                logical_name,
                json!({
                    "identifier": instance.get("DBInstanceIdentifier"),
                    "region": self.region,
                    "engine": instance.get("Engine"),
                    "engine_version": instance.get("EngineVersion"),
                    "endpoint": endpoint_addr,
                    "port": port,
                    "username": instance.get("MasterUsername"),
                    "password": password,
                    "create_style": style.as_str(),
                    "db_name": instance.get("DBName"),
                    "multi_az": instance.get("MultiAZ"),
                }),
            )
            .await;
    }

    /// Everything that happens after the instance exists. A failure here
    /// triggers the compensating delete in `create`.
    #[allow(clippy::too_many_arguments)]
    async fn finish_create(
        &self,
        endpoint: &Endpoint,
        descriptor: &ResourceDescriptor,
        config: &DatabaseConfig,
        identifier: &str,
        password: &str,
        snapshot_id: Option<&str>,
        security_group_ids: &[String],
    ) -> Result<()> {
        let instance = self.wait_available(endpoint, identifier).await?;
        let address = instance
            .pointer("/Endpoint/Address")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        register_dns(
            self.services.dns.as_ref(),
            identifier,
            &address,
            config.dns_sync_wait,
        )
        .await?;

        // Restores ignore master password and security group arguments, so
        // apply them after the fact.
        if snapshot_id.is_some() {
            let mut modify = json!({
                "DBInstanceIdentifier": identifier,
                "ApplyImmediately": true,
                "MasterUserPassword": password,
            });
            if !security_group_ids.is_empty() {
                modify["VpcSecurityGroupIds"] = json!(security_group_ids);
            }
            endpoint.call("ModifyDBInstance", modify).await?;
            self.wait_available(endpoint, identifier).await?;
        }

        if config.allow_major_version_upgrade {
            tracing::info!(identifier, "allowing major version upgrades");
            endpoint
                .call(
                    "ModifyDBInstance",
                    json!({
                        "DBInstanceIdentifier": identifier,
                        "ApplyImmediately": true,
                        "AllowMajorVersionUpgrade": true,
                    }),
                )
                .await?;
        }

        let instance = self
            .describe_instance(endpoint, identifier)
            .await?
            .unwrap_or(instance);
        self.notify(&descriptor.name, &instance, Some(password), config.creation_style)
            .await;

        if let Some(replica) = &config.read_replica {
            self.create_read_replica(endpoint, config, replica, identifier, password)
                .await?;
        }
        Ok(())
    }

    async fn create_read_replica(
        &self,
        endpoint: &Endpoint,
        config: &DatabaseConfig,
        replica: &ReadReplicaConfig,
        source_identifier: &str,
        password: &str,
    ) -> Result<()> {
        let node_name = self.services.context.resource_name(&replica.name, None);
        let replica_id = identifier_for_engine(&config.engine, &node_name.to_lowercase());
        let source = replica
            .source_identifier
            .as_deref()
            .unwrap_or(source_identifier);

        let tags = standard_tags(&self.services.context, &replica.name);
        let mut request = json!({
            "DBInstanceIdentifier": replica_id,
            "SourceDBInstanceIdentifier": source,
            "PubliclyAccessible": replica.publicly_accessible,
            "Tags": tags.iter().map(aws_tag).collect::<Vec<_>>(),
        });
        if let Some(size) = &replica.size {
            request["DBInstanceClass"] = json!(size);
        }
        if let Some(port) = replica.port {
            request["Port"] = json!(port);
        }
        if let Some(storage_type) = &replica.storage_type {
            request["StorageType"] = json!(storage_type);
            if storage_type == "io1" {
                if let Some(iops) = replica.iops {
                    request["Iops"] = json!(iops);
                }
            }
        }

        tracing::info!(replica_id, source, "creating read replica");
        endpoint
            .call_capped("CreateDBInstanceReadReplica", request, CREATE_RETRY_CAP)
            .await?;

        let result = async {
            let instance = self.wait_available(endpoint, &replica_id).await?;
            let address = instance
                .pointer("/Endpoint/Address")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            register_dns(
                self.services.dns.as_ref(),
                &replica_id,
                &address,
                config.dns_sync_wait,
            )
            .await?;
            self.notify(&replica.name, &instance, Some(password), config.creation_style)
                .await;
            Ok::<(), CloudError>(())
        }
        .await;

        if let Err(err) = result {
            self.compensate(endpoint, &replica_id).await;
            return Err(err);
        }
        tracing::info!(replica_id, "read replica is ready to use");
        Ok(())
    }
}

fn aws_tag(tag: &Tag) -> Value {
    json!({"Key": tag.key, "Value": tag.value})
}

fn physical_from(instance: &Value) -> PhysicalResource {
    let status = match instance.get("DBInstanceStatus").and_then(Value::as_str) {
        Some("available") => ResourceStatus::Available,
        Some("creating") | Some("backing-up") | Some("modifying") => ResourceStatus::Creating,
        Some("deleting") => ResourceStatus::Deleting,
        Some("failed") => ResourceStatus::CreateFailed,
        _ => ResourceStatus::Creating,
    };
    PhysicalResource {
        id: instance
            .get("DBInstanceIdentifier")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        status,
        tags: Vec::new(),
        attributes: instance.clone(),
    }
}

#[async_trait]
impl ResourceController for DatabaseController {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Database
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            deps_wait_on_my_creation: true,
            waits_on_parent_completion: false,
        }
    }

    async fn create(&self, descriptor: &ResourceDescriptor) -> Result<String> {
        let mut config: DatabaseConfig = descriptor.parse_config()?;
        let endpoint = self.endpoint();

        if config.creation_style == CreationStyle::Existing {
            let identifier = config.identifier.clone().ok_or_else(|| {
                CloudError::InvalidConfig(format!(
                    "database '{}': creation_style 'existing' requires an identifier",
                    descriptor.name
                ))
            })?;
            let instance = self
                .describe_instance(&endpoint, &identifier)
                .await?
                .ok_or_else(|| CloudError::CreationFailed {
                    kind: ResourceKind::Database,
                    name: descriptor.name.clone(),
                    reason: format!("existing database '{identifier}' not found"),
                })?;
            self.notify(
                &descriptor.name,
                &instance,
                config.password.as_deref(),
                config.creation_style,
            )
            .await;
            return Ok(identifier);
        }

        // Snapshot-based styles resolve their source snapshot up front.
        let snapshot_id = match config.creation_style {
            CreationStyle::ExistingSnapshot => {
                let source = config.identifier.clone().ok_or_else(|| {
                    CloudError::InvalidConfig(format!(
                        "database '{}': snapshot styles require a source identifier",
                        descriptor.name
                    ))
                })?;
                match self.latest_snapshot(&endpoint, &source).await? {
                    Some(snap) => Some(snap),
                    // No snapshot to restore; take one now.
                    None => Some(self.create_snapshot(&endpoint, &source).await?),
                }
            }
            CreationStyle::NewSnapshot => {
                let source = config.identifier.clone().ok_or_else(|| {
                    CloudError::InvalidConfig(format!(
                        "database '{}': snapshot styles require a source identifier",
                        descriptor.name
                    ))
                })?;
                Some(self.create_snapshot(&endpoint, &source).await?)
            }
            _ => None,
        };

        let node_name = self.services.context.resource_name(&descriptor.name, None);
        let basename: String = format!("{}{}", descriptor.name, self.services.context.deploy_id)
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .collect::<String>()
            .to_lowercase();

        let db_name = db_name_for_engine(&config.engine, &basename);
        let master_user = master_user_for_engine(&config.engine, &basename);
        let identifier = identifier_for_engine(&config.engine, &node_name.to_lowercase());
        if master_user != descriptor.name && snapshot_id.is_none() {
            tracing::warn!(identifier, master_user, "truncated master username");
        }

        let password = match &config.password {
            Some(p) => p.clone(),
            None => pronounceable_password(12),
        };

        // Multi-AZ failover needs automatic backups.
        if config.multi_az && config.backup_retention_period.unwrap_or(0) == 0 {
            config.backup_retention_period = Some(35);
            tracing::warn!(
                identifier,
                "multi-AZ requested with backups disabled; enabling 35-day retention"
            );
            if config.preferred_backup_window.is_none() {
                config.preferred_backup_window = Some("05:00-05:30".to_string());
            }
        }

        let security_group_ids = self
            .resolve_security_groups(descriptor, &config.security_groups)
            .await?;
        let tags = standard_tags(&self.services.context, &descriptor.name);

        let mut request = json!({
            "DBInstanceIdentifier": identifier,
            "DBInstanceClass": config.size,
            "Engine": config.engine,
            "MultiAZ": config.multi_az,
            "Tags": tags.iter().map(aws_tag).collect::<Vec<_>>(),
        });
        if let Some(version) = &config.engine_version {
            request["EngineVersion"] = json!(version);
        }
        if let Some(storage_type) = &config.storage_type {
            request["StorageType"] = json!(storage_type);
            if storage_type == "io1" {
                if let Some(iops) = config.iops {
                    request["Iops"] = json!(iops);
                }
            }
        }
        if let Some(window) = &config.preferred_maintenance_window {
            request["PreferredMaintenanceWindow"] = json!(window);
        }
        if let Some(window) = &config.preferred_backup_window {
            request["PreferredBackupWindow"] = json!(window);
        }
        if let Some(retention) = config.backup_retention_period {
            request["BackupRetentionPeriod"] = json!(retention);
        }

        let group_name = node_name.to_lowercase();
        if !config.subnets.is_empty() {
            let subnet_ids = self.resolve_subnet_ids(&config.subnets).await;
            self.create_subnet_group(&endpoint, &group_name, &subnet_ids, &tags)
                .await?;
            request["DBSubnetGroupName"] = json!(group_name);
            if !security_group_ids.is_empty() && snapshot_id.is_none() {
                request["VpcSecurityGroupIds"] = json!(security_group_ids);
            }
        } else {
            request["PubliclyAccessible"] = json!(config.publicly_accessible);
        }

        // Restore requests reject fresh-create arguments.
        let operation = if let Some(snap) = &snapshot_id {
            request["DBSnapshotIdentifier"] = json!(snap);
            "RestoreDBInstanceFromDBSnapshot"
        } else {
            request["StorageEncrypted"] = json!(config.storage_encrypted);
            if let Some(storage) = config.storage {
                request["AllocatedStorage"] = json!(storage);
            }
            if let Some(db_name) = &db_name {
                request["DBName"] = json!(db_name);
            }
            request["MasterUsername"] = json!(master_user);
            request["MasterUserPassword"] = json!(password);
            "CreateDBInstance"
        };

        let _guard = self.services.locks.lock(&identifier).await;
        match &snapshot_id {
            Some(snap) => tracing::info!(identifier, snapshot = %snap, "restoring database from snapshot"),
            None => tracing::info!(identifier, engine = %config.engine, "creating database instance"),
        }
        endpoint
            .call_capped(operation, request, CREATE_RETRY_CAP)
            .await?;

        if let Err(err) = self
            .finish_create(
                &endpoint,
                descriptor,
                &config,
                &identifier,
                &password,
                snapshot_id.as_deref(),
                &security_group_ids,
            )
            .await
        {
            self.compensate(&endpoint, &identifier).await;
            return Err(err);
        }

        tracing::info!(identifier, "database is ready to use");
        Ok(identifier)
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
                .lookup(ResourceKind::Database.as_str(), name)
                .await
            {
                if id.is_none() {
                    id = meta
                        .get("identifier")
                        .and_then(Value::as_str)
                        .map(String::from);
                }
            }
        }
        if let Some(id) = &id {
            if let Some(instance) = self.describe_instance(&endpoint, id).await? {
                return Ok(Some(physical_from(&instance)));
            }
        }

        let resp = endpoint.call("DescribeDBInstances", json!({})).await?;
        let instances = resp
            .get("DBInstances")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        if let Some(address) = &criteria.secondary {
            if let Some(instance) = instances.iter().find(|i| {
                i.pointer("/Endpoint/Address").and_then(Value::as_str) == Some(address)
            }) {
                return Ok(Some(physical_from(instance)));
            }
        }
        if let Some((key, value)) = &criteria.tag {
            for instance in &instances {
                let Some(arn) = instance.get("DBInstanceArn").and_then(Value::as_str) else {
                    continue;
                };
                let tags = list_tags(&endpoint, arn).await?;
                if tags.iter().any(|t| &t.key == key && &t.value == value) {
                    let mut found = physical_from(instance);
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

        let resp = endpoint.call("DescribeDBInstances", json!({})).await?;
        let instances = resp
            .get("DBInstances")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for instance in instances {
            let Some(identifier) = instance
                .get("DBInstanceIdentifier")
                .and_then(Value::as_str)
            else {
                continue;
            };
            let tags = match instance.get("DBInstanceArn").and_then(Value::as_str) {
                Some(arn) => list_tags(&endpoint, arn).await?,
                None => Vec::new(),
            };

            let owned = if matches_deployment(&tags, deploy_id, master_ip, options.ignoremaster) {
                true
            } else if tags.is_empty()
                && matches_name_fallback(identifier, &deploy_id.to_lowercase())
            {
                tracing::warn!(
                    identifier,
                    "removing database by name match (tags unavailable); this fallback is deprecated"
                );
                true
            } else {
                false
            };
            if !owned {
                continue;
            }

            report.candidates.push(identifier.to_string());
            if options.noop {
                tracing::info!(identifier, "would remove database");
                continue;
            }

            let _guard = self.services.locks.lock(identifier).await;
            if let Err(err) = self.services.dns.delete_record(identifier).await {
                tracing::warn!(identifier, error = %err, "failed to remove DNS record");
            }

            let mut delete = json!({"DBInstanceIdentifier": identifier});
            if options.skip_snapshots {
                delete["SkipFinalSnapshot"] = json!(true);
            } else {
                delete["FinalDBSnapshotIdentifier"] = json!(format!("{identifier}-final"));
            }

            tracing::info!(identifier, "removing database");
            let deleted = match endpoint.call("DeleteDBInstance", delete).await {
                Ok(_) => true,
                Err(err) if err.is_not_found() => true,
                Err(err) => {
                    report.failed.push((identifier.to_string(), err.to_string()));
                    false
                }
            };
            if !deleted {
                continue;
            }

            if options.wait {
                let subject = format!("deletion of database {identifier}");
                let ep = &endpoint;
                let wait = wait_for(&subject, &self.poll, || async move {
                    match self.describe_instance(ep, identifier).await {
                        Ok(None) => Ok(PollOutcome::Ready(())),
                        Ok(Some(_)) => Ok(PollOutcome::Pending),
                        Err(CloudError::Api(err)) => Err(err),
                        Err(err) => Ok(PollOutcome::Failed(err.to_string())),
                    }
                })
                .await;
                if let Err(err) = wait {
                    report.failed.push((identifier.to_string(), err.to_string()));
                    continue;
                }
            }

            // Subnet group is per-instance; sweep it with its owner.
            let group_name = instance
                .pointer("/DBSubnetGroup/DBSubnetGroupName")
                .and_then(Value::as_str);
            if let Some(group_name) = group_name {
                if let Err(err) = endpoint
                    .call(
                        "DeleteDBSubnetGroup",
                        json!({"DBSubnetGroupName": group_name}),
                    )
                    .await
                {
                    if !err.is_not_found() {
                        tracing::warn!(group_name, error = %err, "failed to remove subnet group");
                    }
                }
            }
            report.deleted.push(identifier.to_string());
        }
        Ok(report)
    }
}

async fn list_tags(endpoint: &Endpoint, arn: &str) -> Result<Vec<Tag>> {
    let resp = endpoint
        .call("ListTagsForResource", json!({"ResourceName": arn}))
        .await?;
    Ok(resp
        .get("TagList")
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
        .unwrap_or_default())
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

    fn harness() -> (Arc<Services>, Arc<MockApi>, DatabaseController) {
        let services = Services::new(DeployContext::new("demo-1234"));
        let mock = Arc::new(MockApi::new("aws", "rds"));
        services.endpoints.register(
            "aws",
            "rds",
            "us-east-1",
            Arc::new(Endpoint::new(mock.clone(), fast_backoff())),
        );
        let controller = DatabaseController::new(services.clone(), "us-east-1")
            .with_poll_policy(fast_poll());
        (services, mock, controller)
    }

    fn available_instance(identifier: &str) -> Value {
        json!({"DBInstances": [{
            "DBInstanceIdentifier": identifier,
            "DBInstanceStatus": "available",
            "Engine": "mysql",
            "MasterUsername": "admin",
            "Endpoint": {"Address": format!("{identifier}.rds.amazonaws.com"), "Port": 3306}
        }]})
    }

    #[test]
    fn test_engine_name_constraints() {
        assert_eq!(
            db_name_for_engine("oracle-se2", "longbasename123"),
            Some("longbase".to_string())
        );
        assert_eq!(db_name_for_engine("sqlserver-ex", "anything"), None);
        assert_eq!(
            master_user_for_engine("mysql", "averylongusername123"),
            "averylongusernam"
        );
        assert_eq!(
            identifier_for_engine("sqlserver-ex", "123db-main_x"),
            "dbmainx"
        );
        assert_eq!(identifier_for_engine("mysql", "123db_main-"), "db-main");
    }

    #[test]
    fn test_generated_password_shape() {
        let p = pronounceable_password(12);
        assert_eq!(p.chars().count(), 12);
        assert!(p.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[tokio::test]
    async fn test_new_snapshot_style_uses_restore_path() {
        let (_services, mock, controller) = harness();
        mock.stage_ok("CreateDBSnapshot", json!({}));
        mock.stage_ok(
            "DescribeDBSnapshots",
            json!({"DBSnapshots": [{"Status": "available"}]}),
        );
        mock.stage_ok("RestoreDBInstanceFromDBSnapshot", json!({}));
        // wait_available, post-modify wait, final describe
        for _ in 0..3 {
            mock.stage_ok("DescribeDBInstances", available_instance("demo-1234-db"));
        }
        mock.stage_ok("ModifyDBInstance", json!({}));

        let descriptor = ResourceDescriptor::new(ResourceKind::Database, "db")
            .with_region("us-east-1")
            .with_config(json!({
                "creation_style": "new_snapshot",
                "identifier": "source-db",
                "engine": "mysql",
                "size": "db.m5.large"
            }));
        controller.create(&descriptor).await.unwrap();

        assert_eq!(mock.calls_for("CreateDBInstance").len(), 0);
        let restore = &mock.calls_for("RestoreDBInstanceFromDBSnapshot")[0];
        let snap = restore["DBSnapshotIdentifier"].as_str().unwrap();
        assert_eq!(
            mock.calls_for("CreateDBSnapshot")[0]["DBSnapshotIdentifier"]
                .as_str()
                .unwrap(),
            snap
        );
        // Restore path never carries fresh-create arguments.
        assert!(restore.get("MasterUserPassword").is_none());
    }

    #[tokio::test]
    async fn test_multi_az_enables_backup_retention() {
        let (_services, mock, controller) = harness();
        mock.stage_ok("CreateDBInstance", json!({}));
        for _ in 0..2 {
            mock.stage_ok("DescribeDBInstances", available_instance("demo-1234-db"));
        }

        let descriptor = ResourceDescriptor::new(ResourceKind::Database, "db")
            .with_region("us-east-1")
            .with_config(json!({
                "engine": "mysql",
                "size": "db.m5.large",
                "multi_az": true
            }));
        controller.create(&descriptor).await.unwrap();

        let create = &mock.calls_for("CreateDBInstance")[0];
        assert_eq!(create["BackupRetentionPeriod"], json!(35));
        assert_eq!(create["PreferredBackupWindow"], json!("05:00-05:30"));
        // A password was generated and sent.
        assert!(create["MasterUserPassword"].as_str().unwrap().len() >= 10);
    }

    #[tokio::test]
    async fn test_failed_readiness_compensates_once() {
        let (_services, mock, controller) = harness();
        mock.stage_ok("CreateDBInstance", json!({}));
        mock.stage_ok(
            "DescribeDBInstances",
            json!({"DBInstances": [{
                "DBInstanceIdentifier": "demo-1234-db",
                "DBInstanceStatus": "failed"
            }]}),
        );
        mock.stage_ok("DeleteDBInstance", json!({}));

        let descriptor = ResourceDescriptor::new(ResourceKind::Database, "db")
            .with_region("us-east-1")
            .with_config(json!({"engine": "mysql", "size": "db.m5.large"}));
        let err = controller.create(&descriptor).await.unwrap_err();

        assert!(matches!(err, CloudError::WaitFailed { .. }));
        let deletes = mock.calls_for("DeleteDBInstance");
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0]["SkipFinalSnapshot"], json!(true));
    }

    #[tokio::test]
    async fn test_cleanup_takes_final_snapshot_unless_skipped() {
        let (_services, mock, controller) = harness();
        mock.stage_ok(
            "DescribeDBInstances",
            json!({"DBInstances": [{
                "DBInstanceIdentifier": "demo-1234-db",
                "DBInstanceStatus": "available",
                "DBInstanceArn": "arn:aws:rds:us-east-1:123:db:demo-1234-db"
            }]}),
        );
        mock.stage_ok(
            "ListTagsForResource",
            json!({"TagList": [{"Key": "gw-deploy-id", "Value": "demo-1234"}]}),
        );
        mock.stage_ok("DeleteDBInstance", json!({}));

        let report = controller
            .cleanup("demo-1234", &CleanupOptions::default())
            .await
            .unwrap();

        assert_eq!(report.deleted, vec!["demo-1234-db"]);
        let delete = &mock.calls_for("DeleteDBInstance")[0];
        assert_eq!(
            delete["FinalDBSnapshotIdentifier"],
            json!("demo-1234-db-final")
        );
        assert!(delete.get("SkipFinalSnapshot").is_none());
    }
}
