//! Deployment ledger
//!
//! The append/query store of resource metadata keyed by deployment and
//! logical resource name. After a controller successfully creates (or
//! discovers) a resource it calls `notify`; dependent controllers resolve
//! their upstreams with `lookup`. Entries are insertion-ordered per kind and
//! upserts are last-write-wins.
//!
//! Persistence is optional: [`LedgerStore`] writes the ledger to
//! `.groundwork/deploy.json` with a backup of the previous version, so a
//! later process (including one that did not create the deployment) can load
//! it for reconciliation or cleanup.

use crate::error::{CloudError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;

const LEDGER_VERSION: u32 = 1;
const LEDGER_DIR: &str = ".groundwork";
const LEDGER_FILE: &str = "deploy.json";
const LEDGER_BACKUP: &str = "deploy.json.backup";

/// One recorded resource: metadata snapshot plus bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub name: String,
    pub metadata: Value,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerData {
    pub version: u32,
    pub deploy_id: Option<String>,
    pub updated_at: DateTime<Utc>,

    /// Entries per resource kind, in insertion order
    pub kinds: HashMap<String, Vec<LedgerEntry>>,
}

impl Default for LedgerData {
    fn default() -> Self {
        Self {
            version: LEDGER_VERSION,
            deploy_id: None,
            updated_at: Utc::now(),
            kinds: HashMap::new(),
        }
    }
}

/// In-memory deployment ledger, safe for concurrent writers.
///
/// A single entry's write is atomic: a concurrent reader sees either the
/// previous metadata or the new metadata, never a torn mix. No cross-entry
/// transactionality is offered.
#[derive(Default)]
pub struct Ledger {
    data: RwLock<LedgerData>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_deployment(deploy_id: impl Into<String>) -> Self {
        let ledger = Self::new();
        {
            let mut data = ledger.data.try_write().expect("fresh ledger");
            data.deploy_id = Some(deploy_id.into());
        }
        ledger
    }

    /// Record (or overwrite) the metadata for `(kind, name)`.
    pub async fn notify(&self, kind: &str, name: &str, metadata: Value) {
        let mut data = self.data.write().await;
        let entries = data.kinds.entry(kind.to_string()).or_default();
        let entry = LedgerEntry {
            name: name.to_string(),
            metadata,
            recorded_at: Utc::now(),
        };
        match entries.iter_mut().find(|e| e.name == name) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
        data.updated_at = Utc::now();
        tracing::debug!(kind, name, "ledger notify");
    }

    /// Metadata most recently written for `(kind, name)`.
    pub async fn lookup(&self, kind: &str, name: &str) -> Option<Value> {
        let data = self.data.read().await;
        data.kinds
            .get(kind)?
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.metadata.clone())
    }

    /// All entries of a kind, in insertion order.
    pub async fn entries(&self, kind: &str) -> Vec<LedgerEntry> {
        let data = self.data.read().await;
        data.kinds.get(kind).cloned().unwrap_or_default()
    }

    pub async fn snapshot(&self) -> LedgerData {
        self.data.read().await.clone()
    }

    pub async fn restore(&self, data: LedgerData) {
        *self.data.write().await = data;
    }
}

/// Reads and writes the ledger file under a project root.
pub struct LedgerStore {
    project_root: PathBuf,
}

impl LedgerStore {
    pub fn new(project_root: impl AsRef<Path>) -> Self {
        Self {
            project_root: project_root.as_ref().to_path_buf(),
        }
    }

    fn ledger_dir(&self) -> PathBuf {
        self.project_root.join(LEDGER_DIR)
    }

    fn ledger_path(&self) -> PathBuf {
        self.ledger_dir().join(LEDGER_FILE)
    }

    fn backup_path(&self) -> PathBuf {
        self.ledger_dir().join(LEDGER_BACKUP)
    }

    async fn ensure_dir(&self) -> Result<()> {
        let dir = self.ledger_dir();
        if !dir.exists() {
            fs::create_dir_all(&dir).await?;
            tracing::debug!("Created ledger directory: {}", dir.display());
        }
        Ok(())
    }

    /// Load the persisted ledger, or an empty one when none exists.
    pub async fn load(&self) -> Result<LedgerData> {
        let path = self.ledger_path();
        if !path.exists() {
            tracing::debug!("Ledger file not found, returning empty ledger");
            return Ok(LedgerData::default());
        }

        let content = fs::read_to_string(&path).await?;
        let data: LedgerData = serde_json::from_str(&content)?;

        if data.version > LEDGER_VERSION {
            return Err(CloudError::Store(format!(
                "ledger file version {} is newer than supported version {}",
                data.version, LEDGER_VERSION
            )));
        }
        Ok(data)
    }

    /// Save the ledger, keeping the previous file as a backup.
    pub async fn save(&self, ledger: &Ledger) -> Result<()> {
        self.ensure_dir().await?;

        let path = self.ledger_path();
        let backup = self.backup_path();

        if path.exists() {
            if backup.exists() {
                fs::remove_file(&backup).await?;
            }
            fs::rename(&path, &backup).await?;
        }

        let data = ledger.snapshot().await;
        let content = serde_json::to_string_pretty(&data)?;
        fs::write(&path, content).await?;

        tracing::debug!(
            kinds = data.kinds.len(),
            "Saved deployment ledger to {}",
            path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::join_all;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_notify_then_lookup_reads_own_write() {
        let ledger = Ledger::new();
        ledger
            .notify("database", "maindb", json!({"identifier": "db-1"}))
            .await;
        let meta = ledger.lookup("database", "maindb").await.unwrap();
        assert_eq!(meta["identifier"], "db-1");
        assert!(ledger.lookup("database", "otherdb").await.is_none());
        assert!(ledger.lookup("instance", "maindb").await.is_none());
    }

    #[tokio::test]
    async fn test_renotify_is_last_write_wins() {
        let ledger = Ledger::new();
        ledger.notify("instance", "web", json!({"ip": "10.0.0.1"})).await;
        ledger.notify("instance", "web", json!({"ip": "10.0.0.2"})).await;

        let meta = ledger.lookup("instance", "web").await.unwrap();
        assert_eq!(meta["ip"], "10.0.0.2");
        assert_eq!(ledger.entries("instance").await.len(), 1);
    }

    #[tokio::test]
    async fn test_entries_keep_insertion_order() {
        let ledger = Ledger::new();
        for name in ["a", "b", "c"] {
            ledger.notify("subnet", name, json!({})).await;
        }
        // Overwriting must not reorder
        ledger.notify("subnet", "a", json!({"v": 2})).await;

        let names: Vec<String> = ledger
            .entries("subnet")
            .await
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_concurrent_notify_keeps_every_entry() {
        let ledger = Arc::new(Ledger::new());
        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    ledger
                        .notify("instance", &format!("node-{}", i), json!({"n": i}))
                        .await;
                })
            })
            .collect();
        join_all(tasks).await;

        assert_eq!(ledger.entries("instance").await.len(), 32);
    }

    #[tokio::test]
    async fn test_store_save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::new(dir.path());

        let ledger = Ledger::for_deployment("APP-DEV-2024");
        ledger
            .notify("load_balancer", "front", json!({"dns": "front.example.com"}))
            .await;
        store.save(&ledger).await.unwrap();
        // Second save creates the backup of the first
        ledger.notify("load_balancer", "front", json!({"dns": "front2.example.com"})).await;
        store.save(&ledger).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.deploy_id.as_deref(), Some("APP-DEV-2024"));
        assert_eq!(
            loaded.kinds["load_balancer"][0].metadata["dns"],
            "front2.example.com"
        );
        assert!(dir.path().join(".groundwork/deploy.json.backup").exists());
    }

    #[tokio::test]
    async fn test_load_missing_file_returns_empty() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::new(dir.path());
        let data = store.load().await.unwrap();
        assert!(data.kinds.is_empty());
    }
}
