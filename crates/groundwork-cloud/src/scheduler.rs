//! Dependency-aware creation scheduling
//!
//! Every resource in a deployment gets its own tokio task. Ordering between
//! tasks is expressed with watch channels: each resource publishes one
//! `DepState` and dependents subscribe to the resources they must wait on.
//! Whether a dependent actually blocks is decided by capabilities, either
//! side can demand strict ordering. Deletion is the mirror image: kinds are
//! swept sequentially in reverse registration order.

use crate::controller::ResourceController;
use crate::error::{CloudError, Result};
use crate::resource::{CleanupOptions, CleanupReport, ResourceDescriptor, ResourceKind};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Published creation state of one resource in the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepState {
    Pending,
    Succeeded,
    Failed,
}

/// Result of a full deployment run. Creation keeps going past individual
/// failures; only resources downstream of a failure are skipped.
#[derive(Debug, Default)]
pub struct DeployOutcome {
    /// (kind, logical name, physical id) for each created resource
    pub succeeded: Vec<(ResourceKind, String, String)>,
    pub failed: Vec<(ResourceKind, String, CloudError)>,
}

impl DeployOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Scheduler {
    controllers: HashMap<ResourceKind, Arc<dyn ResourceController>>,
    /// Registration order, replayed in reverse for cleanup
    order: Vec<ResourceKind>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            controllers: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn register(&mut self, controller: Arc<dyn ResourceController>) {
        let kind = controller.kind();
        if self.controllers.insert(kind, controller).is_none() {
            self.order.push(kind);
        }
    }

    pub fn controller(&self, kind: ResourceKind) -> Result<Arc<dyn ResourceController>> {
        self.controllers
            .get(&kind)
            .cloned()
            .ok_or(CloudError::UnknownKind(kind))
    }

    /// Create all descriptors concurrently, honoring capability-driven
    /// ordering between them.
    ///
    /// A dependency that fails (or whose task aborts) fails its dependents
    /// with a dependency error before their controller is ever invoked.
    /// Dependencies not part of this run are not waited on; the controller
    /// resolves them from the ledger at create time.
    pub async fn create_all(&self, descriptors: Vec<ResourceDescriptor>) -> DeployOutcome {
        let mut senders: HashMap<(ResourceKind, String), watch::Sender<DepState>> = HashMap::new();
        let mut receivers: HashMap<(ResourceKind, String), watch::Receiver<DepState>> =
            HashMap::new();
        for desc in &descriptors {
            let (tx, rx) = watch::channel(DepState::Pending);
            senders.insert((desc.kind, desc.name.clone()), tx);
            receivers.insert((desc.kind, desc.name.clone()), rx);
        }

        let mut handles = Vec::with_capacity(descriptors.len());
        for desc in descriptors {
            let tx = senders
                .remove(&(desc.kind, desc.name.clone()))
                .expect("sender registered above");

            let controller = match self.controller(desc.kind) {
                Ok(c) => c,
                Err(err) => {
                    // No controller; fail now and unblock dependents.
                    let _ = tx.send(DepState::Failed);
                    handles.push(tokio::spawn(async move {
                        (desc.kind, desc.name.clone(), Err(err))
                    }));
                    continue;
                }
            };

            let my_caps = controller.capabilities();
            let mut gates = Vec::new();
            for dep in &desc.depends_on {
                let Some(rx) = receivers.get(&(dep.kind, dep.name.clone())) else {
                    continue;
                };
                let dep_caps = match self.controller(dep.kind) {
                    Ok(c) => c.capabilities(),
                    Err(_) => continue,
                };
                if dep_caps.deps_wait_on_my_creation || my_caps.waits_on_parent_completion {
                    gates.push((dep.clone(), rx.clone()));
                }
            }

            handles.push(tokio::spawn(async move {
                let result = run_one(controller, &desc, gates).await;
                let _ = tx.send(match result {
                    Ok(_) => DepState::Succeeded,
                    Err(_) => DepState::Failed,
                });
                (desc.kind, desc.name, result)
            }));
        }

        let mut outcome = DeployOutcome::default();
        for handle in futures_util::future::join_all(handles).await {
            match handle {
                Ok((kind, name, Ok(id))) => outcome.succeeded.push((kind, name, id)),
                Ok((kind, name, Err(err))) => outcome.failed.push((kind, name, err)),
                Err(join_err) => {
                    tracing::error!(error = %join_err, "resource task aborted");
                }
            }
        }
        outcome
    }

    /// Sweep every registered kind for `deploy_id`, newest kinds first.
    ///
    /// Individual failures never abort the sweep; a kind whose controller
    /// errors outright is folded into the report's failure list.
    pub async fn cleanup_all(
        &self,
        deploy_id: &str,
        options: &CleanupOptions,
    ) -> CleanupReport {
        let mut report = CleanupReport::default();
        for kind in self.order.iter().rev() {
            let controller = match self.controllers.get(kind) {
                Some(c) => c,
                None => continue,
            };
            match controller.cleanup(deploy_id, options).await {
                Ok(partial) => report.merge(partial),
                Err(err) => {
                    tracing::error!(kind = %kind, error = %err, "cleanup sweep failed");
                    report.failed.push((kind.to_string(), err.to_string()));
                }
            }
        }
        report
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_one(
    controller: Arc<dyn ResourceController>,
    desc: &ResourceDescriptor,
    gates: Vec<(crate::resource::Dependency, watch::Receiver<DepState>)>,
) -> Result<String> {
    for (dep, mut rx) in gates {
        let state = match rx.wait_for(|s| *s != DepState::Pending).await {
            Ok(state) => *state,
            // Sender dropped while pending: the dependency's task aborted.
            Err(_) => DepState::Failed,
        };
        if state == DepState::Failed {
            return Err(CloudError::DependencyNotFound {
                kind: desc.kind,
                name: desc.name.clone(),
                dep_kind: dep.kind,
                dep_name: dep.name,
            });
        }
        tracing::debug!(
            kind = %desc.kind,
            name = %desc.name,
            dep_kind = %dep.kind,
            dep_name = %dep.name,
            "dependency ready"
        );
    }
    controller.create(desc).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::FindCriteria;
    use crate::resource::{Capabilities, PhysicalResource};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Controller that logs create order into a shared vec.
    struct ScriptedController {
        kind: ResourceKind,
        caps: Capabilities,
        delay: Duration,
        fail: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ResourceController for ScriptedController {
        fn kind(&self) -> ResourceKind {
            self.kind
        }

        fn capabilities(&self) -> Capabilities {
            self.caps
        }

        async fn create(&self, descriptor: &ResourceDescriptor) -> Result<String> {
            self.log
                .lock()
                .unwrap()
                .push(format!("start:{}", descriptor.name));
            tokio::time::sleep(self.delay).await;
            self.log
                .lock()
                .unwrap()
                .push(format!("done:{}", descriptor.name));
            if self.fail {
                Err(CloudError::CreationFailed {
                    kind: self.kind,
                    name: descriptor.name.clone(),
                    reason: "scripted failure".to_string(),
                })
            } else {
                Ok(format!("id-{}", descriptor.name))
            }
        }

        async fn find(&self, _criteria: &FindCriteria) -> Result<Option<PhysicalResource>> {
            Ok(None)
        }

        async fn cleanup(
            &self,
            _deploy_id: &str,
            _options: &CleanupOptions,
        ) -> Result<CleanupReport> {
            self.log.lock().unwrap().push(format!("sweep:{}", self.kind));
            Ok(CleanupReport::default())
        }
    }

    fn scheduler_with(
        log: &Arc<Mutex<Vec<String>>>,
        specs: Vec<(ResourceKind, Capabilities, Duration, bool)>,
    ) -> Scheduler {
        let mut sched = Scheduler::new();
        for (kind, caps, delay, fail) in specs {
            sched.register(Arc::new(ScriptedController {
                kind,
                caps,
                delay,
                fail,
                log: Arc::clone(log),
            }));
        }
        sched
    }

    #[tokio::test]
    async fn test_blocking_parent_completes_before_child_starts() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sched = scheduler_with(
            &log,
            vec![
                (
                    ResourceKind::Stack,
                    Capabilities {
                        deps_wait_on_my_creation: true,
                        waits_on_parent_completion: false,
                    },
                    Duration::from_millis(30),
                    false,
                ),
                (
                    ResourceKind::Database,
                    Capabilities::default(),
                    Duration::from_millis(1),
                    false,
                ),
            ],
        );

        let outcome = sched
            .create_all(vec![
                ResourceDescriptor::new(ResourceKind::Stack, "net"),
                ResourceDescriptor::new(ResourceKind::Database, "db")
                    .with_dependency(ResourceKind::Stack, "net"),
            ])
            .await;

        assert!(outcome.is_complete());
        let log = log.lock().unwrap();
        let done_net = log.iter().position(|e| e == "done:net").unwrap();
        let start_db = log.iter().position(|e| e == "start:db").unwrap();
        assert!(done_net < start_db, "expected net before db, got {log:?}");
    }

    #[tokio::test]
    async fn test_non_blocking_dependency_runs_concurrently() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sched = scheduler_with(
            &log,
            vec![
                (
                    ResourceKind::Stack,
                    Capabilities::default(),
                    Duration::from_millis(50),
                    false,
                ),
                (
                    ResourceKind::LoadBalancer,
                    Capabilities::default(),
                    Duration::from_millis(1),
                    false,
                ),
            ],
        );

        let outcome = sched
            .create_all(vec![
                ResourceDescriptor::new(ResourceKind::Stack, "net"),
                ResourceDescriptor::new(ResourceKind::LoadBalancer, "lb")
                    .with_dependency(ResourceKind::Stack, "net"),
            ])
            .await;

        assert!(outcome.is_complete());
        let log = log.lock().unwrap();
        let start_lb = log.iter().position(|e| e == "start:lb").unwrap();
        let done_net = log.iter().position(|e| e == "done:net").unwrap();
        assert!(start_lb < done_net, "lb should not wait for net: {log:?}");
    }

    #[tokio::test]
    async fn test_failed_dependency_skips_dependents() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sched = scheduler_with(
            &log,
            vec![
                (
                    ResourceKind::Stack,
                    Capabilities {
                        deps_wait_on_my_creation: true,
                        waits_on_parent_completion: false,
                    },
                    Duration::from_millis(1),
                    true,
                ),
                (
                    ResourceKind::Database,
                    Capabilities::default(),
                    Duration::from_millis(1),
                    false,
                ),
            ],
        );

        let outcome = sched
            .create_all(vec![
                ResourceDescriptor::new(ResourceKind::Stack, "net"),
                ResourceDescriptor::new(ResourceKind::Database, "db")
                    .with_dependency(ResourceKind::Stack, "net"),
            ])
            .await;

        assert_eq!(outcome.failed.len(), 2);
        let db_err = outcome
            .failed
            .iter()
            .find(|(_, name, _)| name == "db")
            .map(|(_, _, err)| err)
            .unwrap();
        assert!(db_err.is_dependency_error());
        // The database controller was never invoked.
        assert!(!log.lock().unwrap().iter().any(|e| e == "start:db"));
    }

    #[tokio::test]
    async fn test_cleanup_sweeps_in_reverse_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sched = scheduler_with(
            &log,
            vec![
                (
                    ResourceKind::Stack,
                    Capabilities::default(),
                    Duration::ZERO,
                    false,
                ),
                (
                    ResourceKind::Database,
                    Capabilities::default(),
                    Duration::ZERO,
                    false,
                ),
                (
                    ResourceKind::LoadBalancer,
                    Capabilities::default(),
                    Duration::ZERO,
                    false,
                ),
            ],
        );

        let report = sched
            .cleanup_all("deploy-1", &CleanupOptions::default())
            .await;
        assert!(report.is_clean());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["sweep:load_balancer", "sweep:database", "sweep:stack"]
        );
    }

    #[tokio::test]
    async fn test_unregistered_kind_fails_without_blocking_others() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sched = scheduler_with(
            &log,
            vec![(
                ResourceKind::Database,
                Capabilities::default(),
                Duration::ZERO,
                false,
            )],
        );

        let outcome = sched
            .create_all(vec![
                ResourceDescriptor::new(ResourceKind::Instance, "vm"),
                ResourceDescriptor::new(ResourceKind::Database, "db"),
            ])
            .await;

        assert_eq!(outcome.succeeded.len(), 1);
        assert_eq!(outcome.failed.len(), 1);
        assert!(matches!(
            outcome.failed[0].2,
            CloudError::UnknownKind(ResourceKind::Instance)
        ));
    }
}
