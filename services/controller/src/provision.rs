//! All-or-nothing batch provisioning.
//!
//! Every planned node is created by its own task. The provisioner waits for
//! all of them, then either returns the whole batch or destroys everything
//! the batch created and fails. Callers never see a partially-live batch.

use std::sync::Arc;

use cloudfleet_id::BatchId;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::driver::{DriverError, NodeMetadata};
use crate::ledger::{RollbackFailure, Terminator};
use crate::plan::{Disposal, NodePlan, NodeSupplier, RunningNode};
use crate::pool::WorkerPool;

pub const DEFAULT_CREATE_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Supplier calls per node before the node counts as failed.
    pub create_attempts: u32,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            create_attempts: DEFAULT_CREATE_ATTEMPTS,
        }
    }
}

/// A batch had at least one failed creation and was rolled back.
#[derive(Debug, Error)]
#[error("{failed} of {requested} node(s) failed to launch in {batch_id}")]
pub struct ProvisioningFailure {
    pub batch_id: BatchId,
    pub requested: usize,
    pub failed: usize,
    /// Last error of each failed node.
    pub errors: Vec<String>,
    /// Set when the rollback itself left nodes behind.
    pub rollback: Option<RollbackFailure>,
}

struct Launch {
    position: usize,
    result: Result<NodeMetadata, Option<DriverError>>,
    /// Nodes reported by failed attempts that still exist, in the plan's
    /// cloud.
    strays: Vec<RunningNode>,
}

pub struct Provisioner {
    terminator: Arc<Terminator>,
    pool: WorkerPool,
    config: ProvisionerConfig,
}

impl Provisioner {
    pub fn new(terminator: Arc<Terminator>, pool: WorkerPool, config: ProvisionerConfig) -> Self {
        Self {
            terminator,
            pool,
            config,
        }
    }

    pub fn terminator(&self) -> &Arc<Terminator> {
        &self.terminator
    }

    /// Provision every node in `plans`.
    ///
    /// On success the nodes come back in plan order and the caller owns
    /// them. On failure everything created by this batch has already been
    /// handed to the termination ledger.
    pub async fn provision(&self, plans: &[NodePlan]) -> Result<Vec<RunningNode>, ProvisioningFailure> {
        let batch_id = BatchId::new();
        let mut slots: Vec<(&NodePlan, Option<RunningNode>)> = Vec::new();
        let mut tasks = JoinSet::new();

        for plan in plans.iter().filter(|p| p.count > 0) {
            info!(
                batch_id = %batch_id,
                cloud = %plan.cloud_name,
                template = %plan.template_name,
                count = plan.count,
                "Launching nodes"
            );
            for _ in 0..plan.count {
                let position = slots.len();
                slots.push((plan, None));
                let target = LaunchTarget {
                    position,
                    cloud_name: plan.cloud_name.clone(),
                    template_name: plan.template_name.clone(),
                    supplier: Arc::clone(&plan.supplier),
                };
                let pool = self.pool.clone();
                let attempts = self.config.create_attempts.max(1);
                tasks.spawn(async move { launch(target, pool, attempts).await });
            }
        }

        let requested = slots.len();
        if requested == 0 {
            return Ok(Vec::new());
        }

        let mut errors = Vec::new();
        let mut strays = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let launch = match joined {
                Ok(launch) => launch,
                Err(e) => {
                    error!(batch_id = %batch_id, error = %e, "Node launch task failed");
                    errors.push(format!("launch task failed: {e}"));
                    continue;
                }
            };
            strays.extend(launch.strays);

            let (plan, slot) = &mut slots[launch.position];
            match launch.result {
                Ok(node) => {
                    *slot = Some(RunningNode {
                        cloud_name: plan.cloud_name.clone(),
                        template_name: plan.template_name.clone(),
                        disposal: plan.disposal,
                        node,
                    });
                }
                Err(e) => {
                    let message = e.map_or_else(
                        || "supplier produced no node".to_string(),
                        |e| e.to_string(),
                    );
                    warn!(
                        batch_id = %batch_id,
                        cloud = %plan.cloud_name,
                        template = %plan.template_name,
                        error = %message,
                        "Failed to launch node"
                    );
                    errors.push(message);
                }
            }
        }

        let created: Vec<RunningNode> = slots.iter_mut().filter_map(|(_, s)| s.take()).collect();
        let failed = requested - created.len();

        if failed == 0 {
            if !strays.is_empty() {
                warn!(
                    batch_id = %batch_id,
                    count = strays.len(),
                    "Destroying extra nodes left by failed attempts"
                );
                self.rollback(batch_id, strays).await;
            }
            info!(batch_id = %batch_id, nodes = created.len(), "Batch launched");
            return Ok(created);
        }

        error!(
            batch_id = %batch_id,
            requested,
            failed,
            created = created.len(),
            "Batch failed, destroying every node it created"
        );
        let mut doomed = created;
        doomed.extend(strays);
        let rollback = self.rollback(batch_id, doomed).await;

        Err(ProvisioningFailure {
            batch_id,
            requested,
            failed,
            errors,
            rollback,
        })
    }

    async fn rollback(&self, batch_id: BatchId, nodes: Vec<RunningNode>) -> Option<RollbackFailure> {
        if nodes.is_empty() {
            return None;
        }
        let report = self.terminator.destroy(&nodes).await;
        match report.into_rollback_result() {
            Ok(()) => None,
            Err(failure) => {
                error!(batch_id = %batch_id, error = %failure, "Rollback incomplete");
                Some(failure)
            }
        }
    }
}

/// One node slot of a plan.
struct LaunchTarget {
    position: usize,
    cloud_name: String,
    template_name: String,
    supplier: Arc<dyn NodeSupplier>,
}

impl LaunchTarget {
    /// Partial creates are always destroyed, whatever the plan's disposal.
    fn stray(&self, node: NodeMetadata) -> RunningNode {
        RunningNode {
            cloud_name: self.cloud_name.clone(),
            template_name: self.template_name.clone(),
            disposal: Disposal::Destroy,
            node,
        }
    }
}

async fn launch(target: LaunchTarget, pool: WorkerPool, attempts: u32) -> Launch {
    let mut strays = Vec::new();
    let mut last_error = None;

    for attempt in 1..=attempts {
        match pool.run(target.supplier.supply()).await {
            Ok(node) => {
                return Launch {
                    position: target.position,
                    result: Ok(node),
                    strays,
                };
            }
            Err(e) => {
                warn!(
                    cloud = %target.cloud_name,
                    template = %target.template_name,
                    attempt,
                    attempts,
                    error = %e,
                    "Node creation attempt failed"
                );
                strays.extend(e.partial_successes().iter().cloned().map(|n| target.stray(n)));
                last_error = Some(e);
            }
        }
    }

    Launch {
        position: target.position,
        result: Err(last_error),
        strays,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clouds::{CloudProfile, CloudRegistry, TemplateSpec};
    use crate::driver::MockCloudDriver;
    use crate::ledger::LedgerStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn provisioner(driver: Arc<MockCloudDriver>) -> (tempfile::TempDir, Provisioner, Arc<CloudRegistry>) {
        let dir = tempfile::tempdir().unwrap();
        let mut profile = CloudProfile::new("aws");
        profile.templates.push(TemplateSpec::new("builder"));
        let clouds = Arc::new(CloudRegistry::new().with_cloud(profile, driver));
        let pool = WorkerPool::new(4);
        let terminator = Arc::new(Terminator::new(
            Arc::new(LedgerStore::new(dir.path())),
            Arc::clone(&clouds),
            pool.clone(),
        ));
        (dir, Provisioner::new(terminator, pool, ProvisionerConfig::default()), clouds)
    }

    /// Fails a fixed number of times, then creates through the driver.
    struct FlakySupplier {
        failures_left: AtomicUsize,
        inner: Arc<dyn NodeSupplier>,
    }

    #[async_trait]
    impl NodeSupplier for FlakySupplier {
        async fn supply(&self) -> Result<NodeMetadata, DriverError> {
            let left = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if left.is_ok() {
                return Err(DriverError::Api("transient".to_string()));
            }
            self.inner.supply().await
        }
    }

    #[tokio::test]
    async fn test_successful_batch_keeps_plan_order() {
        let driver = Arc::new(MockCloudDriver::new());
        let (_dir, p, clouds) = provisioner(driver.clone());
        let supplier = clouds.supplier("aws", "builder").unwrap();

        let plans = vec![
            NodePlan::new("aws", "builder", 2, Disposal::Destroy, supplier.clone()),
            NodePlan::new("aws", "builder", 1, Disposal::Suspend, supplier),
        ];
        let nodes = p.provision(&plans).await.unwrap();

        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[2].disposal, Disposal::Suspend);
        assert_eq!(driver.live_count(), 3);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let (_dir, p, clouds) = provisioner(Arc::new(MockCloudDriver::new()));
        let supplier = clouds.supplier("aws", "builder").unwrap();
        let plans = vec![NodePlan::new("aws", "builder", 0, Disposal::Destroy, supplier)];
        assert!(p.provision(&plans).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let driver = Arc::new(MockCloudDriver::new());
        let (_dir, p, clouds) = provisioner(driver.clone());
        let supplier: Arc<dyn NodeSupplier> = Arc::new(FlakySupplier {
            failures_left: AtomicUsize::new(4),
            inner: clouds.supplier("aws", "builder").unwrap(),
        });

        let plans = vec![NodePlan::new("aws", "builder", 1, Disposal::Destroy, supplier)];
        let nodes = p.provision(&plans).await.unwrap();
        assert_eq!(nodes.len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_the_batch() {
        let driver = Arc::new(MockCloudDriver::new());
        let (_dir, p, clouds) = provisioner(driver.clone());
        let flaky: Arc<dyn NodeSupplier> = Arc::new(FlakySupplier {
            failures_left: AtomicUsize::new(5),
            inner: clouds.supplier("aws", "builder").unwrap(),
        });
        let good = clouds.supplier("aws", "builder").unwrap();

        let plans = vec![
            NodePlan::new("aws", "builder", 2, Disposal::Suspend, good),
            NodePlan::new("aws", "builder", 1, Disposal::Destroy, flaky),
        ];
        let err = p.provision(&plans).await.unwrap_err();

        assert_eq!(err.requested, 3);
        assert_eq!(err.failed, 1);
        assert!(err.rollback.is_none());
        assert_eq!(driver.live_count(), 0);
        assert_eq!(driver.suspended_count(), 0);
        assert_eq!(driver.destroyed_count(), 2);
    }
}
