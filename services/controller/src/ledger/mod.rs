//! Crash-safe termination.
//!
//! Every suspend or destroy goes through a [`TerminationLedger`]: intents are
//! recorded and persisted first, then executed. If the process dies in
//! between, [`StartupRecovery`] finds the record on the next start and
//! finishes the job.
//!
//! A ledger promises that each recorded node was attempted at least once,
//! not that the attempt succeeded. Nodes that could not be terminated are
//! reported back so the caller can retry later.

mod recovery;
mod store;

pub use recovery::{RecoveryFailure, RecoveryReport, StartupRecovery};
pub use store::{
    CloudTermination, LedgerError, LedgerStore, PendingTermination, PersistedLedger,
    RECORD_EXTENSION, RECORD_PREFIX,
};

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use cloudfleet_id::LedgerId;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::clouds::CloudRegistry;
use crate::driver::{CloudDriver, DriverError, NodeStatus};
use crate::plan::{Disposal, RunningNode};
use crate::pool::WorkerPool;

/// Why a single node could not be terminated.
#[derive(Debug, Error)]
pub enum TerminationFailureReason {
    #[error("cloud is not configured")]
    UnknownCloud,

    #[error("termination task did not complete")]
    TaskFailed,

    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// One node a ledger could not suspend or destroy.
#[derive(Debug, Error)]
#[error("failed to {disposal} node {node_id} in cloud {cloud}: {reason}")]
pub struct TerminationFailure {
    pub cloud: String,
    pub node_id: String,
    pub disposal: Disposal,
    pub reason: TerminationFailureReason,
}

/// Destroying the nodes of a failed batch did not fully succeed.
#[derive(Debug, Error)]
#[error("rollback of batch left {} node(s) behind", .failures.len())]
pub struct RollbackFailure {
    pub failures: Vec<TerminationFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeOutcome {
    Suspended,
    Destroyed,
    AlreadyGone,
}

/// Result of one execution pass.
#[derive(Debug)]
pub struct TerminationReport {
    pub ledger_id: LedgerId,
    pub suspended: Vec<String>,
    pub destroyed: Vec<String>,
    /// Nodes that were no longer running when checked.
    pub already_gone: Vec<String>,
    /// Nodes held by another live ledger and left to it. Their outcome is
    /// not known yet.
    pub deferred: Vec<String>,
    pub failures: Vec<TerminationFailure>,
}

impl TerminationReport {
    fn new(ledger_id: LedgerId) -> Self {
        Self {
            ledger_id,
            suspended: Vec::new(),
            destroyed: Vec::new(),
            already_gone: Vec::new(),
            deferred: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// No failures and nothing left to another ledger: every node is known
    /// to be terminated.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.deferred.is_empty()
    }

    pub fn attempted(&self) -> usize {
        self.suspended.len() + self.destroyed.len() + self.already_gone.len() + self.failures.len()
    }

    pub fn failed(&self, cloud: &str, node_id: &str) -> bool {
        self.failures
            .iter()
            .any(|f| f.cloud == cloud && f.node_id == node_id)
    }

    /// Turn a report with failures into a [`RollbackFailure`].
    pub fn into_rollback_result(self) -> Result<(), RollbackFailure> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(RollbackFailure {
                failures: self.failures,
            })
        }
    }
}

/// Intent log for one batch of terminations.
pub struct TerminationLedger {
    id: LedgerId,
    record_path: PathBuf,
    store: Arc<LedgerStore>,
    clouds: Arc<CloudRegistry>,
    pool: WorkerPool,
    pending: Mutex<PendingTermination>,
}

impl TerminationLedger {
    pub fn new(store: Arc<LedgerStore>, clouds: Arc<CloudRegistry>, pool: WorkerPool) -> Self {
        let id = LedgerId::new();
        Self {
            record_path: store.record_path(&id),
            id,
            store,
            clouds,
            pool,
            pending: Mutex::new(PendingTermination::new()),
        }
    }

    /// Rebuild a ledger from a record found on disk.
    pub(crate) fn resume(
        record: PersistedLedger,
        record_path: PathBuf,
        store: Arc<LedgerStore>,
        clouds: Arc<CloudRegistry>,
        pool: WorkerPool,
    ) -> Self {
        Self {
            id: record.ledger_id,
            record_path,
            store,
            clouds,
            pool,
            pending: Mutex::new(record.clouds),
        }
    }

    pub fn id(&self) -> LedgerId {
        self.id
    }

    pub fn record_path(&self) -> &std::path::Path {
        &self.record_path
    }

    /// Add one intent and persist the whole pending set before returning.
    pub fn record_intent(
        &self,
        cloud: &str,
        node_id: &str,
        disposal: Disposal,
    ) -> Result<(), LedgerError> {
        self.record_intents([(cloud, node_id, disposal)])
    }

    /// Add several intents with a single write.
    ///
    /// On a persistence error the intents stay in memory and are still
    /// executed by this ledger; only crash safety is lost.
    pub fn record_intents<'a, I>(&self, intents: I) -> Result<(), LedgerError>
    where
        I: IntoIterator<Item = (&'a str, &'a str, Disposal)>,
    {
        let mut pending = self.lock();
        let mut changed = false;
        for (cloud, node_id, disposal) in intents {
            changed |= pending.insert(cloud, node_id, disposal);
        }
        if changed {
            self.store.save(&self.record_path, &self.id, &pending)?;
        }
        Ok(())
    }

    /// Attempt every recorded intent, then delete the record.
    pub async fn execute(self) -> TerminationReport {
        let pending = std::mem::take(&mut *self.lock());
        let mut report = TerminationReport::new(self.id);

        if !pending.is_empty() {
            info!(
                ledger_id = %self.id,
                intents = pending.len(),
                "Executing termination ledger"
            );
        }

        let mut tasks = JoinSet::new();
        let mut spawned = Vec::new();
        for (cloud, node_id, disposal) in pending.intents() {
            let driver = self.clouds.driver(&cloud);
            let pool = self.pool.clone();
            spawned.push((cloud.clone(), node_id.clone(), disposal));
            tasks.spawn(async move {
                let result = match driver {
                    Some(driver) => pool
                        .run(terminate_node(driver.as_ref(), &node_id, disposal))
                        .await
                        .map_err(TerminationFailureReason::from),
                    None => Err(TerminationFailureReason::UnknownCloud),
                };
                (cloud, node_id, disposal, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let Ok((cloud, node_id, disposal, result)) = joined else {
                continue;
            };
            spawned.retain(|(c, n, _)| !(c == &cloud && n == &node_id));
            match result {
                Ok(NodeOutcome::Suspended) => report.suspended.push(node_id),
                Ok(NodeOutcome::Destroyed) => report.destroyed.push(node_id),
                Ok(NodeOutcome::AlreadyGone) => report.already_gone.push(node_id),
                Err(reason) => {
                    let failure = TerminationFailure {
                        cloud,
                        node_id,
                        disposal,
                        reason,
                    };
                    warn!(ledger_id = %self.id, error = %failure, "Termination failed");
                    report.failures.push(failure);
                }
            }
        }

        // Tasks that panicked never reported back.
        for (cloud, node_id, disposal) in spawned {
            let failure = TerminationFailure {
                cloud,
                node_id,
                disposal,
                reason: TerminationFailureReason::TaskFailed,
            };
            error!(ledger_id = %self.id, error = %failure, "Termination task failed");
            report.failures.push(failure);
        }

        if let Err(e) = self.store.remove(&self.record_path) {
            error!(ledger_id = %self.id, error = %e, "Failed to remove termination ledger record");
        }

        if report.attempted() > 0 {
            info!(
                ledger_id = %self.id,
                suspended = report.suspended.len(),
                destroyed = report.destroyed.len(),
                already_gone = report.already_gone.len(),
                failed = report.failures.len(),
                "Termination ledger executed"
            );
        }
        report
    }

    fn lock(&self) -> MutexGuard<'_, PendingTermination> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Check status and, if the node still exists, apply `disposal`.
///
/// A suspend only applies to a running node; a destroy applies to anything
/// the provider still knows about.
async fn terminate_node(
    driver: &dyn CloudDriver,
    node_id: &str,
    disposal: Disposal,
) -> Result<NodeOutcome, DriverError> {
    let status = driver.status(node_id).await?;
    let act = match (disposal, status) {
        (_, None | Some(NodeStatus::Terminated)) => false,
        (Disposal::Suspend, Some(status)) => status == NodeStatus::Running,
        (Disposal::Destroy, Some(_)) => true,
    };
    if !act {
        debug!(node_id = %node_id, status = ?status, "Node already not running");
        return Ok(NodeOutcome::AlreadyGone);
    }

    match disposal {
        Disposal::Suspend => {
            driver.suspend(node_id).await?;
            info!(node_id = %node_id, "Node suspended");
            Ok(NodeOutcome::Suspended)
        }
        Disposal::Destroy => match driver.destroy(node_id).await {
            Ok(()) => {
                info!(node_id = %node_id, "Node destroyed");
                Ok(NodeOutcome::Destroyed)
            }
            // Gone between the status check and the destroy.
            Err(DriverError::NotFound(_)) => Ok(NodeOutcome::AlreadyGone),
            Err(e) => Err(e),
        },
    }
}

/// Hands each termination request to a fresh ledger.
///
/// Keeps the set of node ids held by ledgers that are still executing and
/// refuses to record any of them in a second one.
pub struct Terminator {
    store: Arc<LedgerStore>,
    clouds: Arc<CloudRegistry>,
    pool: WorkerPool,
    in_flight: Mutex<HashSet<(String, String)>>,
}

struct Claims<'a> {
    in_flight: &'a Mutex<HashSet<(String, String)>>,
    keys: Vec<(String, String)>,
}

impl Drop for Claims<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        for key in &self.keys {
            in_flight.remove(key);
        }
    }
}

impl Terminator {
    pub fn new(store: Arc<LedgerStore>, clouds: Arc<CloudRegistry>, pool: WorkerPool) -> Self {
        Self {
            store,
            clouds,
            pool,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn clouds(&self) -> &Arc<CloudRegistry> {
        &self.clouds
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn ledger(&self) -> TerminationLedger {
        TerminationLedger::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clouds),
            self.pool.clone(),
        )
    }

    /// Terminate `nodes`, each with its own disposal.
    ///
    /// Nodes already held by another live ledger are skipped and listed as
    /// deferred; that ledger is responsible for them.
    pub async fn terminate(&self, nodes: &[RunningNode]) -> TerminationReport {
        let ledger = self.ledger();
        let mut claims = Claims {
            in_flight: &self.in_flight,
            keys: Vec::with_capacity(nodes.len()),
        };

        let mut deferred = Vec::new();
        let mut intents = Vec::with_capacity(nodes.len());
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            for node in nodes {
                let key = (node.cloud_name.clone(), node.node_id().to_string());
                if !in_flight.insert(key.clone()) {
                    warn!(
                        cloud = %node.cloud_name,
                        node_id = %node.node_id(),
                        "Node already held by a live termination ledger, skipping"
                    );
                    deferred.push(node.node_id().to_string());
                    continue;
                }
                claims.keys.push(key);
                intents.push((node.cloud_name.as_str(), node.node_id(), node.disposal));
            }
        }

        if let Err(e) = ledger.record_intents(intents) {
            error!(
                ledger_id = %ledger.id(),
                error = %e,
                "Failed to persist termination ledger, terminating without crash safety"
            );
        }

        let mut report = ledger.execute().await;
        drop(claims);
        report.deferred = deferred;
        report
    }

    /// Destroy `nodes` regardless of their disposal.
    pub async fn destroy(&self, nodes: &[RunningNode]) -> TerminationReport {
        let nodes: Vec<RunningNode> = nodes
            .iter()
            .cloned()
            .map(|n| n.with_disposal(Disposal::Destroy))
            .collect();
        self.terminate(&nodes).await
    }
}
