//! Replays ledger records left behind by an unclean shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use cloudfleet_id::LedgerId;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use super::store::{LedgerError, LedgerStore};
use super::TerminationLedger;
use crate::clouds::CloudRegistry;
use crate::pool::WorkerPool;

/// A stale record that could not be fully replayed. The record is removed
/// either way; leftover nodes are picked up by later cleanup.
#[derive(Debug, Error)]
pub enum RecoveryFailure {
    #[error("could not scan ledger directory: {0}")]
    Scan(#[source] LedgerError),

    #[error("discarded unreadable ledger record {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: LedgerError,
    },

    #[error("ledger {ledger_id} could not terminate {} node(s): {}", .node_ids.len(), .node_ids.join(", "))]
    Incomplete {
        ledger_id: LedgerId,
        node_ids: Vec<String>,
    },
}

#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Records found on disk.
    pub records: usize,
    /// Nodes suspended or destroyed during replay.
    pub terminated: usize,
    pub failures: Vec<RecoveryFailure>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Must run to completion before the controller issues any new termination.
pub struct StartupRecovery {
    store: Arc<LedgerStore>,
    clouds: Arc<CloudRegistry>,
    pool: WorkerPool,
}

impl StartupRecovery {
    pub fn new(store: Arc<LedgerStore>, clouds: Arc<CloudRegistry>, pool: WorkerPool) -> Self {
        Self {
            store,
            clouds,
            pool,
        }
    }

    #[instrument(skip(self), fields(dir = %self.store.root().display()))]
    pub async fn run(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();

        let records = match self.store.list_records() {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "Failed to scan for stale termination ledgers");
                report.failures.push(RecoveryFailure::Scan(e));
                return report;
            }
        };
        report.records = records.len();
        if records.is_empty() {
            return report;
        }
        info!(records = records.len(), "Replaying stale termination ledgers");

        for path in records {
            let record = match self.store.load(&path) {
                Ok(record) => record,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Discarding unreadable termination ledger");
                    if let Err(remove_err) = self.store.remove(&path) {
                        error!(path = %path.display(), error = %remove_err, "Failed to remove unreadable ledger");
                    }
                    report
                        .failures
                        .push(RecoveryFailure::Unreadable { path, source: e });
                    continue;
                }
            };

            let ledger_id = record.ledger_id;
            let ledger = TerminationLedger::resume(
                record,
                path,
                Arc::clone(&self.store),
                Arc::clone(&self.clouds),
                self.pool.clone(),
            );
            let result = ledger.execute().await;
            report.terminated += result.suspended.len() + result.destroyed.len();

            if !result.is_clean() {
                let failure = RecoveryFailure::Incomplete {
                    ledger_id,
                    node_ids: result.failures.into_iter().map(|f| f.node_id).collect(),
                };
                error!(error = %failure, "Stale termination ledger replay incomplete");
                report.failures.push(failure);
            }
        }

        info!(
            records = report.records,
            terminated = report.terminated,
            failed = report.failures.len(),
            "Termination ledger recovery complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clouds::CloudProfile;
    use crate::driver::{MockCloudDriver, NodeStatus};
    use crate::plan::Disposal;

    #[tokio::test]
    async fn test_empty_directory_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let recovery = StartupRecovery::new(
            Arc::new(LedgerStore::new(dir.path())),
            Arc::new(CloudRegistry::new()),
            WorkerPool::new(1),
        );
        let report = recovery.run().await;
        assert_eq!(report.records, 0);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_unreadable_record_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("termination-ledger@garbage.json");
        std::fs::write(&path, "not json").unwrap();

        let recovery = StartupRecovery::new(
            Arc::new(LedgerStore::new(dir.path())),
            Arc::new(CloudRegistry::new()),
            WorkerPool::new(1),
        );
        let report = recovery.run().await;
        assert_eq!(report.records, 1);
        assert!(matches!(
            report.failures[0],
            RecoveryFailure::Unreadable { .. }
        ));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_failed_replay_still_removes_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LedgerStore::new(dir.path()));
        let driver = Arc::new(MockCloudDriver::new().with_node("i-1", NodeStatus::Running));
        driver.set_destroy_failure("i-1", true);
        let clouds = Arc::new(CloudRegistry::new().with_cloud(CloudProfile::new("aws"), driver.clone()));

        let ledger = TerminationLedger::new(store.clone(), clouds.clone(), WorkerPool::new(1));
        ledger.record_intent("aws", "i-1", Disposal::Destroy).unwrap();
        drop(ledger);

        let report = StartupRecovery::new(store.clone(), clouds, WorkerPool::new(1))
            .run()
            .await;
        assert!(matches!(
            &report.failures[0],
            RecoveryFailure::Incomplete { node_ids, .. } if node_ids == &vec!["i-1".to_string()]
        ));
        assert!(store.list_records().unwrap().is_empty());
        assert!(driver.node("i-1").is_some());
    }
}
