//! Periodic reclamation of agents flagged pending-delete.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::{AgentInventory, ManagedAgent};
use crate::ledger::Terminator;

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
        }
    }
}

/// Result of one sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Agents terminated and removed from the inventory.
    pub removed: Vec<String>,
    /// Agents whose termination failed; still flagged for the next sweep.
    pub failed: Vec<String>,
    /// Agents another termination was already working on; still flagged.
    pub in_progress: Vec<String>,
}

/// Outcome of an explicit delete request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteOutcome {
    UnknownAgent,
    /// Flagged; the next sweep terminates it.
    Flagged,
    /// Already flagged, so terminated right away.
    Deleted,
    /// Already flagged but still running a task, or already being
    /// terminated elsewhere.
    Postponed,
    /// Termination failed; the agent stays flagged.
    Failed,
}

pub struct CleanupSweeper {
    inventory: Arc<AgentInventory>,
    terminator: Arc<Terminator>,
    config: SweeperConfig,
}

impl CleanupSweeper {
    pub fn new(
        inventory: Arc<AgentInventory>,
        terminator: Arc<Terminator>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            inventory,
            terminator,
            config,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting cleanup sweeper"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Cleanup sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Terminate every pending-delete agent and wait for all of them.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let flagged = self.inventory.pending_delete();
        if flagged.is_empty() {
            debug!("No agents pending delete");
            return report;
        }

        let mut tasks = JoinSet::new();
        for agent in flagged {
            let terminator = Arc::clone(&self.terminator);
            tasks.spawn(async move {
                info!(agent = %agent.name(), "Deleting pending agent");
                let terminated = terminate_agent(&terminator, &agent).await;
                (agent, terminated)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((agent, AgentTermination::Terminated)) => {
                    self.inventory.remove(agent.name());
                    report.removed.push(agent.name().to_string());
                }
                Ok((agent, AgentTermination::InProgress)) => {
                    report.in_progress.push(agent.name().to_string())
                }
                Ok((agent, AgentTermination::Failed)) => report.failed.push(agent.name().to_string()),
                Err(e) => error!(error = %e, "Agent deletion task failed"),
            }
        }

        info!(
            removed = report.removed.len(),
            failed = report.failed.len(),
            in_progress = report.in_progress.len(),
            "Cleanup sweep complete"
        );
        report
    }

    /// Delete an agent on request.
    ///
    /// The first request disconnects it and flags it for the next sweep. A
    /// request for an agent that is already flagged terminates it at once,
    /// unless it is busy.
    pub async fn request_delete(&self, name: &str) -> DeleteOutcome {
        let Some(agent) = self.inventory.get(name) else {
            return DeleteOutcome::UnknownAgent;
        };

        agent.disconnect();
        if !agent.is_pending_delete() {
            agent.set_pending_delete(true);
            return DeleteOutcome::Flagged;
        }

        info!(agent = %name, "Agent already pending delete, deleting now");
        if !agent.snapshot().is_idle() {
            info!(agent = %name, "Agent is not idle, postponing deletion");
            return DeleteOutcome::Postponed;
        }
        match terminate_agent(&self.terminator, &agent).await {
            AgentTermination::Terminated => {
                self.inventory.remove(name);
                DeleteOutcome::Deleted
            }
            AgentTermination::InProgress => DeleteOutcome::Postponed,
            AgentTermination::Failed => DeleteOutcome::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AgentTermination {
    Terminated,
    /// Another ledger holds the node; whoever owns that ledger decides.
    InProgress,
    Failed,
}

async fn terminate_agent(terminator: &Terminator, agent: &ManagedAgent) -> AgentTermination {
    agent.disconnect();
    let report = terminator.terminate(std::slice::from_ref(agent.node())).await;
    if !report.is_clean() {
        for failure in &report.failures {
            warn!(agent = %agent.name(), error = %failure, "Failed to terminate agent, will retry");
        }
        return AgentTermination::Failed;
    }
    if !report.is_complete() {
        info!(agent = %agent.name(), "Agent termination already in progress");
        return AgentTermination::InProgress;
    }
    AgentTermination::Terminated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clouds::{CloudProfile, CloudRegistry};
    use crate::driver::{CloudDriver, MockCloudDriver, NodeStatus};
    use crate::ledger::LedgerStore;
    use crate::phone_home::PhoneHomeMonitor;
    use crate::plan::RunningNode;
    use crate::pool::WorkerPool;
    use crate::retention::RetentionTime;
    use chrono::Utc;

    struct Fixture {
        _dir: tempfile::TempDir,
        driver: Arc<MockCloudDriver>,
        inventory: Arc<AgentInventory>,
        sweeper: CleanupSweeper,
    }

    fn fixture(node_ids: &[&str]) -> Fixture {
        fixture_with(MockCloudDriver::new(), node_ids)
    }

    fn fixture_with(mut driver: MockCloudDriver, node_ids: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        for id in node_ids {
            driver = driver.with_node(id, NodeStatus::Running);
        }
        let driver = Arc::new(driver);
        let clouds = Arc::new(CloudRegistry::new().with_cloud(CloudProfile::new("aws"), driver.clone()));
        let terminator = Arc::new(Terminator::new(
            Arc::new(LedgerStore::new(dir.path())),
            clouds,
            WorkerPool::new(2),
        ));
        let inventory = Arc::new(AgentInventory::new());
        for id in node_ids {
            let mut node = crate::agent::tests::running_node("aws", id);
            node.node.id = id.to_string();
            inventory.register(agent(node));
        }
        let sweeper = CleanupSweeper::new(Arc::clone(&inventory), terminator, SweeperConfig::default());
        Fixture {
            _dir: dir,
            driver,
            inventory,
            sweeper,
        }
    }

    fn agent(node: RunningNode) -> Arc<ManagedAgent> {
        let a = Arc::new(ManagedAgent::new(
            node,
            RetentionTime::Inherit,
            Arc::new(PhoneHomeMonitor::new(0)),
            Utc::now(),
        ));
        a.connect(1, Utc::now());
        a
    }

    #[tokio::test]
    async fn test_sweep_removes_only_flagged_agents() {
        let f = fixture(&["i-1", "i-2"]);
        f.inventory.get("i-1").unwrap().set_pending_delete(true);

        let report = f.sweeper.sweep().await;
        assert_eq!(report.removed, vec!["i-1".to_string()]);
        assert_eq!(f.inventory.len(), 1);
        assert_eq!(f.driver.destroy_count("i-1"), 1);
        assert_eq!(f.driver.destroy_count("i-2"), 0);
    }

    #[tokio::test]
    async fn test_failed_termination_is_retried_next_sweep() {
        let f = fixture(&["i-1"]);
        f.driver.set_destroy_failure("i-1", true);
        f.inventory.get("i-1").unwrap().set_pending_delete(true);

        let report = f.sweeper.sweep().await;
        assert_eq!(report.failed, vec!["i-1".to_string()]);
        assert!(f.inventory.get("i-1").unwrap().is_pending_delete());

        f.driver.set_destroy_failure("i-1", false);
        let report = f.sweeper.sweep().await;
        assert_eq!(report.removed, vec!["i-1".to_string()]);
        assert!(f.inventory.is_empty());
    }

    #[tokio::test]
    async fn test_node_gone_before_sweep_counts_as_removed() {
        let f = fixture(&["i-1"]);
        f.driver.destroy("i-1").await.unwrap();
        f.inventory.get("i-1").unwrap().set_pending_delete(true);

        let report = f.sweeper.sweep().await;
        assert_eq!(report.removed, vec!["i-1".to_string()]);
    }

    #[tokio::test]
    async fn test_request_delete_twice_deletes_immediately() {
        let f = fixture(&["i-1"]);

        assert_eq!(f.sweeper.request_delete("i-1").await, DeleteOutcome::Flagged);
        assert!(!f.inventory.get("i-1").unwrap().snapshot().online);
        assert_eq!(f.driver.destroyed_count(), 0);

        assert_eq!(f.sweeper.request_delete("i-1").await, DeleteOutcome::Deleted);
        assert_eq!(f.driver.destroy_count("i-1"), 1);
        assert_eq!(f.sweeper.request_delete("i-1").await, DeleteOutcome::UnknownAgent);
    }

    #[tokio::test]
    async fn test_request_delete_postpones_busy_agent() {
        let f = fixture(&["i-1"]);
        let a = f.inventory.get("i-1").unwrap();
        a.set_pending_delete(true);
        a.task_started();

        assert_eq!(f.sweeper.request_delete("i-1").await, DeleteOutcome::Postponed);
        assert_eq!(f.driver.destroyed_count(), 0);

        a.task_finished(Utc::now());
        assert_eq!(f.sweeper.request_delete("i-1").await, DeleteOutcome::Deleted);
    }

    #[tokio::test]
    async fn test_request_during_sweep_waits_for_its_outcome() {
        let f = Arc::new(fixture_with(
            MockCloudDriver::new().with_latency(std::time::Duration::from_millis(50)),
            &["i-1"],
        ));
        f.driver.set_destroy_failure("i-1", true);
        f.inventory.get("i-1").unwrap().set_pending_delete(true);

        let sweep = {
            let f = Arc::clone(&f);
            tokio::spawn(async move { f.sweeper.sweep().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(f.sweeper.request_delete("i-1").await, DeleteOutcome::Postponed);
        let report = sweep.await.unwrap();
        assert_eq!(report.failed, vec!["i-1".to_string()]);

        // The node is still alive, so the agent stays for the next sweep.
        assert!(f.driver.node("i-1").is_some());
        assert!(f.inventory.get("i-1").unwrap().is_pending_delete());
    }

    #[tokio::test]
    async fn test_overlapping_sweep_leaves_agent_to_the_first() {
        let f = Arc::new(fixture_with(
            MockCloudDriver::new().with_latency(std::time::Duration::from_millis(50)),
            &["i-1"],
        ));
        f.inventory.get("i-1").unwrap().set_pending_delete(true);

        let first = {
            let f = Arc::clone(&f);
            tokio::spawn(async move { f.sweeper.sweep().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let second = f.sweeper.sweep().await;
        assert!(second.removed.is_empty());
        assert_eq!(second.in_progress, vec!["i-1".to_string()]);

        let first = first.await.unwrap();
        assert_eq!(first.removed, vec!["i-1".to_string()]);
        assert_eq!(f.driver.destroy_count("i-1"), 1);
        assert!(f.inventory.is_empty());
    }
}
