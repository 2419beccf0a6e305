//! Integration tests for termination ledger recovery.
//!
//! A process that dies after recording termination intents but before
//! executing them leaves a record behind. The next start must terminate
//! those nodes exactly once and leave no record.

use std::sync::Arc;

use cloudfleet_controller::clouds::{CloudProfile, CloudRegistry};
use cloudfleet_controller::driver::{MockCloudDriver, NodeStatus};
use cloudfleet_controller::ledger::{LedgerStore, StartupRecovery, Terminator};
use cloudfleet_controller::plan::Disposal;
use cloudfleet_controller::pool::WorkerPool;
use cloudfleet_id::LedgerId;

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<LedgerStore>,
    clouds: Arc<CloudRegistry>,
}

fn harness(driver: Arc<MockCloudDriver>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(LedgerStore::new(dir.path().join("ledgers")));
    let clouds = Arc::new(CloudRegistry::new().with_cloud(CloudProfile::new("cloudA"), driver));
    Harness {
        _dir: dir,
        store,
        clouds,
    }
}

fn recovery(h: &Harness) -> StartupRecovery {
    StartupRecovery::new(Arc::clone(&h.store), Arc::clone(&h.clouds), WorkerPool::new(2))
}

#[tokio::test]
async fn test_crash_between_record_and_execute() {
    let driver = Arc::new(
        MockCloudDriver::new()
            .with_node("i-a", NodeStatus::Running)
            .with_node("i-b", NodeStatus::Running),
    );
    let h = harness(driver.clone());

    {
        let terminator = Terminator::new(Arc::clone(&h.store), Arc::clone(&h.clouds), WorkerPool::new(2));
        let ledger = terminator.ledger();
        ledger.record_intent("cloudA", "i-a", Disposal::Destroy).unwrap();
        ledger.record_intent("cloudA", "i-b", Disposal::Suspend).unwrap();
        assert!(ledger.record_path().exists());
        // The process dies here: the ledger is dropped without executing.
    }
    assert_eq!(driver.destroyed_count(), 0);
    assert_eq!(h.store.list_records().unwrap().len(), 1);

    let report = recovery(&h).run().await;
    assert!(report.is_clean());
    assert_eq!(report.records, 1);
    assert_eq!(report.terminated, 2);
    assert_eq!(driver.destroy_count("i-a"), 1);
    assert_eq!(driver.node("i-b").unwrap().status, NodeStatus::Suspended);
    assert!(h.store.list_records().unwrap().is_empty());

    let second = recovery(&h).run().await;
    assert_eq!(second.records, 0);
    assert_eq!(second.terminated, 0);
    assert_eq!(driver.destroy_count("i-a"), 1);
}

#[tokio::test]
async fn test_leftover_record_destroys_node() {
    let driver = Arc::new(MockCloudDriver::new().with_node("i-1", NodeStatus::Running));
    let h = harness(driver.clone());

    let id = LedgerId::new();
    let record = serde_json::json!({
        "version": 1,
        "ledger_id": id.to_string(),
        "clouds": { "cloudA": { "suspend": [], "destroy": ["i-1"] } }
    });
    std::fs::create_dir_all(h.store.root()).unwrap();
    std::fs::write(h.store.record_path(&id), record.to_string()).unwrap();

    let report = recovery(&h).run().await;
    assert!(report.is_clean());
    assert_eq!(driver.destroy_count("i-1"), 1);
    assert_eq!(driver.live_count(), 0);
    assert!(!h.store.record_path(&id).exists());
}

#[tokio::test]
async fn test_failed_replay_still_removes_record() {
    let driver = Arc::new(MockCloudDriver::new().with_node("i-1", NodeStatus::Running));
    driver.set_destroy_failure("i-1", true);
    let h = harness(driver.clone());

    let terminator = Terminator::new(Arc::clone(&h.store), Arc::clone(&h.clouds), WorkerPool::new(1));
    let ledger = terminator.ledger();
    ledger.record_intent("cloudA", "i-1", Disposal::Destroy).unwrap();
    drop(ledger);

    let report = recovery(&h).run().await;
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].to_string().contains("i-1"));
    assert!(h.store.list_records().unwrap().is_empty());
    assert_eq!(driver.live_count(), 1);
}

#[tokio::test]
async fn test_nodes_already_gone_are_not_failures() {
    let driver = Arc::new(MockCloudDriver::new().with_node("i-2", NodeStatus::Terminated));
    let h = harness(driver.clone());

    let terminator = Terminator::new(Arc::clone(&h.store), Arc::clone(&h.clouds), WorkerPool::new(1));
    let ledger = terminator.ledger();
    ledger.record_intent("cloudA", "i-1", Disposal::Destroy).unwrap();
    ledger.record_intent("cloudA", "i-2", Disposal::Suspend).unwrap();
    drop(ledger);

    let report = recovery(&h).run().await;
    assert!(report.is_clean());
    assert_eq!(report.terminated, 0);
    assert_eq!(driver.destroyed_count(), 0);
}
