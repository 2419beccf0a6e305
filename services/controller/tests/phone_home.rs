//! Integration tests for phone-home waits.
//!
//! Covers the monitor on its own, under a paused clock for deadlines, and
//! end to end through the HTTP callback while a build session waits.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use cloudfleet_controller::agent::AgentInventory;
use cloudfleet_controller::api::{create_router, ApiState};
use cloudfleet_controller::clock::SystemClock;
use cloudfleet_controller::clouds::{CloudProfile, CloudRegistry, TemplateSpec};
use cloudfleet_controller::driver::MockCloudDriver;
use cloudfleet_controller::ledger::{LedgerStore, Terminator};
use cloudfleet_controller::phone_home::{
    PhoneHomeError, PhoneHomeMonitor, PhoneHomeRegistry, PhoneHomeState,
};
use cloudfleet_controller::pool::WorkerPool;
use cloudfleet_controller::provision::{Provisioner, ProvisionerConfig};
use cloudfleet_controller::launcher::AgentLauncher;
use cloudfleet_controller::session::{
    BuildSessions, InstancesToRun, SupplementalInstances, IPS_ENV_VAR,
};
use cloudfleet_controller::sweeper::{CleanupSweeper, SweeperConfig};
use tokio::time::Instant;
use tower::ServiceExt;

#[tokio::test]
async fn test_multiple_targets_all_required() {
    let monitor = Arc::new(PhoneHomeMonitor::new(0));
    monitor.wait_for_phone_home_async(["a", "b"]).unwrap();

    assert!(monitor.ring("a"));
    assert!(!monitor.ring("a"));
    assert!(matches!(monitor.state(), PhoneHomeState::Waiting { .. }));
    assert_eq!(monitor.remaining(), vec!["b".to_string()]);

    assert!(monitor.ring("b"));
    monitor.join().await.unwrap();
    assert_eq!(monitor.state(), PhoneHomeState::Satisfied);
    assert!(!monitor.ring("b"));
}

#[tokio::test(start_paused = true)]
async fn test_one_minute_timeout_fires_at_sixty_seconds() {
    let monitor = PhoneHomeMonitor::new(1);
    monitor.activate(["a", "b"], 1).unwrap();
    monitor.ring("a");

    let started = Instant::now();
    let err = monitor.wait_for_phone_home().await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(60), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(61), "elapsed {elapsed:?}");
    assert_eq!(
        err,
        PhoneHomeError::Timeout {
            targets: vec!["b".to_string()],
            timeout_minutes: 1,
        }
    );
    assert_eq!(
        monitor.state(),
        PhoneHomeState::TimedOut {
            targets: vec!["b".to_string()],
            timeout_minutes: 1,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_wakes_waiter() {
    let monitor = Arc::new(PhoneHomeMonitor::new(10));
    monitor.wait_for_phone_home_async(["a"]).unwrap();

    tokio::time::sleep(Duration::from_secs(90)).await;
    monitor.interrupt();

    assert_eq!(monitor.join().await, Err(PhoneHomeError::Interrupted));
}

#[tokio::test]
async fn test_webhook_completes_supplemental_session() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(MockCloudDriver::new());
    let mut template = TemplateSpec::new("builder");
    template.wait_phone_home = true;
    template.phone_home_timeout_minutes = 5;
    let mut profile = CloudProfile::new("cloudA");
    profile.templates.push(template);
    let clouds = Arc::new(CloudRegistry::new().with_cloud(profile, driver.clone()));

    let pool = WorkerPool::new(4);
    let terminator = Arc::new(Terminator::new(
        Arc::new(LedgerStore::new(dir.path())),
        Arc::clone(&clouds),
        pool.clone(),
    ));
    let provisioner = Arc::new(Provisioner::new(
        Arc::clone(&terminator),
        pool,
        ProvisionerConfig::default(),
    ));
    let registry = Arc::new(PhoneHomeRegistry::new());
    let inventory = Arc::new(AgentInventory::new());
    let session = Arc::new(SupplementalInstances::new(
        Arc::clone(&clouds),
        Arc::clone(&provisioner),
        Arc::clone(&registry),
    ));
    let app = create_router(ApiState {
        phone_home: Arc::clone(&registry),
        inventory: Arc::clone(&inventory),
        launcher: Arc::new(AgentLauncher::new(
            clouds,
            provisioner,
            Arc::clone(&inventory),
            Arc::clone(&registry),
            Arc::new(SystemClock),
        )),
        sweeper: Arc::new(CleanupSweeper::new(inventory, terminator, SweeperConfig::default())),
        supplemental: Arc::clone(&session),
        sessions: Arc::new(BuildSessions::new()),
    });

    let set_up = tokio::spawn(async move {
        session
            .set_up(&[InstancesToRun::new("cloudA", "builder", 2)])
            .await
    });
    while registry.is_empty() {
        tokio::task::yield_now().await;
    }

    // The mock names nodes `{template}-{n:04x}`.
    for name in ["builder-0001", "builder-0002"] {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri(format!("/phone-home?instance_id={name}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let env = match set_up.await.unwrap() {
        Ok(env) => env,
        Err(e) => panic!("set up failed: {e}"),
    };
    assert_eq!(env.nodes().len(), 2);
    assert_eq!(env.env_vars()[IPS_ENV_VAR].split(',').count(), 2);
    assert!(registry.is_empty());

    let report = env.tear_down().await;
    assert!(report.is_clean());
    assert_eq!(driver.live_count(), 0);
}
