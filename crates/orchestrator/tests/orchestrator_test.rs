//! End-to-end scenarios for the orchestrator facade against mock collaborators

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use fleet_common::{
    Customer, DeployRequest, DeploymentStatus, Error, License, LicenseStatus, LicenseType,
    QuotaDimension, ResourceOverride, ResourceQuotas, SubscriptionPlan, UpdateRequest,
};
use fleet_orchestrator::health::HealthMonitor;
use fleet_orchestrator::mock::MockFleet;
use fleet_orchestrator::store::DeploymentStore;
use fleet_orchestrator::Orchestrator;

fn license(id: &str, customer_id: &str, application_id: &str) -> License {
    License {
        id: id.to_string(),
        customer_id: customer_id.to_string(),
        application_id: application_id.to_string(),
        license_type: LicenseType::Subscription,
        status: LicenseStatus::Active,
        valid_from: Utc::now() - ChronoDuration::days(10),
        valid_until: None,
        max_deployments: None,
    }
}

/// Customer on explicit quotas, licensed for both demo applications
async fn tight_customer(fleet: &MockFleet, id: &str, quotas: ResourceQuotas) {
    let mut customer = Customer::new(id, "Tight", SubscriptionPlan::Starter);
    customer.quotas = Some(quotas);
    fleet.catalog.upsert_customer(customer).await;
    fleet
        .catalog
        .upsert_license(license(&format!("{id}_a"), id, "app_a"))
        .await;
    fleet
        .catalog
        .upsert_license(license(&format!("{id}_b"), id, "app_b"))
        .await;
}

fn cpu_request(customer_id: &str, cpu_millis: u64) -> DeployRequest {
    let mut request = DeployRequest::new(customer_id, "app_a");
    request.resources = Some(ResourceOverride {
        cpu_millis,
        memory_mb: 64,
        storage_mb: Some(64),
    });
    request
}

#[tokio::test]
async fn test_container_quota_rejects_second_deploy() {
    let fleet = MockFleet::new().await;
    tight_customer(
        &fleet,
        "cust_tight",
        ResourceQuotas {
            max_containers: 1,
            ..ResourceQuotas::default()
        },
    )
    .await;
    let orchestrator = fleet.orchestrator();

    let first = orchestrator
        .deploy(&DeployRequest::new("cust_tight", "app_a"))
        .await
        .unwrap();

    let usage_before = orchestrator.customer_usage("cust_tight").await.unwrap().usage;
    let err = orchestrator
        .deploy(&DeployRequest::new("cust_tight", "app_b"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::QuotaExceeded {
            dimension: QuotaDimension::Containers,
            ..
        }
    ));
    assert_eq!(err.code(), "QuotaExceeded:containers");

    // Rejection leaves usage untouched
    let usage_after = orchestrator.customer_usage("cust_tight").await.unwrap().usage;
    assert!(usage_before.same_totals(&usage_after));

    orchestrator.settle().await;
    let first = orchestrator.get_deployment(&first.id).await.unwrap();
    assert_eq!(first.status, DeploymentStatus::Running);
}

#[tokio::test]
async fn test_expired_license_creates_no_record() {
    let fleet = MockFleet::new().await;
    let mut expired = license("lic_x", "cust_2", "app_b");
    expired.valid_from = Utc::now() - ChronoDuration::days(60);
    expired.valid_until = Some(Utc::now() - ChronoDuration::days(1));
    fleet.catalog.upsert_license(expired).await;
    let orchestrator = fleet.orchestrator();

    let err = orchestrator
        .deploy(&DeployRequest::new("cust_2", "app_b"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::LicenseExpired(_)));
    assert!(fleet.store.is_empty().await);
    assert!(orchestrator.list_deployments(None, None).await.is_empty());
    assert_eq!(fleet.engine.ledger.usage("cust_2").await.deployments, 0);
    assert_eq!(fleet.audit.count("deployment.rejected"), 1);
}

#[tokio::test]
async fn test_unlicensed_application_is_rejected() {
    let fleet = MockFleet::new().await;
    let orchestrator = fleet.orchestrator();

    let err = orchestrator
        .deploy(&DeployRequest::new("cust_2", "app_b"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LicenseRequired { .. }));
}

#[tokio::test]
async fn test_sustained_health_failure_fails_exactly_once() {
    let fleet = MockFleet::new().await;
    let orchestrator = fleet.orchestrator();
    let deployment = orchestrator
        .deploy(&DeployRequest::new("cust_1", "app_a"))
        .await
        .unwrap();
    orchestrator.settle().await;

    let instance = orchestrator
        .get_deployment(&deployment.id)
        .await
        .unwrap()
        .instance
        .unwrap();
    fleet.runtime.set_healthy(&instance.id, false);

    let monitor = HealthMonitor::new(fleet.engine.clone());
    for tick in 1..=3 {
        monitor.check_all().await;
        let current = orchestrator.get_deployment(&deployment.id).await.unwrap();
        assert_eq!(current.status, DeploymentStatus::Degraded, "tick {tick}");
    }
    monitor.check_all().await;
    monitor.check_all().await;

    let failed = orchestrator.get_deployment(&deployment.id).await.unwrap();
    assert_eq!(failed.status, DeploymentStatus::Failed);
    assert_eq!(failed.health.consecutive_failures, 4);
    assert!(orchestrator
        .list_deployments(None, Some(DeploymentStatus::Running))
        .await
        .is_empty());

    let failed_transitions = fleet
        .audit
        .events()
        .into_iter()
        .filter(|e| e.name == "deployment.transition" && e.fields["to"] == "failed")
        .count();
    assert_eq!(failed_transitions, 1);
}

#[tokio::test]
async fn test_stop_reclaims_health_failed_deployment() {
    let fleet = MockFleet::new().await;
    let orchestrator = fleet.orchestrator();
    let deployment = orchestrator
        .deploy(&DeployRequest::new("cust_1", "app_a"))
        .await
        .unwrap();
    orchestrator.settle().await;

    let instance = orchestrator
        .get_deployment(&deployment.id)
        .await
        .unwrap()
        .instance
        .unwrap();
    fleet.runtime.set_healthy(&instance.id, false);
    let monitor = HealthMonitor::new(fleet.engine.clone());
    for _ in 0..4 {
        monitor.check_all().await;
    }
    assert_eq!(fleet.engine.ledger.usage("cust_1").await.deployments, 1);

    let stopped = orchestrator.stop_deployment(&deployment.id).await.unwrap();
    assert_eq!(stopped.status, DeploymentStatus::Failed);
    assert!(!stopped.reservation_held);
    assert!(stopped.instance.is_none());
    assert_eq!(fleet.engine.ledger.usage("cust_1").await.deployments, 0);
    assert_eq!(fleet.runtime.instance_count(), 0);
}

#[tokio::test]
async fn test_update_with_failing_image_keeps_previous_version() {
    let fleet = MockFleet::new().await;
    let orchestrator = fleet.orchestrator();
    let deployment = orchestrator
        .deploy(&DeployRequest::new("cust_1", "app_a"))
        .await
        .unwrap();
    orchestrator.settle().await;
    let before = orchestrator.get_deployment(&deployment.id).await.unwrap();
    let v1 = before.instance.clone().unwrap();

    fleet.runtime.fail_version("2.0");
    let err = orchestrator
        .update_deployment(
            &deployment.id,
            &UpdateRequest {
                version: Some("2.0".to_string()),
                environment: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UpdateFailed(_)));

    let after = orchestrator.get_deployment(&deployment.id).await.unwrap();
    assert_eq!(after.status, DeploymentStatus::Running);
    assert_eq!(after.version, "1.0");
    assert_eq!(after.instance, Some(v1.clone()));
    assert_eq!(fleet.router.route_for(&after.domains[0]), Some(v1.id));

    let persisted = fleet.store.get(&deployment.id).await.unwrap().unwrap();
    assert_eq!(persisted.status, DeploymentStatus::Running);
    assert_eq!(persisted.version, "1.0");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_half_quota_deploys() {
    let fleet = MockFleet::new().await;
    tight_customer(
        &fleet,
        "cust_cpu",
        ResourceQuotas {
            max_cpu_millis: 1_000,
            ..ResourceQuotas::default()
        },
    )
    .await;
    let orchestrator = Arc::new(fleet.orchestrator());

    // 600m twice does not fit in 1000m: exactly one wins
    let (req_a, req_b) = (cpu_request("cust_cpu", 600), cpu_request("cust_cpu", 600));
    let (a, b) = tokio::join!(
        orchestrator.deploy(&req_a),
        orchestrator.deploy(&req_b),
    );
    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let rejected = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert_eq!(rejected.code(), "QuotaExceeded:cpu");

    orchestrator.settle().await;
    let winner = results.iter().find_map(|r| r.as_ref().ok()).unwrap();
    orchestrator.stop_deployment(&winner.id).await.unwrap();

    // 400m twice fits: both win
    let (req_a, req_b) = (cpu_request("cust_cpu", 400), cpu_request("cust_cpu", 400));
    let (a, b) = tokio::join!(
        orchestrator.deploy(&req_a),
        orchestrator.deploy(&req_b),
    );
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(
        fleet.engine.ledger.usage("cust_cpu").await.cpu_millis,
        800
    );
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let fleet = MockFleet::new().await;
    let orchestrator = fleet.orchestrator();
    let deployment = orchestrator
        .deploy(&DeployRequest::new("cust_1", "app_a"))
        .await
        .unwrap();
    orchestrator.settle().await;

    let first = orchestrator.stop_deployment(&deployment.id).await.unwrap();
    let second = orchestrator.stop_deployment(&deployment.id).await.unwrap();

    assert_eq!(first.status, DeploymentStatus::Stopped);
    assert_eq!(second.status, DeploymentStatus::Stopped);
    assert!(!fleet.engine.ledger.holds("cust_1", &deployment.id).await);
    assert_eq!(fleet.engine.ledger.usage("cust_1").await.cpu_millis, 0);
    assert_eq!(fleet.router.route_count(), 0);
}

#[tokio::test]
async fn test_stop_during_provisioning_is_cooperative() {
    let fleet = MockFleet::new().await;
    fleet.source.set_delay(Duration::from_millis(100));
    let orchestrator = fleet.orchestrator();

    let deployment = orchestrator
        .deploy(&DeployRequest::new("cust_1", "app_a"))
        .await
        .unwrap();
    let pending = orchestrator.stop_deployment(&deployment.id).await.unwrap();
    assert!(!pending.status.is_terminal());

    orchestrator.settle().await;
    let stopped = orchestrator.get_deployment(&deployment.id).await.unwrap();
    assert_eq!(stopped.status, DeploymentStatus::Stopped);
    assert_eq!(fleet.runtime.instance_count(), 0);
    assert_eq!(fleet.engine.ledger.usage("cust_1").await.deployments, 0);
}

#[tokio::test]
async fn test_provisioning_failure_is_visible_on_the_record() {
    let fleet = MockFleet::new().await;
    fleet.source.set_failing(true);
    let orchestrator = fleet.orchestrator();

    let deployment = orchestrator
        .deploy(&DeployRequest::new("cust_1", "app_a"))
        .await
        .unwrap();
    orchestrator.settle().await;

    let failed = orchestrator.get_deployment(&deployment.id).await.unwrap();
    assert_eq!(failed.status, DeploymentStatus::Failed);
    assert!(failed.error.unwrap().contains("mock source unavailable"));
    assert_eq!(
        failed.metadata.get("failed_step").map(String::as_str),
        Some("prepare_source")
    );
    assert_eq!(fleet.engine.ledger.usage("cust_1").await.deployments, 0);
}

#[tokio::test]
async fn test_shutdown_leaves_persisted_intermediate_state() {
    let fleet = MockFleet::new().await;
    fleet.source.set_delay(Duration::from_millis(100));
    let orchestrator = fleet.orchestrator();

    let deployment = orchestrator
        .deploy(&DeployRequest::new("cust_1", "app_a"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    orchestrator.shutdown().await;

    let persisted = fleet.store.get(&deployment.id).await.unwrap().unwrap();
    assert_eq!(persisted.status, DeploymentStatus::Deploying);
    assert_eq!(fleet.runtime.instance_count(), 0);

    let err = orchestrator
        .deploy(&DeployRequest::new("cust_1", "app_a"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_update_never_leaves_route_without_live_instance() {
    let mut settings = MockFleet::test_settings();
    settings.drain_grace = Duration::from_millis(50);
    let fleet = MockFleet::with_settings(settings).await;
    let orchestrator = Arc::new(fleet.orchestrator());

    let deployment = orchestrator
        .deploy(&DeployRequest::new("cust_1", "app_a"))
        .await
        .unwrap();
    orchestrator.settle().await;
    let domain = orchestrator
        .get_deployment(&deployment.id)
        .await
        .unwrap()
        .domains[0]
        .clone();

    fleet.runtime.set_start_delay(Duration::from_millis(50));
    let done = Arc::new(AtomicBool::new(false));
    let misses = Arc::new(AtomicUsize::new(0));
    let samples = Arc::new(AtomicUsize::new(0));

    let prober = {
        let runtime = fleet.runtime.clone();
        let router = fleet.router.clone();
        let (done, misses, samples) = (done.clone(), misses.clone(), samples.clone());
        tokio::spawn(async move {
            while !done.load(Ordering::SeqCst) {
                let live = router
                    .route_for(&domain)
                    .is_some_and(|instance| runtime.is_running(&instance));
                if !live {
                    misses.fetch_add(1, Ordering::SeqCst);
                }
                samples.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };

    let updated = orchestrator
        .update_deployment(
            &deployment.id,
            &UpdateRequest {
                version: Some("2.0".to_string()),
                environment: None,
            },
        )
        .await
        .unwrap();
    done.store(true, Ordering::SeqCst);
    prober.await.unwrap();

    assert_eq!(updated.version, "2.0");
    assert!(samples.load(Ordering::SeqCst) > 0);
    assert_eq!(misses.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_background_tasks_stop_on_shutdown() {
    let fleet = MockFleet::new().await;
    let orchestrator: Orchestrator = fleet.orchestrator();
    orchestrator.start_background().await;

    orchestrator
        .deploy(&DeployRequest::new("cust_1", "app_a"))
        .await
        .unwrap();
    orchestrator.settle().await;
    tokio::time::sleep(Duration::from_millis(120)).await;

    let running = orchestrator
        .list_deployments(Some("cust_1"), Some(DeploymentStatus::Running))
        .await;
    assert_eq!(running.len(), 1);
    assert!(running[0].last_checked.is_some());

    tokio::time::timeout(Duration::from_secs(5), orchestrator.shutdown())
        .await
        .expect("shutdown should complete");
}
