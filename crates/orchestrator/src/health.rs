//! Health monitor
//!
//! Periodically probes every serving deployment. Probes run without any
//! lock held; a result is applied only if the deployment is still serving
//! the same instance and no other role owns it.

use std::sync::Arc;

use fleet_common::{DeploymentStatus, HealthState, InstanceHandle};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::pipeline::health_from_probe;
use crate::table::SharedEntry;

/// Consecutive failures tolerated before a deployment is failed
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

#[derive(Clone)]
pub struct HealthMonitor {
    engine: Arc<Engine>,
}

impl HealthMonitor {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Run the monitoring loop until shutdown is signalled
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting health monitor (every {:?}, threshold {})",
            self.engine.settings.health_interval, self.engine.settings.health_failure_threshold
        );
        let mut ticker = interval(self.engine.settings.health_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    let checked = self.check_all().await;
                    debug!("Health pass checked {} deployments", checked);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Health monitor stopped");
    }

    /// One pass over the table; returns how many deployments were probed
    pub async fn check_all(&self) -> usize {
        let mut checks = JoinSet::new();
        for entry in self.engine.table.entries().await {
            let monitor = self.clone();
            checks.spawn(async move { monitor.check(entry).await });
        }

        let mut checked = 0;
        while let Some(result) = checks.join_next().await {
            match result {
                Ok(true) => checked += 1,
                Ok(false) => {}
                Err(e) => error!("Health check task panicked: {}", e),
            }
        }
        checked
    }

    async fn check(&self, entry: SharedEntry) -> bool {
        let (instance, application_id) = {
            let guard = entry.lock().await;
            if guard.busy || !guard.record.status.is_serving() {
                return false;
            }
            let Some(instance) = guard.record.instance.clone() else {
                return false;
            };
            (instance, guard.record.application_id.clone())
        };

        let health_check = match self.engine.catalog.get_application(&application_id).await {
            Ok(application) => application.and_then(|a| a.health_check),
            Err(e) => {
                warn!("Catalog lookup for {} failed: {}", application_id, e);
                None
            }
        };
        let result = self.engine.probe.probe(&instance, health_check.as_ref()).await;

        let mut guard = entry.lock().await;
        if !still_owned(&guard.record.instance, &instance)
            || guard.busy
            || !guard.record.status.is_serving()
        {
            debug!(
                "Discarding stale probe of {} for {}",
                instance.name, guard.record.id
            );
            return false;
        }

        let threshold = self.engine.settings.health_failure_threshold;
        let status = guard.record.status;

        if result.healthy {
            let health = health_from_probe(&result, 0, HealthState::Healthy);
            let outcome = self
                .engine
                .commit_best_effort(&mut guard, |d| {
                    if status == DeploymentStatus::Degraded {
                        d.transition_to(DeploymentStatus::Running)?;
                    }
                    d.last_checked = health.last_check;
                    d.health = health;
                    Ok(())
                })
                .await;
            if let Err(e) = outcome {
                error!("Failed to record health of {}: {}", guard.record.id, e);
            }
            return true;
        }

        let failures = guard.record.health.consecutive_failures + 1;
        if failures <= threshold {
            let health = health_from_probe(&result, failures, HealthState::Degraded);
            let outcome = self
                .engine
                .commit_best_effort(&mut guard, |d| {
                    if status == DeploymentStatus::Running {
                        d.transition_to(DeploymentStatus::Degraded)?;
                    }
                    d.last_checked = health.last_check;
                    d.health = health;
                    Ok(())
                })
                .await;
            match outcome {
                Ok(d) => warn!(
                    "Deployment {} failed health check ({}/{}): {:?}",
                    d.id, failures, threshold, result.detail
                ),
                Err(e) => error!("Failed to record health of {}: {}", guard.record.id, e),
            }
            return true;
        }

        // Past the threshold: fail the deployment and take it out of routing.
        // The instance and its quota are held until an explicit stop.
        let health = health_from_probe(&result, failures, HealthState::Unhealthy);
        let message = format!("health check failed {} consecutive times", failures);
        let failed = self
            .engine
            .commit_best_effort(&mut guard, |d| {
                d.last_checked = health.last_check;
                d.health = health;
                d.mark_failed(message)
            })
            .await;
        if let Err(e) = failed {
            error!("Failed to mark {} failed: {}", guard.record.id, e);
            return true;
        }
        warn!(
            "Deployment {} failed after {} consecutive health failures",
            guard.record.id, failures
        );

        guard.busy = true;
        let domains = guard.record.domains.clone();
        drop(guard);

        self.engine.unroute(&domains).await;

        let mut guard = entry.lock().await;
        let outcome = self
            .engine
            .commit_best_effort(&mut guard, |d| {
                d.domains.clear();
                Ok(())
            })
            .await;
        if let Err(e) = outcome {
            error!("Failed to record unrouting of {}: {}", guard.record.id, e);
        }
        if guard.stop_requested {
            drop(guard);
            if let Err(e) = self.engine.teardown(&entry).await {
                error!("Teardown after health failure failed: {}", e);
            }
            return true;
        }
        guard.busy = false;
        true
    }
}

fn still_owned(current: &Option<InstanceHandle>, probed: &InstanceHandle) -> bool {
    current.as_ref().map(|i| i.id.as_str()) == Some(probed.id.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockFleet;
    use crate::pipeline::ExecutionPipeline;
    use crate::admission::AdmissionController;
    use fleet_common::DeployRequest;

    async fn running(fleet: &MockFleet) -> SharedEntry {
        let (_, entry) = AdmissionController::new(fleet.engine.clone())
            .admit(&DeployRequest::new("cust_1", "app_a"))
            .await
            .unwrap();
        ExecutionPipeline::new(fleet.engine.clone())
            .run(entry.clone())
            .await;
        entry
    }

    #[tokio::test]
    async fn test_failures_degrade_then_recover() {
        let fleet = MockFleet::new().await;
        let entry = running(&fleet).await;
        let monitor = HealthMonitor::new(fleet.engine.clone());
        let instance = entry.lock().await.record.instance.clone().unwrap();

        fleet.runtime.set_healthy(&instance.id, false);
        assert_eq!(monitor.check_all().await, 1);
        {
            let guard = entry.lock().await;
            assert_eq!(guard.record.status, DeploymentStatus::Degraded);
            assert_eq!(guard.record.health.consecutive_failures, 1);
            assert!(guard.record.last_checked.is_some());
        }

        fleet.runtime.set_healthy(&instance.id, true);
        monitor.check_all().await;
        let guard = entry.lock().await;
        assert_eq!(guard.record.status, DeploymentStatus::Running);
        assert_eq!(guard.record.health.state, HealthState::Healthy);
        assert_eq!(guard.record.health.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_busy_deployment_is_skipped() {
        let fleet = MockFleet::new().await;
        let entry = running(&fleet).await;
        let monitor = HealthMonitor::new(fleet.engine.clone());
        let instance = entry.lock().await.record.instance.clone().unwrap();

        entry.lock().await.busy = true;
        fleet.runtime.set_healthy(&instance.id, false);
        assert_eq!(monitor.check_all().await, 0);
        assert_eq!(entry.lock().await.record.status, DeploymentStatus::Running);
    }

    #[tokio::test]
    async fn test_threshold_fails_and_unroutes_but_keeps_quota() {
        let fleet = MockFleet::new().await;
        let entry = running(&fleet).await;
        let monitor = HealthMonitor::new(fleet.engine.clone());
        let (instance, domain) = {
            let guard = entry.lock().await;
            (
                guard.record.instance.clone().unwrap(),
                guard.record.domains[0].clone(),
            )
        };

        fleet.runtime.set_healthy(&instance.id, false);
        for _ in 0..=DEFAULT_FAILURE_THRESHOLD {
            monitor.check_all().await;
        }

        let guard = entry.lock().await;
        assert_eq!(guard.record.status, DeploymentStatus::Failed);
        assert_eq!(
            guard.record.health.consecutive_failures,
            DEFAULT_FAILURE_THRESHOLD + 1
        );
        assert!(guard.record.domains.is_empty());
        assert!(fleet.router.route_for(&domain).is_none());
        assert!(guard.record.reservation_held);
        assert_eq!(fleet.engine.ledger.usage("cust_1").await.deployments, 1);
    }
}
