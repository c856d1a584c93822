//! Quota reconciliation
//!
//! Recomputes each customer's ledger from the deployments that actually
//! hold a reservation and corrects any drift. Each deployment is examined
//! under its own entry lock, so reconciliation never races an admission or
//! a release of that deployment.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::engine::Engine;

pub struct Reconciler {
    engine: Arc<Engine>,
    /// Claims without a table entry seen on the previous pass
    suspects: Mutex<HashSet<(String, String)>>,
}

impl Reconciler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            suspects: Mutex::new(HashSet::new()),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting quota reconciler (every {:?})",
            self.engine.settings.reconcile_interval
        );
        let mut ticker = interval(self.engine.settings.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    let corrected = self.reconcile_once().await;
                    if corrected > 0 {
                        warn!("Reconciliation corrected {} ledger entries", corrected);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Quota reconciler stopped");
    }

    /// One reconciliation pass; returns the number of corrections made
    pub async fn reconcile_once(&self) -> usize {
        let mut corrected = 0;
        let mut known: HashSet<String> = HashSet::new();

        for entry in self.engine.table.entries().await {
            let guard = entry.lock().await;
            let record = &guard.record;
            known.insert(record.id.clone());

            let expected = record.reservation_held.then_some(record.reservation);
            if self
                .engine
                .ledger
                .reconcile_claim(
                    &record.customer_id,
                    &record.id,
                    &record.application_id,
                    &record.license_id,
                    expected,
                )
                .await
            {
                corrected += 1;
                self.audit(&record.customer_id, Some(&record.id), "claim");
            }
        }

        // A claim can briefly precede its table entry during admission, so
        // an orphan is only released once it survives two passes
        let mut suspects = self.suspects.lock().await;
        let mut still_orphaned = HashSet::new();
        for customer_id in self.engine.ledger.customers().await {
            for deployment_id in self.engine.ledger.claimants(&customer_id).await {
                if known.contains(&deployment_id) || self.engine.table.get(&deployment_id).await.is_some() {
                    continue;
                }
                let key = (customer_id.clone(), deployment_id);
                if suspects.contains(&key) {
                    warn!(
                        "Releasing orphaned claim of {} for customer {}",
                        key.1, key.0
                    );
                    self.engine.ledger.release(&key.0, &key.1).await;
                    corrected += 1;
                    self.audit(&key.0, Some(&key.1), "orphan");
                } else {
                    still_orphaned.insert(key);
                }
            }

            if self.engine.ledger.recompute(&customer_id).await {
                corrected += 1;
                self.audit(&customer_id, None, "totals");
            }
        }
        *suspects = still_orphaned;

        corrected
    }

    fn audit(&self, customer_id: &str, deployment_id: Option<&str>, kind: &str) {
        self.engine.audit.log_event(
            "quota.drift_corrected",
            json!({
                "customer_id": customer_id,
                "deployment_id": deployment_id,
                "kind": kind,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionController;
    use crate::ledger::ReservationRequest;
    use crate::mock::MockFleet;
    use fleet_common::{DeployRequest, ResourceQuotas};

    #[tokio::test]
    async fn test_consistent_ledger_needs_no_correction() {
        let fleet = MockFleet::new().await;
        AdmissionController::new(fleet.engine.clone())
            .admit(&DeployRequest::new("cust_1", "app_a"))
            .await
            .unwrap();

        let reconciler = Reconciler::new(fleet.engine.clone());
        assert_eq!(reconciler.reconcile_once().await, 0);
        assert_eq!(fleet.audit.count("quota.drift_corrected"), 0);
    }

    #[tokio::test]
    async fn test_missing_claim_is_restored() {
        let fleet = MockFleet::new().await;
        let (deployment, _) = AdmissionController::new(fleet.engine.clone())
            .admit(&DeployRequest::new("cust_1", "app_a"))
            .await
            .unwrap();
        fleet.engine.ledger.release("cust_1", &deployment.id).await;
        assert_eq!(fleet.engine.ledger.usage("cust_1").await.deployments, 0);

        let reconciler = Reconciler::new(fleet.engine.clone());
        assert_eq!(reconciler.reconcile_once().await, 1);
        let usage = fleet.engine.ledger.usage("cust_1").await;
        assert_eq!(usage.deployments, 1);
        assert_eq!(usage.cpu_millis, deployment.reservation.cpu_millis);
        assert_eq!(fleet.audit.count("quota.drift_corrected"), 1);
    }

    #[tokio::test]
    async fn test_orphan_claim_released_on_second_pass() {
        let fleet = MockFleet::new().await;
        let quotas = ResourceQuotas::default();
        fleet
            .engine
            .ledger
            .reserve(ReservationRequest {
                customer_id: "cust_1",
                deployment_id: "dep_ghost",
                application_id: "app_a",
                license_id: "lic_a",
                license_limit: None,
                quotas: &quotas,
                amount: fleet.app_a_resources().reservation(),
            })
            .await
            .unwrap();

        let reconciler = Reconciler::new(fleet.engine.clone());
        assert_eq!(reconciler.reconcile_once().await, 0);
        assert!(fleet.engine.ledger.holds("cust_1", "dep_ghost").await);

        assert_eq!(reconciler.reconcile_once().await, 1);
        assert!(!fleet.engine.ledger.holds("cust_1", "dep_ghost").await);
        assert_eq!(fleet.engine.ledger.usage("cust_1").await.cpu_millis, 0);
    }
}
