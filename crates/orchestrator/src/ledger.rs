//! Quota ledger
//!
//! Per-customer resource accounting. Each customer has its own lock, and
//! `reserve` checks and commits inside that one critical section, so
//! concurrent admissions for the same customer can never jointly exceed a
//! quota or a license's deployment limit. Reservations are keyed by
//! deployment ID, which makes a second release of the same deployment
//! detectable.

use std::collections::HashMap;
use std::sync::Arc;

use fleet_common::{Error, ResourceQuotas, ResourceReservation, ResourceUsage, Result};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Claim {
    application_id: String,
    license_id: String,
    amount: ResourceReservation,
}

#[derive(Debug)]
struct LedgerEntry {
    quotas: ResourceQuotas,
    usage: ResourceUsage,
    claims: HashMap<String, Claim>,
}

impl LedgerEntry {
    fn new(quotas: ResourceQuotas) -> Self {
        Self {
            quotas,
            usage: ResourceUsage::default(),
            claims: HashMap::new(),
        }
    }

    fn holds_app(&self, application_id: &str) -> bool {
        self.claims
            .values()
            .any(|claim| claim.application_id == application_id)
    }

    fn license_claims(&self, license_id: &str) -> usize {
        self.claims
            .values()
            .filter(|claim| claim.license_id == license_id)
            .count()
    }

    /// Usage as the sum of outstanding claims
    fn recompute(&self) -> ResourceUsage {
        let mut usage = ResourceUsage {
            bandwidth_mb: self.usage.bandwidth_mb,
            ..ResourceUsage::default()
        };
        let mut apps: Vec<&str> = Vec::new();
        for claim in self.claims.values() {
            let new_app = !apps.contains(&claim.application_id.as_str());
            if new_app {
                apps.push(&claim.application_id);
            }
            usage.add(&claim.amount, new_app);
        }
        usage
    }
}

/// A reservation attempt for one deployment
#[derive(Debug, Clone)]
pub struct ReservationRequest<'a> {
    pub customer_id: &'a str,
    pub deployment_id: &'a str,
    pub application_id: &'a str,
    pub license_id: &'a str,
    /// The license's `max_deployments`, counted against held claims
    pub license_limit: Option<u32>,
    pub quotas: &'a ResourceQuotas,
    pub amount: ResourceReservation,
}

#[derive(Debug, Default)]
pub struct QuotaLedger {
    entries: RwLock<HashMap<String, Arc<Mutex<LedgerEntry>>>>,
}

impl QuotaLedger {
    pub fn new() -> Self {
        Self::default()
    }

    async fn existing(&self, customer_id: &str) -> Option<Arc<Mutex<LedgerEntry>>> {
        self.entries.read().await.get(customer_id).cloned()
    }

    async fn entry(&self, customer_id: &str, quotas: &ResourceQuotas) -> Arc<Mutex<LedgerEntry>> {
        if let Some(entry) = self.existing(customer_id).await {
            return entry;
        }
        let mut entries = self.entries.write().await;
        entries
            .entry(customer_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(LedgerEntry::new(quotas.clone()))))
            .clone()
    }

    /// Check-and-commit a reservation. Either every dimension is
    /// incremented or nothing changes.
    pub async fn reserve(&self, request: ReservationRequest<'_>) -> Result<ResourceUsage> {
        let entry = self.entry(request.customer_id, request.quotas).await;
        let mut entry = entry.lock().await;

        // Quotas can change between admissions; the latest catalog value wins
        entry.quotas = request.quotas.clone();

        if entry.claims.contains_key(request.deployment_id) {
            return Err(Error::InvalidRequest(format!(
                "deployment {} already holds a reservation",
                request.deployment_id
            )));
        }

        if let Some(limit) = request.license_limit {
            if entry.license_claims(request.license_id) >= limit as usize {
                return Err(Error::LicenseLimitReached {
                    license_id: request.license_id.to_string(),
                    limit,
                });
            }
        }

        let new_app = !entry.holds_app(request.application_id);
        entry
            .usage
            .check_fits(&request.amount, new_app, request.quotas)?;

        entry.usage.add(&request.amount, new_app);
        entry.claims.insert(
            request.deployment_id.to_string(),
            Claim {
                application_id: request.application_id.to_string(),
                license_id: request.license_id.to_string(),
                amount: request.amount,
            },
        );

        debug!(
            "Reserved {:?} for {} (customer {})",
            request.amount, request.deployment_id, request.customer_id
        );
        Ok(entry.usage.clone())
    }

    /// Return a deployment's reservation. Releasing twice is a bug; it is
    /// logged and otherwise ignored.
    pub async fn release(&self, customer_id: &str, deployment_id: &str) -> Option<ResourceReservation> {
        let Some(entry) = self.existing(customer_id).await else {
            error!(
                "Release for unknown customer {} (deployment {})",
                customer_id, deployment_id
            );
            return None;
        };
        let mut entry = entry.lock().await;

        let Some(claim) = entry.claims.remove(deployment_id) else {
            error!(
                "Double release of deployment {} for customer {}",
                deployment_id, customer_id
            );
            return None;
        };

        let app_gone = !entry.holds_app(&claim.application_id);
        entry.usage.subtract(&claim.amount, app_gone);

        debug!(
            "Released {:?} for {} (customer {})",
            claim.amount, deployment_id, customer_id
        );
        Some(claim.amount)
    }

    pub async fn usage(&self, customer_id: &str) -> ResourceUsage {
        match self.existing(customer_id).await {
            Some(entry) => entry.lock().await.usage.clone(),
            None => ResourceUsage::default(),
        }
    }

    pub async fn holds(&self, customer_id: &str, deployment_id: &str) -> bool {
        match self.existing(customer_id).await {
            Some(entry) => entry.lock().await.claims.contains_key(deployment_id),
            None => false,
        }
    }

    pub async fn customers(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    /// Deployment IDs currently holding a claim for the customer
    pub async fn claimants(&self, customer_id: &str) -> Vec<String> {
        match self.existing(customer_id).await {
            Some(entry) => entry.lock().await.claims.keys().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Align one deployment's claim with what the deployment table says it
    /// holds. Returns true when drift was corrected.
    pub async fn reconcile_claim(
        &self,
        customer_id: &str,
        deployment_id: &str,
        application_id: &str,
        license_id: &str,
        expected: Option<ResourceReservation>,
    ) -> bool {
        let entry = match (self.existing(customer_id).await, expected) {
            (Some(entry), _) => entry,
            (None, None) => return false,
            (None, Some(_)) => self.entry(customer_id, &ResourceQuotas::default()).await,
        };
        let mut entry = entry.lock().await;

        let current = entry.claims.get(deployment_id).map(|c| c.amount);
        if current == expected {
            return false;
        }

        match expected {
            Some(amount) => {
                warn!(
                    "Ledger drift: deployment {} holds {:?} but ledger has {:?}",
                    deployment_id, amount, current
                );
                entry.claims.insert(
                    deployment_id.to_string(),
                    Claim {
                        application_id: application_id.to_string(),
                        license_id: license_id.to_string(),
                        amount,
                    },
                );
            }
            None => {
                warn!(
                    "Ledger drift: deployment {} released but ledger still holds {:?}",
                    deployment_id, current
                );
                entry.claims.remove(deployment_id);
            }
        }
        entry.usage = entry.recompute();
        true
    }

    /// Recompute a customer's totals from its claims. Returns true when the
    /// stored totals had drifted.
    pub async fn recompute(&self, customer_id: &str) -> bool {
        let Some(entry) = self.existing(customer_id).await else {
            return false;
        };
        let mut entry = entry.lock().await;

        let computed = entry.recompute();
        if computed.same_totals(&entry.usage) {
            return false;
        }

        warn!(
            "Ledger totals for {} drifted: stored {:?}, computed {:?}",
            customer_id, entry.usage, computed
        );
        entry.usage = computed;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_common::QuotaDimension;

    fn amount(cpu_millis: u64) -> ResourceReservation {
        ResourceReservation {
            cpu_millis,
            memory_mb: 128,
            storage_mb: 0,
            containers: 1,
            custom_domains: 0,
        }
    }

    fn request<'a>(
        deployment_id: &'a str,
        application_id: &'a str,
        quotas: &'a ResourceQuotas,
        cpu_millis: u64,
    ) -> ReservationRequest<'a> {
        ReservationRequest {
            customer_id: "cust_1",
            deployment_id,
            application_id,
            license_id: "lic_a",
            license_limit: None,
            quotas,
            amount: amount(cpu_millis),
        }
    }

    #[tokio::test]
    async fn test_reserve_and_release() {
        let ledger = QuotaLedger::new();
        let quotas = ResourceQuotas::default();

        let usage = ledger
            .reserve(request("dep_1", "app_a", &quotas, 500))
            .await
            .unwrap();
        assert_eq!(usage.cpu_millis, 500);
        assert_eq!(usage.deployments, 1);
        assert_eq!(usage.apps, 1);

        ledger
            .reserve(request("dep_2", "app_a", &quotas, 500))
            .await
            .unwrap();
        assert_eq!(ledger.usage("cust_1").await.apps, 1);

        assert_eq!(ledger.release("cust_1", "dep_1").await, Some(amount(500)));
        let usage = ledger.usage("cust_1").await;
        assert_eq!(usage.cpu_millis, 500);
        assert_eq!(usage.apps, 1);

        ledger.release("cust_1", "dep_2").await;
        let usage = ledger.usage("cust_1").await;
        assert_eq!(usage.cpu_millis, 0);
        assert_eq!(usage.apps, 0);
    }

    #[tokio::test]
    async fn test_rejected_reservation_changes_nothing() {
        let ledger = QuotaLedger::new();
        let quotas = ResourceQuotas {
            max_containers: 1,
            ..ResourceQuotas::default()
        };

        ledger
            .reserve(request("dep_1", "app_a", &quotas, 100))
            .await
            .unwrap();
        let before = ledger.usage("cust_1").await;

        let err = ledger
            .reserve(request("dep_2", "app_b", &quotas, 100))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::QuotaExceeded {
                dimension: QuotaDimension::Containers,
                ..
            }
        ));
        assert_eq!(ledger.usage("cust_1").await, before);
        assert!(!ledger.holds("cust_1", "dep_2").await);
    }

    #[tokio::test]
    async fn test_double_release_is_a_no_op() {
        let ledger = QuotaLedger::new();
        let quotas = ResourceQuotas::default();
        ledger
            .reserve(request("dep_1", "app_a", &quotas, 300))
            .await
            .unwrap();

        assert!(ledger.release("cust_1", "dep_1").await.is_some());
        assert!(ledger.release("cust_1", "dep_1").await.is_none());
        assert_eq!(ledger.usage("cust_1").await.cpu_millis, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reservations_respect_quota() {
        let ledger = Arc::new(QuotaLedger::new());
        let quotas = Arc::new(ResourceQuotas {
            max_cpu_millis: 1_000,
            max_containers: 100,
            max_deployments: 100,
            ..ResourceQuotas::default()
        });

        let mut handles = Vec::new();
        for i in 0..20 {
            let ledger = ledger.clone();
            let quotas = quotas.clone();
            handles.push(tokio::spawn(async move {
                let deployment_id = format!("dep_{i}");
                ledger
                    .reserve(ReservationRequest {
                        customer_id: "cust_1",
                        deployment_id: &deployment_id,
                        application_id: "app_a",
                        license_id: "lic_a",
                        license_limit: None,
                        quotas: &quotas,
                        amount: amount(300),
                    })
                    .await
                    .is_ok()
            }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }

        assert_eq!(granted, 3);
        assert_eq!(ledger.usage("cust_1").await.cpu_millis, 900);
    }

    #[tokio::test]
    async fn test_reconcile_claim_corrects_drift() {
        let ledger = QuotaLedger::new();
        let quotas = ResourceQuotas::default();
        ledger
            .reserve(request("dep_1", "app_a", &quotas, 400))
            .await
            .unwrap();

        // Table says dep_1 was released
        assert!(ledger.reconcile_claim("cust_1", "dep_1", "app_a", "lic_a", None).await);
        assert_eq!(ledger.usage("cust_1").await.cpu_millis, 0);

        // Table says dep_2 holds resources the ledger never saw
        assert!(
            ledger
                .reconcile_claim("cust_1", "dep_2", "app_b", "lic_b", Some(amount(250)))
                .await
        );
        let usage = ledger.usage("cust_1").await;
        assert_eq!(usage.cpu_millis, 250);
        assert_eq!(usage.apps, 1);

        assert!(
            !ledger
                .reconcile_claim("cust_1", "dep_2", "app_b", "lic_b", Some(amount(250)))
                .await
        );
        assert!(!ledger.recompute("cust_1").await);
    }

    #[tokio::test]
    async fn test_license_limit_counts_held_claims() {
        let ledger = QuotaLedger::new();
        let quotas = ResourceQuotas::default();
        let limited = |deployment_id: &'static str| ReservationRequest {
            license_limit: Some(1),
            ..request(deployment_id, "app_a", &quotas, 100)
        };

        ledger.reserve(limited("dep_1")).await.unwrap();
        let before = ledger.usage("cust_1").await;

        let err = ledger.reserve(limited("dep_2")).await.unwrap_err();
        assert!(matches!(err, Error::LicenseLimitReached { limit: 1, .. }));
        assert!(ledger.usage("cust_1").await.same_totals(&before));

        // Another license of the same customer is unaffected
        ledger
            .reserve(ReservationRequest {
                license_id: "lic_b",
                ..limited("dep_3")
            })
            .await
            .unwrap();

        ledger.release("cust_1", "dep_1").await;
        ledger.reserve(limited("dep_2")).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reservations_respect_license_limit() {
        let ledger = Arc::new(QuotaLedger::new());
        let quotas = Arc::new(ResourceQuotas::default());

        let mut handles = Vec::new();
        for i in 0..4 {
            let ledger = ledger.clone();
            let quotas = quotas.clone();
            handles.push(tokio::spawn(async move {
                let deployment_id = format!("dep_{i}");
                ledger
                    .reserve(ReservationRequest {
                        customer_id: "cust_1",
                        deployment_id: &deployment_id,
                        application_id: "app_a",
                        license_id: "lic_a",
                        license_limit: Some(2),
                        quotas: &quotas,
                        amount: amount(100),
                    })
                    .await
            }));
        }

        let mut granted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => granted += 1,
                Err(err) => assert!(matches!(err, Error::LicenseLimitReached { .. })),
            }
        }
        assert_eq!(granted, 2);
        assert_eq!(ledger.usage("cust_1").await.deployments, 2);
    }
}
