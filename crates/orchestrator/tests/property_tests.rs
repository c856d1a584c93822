//! Property-based tests for quota safety.
//!
//! Concurrent admissions racing against a tight quota must never jointly
//! exceed it, and the ledger must account for exactly what was admitted.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use fleet_common::{Customer, DeployRequest, Error, ResourceOverride, ResourceQuotas, SubscriptionPlan};
use fleet_orchestrator::admission::AdmissionController;
use fleet_orchestrator::mock::MockFleet;
use proptest::prelude::*;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("runtime")
}

/// CPU and memory asks for one admission attempt
fn arb_ask() -> impl Strategy<Value = (u64, u64)> {
    (50u64..1_200, 32u64..1_024)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn concurrent_admissions_never_exceed_quota(
        asks in prop::collection::vec(arb_ask(), 1..16),
        max_cpu_millis in 500u64..3_000,
        max_memory_mb in 256u64..4_096,
        max_deployments in 1u32..8,
    ) {
        let quotas = ResourceQuotas {
            max_cpu_millis,
            max_memory_mb,
            max_deployments,
            max_containers: max_deployments,
            ..ResourceQuotas::default()
        };

        let (admitted, usage) = runtime().block_on(async {
            let fleet = MockFleet::new().await;
            let mut customer = Customer::new("cust_1", "Acme Corp", SubscriptionPlan::Starter);
            customer.quotas = Some(quotas.clone());
            customer.license_ids = vec!["lic_a".to_string()];
            fleet.catalog.upsert_customer(customer).await;

            let admission = Arc::new(AdmissionController::new(fleet.engine.clone()));
            let mut tasks = Vec::new();
            for (cpu_millis, memory_mb) in asks.clone() {
                let admission = admission.clone();
                tasks.push(tokio::spawn(async move {
                    let mut request = DeployRequest::new("cust_1", "app_a");
                    request.resources = Some(ResourceOverride {
                        cpu_millis,
                        memory_mb,
                        storage_mb: Some(1),
                    });
                    admission.admit(&request).await.map(|(d, _)| d)
                }));
            }

            let mut admitted = Vec::new();
            for task in tasks {
                match task.await.unwrap() {
                    Ok(deployment) => admitted.push(deployment),
                    Err(Error::QuotaExceeded { .. }) => {}
                    Err(other) => panic!("unexpected rejection: {other}"),
                }
            }
            (admitted, fleet.engine.ledger.usage("cust_1").await)
        });

        let cpu: u64 = admitted.iter().map(|d| d.reservation.cpu_millis).sum();
        let memory: u64 = admitted.iter().map(|d| d.reservation.memory_mb).sum();

        prop_assert!(cpu <= quotas.max_cpu_millis);
        prop_assert!(memory <= quotas.max_memory_mb);
        prop_assert!(admitted.len() as u64 <= u64::from(quotas.max_deployments));
        prop_assert_eq!(usage.cpu_millis, cpu);
        prop_assert_eq!(usage.memory_mb, memory);
        prop_assert_eq!(u64::from(usage.deployments), admitted.len() as u64);
    }

    #[test]
    fn rejected_admission_leaves_usage_unchanged(
        held in 1u64..1_000,
        ask in 1u64..2_000,
    ) {
        let quotas = ResourceQuotas {
            max_cpu_millis: 1_000,
            ..ResourceQuotas::default()
        };

        let outcome = runtime().block_on(async {
            let fleet = MockFleet::new().await;
            let mut customer = Customer::new("cust_1", "Acme Corp", SubscriptionPlan::Starter);
            customer.quotas = Some(quotas.clone());
            customer.license_ids = vec!["lic_a".to_string()];
            fleet.catalog.upsert_customer(customer).await;
            let admission = AdmissionController::new(fleet.engine.clone());

            let mut first = DeployRequest::new("cust_1", "app_a");
            first.resources = Some(ResourceOverride { cpu_millis: held, memory_mb: 64, storage_mb: None });
            admission.admit(&first).await.unwrap();
            let before = fleet.engine.ledger.usage("cust_1").await;

            let mut second = DeployRequest::new("cust_1", "app_a");
            second.resources = Some(ResourceOverride { cpu_millis: ask, memory_mb: 64, storage_mb: None });
            let result = admission.admit(&second).await;
            let after = fleet.engine.ledger.usage("cust_1").await;
            (result.is_ok(), before.same_totals(&after), fleet.store.len().await)
        });

        let (accepted, unchanged, records) = outcome;
        prop_assert_eq!(accepted, held + ask <= 1_000);
        if !accepted {
            prop_assert!(unchanged);
            prop_assert_eq!(records, 1);
        }
    }
}
