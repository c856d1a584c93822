//! Read-only customer, application and license data consumed by admission

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use fleet_common::{Application, Customer, License, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

#[async_trait]
pub trait CatalogProvider: Send + Sync {
    async fn get_customer(&self, customer_id: &str) -> Result<Option<Customer>>;

    async fn get_application(&self, application_id: &str) -> Result<Option<Application>>;

    async fn get_license(&self, license_id: &str) -> Result<Option<License>>;

    async fn customer_count(&self) -> Result<usize>;

    async fn application_count(&self) -> Result<usize>;
}

/// On-disk catalog format
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub customers: Vec<Customer>,
    #[serde(default)]
    pub applications: Vec<Application>,
    #[serde(default)]
    pub licenses: Vec<License>,
}

#[derive(Debug, Default)]
struct CatalogData {
    customers: HashMap<String, Customer>,
    applications: HashMap<String, Application>,
    licenses: HashMap<String, License>,
}

/// Catalog held in memory, optionally seeded from a JSON file
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    data: RwLock<CatalogData>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(file: CatalogFile) -> Self {
        let data = CatalogData {
            customers: file
                .customers
                .into_iter()
                .map(|c| (c.id.clone(), c))
                .collect(),
            applications: file
                .applications
                .into_iter()
                .map(|a| (a.id.clone(), a))
                .collect(),
            licenses: file
                .licenses
                .into_iter()
                .map(|l| (l.id.clone(), l))
                .collect(),
        };
        Self {
            data: RwLock::new(data),
        }
    }

    /// Load a catalog from a JSON file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog {}", path.display()))?;
        let file: CatalogFile =
            serde_json::from_str(&raw).context("Failed to parse catalog JSON")?;

        info!(
            "Loaded catalog: {} customers, {} applications, {} licenses",
            file.customers.len(),
            file.applications.len(),
            file.licenses.len()
        );

        Ok(Self::from_file(file))
    }

    pub async fn upsert_customer(&self, customer: Customer) {
        let mut data = self.data.write().await;
        data.customers.insert(customer.id.clone(), customer);
    }

    pub async fn upsert_application(&self, application: Application) {
        let mut data = self.data.write().await;
        data.applications.insert(application.id.clone(), application);
    }

    /// Store a license and attach it to its customer
    pub async fn upsert_license(&self, license: License) {
        let mut data = self.data.write().await;
        if let Some(customer) = data.customers.get_mut(&license.customer_id) {
            if !customer.license_ids.contains(&license.id) {
                customer.license_ids.push(license.id.clone());
            }
        }
        data.licenses.insert(license.id.clone(), license);
    }
}

#[async_trait]
impl CatalogProvider for InMemoryCatalog {
    async fn get_customer(&self, customer_id: &str) -> Result<Option<Customer>> {
        Ok(self.data.read().await.customers.get(customer_id).cloned())
    }

    async fn get_application(&self, application_id: &str) -> Result<Option<Application>> {
        Ok(self.data.read().await.applications.get(application_id).cloned())
    }

    async fn get_license(&self, license_id: &str) -> Result<Option<License>> {
        Ok(self.data.read().await.licenses.get(license_id).cloned())
    }

    async fn customer_count(&self) -> Result<usize> {
        Ok(self.data.read().await.customers.len())
    }

    async fn application_count(&self) -> Result<usize> {
        Ok(self.data.read().await.applications.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_common::SubscriptionPlan;

    #[tokio::test]
    async fn test_catalog_from_json() {
        let raw = r#"{
            "customers": [
                { "id": "cust_1", "name": "Acme", "plan": "starter", "status": "active" }
            ],
            "applications": [
                {
                    "id": "app_a",
                    "name": "Ghost",
                    "default_version": "5.0",
                    "source": { "kind": "registry", "image": "ghost" },
                    "port": 2368,
                    "resources": { "cpu_millis": 250, "memory_mb": 384, "storage_mb": 2048 }
                }
            ],
            "licenses": [
                {
                    "id": "lic_1",
                    "customer_id": "cust_1",
                    "application_id": "app_a",
                    "license_type": "one-time",
                    "status": "active",
                    "valid_from": "2024-01-01T00:00:00Z"
                }
            ]
        }"#;
        let file: CatalogFile = serde_json::from_str(raw).unwrap();
        let catalog = InMemoryCatalog::from_file(file);

        let customer = catalog.get_customer("cust_1").await.unwrap().unwrap();
        assert_eq!(customer.plan, SubscriptionPlan::Starter);
        assert!(customer.is_active());

        let app = catalog.get_application("app_a").await.unwrap().unwrap();
        assert_eq!(app.resources.cpu_millis, 250);
        assert_eq!(app.resources.memory_mb, 384);
        assert_eq!(app.resources.pids_limit, 256);
        assert!(app.health_check.is_none());

        assert!(catalog.get_license("lic_1").await.unwrap().is_some());
        assert_eq!(catalog.customer_count().await.unwrap(), 1);
    }

    #[test]
    fn test_application_without_resources_is_rejected() {
        let raw = r#"{
            "applications": [
                {
                    "id": "app_a",
                    "name": "Ghost",
                    "default_version": "5.0",
                    "source": { "kind": "registry", "image": "ghost" },
                    "port": 2368
                }
            ]
        }"#;
        let err = serde_json::from_str::<CatalogFile>(raw).unwrap_err();
        assert!(err.to_string().contains("resources"));
    }

    #[tokio::test]
    async fn test_upsert_license_links_customer() {
        let catalog = InMemoryCatalog::new();
        catalog
            .upsert_customer(Customer::new("cust_1", "Acme", SubscriptionPlan::Free))
            .await;
        catalog
            .upsert_license(License {
                id: "lic_9".to_string(),
                customer_id: "cust_1".to_string(),
                application_id: "app_a".to_string(),
                license_type: fleet_common::LicenseType::Trial,
                status: fleet_common::LicenseStatus::Active,
                valid_from: chrono::Utc::now(),
                valid_until: None,
                max_deployments: None,
            })
            .await;

        let customer = catalog.get_customer("cust_1").await.unwrap().unwrap();
        assert_eq!(customer.license_ids, vec!["lic_9".to_string()]);
    }
}
