//! Caddy admin API route provisioner

use async_trait::async_trait;
use fleet_common::{Error, InstanceHandle, Result};
use reqwest::StatusCode;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{subdomain_for, RouteProvisioner};

pub struct CaddyRouteProvisioner {
    http_client: reqwest::Client,
    admin_url: String,
    server: String,
    base_domain: String,
    /// Serializes every mutation of the routing table
    lock: Mutex<()>,
}

impl CaddyRouteProvisioner {
    pub fn new(admin_url: impl Into<String>, base_domain: impl Into<String>) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            admin_url: admin_url.into().trim_end_matches('/').to_string(),
            server: "srv0".to_string(),
            base_domain: base_domain.into(),
            lock: Mutex::new(()),
        }
    }

    fn route_id(domain: &str) -> String {
        format!("fleet-{}", domain.replace('.', "-"))
    }

    fn route_body(domain: &str, dial: &str) -> serde_json::Value {
        json!({
            "@id": Self::route_id(domain),
            "match": [{ "host": [domain] }],
            "handle": [{
                "handler": "reverse_proxy",
                "upstreams": [{ "dial": dial }]
            }],
            "terminal": true
        })
    }

    async fn error_text(response: reqwest::Response) -> String {
        response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string())
    }
}

#[async_trait]
impl RouteProvisioner for CaddyRouteProvisioner {
    async fn assign_subdomain(&self, _customer_id: &str, deployment_id: &str) -> Result<String> {
        Ok(subdomain_for(deployment_id, &self.base_domain))
    }

    async fn program_route(&self, domain: &str, instance: &InstanceHandle) -> Result<()> {
        let dial = instance.address.as_deref().ok_or_else(|| {
            Error::Route(format!("instance {} has no reachable address", instance.name))
        })?;
        let body = Self::route_body(domain, dial);

        let _guard = self.lock.lock().await;

        // PATCH replaces an existing route in place, so traffic flips in one step
        let response = self
            .http_client
            .patch(format!("{}/id/{}", self.admin_url, Self::route_id(domain)))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Route(format!("Failed to reach proxy admin API: {}", e)))?;

        if response.status().is_success() {
            info!("Repointed route {} -> {}", domain, dial);
            return Ok(());
        }

        if response.status() != StatusCode::NOT_FOUND {
            return Err(Error::Route(format!(
                "Failed to update route {}: {}",
                domain,
                Self::error_text(response).await
            )));
        }

        let response = self
            .http_client
            .post(format!(
                "{}/config/apps/http/servers/{}/routes",
                self.admin_url, self.server
            ))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Route(format!("Failed to reach proxy admin API: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Route(format!(
                "Failed to create route {}: {}",
                domain,
                Self::error_text(response).await
            )));
        }

        info!("Created route {} -> {}", domain, dial);
        Ok(())
    }

    async fn remove_route(&self, domain: &str) -> Result<()> {
        let _guard = self.lock.lock().await;

        let response = self
            .http_client
            .delete(format!("{}/id/{}", self.admin_url, Self::route_id(domain)))
            .send()
            .await
            .map_err(|e| Error::Route(format!("Failed to reach proxy admin API: {}", e)))?;

        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            info!("Removed route {}", domain);
            return Ok(());
        }

        Err(Error::Route(format!(
            "Failed to remove route {}: {}",
            domain,
            Self::error_text(response).await
        )))
    }

    async fn issue_certificate(&self, domain: &str) {
        let result = self
            .http_client
            .post(format!(
                "{}/config/apps/tls/certificates/automate",
                self.admin_url
            ))
            .json(&domain)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                info!("Requested certificate for {}", domain);
            }
            Ok(response) => {
                warn!(
                    "Certificate request for {} returned {}",
                    domain,
                    response.status()
                );
            }
            Err(e) => warn!("Failed to request certificate for {}: {}", domain, e),
        }
    }
}
