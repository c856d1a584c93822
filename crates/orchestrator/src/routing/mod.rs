//! Route provisioner contract
//!
//! The reverse-proxy routing table is mutated only through this trait;
//! implementations serialize their own mutations.

pub mod caddy;

use async_trait::async_trait;
use fleet_common::{InstanceHandle, Result};

pub use caddy::CaddyRouteProvisioner;

#[async_trait]
pub trait RouteProvisioner: Send + Sync {
    /// Allocate the subdomain a deployment is served on
    async fn assign_subdomain(&self, customer_id: &str, deployment_id: &str) -> Result<String>;

    /// Point `domain` at `instance`, replacing any existing route atomically
    async fn program_route(&self, domain: &str, instance: &InstanceHandle) -> Result<()>;

    /// Idempotent: removing an unknown route succeeds
    async fn remove_route(&self, domain: &str) -> Result<()>;

    /// Trigger certificate issuance; failures are logged, never returned
    async fn issue_certificate(&self, domain: &str);
}

/// DNS-safe subdomain label for a deployment under `base_domain`
pub fn subdomain_for(deployment_id: &str, base_domain: &str) -> String {
    let label: String = deployment_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .take(63)
        .collect();
    format!("{}.{}", label.trim_matches('-'), base_domain)
}
