//! Single health probe against one instance

use std::sync::Arc;
use std::time::{Duration, Instant};

use fleet_common::{HealthCheck, InstanceHandle};
use tracing::debug;

use crate::runtime::ContainerDriver;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub healthy: bool,
    pub response_time: Duration,
    pub detail: Option<String>,
}

impl ProbeResult {
    fn healthy(started: Instant) -> Self {
        Self {
            healthy: true,
            response_time: started.elapsed(),
            detail: None,
        }
    }

    fn unhealthy(started: Instant, detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            response_time: started.elapsed(),
            detail: Some(detail.into()),
        }
    }
}

/// Checks the runtime status, then the HTTP health endpoint when one is declared
pub struct HealthProbe {
    runtime: Arc<dyn ContainerDriver>,
    http_client: reqwest::Client,
}

impl HealthProbe {
    pub fn new(runtime: Arc<dyn ContainerDriver>) -> Self {
        Self {
            runtime,
            http_client: reqwest::Client::new(),
        }
    }

    pub async fn probe(&self, instance: &InstanceHandle, check: Option<&HealthCheck>) -> ProbeResult {
        let started = Instant::now();

        match self.runtime.inspect(instance).await {
            Ok(status) if status.is_running() => {}
            Ok(status) => {
                return ProbeResult::unhealthy(started, format!("container is {:?}", status))
            }
            Err(e) => return ProbeResult::unhealthy(started, format!("inspect failed: {}", e)),
        }

        let Some(check) = check else {
            return ProbeResult::healthy(started);
        };
        // A declared health check is never skipped
        let Some(address) = instance.address.as_deref() else {
            return ProbeResult::unhealthy(started, "no reachable address");
        };

        let url = format!("http://{}{}", address, check.path);
        let result = self
            .http_client
            .get(&url)
            .timeout(Duration::from_millis(check.timeout_ms))
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                debug!("Probe {} ok in {:?}", url, started.elapsed());
                ProbeResult::healthy(started)
            }
            Ok(response) => ProbeResult::unhealthy(started, format!("{} returned {}", url, response.status())),
            Err(e) => ProbeResult::unhealthy(started, format!("{} unreachable: {}", url, e)),
        }
    }
}
