//! Catalog applications and where their code comes from

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::resources::ResourceReservation;

/// Where an application's runnable image is produced from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceKind {
    /// Build from a git repository; the requested version is the ref to check out
    Git {
        repository: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dockerfile: Option<String>,
    },
    /// Pull a prebuilt image; the requested version is the tag
    Registry { image: String },
    /// Build from a tarball served over HTTP; `{version}` in the URL is substituted
    Archive { url: String },
}

/// Resources an application needs per instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceProfile {
    pub cpu_millis: u64,
    pub memory_mb: u64,
    pub storage_mb: u64,
    /// Process count limit applied to the container
    #[serde(default = "default_pids_limit")]
    pub pids_limit: u32,
}

fn default_pids_limit() -> u32 {
    256
}

impl ResourceProfile {
    pub fn reservation(&self) -> ResourceReservation {
        ResourceReservation {
            cpu_millis: self.cpu_millis,
            memory_mb: self.memory_mb,
            storage_mb: self.storage_mb,
            containers: 1,
            custom_domains: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// HTTP path probed on the instance, e.g. `/healthz`
    pub path: String,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_probe_timeout_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    pub name: String,
    pub default_version: String,
    pub source: SourceKind,
    /// Port the application listens on inside the container
    pub port: u16,
    /// Required; admission reserves exactly this unless a request overrides it
    pub resources: ResourceProfile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
}
