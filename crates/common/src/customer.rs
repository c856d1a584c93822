//! Customer records as seen by the orchestrator

use serde::{Deserialize, Serialize};

use crate::resources::ResourceQuotas;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomerStatus {
    Active,
    Suspended,
    Pending,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionPlan {
    Free,
    Starter,
    Professional,
    Enterprise,
}

impl SubscriptionPlan {
    /// Quotas granted by the plan when the customer has no explicit override.
    pub fn default_quotas(&self) -> ResourceQuotas {
        match self {
            Self::Free => ResourceQuotas {
                max_cpu_millis: 500,
                max_memory_mb: 512,
                max_storage_mb: 1_024,
                max_bandwidth_mb: 10_240,
                max_containers: 1,
                max_apps: 1,
                max_deployments: 1,
                max_custom_domains: 0,
            },
            Self::Starter => ResourceQuotas::default(),
            Self::Professional => ResourceQuotas {
                max_cpu_millis: 8_000,
                max_memory_mb: 16_384,
                max_storage_mb: 102_400,
                max_bandwidth_mb: 1_048_576,
                max_containers: 20,
                max_apps: 10,
                max_deployments: 20,
                max_custom_domains: 5,
            },
            Self::Enterprise => ResourceQuotas {
                max_cpu_millis: 64_000,
                max_memory_mb: 131_072,
                max_storage_mb: 1_048_576,
                max_bandwidth_mb: 10_485_760,
                max_containers: 200,
                max_apps: 100,
                max_deployments: 200,
                max_custom_domains: 50,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub name: String,
    pub plan: SubscriptionPlan,
    /// Explicit quotas; falls back to the plan's defaults when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quotas: Option<ResourceQuotas>,
    #[serde(default)]
    pub license_ids: Vec<String>,
    pub status: CustomerStatus,
}

impl Customer {
    pub fn new(id: impl Into<String>, name: impl Into<String>, plan: SubscriptionPlan) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            plan,
            quotas: None,
            license_ids: Vec::new(),
            status: CustomerStatus::Active,
        }
    }

    pub fn effective_quotas(&self) -> ResourceQuotas {
        self.quotas
            .clone()
            .unwrap_or_else(|| self.plan.default_quotas())
    }

    pub fn is_active(&self) -> bool {
        self.status == CustomerStatus::Active
    }
}
