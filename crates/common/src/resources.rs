//! Resource quotas, usage and per-deployment reservations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, QuotaDimension, Result};

/// Hard limits for a customer, set by the subscription plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuotas {
    /// Total CPU in millicores
    pub max_cpu_millis: u64,
    pub max_memory_mb: u64,
    pub max_storage_mb: u64,
    /// Metered externally; carried for reporting only
    #[serde(default)]
    pub max_bandwidth_mb: u64,
    pub max_containers: u32,
    pub max_apps: u32,
    pub max_deployments: u32,
    #[serde(default)]
    pub max_custom_domains: u32,
}

impl Default for ResourceQuotas {
    fn default() -> Self {
        Self {
            max_cpu_millis: 2_000,
            max_memory_mb: 4_096,
            max_storage_mb: 20_480,
            max_bandwidth_mb: 102_400,
            max_containers: 5,
            max_apps: 3,
            max_deployments: 5,
            max_custom_domains: 1,
        }
    }
}

/// Resources held by a single deployment for as long as it is live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceReservation {
    pub cpu_millis: u64,
    pub memory_mb: u64,
    pub storage_mb: u64,
    pub containers: u32,
    #[serde(default)]
    pub custom_domains: u32,
}

impl ResourceReservation {
    pub fn validate(&self) -> Result<()> {
        if self.cpu_millis == 0 {
            return Err(Error::InvalidRequest("cpu reservation must be positive".into()));
        }
        if self.memory_mb == 0 {
            return Err(Error::InvalidRequest("memory reservation must be positive".into()));
        }
        if self.containers == 0 {
            return Err(Error::InvalidRequest("at least one container is required".into()));
        }
        Ok(())
    }
}

/// Aggregate consumption for one customer. Owned by the quota ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_millis: u64,
    pub memory_mb: u64,
    pub storage_mb: u64,
    pub bandwidth_mb: u64,
    pub containers: u32,
    pub apps: u32,
    pub deployments: u32,
    pub custom_domains: u32,
    pub last_updated: DateTime<Utc>,
}

impl Default for ResourceUsage {
    fn default() -> Self {
        Self {
            cpu_millis: 0,
            memory_mb: 0,
            storage_mb: 0,
            bandwidth_mb: 0,
            containers: 0,
            apps: 0,
            deployments: 0,
            custom_domains: 0,
            last_updated: Utc::now(),
        }
    }
}

impl ResourceUsage {
    /// Check that adding `amount` (plus one deployment, and one app when
    /// `new_app` is set) stays within `quotas` in every dimension.
    pub fn check_fits(
        &self,
        amount: &ResourceReservation,
        new_app: bool,
        quotas: &ResourceQuotas,
    ) -> Result<()> {
        let checks = [
            (QuotaDimension::Cpu, self.cpu_millis, amount.cpu_millis, quotas.max_cpu_millis),
            (QuotaDimension::Memory, self.memory_mb, amount.memory_mb, quotas.max_memory_mb),
            (QuotaDimension::Storage, self.storage_mb, amount.storage_mb, quotas.max_storage_mb),
            (
                QuotaDimension::Containers,
                self.containers.into(),
                amount.containers.into(),
                quotas.max_containers.into(),
            ),
            (
                QuotaDimension::Apps,
                self.apps.into(),
                u64::from(new_app),
                quotas.max_apps.into(),
            ),
            (
                QuotaDimension::Deployments,
                self.deployments.into(),
                1,
                quotas.max_deployments.into(),
            ),
            (
                QuotaDimension::CustomDomains,
                self.custom_domains.into(),
                amount.custom_domains.into(),
                quotas.max_custom_domains.into(),
            ),
        ];

        for (dimension, used, requested, limit) in checks {
            if requested == 0 {
                continue;
            }
            let fits = used.checked_add(requested).is_some_and(|total| total <= limit);
            if !fits {
                return Err(Error::QuotaExceeded {
                    dimension,
                    requested,
                    used,
                    limit,
                });
            }
        }
        Ok(())
    }

    pub fn add(&mut self, amount: &ResourceReservation, new_app: bool) {
        self.cpu_millis = self.cpu_millis.saturating_add(amount.cpu_millis);
        self.memory_mb = self.memory_mb.saturating_add(amount.memory_mb);
        self.storage_mb = self.storage_mb.saturating_add(amount.storage_mb);
        self.containers = self.containers.saturating_add(amount.containers);
        self.custom_domains = self.custom_domains.saturating_add(amount.custom_domains);
        self.deployments = self.deployments.saturating_add(1);
        if new_app {
            self.apps = self.apps.saturating_add(1);
        }
        self.last_updated = Utc::now();
    }

    /// Clamped at zero in every dimension.
    pub fn subtract(&mut self, amount: &ResourceReservation, app_gone: bool) {
        self.cpu_millis = self.cpu_millis.saturating_sub(amount.cpu_millis);
        self.memory_mb = self.memory_mb.saturating_sub(amount.memory_mb);
        self.storage_mb = self.storage_mb.saturating_sub(amount.storage_mb);
        self.containers = self.containers.saturating_sub(amount.containers);
        self.custom_domains = self.custom_domains.saturating_sub(amount.custom_domains);
        self.deployments = self.deployments.saturating_sub(1);
        if app_gone {
            self.apps = self.apps.saturating_sub(1);
        }
        self.last_updated = Utc::now();
    }

    /// Compare the counted dimensions, ignoring timestamps and bandwidth.
    pub fn same_totals(&self, other: &ResourceUsage) -> bool {
        self.cpu_millis == other.cpu_millis
            && self.memory_mb == other.memory_mb
            && self.storage_mb == other.storage_mb
            && self.containers == other.containers
            && self.apps == other.apps
            && self.deployments == other.deployments
            && self.custom_domains == other.custom_domains
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> ResourceReservation {
        ResourceReservation {
            cpu_millis: 500,
            memory_mb: 256,
            storage_mb: 1024,
            containers: 1,
            custom_domains: 0,
        }
    }

    #[test]
    fn test_check_fits_reports_first_exceeded_dimension() {
        let quotas = ResourceQuotas {
            max_cpu_millis: 600,
            ..ResourceQuotas::default()
        };
        let mut usage = ResourceUsage::default();
        usage.check_fits(&small(), true, &quotas).unwrap();
        usage.add(&small(), true);

        let err = usage.check_fits(&small(), false, &quotas).unwrap_err();
        match err {
            Error::QuotaExceeded {
                dimension,
                requested,
                used,
                limit,
            } => {
                assert_eq!(dimension, QuotaDimension::Cpu);
                assert_eq!(requested, 500);
                assert_eq!(used, 500);
                assert_eq!(limit, 600);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_app_dimension_only_counts_new_apps() {
        let quotas = ResourceQuotas {
            max_apps: 1,
            ..ResourceQuotas::default()
        };
        let mut usage = ResourceUsage::default();
        usage.add(&small(), true);

        assert!(usage.check_fits(&small(), false, &quotas).is_ok());
        let err = usage.check_fits(&small(), true, &quotas).unwrap_err();
        assert!(matches!(
            err,
            Error::QuotaExceeded {
                dimension: QuotaDimension::Apps,
                ..
            }
        ));
    }

    #[test]
    fn test_subtract_clamps_at_zero() {
        let mut usage = ResourceUsage::default();
        usage.subtract(&small(), true);
        assert_eq!(usage.cpu_millis, 0);
        assert_eq!(usage.deployments, 0);
        assert_eq!(usage.apps, 0);
    }

    #[test]
    fn test_reservation_validation() {
        let mut amount = small();
        assert!(amount.validate().is_ok());
        amount.cpu_millis = 0;
        assert!(matches!(amount.validate(), Err(Error::InvalidRequest(_))));
    }
}
