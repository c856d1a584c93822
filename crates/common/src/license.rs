//! Licenses binding a customer to an application

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LicenseType {
    Free,
    Trial,
    Subscription,
    OneTime,
    Enterprise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseStatus {
    Active,
    Expired,
    Suspended,
    Revoked,
}

impl LicenseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Suspended => "suspended",
            Self::Revoked => "revoked",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct License {
    pub id: String,
    pub customer_id: String,
    pub application_id: String,
    pub license_type: LicenseType,
    pub status: LicenseStatus,
    pub valid_from: DateTime<Utc>,
    /// Open-ended when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
    /// Live deployments allowed under this license; unlimited when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_deployments: Option<u32>,
}

impl License {
    /// Check the license may back a deployment of `application_id` at `now`.
    pub fn validate_for(&self, application_id: &str, now: DateTime<Utc>) -> Result<()> {
        if self.application_id != application_id {
            return Err(Error::LicenseRequired {
                customer_id: self.customer_id.clone(),
                application_id: application_id.to_string(),
            });
        }

        match self.status {
            LicenseStatus::Active => {}
            LicenseStatus::Expired => return Err(Error::LicenseExpired(self.id.clone())),
            status => {
                return Err(Error::LicenseInvalid {
                    license_id: self.id.clone(),
                    status: status.as_str().to_string(),
                })
            }
        }

        if now < self.valid_from {
            return Err(Error::LicenseInvalid {
                license_id: self.id.clone(),
                status: "not yet valid".to_string(),
            });
        }
        if self.valid_until.is_some_and(|until| now >= until) {
            return Err(Error::LicenseExpired(self.id.clone()));
        }
        Ok(())
    }
}
