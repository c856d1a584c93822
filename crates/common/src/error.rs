use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::deployment::DeploymentStatus;

/// Quota dimension named in a `QuotaExceeded` rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaDimension {
    Cpu,
    Memory,
    Storage,
    Containers,
    Apps,
    Deployments,
    CustomDomains,
}

impl QuotaDimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Storage => "storage",
            Self::Containers => "containers",
            Self::Apps => "apps",
            Self::Deployments => "deployments",
            Self::CustomDomains => "custom_domains",
        }
    }
}

impl fmt::Display for QuotaDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Customer not found: {0}")]
    CustomerNotFound(String),

    #[error("Customer is not active: {0}")]
    CustomerInactive(String),

    #[error("Application not found: {0}")]
    ApplicationNotFound(String),

    #[error("No valid license for application {application_id} held by customer {customer_id}")]
    LicenseRequired {
        customer_id: String,
        application_id: String,
    },

    #[error("License expired: {0}")]
    LicenseExpired(String),

    #[error("License {license_id} is {status}")]
    LicenseInvalid { license_id: String, status: String },

    #[error("License {license_id} allows at most {limit} deployments")]
    LicenseLimitReached { license_id: String, limit: u32 },

    #[error("QuotaExceeded:{dimension} (requested {requested}, in use {used}, limit {limit})")]
    QuotaExceeded {
        dimension: QuotaDimension,
        requested: u64,
        used: u64,
        limit: u64,
    },

    #[error("Deployment not found: {0}")]
    DeploymentNotFound(String),

    #[error("Illegal transition for deployment {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: DeploymentStatus,
        to: DeploymentStatus,
    },

    #[error("Deployment {id} is {status}: {reason}")]
    InvalidState {
        id: String,
        status: DeploymentStatus,
        reason: String,
    },

    #[error("Deployment {0} has an operation in progress")]
    Busy(String),

    #[error("UpdateFailed: {0}")]
    UpdateFailed(String),

    #[error("Source retrieval error: {0}")]
    Source(String),

    #[error("Container runtime error: {0}")]
    Container(String),

    #[error("Route provisioning error: {0}")]
    Route(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Admission rejections are caller-correctable and leave no state behind.
    pub fn is_admission_rejection(&self) -> bool {
        matches!(
            self,
            Error::CustomerNotFound(_)
                | Error::CustomerInactive(_)
                | Error::ApplicationNotFound(_)
                | Error::LicenseRequired { .. }
                | Error::LicenseExpired(_)
                | Error::LicenseInvalid { .. }
                | Error::LicenseLimitReached { .. }
                | Error::QuotaExceeded { .. }
                | Error::InvalidRequest(_)
        )
    }

    /// Short machine-readable code used in audit events and API bodies.
    pub fn code(&self) -> String {
        match self {
            Error::CustomerNotFound(_) => "CustomerNotFound".to_string(),
            Error::CustomerInactive(_) => "CustomerInactive".to_string(),
            Error::ApplicationNotFound(_) => "ApplicationNotFound".to_string(),
            Error::LicenseRequired { .. } => "LicenseRequired".to_string(),
            Error::LicenseExpired(_) => "LicenseExpired".to_string(),
            Error::LicenseInvalid { .. } => "LicenseInvalid".to_string(),
            Error::LicenseLimitReached { .. } => "LicenseLimitReached".to_string(),
            Error::QuotaExceeded { dimension, .. } => format!("QuotaExceeded:{dimension}"),
            Error::DeploymentNotFound(_) => "DeploymentNotFound".to_string(),
            Error::InvalidTransition { .. } => "InvalidTransition".to_string(),
            Error::InvalidState { .. } => "InvalidState".to_string(),
            Error::Busy(_) => "Busy".to_string(),
            Error::UpdateFailed(_) => "UpdateFailed".to_string(),
            Error::Source(_) => "SourceError".to_string(),
            Error::Container(_) => "ContainerError".to_string(),
            Error::Route(_) => "RouteError".to_string(),
            Error::Storage(_) => "StorageError".to_string(),
            Error::InvalidRequest(_) => "InvalidRequest".to_string(),
            Error::JsonSerialization(_) | Error::Io(_) | Error::Other(_) => "Internal".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_error_names_dimension() {
        let err = Error::QuotaExceeded {
            dimension: QuotaDimension::Containers,
            requested: 1,
            used: 1,
            limit: 1,
        };
        assert_eq!(err.code(), "QuotaExceeded:containers");
        assert!(err.to_string().starts_with("QuotaExceeded:containers"));
        assert!(err.is_admission_rejection());
    }

    #[test]
    fn test_provisioning_errors_are_not_rejections() {
        assert!(!Error::Container("boom".into()).is_admission_rejection());
        assert!(!Error::Storage("down".into()).is_admission_rejection());
    }
}
