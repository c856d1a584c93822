//! Shared data model for the fleet deployment orchestrator.

pub mod application;
pub mod customer;
pub mod deployment;
pub mod error;
pub mod license;
pub mod resources;

pub use application::{Application, HealthCheck, ResourceProfile, SourceKind};
pub use customer::{Customer, CustomerStatus, SubscriptionPlan};
pub use deployment::{
    DeployRequest, Deployment, DeploymentStatus, HealthState, HealthStatus, InstanceHandle,
    ResourceOverride, SystemStatus, UpdateRequest, validate_version,
};
pub use error::{Error, QuotaDimension, Result};
pub use license::{License, LicenseStatus, LicenseType};
pub use resources::{ResourceQuotas, ResourceReservation, ResourceUsage};
