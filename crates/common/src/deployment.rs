//! Deployment records and their state machine

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::application::ResourceProfile;
use crate::error::{Error, Result};
use crate::resources::ResourceReservation;

/// Deployment lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Admitted, waiting for the execution pipeline
    Pending,
    /// Source, image, container and route are being provisioned
    Deploying,
    Running,
    /// A replacement instance is being stood up
    Updating,
    /// Health checks are failing but below the escalation threshold
    Degraded,
    Failed,
    Stopped,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Deploying => "deploying",
            Self::Running => "running",
            Self::Updating => "updating",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Stopped)
    }

    /// States supervised by the health monitor
    pub fn is_serving(&self) -> bool {
        matches!(self, Self::Running | Self::Degraded)
    }

    pub fn can_transition_to(&self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        matches!(
            (self, next),
            (Pending, Deploying)
                | (Pending, Failed)
                | (Pending, Stopped)
                | (Deploying, Running)
                | (Deploying, Failed)
                | (Deploying, Stopped)
                | (Running, Updating)
                | (Running, Degraded)
                | (Running, Stopped)
                | (Updating, Running)
                | (Updating, Failed)
                | (Updating, Stopped)
                | (Degraded, Running)
                | (Degraded, Failed)
                | (Degraded, Stopped)
        )
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "deploying" => Ok(Self::Deploying),
            "running" => Ok(Self::Running),
            "updating" => Ok(Self::Updating),
            "degraded" => Ok(Self::Degraded),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            other => Err(Error::InvalidRequest(format!("unknown status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub state: HealthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self {
            state: HealthState::Unknown,
            last_check: None,
            consecutive_failures: 0,
            response_time_ms: None,
            message: None,
        }
    }
}

/// Opaque reference to a running instance, issued by the container driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceHandle {
    pub id: String,
    pub name: String,
    /// `host:port` the instance is reachable on, when published
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub customer_id: String,
    pub application_id: String,
    pub license_id: String,
    pub version: String,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_domain: Option<String>,
    /// Domains currently routed to the instance
    #[serde(default)]
    pub domains: Vec<String>,
    pub resources: ResourceProfile,
    pub reservation: ResourceReservation,
    /// Whether the reservation is still counted by the quota ledger
    pub reservation_held: bool,
    pub status: DeploymentStatus,
    pub health: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<InstanceHandle>,
    /// Incremented by each successful update
    pub revision: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
    /// Human-readable last error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Deployment {
    /// Apply a state transition, rejecting edges outside the state machine.
    pub fn transition_to(&mut self, next: DeploymentStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition_to(DeploymentStatus::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }

    pub fn image_tag(&self) -> String {
        format!(
            "fleet/{}:{}-r{}",
            self.application_id, self.version, self.revision
        )
    }

    /// Name for the container of the given revision
    pub fn instance_name(&self, revision: u32) -> String {
        format!("fleet-{}-r{}", self.id, revision)
    }
}

/// Longest version accepted; also the registry's tag length limit
pub const MAX_VERSION_LEN: usize = 128;

/// Check that a requested version is usable as both a git ref and an image
/// tag: ASCII alphanumerics plus `.`, `_` and `-`, not starting with `.` or
/// `-`, and never containing `..`.
pub fn validate_version(version: &str) -> Result<()> {
    let invalid = |reason: &str| -> Result<()> {
        Err(Error::InvalidRequest(format!(
            "invalid version {version:?}: {reason}"
        )))
    };

    if version.is_empty() {
        return invalid("empty");
    }
    if version.len() > MAX_VERSION_LEN {
        return invalid("too long");
    }
    if version.starts_with('.') || version.starts_with('-') {
        return invalid("must start with a letter, digit or underscore");
    }
    if version.contains("..") {
        return invalid("must not contain '..'");
    }
    if let Some(c) = version
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return invalid(&format!("unexpected character {c:?}"));
    }
    Ok(())
}

/// Resource override accepted on a deploy request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceOverride {
    pub cpu_millis: u64,
    pub memory_mb: u64,
    #[serde(default)]
    pub storage_mb: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployRequest {
    pub customer_id: String,
    pub application_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_domain: Option<String>,
}

impl DeployRequest {
    pub fn new(customer_id: impl Into<String>, application_id: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            application_id: application_id.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Replaces the deployment's environment when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<HashMap<String, String>>,
}

/// Aggregate counts reported by the orchestrator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub total_deployments: usize,
    /// Deployments that are not in a terminal state
    pub active_deployments: usize,
    pub running: usize,
    pub degraded: usize,
    pub in_progress: usize,
    pub failed: usize,
    pub stopped: usize,
    pub customers: usize,
    pub applications: usize,
}
