//! Container lifecycle driver contract

pub mod docker;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use fleet_common::{InstanceHandle, Result};
use serde::{Deserialize, Serialize};

pub use docker::DockerCliDriver;

/// What source retrieval produced, ready to be turned into an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceArtifact {
    /// Checked-out tree with a Dockerfile
    BuildContext {
        path: PathBuf,
        dockerfile: Option<String>,
    },
    /// Prebuilt image already validated in a registry
    Image { reference: String },
    /// Tarball context the runtime fetches itself
    RemoteContext { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef(pub String);

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything needed to start one instance
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub name: String,
    pub image: ImageRef,
    pub deployment_id: String,
    pub version: String,
    pub cpu_millis: u64,
    pub memory_mb: u64,
    pub pids_limit: u32,
    pub environment: HashMap<String, String>,
    pub network: String,
    /// Port the application listens on inside the container
    pub port: u16,
    /// Unprivileged `uid:gid` the process runs as
    pub user: String,
}

/// Unprivileged user every instance runs as
pub const NON_ROOT_USER: &str = "65534:65534";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    Running,
    Starting,
    Exited,
    Missing,
}

impl RuntimeStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Build or pull the image for an artifact, tagging it `tag`
    async fn prepare(&self, artifact: &SourceArtifact, tag: &str) -> Result<ImageRef>;

    async fn start(&self, spec: &InstanceSpec) -> Result<InstanceHandle>;

    async fn stop(&self, handle: &InstanceHandle, timeout: Duration) -> Result<()>;

    async fn remove(&self, handle: &InstanceHandle, force: bool) -> Result<()>;

    async fn inspect(&self, handle: &InstanceHandle) -> Result<RuntimeStatus>;
}
