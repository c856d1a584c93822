//! Source retrieval: turns an application's `SourceKind` into a buildable artifact

use std::path::PathBuf;

use async_trait::async_trait;
use fleet_common::{Error, Result, SourceKind, validate_version};
use tokio::process::Command;
use tracing::info;

use crate::runtime::SourceArtifact;

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Fetch `version` of `source` for one revision of a deployment
    async fn fetch(
        &self,
        source: &SourceKind,
        version: &str,
        deployment_id: &str,
        revision: u32,
    ) -> Result<SourceArtifact>;
}

/// Image reference for a registry source at `version`
pub fn registry_reference(image: &str, version: &str) -> String {
    if image.contains('@') {
        // Pinned by digest; the version is informational
        image.to_string()
    } else {
        format!("{}:{}", image, version)
    }
}

/// Fetches sources with the `git` and `docker` command line tools
pub struct CliSourceFetcher {
    git_bin: String,
    docker_bin: String,
    work_dir: PathBuf,
    http_client: reqwest::Client,
}

impl CliSourceFetcher {
    pub fn new(git_bin: impl Into<String>, docker_bin: impl Into<String>, work_dir: PathBuf) -> Self {
        Self {
            git_bin: git_bin.into(),
            docker_bin: docker_bin.into(),
            work_dir,
            http_client: reqwest::Client::new(),
        }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<()> {
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Source(format!("Failed to execute {}: {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Source(format!(
                "{} {} failed: {}",
                program,
                args.first().copied().unwrap_or(""),
                stderr.trim()
            )));
        }
        Ok(())
    }

    /// Checkout directory of one revision; never derived from the version
    fn checkout_dir(&self, deployment_id: &str, revision: u32) -> PathBuf {
        self.work_dir.join(deployment_id).join(format!("r{}", revision))
    }

    async fn checkout(
        &self,
        repository: &str,
        version: &str,
        deployment_id: &str,
        revision: u32,
    ) -> Result<PathBuf> {
        let dir = self.checkout_dir(deployment_id, revision);
        if tokio::fs::try_exists(&dir).await? {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let dir_arg = dir.to_string_lossy().to_string();
        self.run(
            &self.git_bin,
            &[
                "clone",
                "--depth",
                "1",
                "--branch",
                version,
                repository,
                dir_arg.as_str(),
            ],
        )
        .await?;

        Ok(dir)
    }
}

#[async_trait]
impl SourceFetcher for CliSourceFetcher {
    async fn fetch(
        &self,
        source: &SourceKind,
        version: &str,
        deployment_id: &str,
        revision: u32,
    ) -> Result<SourceArtifact> {
        validate_version(version)?;

        match source {
            SourceKind::Git {
                repository,
                dockerfile,
            } => {
                info!("Checking out {}@{} for {}", repository, version, deployment_id);
                let path = self
                    .checkout(repository, version, deployment_id, revision)
                    .await?;
                Ok(SourceArtifact::BuildContext {
                    path,
                    dockerfile: dockerfile.clone(),
                })
            }
            SourceKind::Registry { image } => {
                let reference = registry_reference(image, version);
                info!("Validating image {} for {}", reference, deployment_id);
                self.run(&self.docker_bin, &["manifest", "inspect", reference.as_str()])
                    .await
                    .map_err(|_| Error::Source(format!("image {} not found", reference)))?;
                Ok(SourceArtifact::Image { reference })
            }
            SourceKind::Archive { url } => {
                let url = url.replace("{version}", version);
                let response = self
                    .http_client
                    .head(&url)
                    .send()
                    .await
                    .map_err(|e| Error::Source(format!("Failed to reach {}: {}", url, e)))?;
                if !response.status().is_success() {
                    return Err(Error::Source(format!(
                        "archive {} returned {}",
                        url,
                        response.status()
                    )));
                }
                Ok(SourceArtifact::RemoteContext { url })
            }
        }
    }
}
