//! Docker CLI implementation of the container driver

use std::time::Duration;

use async_trait::async_trait;
use fleet_common::{Error, InstanceHandle, Result};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{ContainerDriver, ImageRef, InstanceSpec, RuntimeStatus, SourceArtifact};

pub struct DockerCliDriver {
    docker_bin: String,
}

impl DockerCliDriver {
    pub fn new(docker_bin: impl Into<String>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
        }
    }

    /// Run a docker subcommand and return trimmed stdout
    async fn docker(&self, args: &[String]) -> Result<String> {
        debug!("{} {}", self.docker_bin, args.join(" "));

        let output = Command::new(&self.docker_bin)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Container(format!("Failed to execute {}: {}", self.docker_bin, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Container(format!(
                "docker {} failed: {}",
                args.first().map(String::as_str).unwrap_or(""),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn run_args(spec: &InstanceSpec) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--detach".into(),
            "--name".into(),
            spec.name.clone(),
            "--cpus".into(),
            format!("{:.3}", spec.cpu_millis as f64 / 1000.0),
            "--memory".into(),
            format!("{}m", spec.memory_mb),
            "--pids-limit".into(),
            spec.pids_limit.to_string(),
            "--user".into(),
            spec.user.clone(),
            "--security-opt".into(),
            "no-new-privileges".into(),
            "--network".into(),
            spec.network.clone(),
            "--publish".into(),
            format!("127.0.0.1::{}", spec.port),
            "--label".into(),
            format!("fleet.deployment={}", spec.deployment_id),
            "--label".into(),
            format!("fleet.version={}", spec.version),
        ];

        let mut env: Vec<_> = spec.environment.iter().collect();
        env.sort();
        for (key, value) in env {
            args.push("--env".into());
            args.push(format!("{key}={value}"));
        }

        args.push(spec.image.0.clone());
        args
    }
}

#[async_trait]
impl ContainerDriver for DockerCliDriver {
    async fn prepare(&self, artifact: &SourceArtifact, tag: &str) -> Result<ImageRef> {
        match artifact {
            SourceArtifact::BuildContext { path, dockerfile } => {
                info!("Building image {} from {}", tag, path.display());
                let mut args = vec!["build".to_string(), "--tag".to_string(), tag.to_string()];
                if let Some(dockerfile) = dockerfile {
                    args.push("--file".into());
                    args.push(path.join(dockerfile).to_string_lossy().to_string());
                }
                args.push(path.to_string_lossy().to_string());
                self.docker(&args).await?;
                Ok(ImageRef(tag.to_string()))
            }
            SourceArtifact::RemoteContext { url } => {
                info!("Building image {} from {}", tag, url);
                self.docker(&["build".into(), "--tag".into(), tag.into(), url.clone()])
                    .await?;
                Ok(ImageRef(tag.to_string()))
            }
            SourceArtifact::Image { reference } => {
                info!("Pulling image {}", reference);
                self.docker(&["pull".into(), reference.clone()]).await?;
                Ok(ImageRef(reference.clone()))
            }
        }
    }

    async fn start(&self, spec: &InstanceSpec) -> Result<InstanceHandle> {
        let id = self.docker(&Self::run_args(spec)).await?;

        let mut handle = InstanceHandle {
            id: id.clone(),
            name: spec.name.clone(),
            address: None,
        };

        // `docker port` prints one binding per line, e.g. 127.0.0.1:49153
        match self
            .docker(&["port".into(), id.clone(), format!("{}/tcp", spec.port)])
            .await
        {
            Ok(ports) => handle.address = ports.lines().next().map(str::to_string),
            Err(e) => {
                // The caller never sees this handle, so clean up here
                warn!("Container {} has no published port: {}", spec.name, e);
                if let Err(e) = self.remove(&handle, true).await {
                    warn!("Failed to remove unreachable container {}: {}", spec.name, e);
                }
                return Err(Error::Container(format!(
                    "container {} started without a published port",
                    spec.name
                )));
            }
        }

        info!(
            "Started container {} ({}) at {:?}",
            spec.name, id, handle.address
        );
        Ok(handle)
    }

    async fn stop(&self, handle: &InstanceHandle, timeout: Duration) -> Result<()> {
        self.docker(&[
            "stop".into(),
            "--time".into(),
            timeout.as_secs().to_string(),
            handle.id.clone(),
        ])
        .await?;
        info!("Stopped container {}", handle.name);
        Ok(())
    }

    async fn remove(&self, handle: &InstanceHandle, force: bool) -> Result<()> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("--force".into());
        }
        args.push(handle.id.clone());

        match self.docker(&args).await {
            Ok(_) => {
                info!("Removed container {}", handle.name);
                Ok(())
            }
            Err(Error::Container(msg)) if msg.contains("No such container") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn inspect(&self, handle: &InstanceHandle) -> Result<RuntimeStatus> {
        let result = self
            .docker(&[
                "inspect".into(),
                "--format".into(),
                "{{.State.Status}}".into(),
                handle.id.clone(),
            ])
            .await;

        match result {
            Ok(state) => Ok(match state.as_str() {
                "running" => RuntimeStatus::Running,
                "created" | "restarting" | "paused" => RuntimeStatus::Starting,
                _ => RuntimeStatus::Exited,
            }),
            Err(Error::Container(msg)) if msg.contains("No such") => Ok(RuntimeStatus::Missing),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_run_args_apply_limits_and_non_root_user() {
        let mut environment = HashMap::new();
        environment.insert("B".to_string(), "2".to_string());
        environment.insert("A".to_string(), "1".to_string());

        let spec = InstanceSpec {
            name: "fleet-dep_1-r0".to_string(),
            image: ImageRef("ghost:5".to_string()),
            deployment_id: "dep_1".to_string(),
            version: "5".to_string(),
            cpu_millis: 1500,
            memory_mb: 512,
            pids_limit: 128,
            environment,
            network: "fleet".to_string(),
            port: 2368,
            user: crate::runtime::NON_ROOT_USER.to_string(),
        };

        let args = DockerCliDriver::run_args(&spec);
        let joined = args.join(" ");
        assert!(joined.contains("--cpus 1.500"));
        assert!(joined.contains("--memory 512m"));
        assert!(joined.contains("--pids-limit 128"));
        assert!(joined.contains("--user 65534:65534"));
        assert!(joined.contains("--publish 127.0.0.1::2368"));
        assert!(joined.contains("--env A=1 --env B=2"));
        assert_eq!(args.last().map(String::as_str), Some("ghost:5"));
    }
}
