//! Execution pipeline
//!
//! Drives an admitted deployment from `Pending` through source preparation,
//! image build/pull, container start, network wiring and initial health
//! verification. Each transition is persisted before the next step starts.
//! No table-wide lock is held across any of the slow steps.

use std::sync::Arc;

use chrono::Utc;
use fleet_common::{
    Application, Deployment, DeploymentStatus, Error, HealthCheck, HealthState, HealthStatus,
    InstanceHandle, Result,
};
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use crate::engine::{Checkpoint, Engine};
use crate::probe::ProbeResult;
use crate::runtime::{ImageRef, InstanceSpec, NON_ROOT_USER};
use crate::table::SharedEntry;

/// Why standing up an instance did not produce one
#[derive(Debug)]
pub(crate) enum Halt {
    Interrupted(Checkpoint),
    Failed { step: &'static str, error: Error },
}

pub(crate) fn instance_spec(
    deployment: &Deployment,
    application: &Application,
    image: ImageRef,
    revision: u32,
    network: &str,
) -> InstanceSpec {
    InstanceSpec {
        name: deployment.instance_name(revision),
        image,
        deployment_id: deployment.id.clone(),
        version: deployment.version.clone(),
        cpu_millis: deployment.resources.cpu_millis,
        memory_mb: deployment.resources.memory_mb,
        pids_limit: deployment.resources.pids_limit,
        environment: deployment.environment.clone(),
        network: network.to_string(),
        port: application.port,
        user: NON_ROOT_USER.to_string(),
    }
}

pub(crate) fn health_from_probe(result: &ProbeResult, failures: u32, state: HealthState) -> HealthStatus {
    HealthStatus {
        state,
        last_check: Some(Utc::now()),
        consecutive_failures: failures,
        response_time_ms: Some(result.response_time.as_millis() as u64),
        message: result.detail.clone(),
    }
}

pub struct ExecutionPipeline {
    engine: Arc<Engine>,
}

impl ExecutionPipeline {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Run the pipeline to completion for an admitted deployment
    pub async fn run(&self, entry: SharedEntry) {
        let id = entry.lock().await.record.id.clone();
        if let Err(e) = self.execute(&entry).await {
            error!("Pipeline for {} aborted: {}", id, e);
        }
    }

    async fn execute(&self, entry: &SharedEntry) -> Result<()> {
        if let Some(done) = self.interrupted(entry).await {
            return done;
        }

        let deployment = {
            let mut guard = entry.lock().await;
            match self
                .engine
                .commit(&mut guard, |d| d.transition_to(DeploymentStatus::Deploying))
                .await
            {
                Ok(deployment) => deployment,
                Err(e) => {
                    drop(guard);
                    self.engine.fail(entry, "persist", &e, None).await?;
                    return Err(e);
                }
            }
        };

        let application = match self
            .engine
            .catalog
            .get_application(&deployment.application_id)
            .await
        {
            Ok(Some(application)) => application,
            Ok(None) => {
                let e = Error::ApplicationNotFound(deployment.application_id.clone());
                self.engine.fail(entry, "prepare_source", &e, None).await?;
                return Ok(());
            }
            Err(e) => {
                self.engine.fail(entry, "prepare_source", &e, None).await?;
                return Ok(());
            }
        };

        // Steps 2-4: source, image, container
        let instance = match self
            .stand_up(entry, &deployment, &application, deployment.revision)
            .await
        {
            Ok(instance) => instance,
            Err(Halt::Interrupted(checkpoint)) => return self.on_checkpoint(entry, checkpoint).await,
            Err(Halt::Failed { step, error }) => {
                self.engine.fail(entry, step, &error, None).await?;
                return Ok(());
            }
        };

        {
            let mut guard = entry.lock().await;
            let recorded = self
                .engine
                .commit(&mut guard, |d| {
                    d.instance = Some(instance.clone());
                    Ok(())
                })
                .await;
            if let Err(e) = recorded {
                drop(guard);
                self.engine.fail(entry, "start", &e, Some(&instance)).await?;
                return Ok(());
            }
        }

        if let Some(done) = self.interrupted(entry).await {
            return done;
        }

        // Step 5: networking
        if let Err(e) = self.configure_network(entry, &deployment, &instance).await {
            self.engine
                .fail(entry, "configure_network", &e, Some(&instance))
                .await?;
            return Ok(());
        }

        if let Some(done) = self.interrupted(entry).await {
            return done;
        }

        // Step 6: initial health verification
        let probe = self
            .verify_health(&instance, application.health_check.as_ref())
            .await;

        let mut guard = entry.lock().await;
        let health = if probe.healthy {
            health_from_probe(&probe, 0, HealthState::Healthy)
        } else {
            // Slow starters are left to the health monitor rather than failed
            warn!(
                "Deployment {} did not pass initial health verification: {:?}",
                deployment.id, probe.detail
            );
            health_from_probe(&probe, 0, HealthState::Unhealthy)
        };
        let committed = self
            .engine
            .commit_best_effort(&mut guard, |d| {
                d.transition_to(DeploymentStatus::Running)?;
                d.last_checked = health.last_check;
                d.health = health;
                Ok(())
            })
            .await;

        if guard.stop_requested {
            drop(guard);
            self.engine.teardown(entry).await?;
            return Ok(());
        }
        guard.busy = false;
        drop(guard);

        let deployment = committed?;
        info!(
            "Deployment {} is running at {:?} (health: {:?})",
            deployment.id, deployment.domains, deployment.health.state
        );
        Ok(())
    }

    /// Honour a stop or shutdown request at a scheduling point
    async fn interrupted(&self, entry: &SharedEntry) -> Option<Result<()>> {
        match self.engine.checkpoint(entry).await {
            Checkpoint::Continue => None,
            checkpoint => Some(self.on_checkpoint(entry, checkpoint).await),
        }
    }

    async fn on_checkpoint(&self, entry: &SharedEntry, checkpoint: Checkpoint) -> Result<()> {
        match checkpoint {
            Checkpoint::Continue => Ok(()),
            Checkpoint::Shutdown => {
                let id = entry.lock().await.record.id.clone();
                info!("Shutdown: leaving deployment {} at its last persisted step", id);
                Ok(())
            }
            Checkpoint::Stop => {
                self.engine.teardown(entry).await?;
                Ok(())
            }
        }
    }

    /// Fetch the source, build or pull the image and start one instance.
    /// Stop and shutdown requests are honoured between steps.
    pub(crate) async fn stand_up(
        &self,
        entry: &SharedEntry,
        deployment: &Deployment,
        application: &Application,
        revision: u32,
    ) -> std::result::Result<InstanceHandle, Halt> {
        let artifact = self
            .engine
            .source
            .fetch(&application.source, &deployment.version, &deployment.id, revision)
            .await
            .map_err(|error| Halt::Failed {
                step: "prepare_source",
                error,
            })?;

        self.continue_or_halt(entry).await?;

        let mut tagged = deployment.clone();
        tagged.revision = revision;
        let image = self
            .engine
            .runtime
            .prepare(&artifact, &tagged.image_tag())
            .await
            .map_err(|error| Halt::Failed {
                step: "build_image",
                error,
            })?;

        self.continue_or_halt(entry).await?;

        let spec = instance_spec(
            deployment,
            application,
            image,
            revision,
            &self.engine.settings.network,
        );
        let instance = self
            .engine
            .runtime
            .start(&spec)
            .await
            .map_err(|error| Halt::Failed {
                step: "start",
                error,
            })?;

        info!("Started instance {} for {}", instance.name, deployment.id);
        Ok(instance)
    }

    async fn continue_or_halt(&self, entry: &SharedEntry) -> std::result::Result<(), Halt> {
        match self.engine.checkpoint(entry).await {
            Checkpoint::Continue => Ok(()),
            checkpoint => Err(Halt::Interrupted(checkpoint)),
        }
    }

    async fn configure_network(
        &self,
        entry: &SharedEntry,
        deployment: &Deployment,
        instance: &InstanceHandle,
    ) -> Result<()> {
        let mut domains = vec![
            self.engine
                .router
                .assign_subdomain(&deployment.customer_id, &deployment.id)
                .await?,
        ];
        if let Some(custom) = &deployment.custom_domain {
            domains.push(custom.clone());
        }

        // Record the domains first so a failure below unroutes all of them
        {
            let mut guard = entry.lock().await;
            let intended = domains.clone();
            self.engine
                .commit(&mut guard, |d| {
                    d.domains = intended;
                    Ok(())
                })
                .await?;
        }

        for domain in &domains {
            self.engine.router.program_route(domain, instance).await?;
        }

        for domain in domains {
            let router = self.engine.router.clone();
            tokio::spawn(async move { router.issue_certificate(&domain).await });
        }
        Ok(())
    }

    /// Probe until healthy or the initial verification window closes
    pub(crate) async fn verify_health(
        &self,
        instance: &InstanceHandle,
        check: Option<&HealthCheck>,
    ) -> ProbeResult {
        let deadline = Instant::now() + self.engine.settings.initial_health_timeout;
        loop {
            let result = self.engine.probe.probe(instance, check).await;
            if result.healthy
                || Instant::now() >= deadline
                || self.engine.is_shutting_down()
            {
                return result;
            }
            sleep(self.engine.settings.probe_interval).await;
        }
    }
}
