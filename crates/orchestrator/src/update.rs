//! Rolling update controller
//!
//! Replaces a running deployment's instance with a new version. The new
//! instance must verify healthy before any route moves to it, and the old
//! instance is retired only after every route points at the new one. A
//! failed update leaves the deployment on its previous version.

use std::sync::Arc;

use fleet_common::{
    Deployment, DeploymentStatus, Error, HealthState, InstanceHandle, Result, UpdateRequest,
    validate_version,
};
use serde_json::json;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::engine::{Checkpoint, Engine};
use crate::pipeline::{health_from_probe, ExecutionPipeline, Halt};
use crate::table::SharedEntry;

pub struct UpdateController {
    engine: Arc<Engine>,
    pipeline: ExecutionPipeline,
}

impl UpdateController {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            pipeline: ExecutionPipeline::new(engine.clone()),
            engine,
        }
    }

    pub async fn update(&self, deployment_id: &str, request: &UpdateRequest) -> Result<Deployment> {
        if let Some(version) = &request.version {
            validate_version(version)?;
        }

        let entry = self
            .engine
            .table
            .get(deployment_id)
            .await
            .ok_or_else(|| Error::DeploymentNotFound(deployment_id.to_string()))?;

        let (current, old_instance) = self.claim(&entry).await?;

        let mut target = current.clone();
        if let Some(version) = &request.version {
            target.version = version.clone();
        }
        if let Some(environment) = &request.environment {
            target.environment = environment.clone();
        }
        let revision = current.revision + 1;

        info!(
            "Updating {} from {} (r{}) to {} (r{})",
            current.id, current.version, current.revision, target.version, revision
        );

        let application = match self.engine.catalog.get_application(&current.application_id).await {
            Ok(Some(application)) => application,
            Ok(None) => {
                let detail = format!("application {} no longer in catalog", current.application_id);
                return self.abandon(&entry, "prepare_source", detail, None).await;
            }
            Err(e) => return self.abandon(&entry, "prepare_source", e.to_string(), None).await,
        };

        let new_instance = match self
            .pipeline
            .stand_up(&entry, &target, &application, revision)
            .await
        {
            Ok(instance) => instance,
            Err(Halt::Failed { step, error }) => {
                return self.abandon(&entry, step, error.to_string(), None).await
            }
            Err(Halt::Interrupted(checkpoint)) => {
                return self.interrupted(&entry, checkpoint, None).await
            }
        };

        let probe = self
            .pipeline
            .verify_health(&new_instance, application.health_check.as_ref())
            .await;
        if !probe.healthy {
            let detail = probe
                .detail
                .unwrap_or_else(|| "new instance did not become healthy".to_string());
            return self
                .abandon(&entry, "verify_health", detail, Some(&new_instance))
                .await;
        }

        match self.engine.checkpoint(&entry).await {
            Checkpoint::Continue => {}
            checkpoint => return self.interrupted(&entry, checkpoint, Some(&new_instance)).await,
        }

        self.repoint(&entry, &current, &old_instance, &new_instance)
            .await?;

        // Old instance keeps serving in-flight requests until the grace ends
        sleep(self.engine.settings.drain_grace).await;
        self.engine.retire_instance(&old_instance).await;

        let health = health_from_probe(&probe, 0, HealthState::Healthy);
        let mut guard = entry.lock().await;
        let committed = self
            .engine
            .commit_best_effort(&mut guard, |d| {
                d.instance = Some(new_instance.clone());
                d.version = target.version.clone();
                d.environment = target.environment.clone();
                d.revision = revision;
                d.last_checked = health.last_check;
                d.health = health;
                d.metadata.remove("last_update_error");
                d.transition_to(DeploymentStatus::Running)
            })
            .await;

        if guard.stop_requested {
            drop(guard);
            return self.engine.teardown(&entry).await;
        }
        guard.busy = false;
        let updated = committed?;
        info!(
            "Deployment {} now serving {} (r{})",
            updated.id, updated.version, updated.revision
        );
        Ok(updated)
    }

    /// Take ownership of a running deployment and mark it `Updating`
    async fn claim(&self, entry: &SharedEntry) -> Result<(Deployment, InstanceHandle)> {
        let mut guard = entry.lock().await;
        let id = guard.record.id.clone();
        if guard.busy {
            return Err(Error::Busy(id));
        }
        if guard.record.status != DeploymentStatus::Running {
            return Err(Error::InvalidState {
                id,
                status: guard.record.status,
                reason: "only running deployments can be updated".to_string(),
            });
        }
        let Some(instance) = guard.record.instance.clone() else {
            return Err(Error::InvalidState {
                id,
                status: guard.record.status,
                reason: "no instance to replace".to_string(),
            });
        };

        guard.busy = true;
        match self
            .engine
            .commit(&mut guard, |d| d.transition_to(DeploymentStatus::Updating))
            .await
        {
            Ok(deployment) => Ok((deployment, instance)),
            Err(e) => {
                guard.busy = false;
                Err(e)
            }
        }
    }

    /// Move every domain to the new instance. On failure the routes already
    /// moved are pointed back; if that also fails the deployment is failed.
    async fn repoint(
        &self,
        entry: &SharedEntry,
        current: &Deployment,
        old_instance: &InstanceHandle,
        new_instance: &InstanceHandle,
    ) -> Result<()> {
        for (moved, domain) in current.domains.iter().enumerate() {
            let Err(e) = self.engine.router.program_route(domain, new_instance).await else {
                continue;
            };
            warn!("Repointing {} to {} failed: {}", domain, new_instance.name, e);

            let mut restored = true;
            for domain in &current.domains[..=moved] {
                if let Err(e) = self.engine.router.program_route(domain, old_instance).await {
                    error!("Restoring route {} to {} failed: {}", domain, old_instance.name, e);
                    restored = false;
                }
            }

            if restored {
                let detail = format!("route {} could not be repointed: {}", domain, e);
                return self
                    .abandon(entry, "repoint_route", detail, Some(new_instance))
                    .await
                    .map(|_| ());
            }
            return Err(self.fail_unrestorable(entry, current, new_instance, &e).await);
        }
        Ok(())
    }

    /// Routing is in an unknown state: take the deployment out of service
    async fn fail_unrestorable(
        &self,
        entry: &SharedEntry,
        current: &Deployment,
        new_instance: &InstanceHandle,
        cause: &Error,
    ) -> Error {
        self.engine.unroute(&current.domains).await;
        self.engine.discard_instance(new_instance).await;

        let detail = format!("update failed and routes could not be restored: {}", cause);
        let mut guard = entry.lock().await;
        let message = detail.clone();
        if let Err(e) = self
            .engine
            .commit_best_effort(&mut guard, |d| {
                d.domains.clear();
                d.mark_failed(message)
            })
            .await
        {
            error!("Failed to mark {} failed: {}", current.id, e);
        }
        guard.busy = false;
        self.audit_failure(&guard.record, "repoint_route", &detail);
        Error::UpdateFailed(detail)
    }

    /// Drop the new instance and return the deployment to `Running` on its
    /// previous version
    async fn abandon(
        &self,
        entry: &SharedEntry,
        step: &str,
        detail: String,
        new_instance: Option<&InstanceHandle>,
    ) -> Result<Deployment> {
        warn!("Update step {} failed: {}", step, detail);
        if let Some(instance) = new_instance {
            self.engine.discard_instance(instance).await;
        }

        let mut guard = entry.lock().await;
        let recorded = detail.clone();
        if let Err(e) = self
            .engine
            .commit_best_effort(&mut guard, |d| {
                d.metadata.insert("last_update_error".to_string(), recorded);
                d.transition_to(DeploymentStatus::Running)
            })
            .await
        {
            error!("Failed to restore {} after update: {}", guard.record.id, e);
        }
        self.audit_failure(&guard.record, step, &detail);

        if guard.stop_requested {
            drop(guard);
            self.engine.teardown(entry).await?;
        } else {
            guard.busy = false;
        }
        Err(Error::UpdateFailed(detail))
    }

    async fn interrupted(
        &self,
        entry: &SharedEntry,
        checkpoint: Checkpoint,
        new_instance: Option<&InstanceHandle>,
    ) -> Result<Deployment> {
        match checkpoint {
            Checkpoint::Stop => {
                if let Some(instance) = new_instance {
                    self.engine.discard_instance(instance).await;
                }
                let stopped = self.engine.teardown(entry).await?;
                Err(Error::UpdateFailed(format!(
                    "deployment {} was stopped during the update",
                    stopped.id
                )))
            }
            _ => {
                self.abandon(entry, "shutdown", "orchestrator shutting down".to_string(), new_instance)
                    .await
            }
        }
    }

    fn audit_failure(&self, deployment: &Deployment, step: &str, detail: &str) {
        self.engine.audit.log_event(
            "deployment.update_failed",
            json!({
                "deployment_id": deployment.id,
                "customer_id": deployment.customer_id,
                "step": step,
                "version": deployment.version,
                "status": deployment.status,
                "detail": detail,
            }),
        );
    }
}
