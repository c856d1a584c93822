//! Orchestrator facade
//!
//! Public entry point composing admission, the execution pipeline, the
//! update controller and the background loops around one shared [`Engine`].

use std::sync::Arc;

use fleet_common::{
    DeployRequest, Deployment, DeploymentStatus, Error, ResourceQuotas, ResourceUsage, Result,
    SystemStatus, UpdateRequest,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::admission::AdmissionController;
use crate::engine::Engine;
use crate::health::HealthMonitor;
use crate::pipeline::ExecutionPipeline;
use crate::reconcile::Reconciler;
use crate::update::UpdateController;

/// A customer's quotas next to what the ledger currently counts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerUsage {
    pub customer_id: String,
    pub quotas: ResourceQuotas,
    pub usage: ResourceUsage,
}

pub struct Orchestrator {
    engine: Arc<Engine>,
    admission: AdmissionController,
    updates: UpdateController,
    pipelines: Mutex<JoinSet<()>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            admission: AdmissionController::new(engine.clone()),
            updates: UpdateController::new(engine.clone()),
            engine,
            pipelines: Mutex::new(JoinSet::new()),
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Admit synchronously, then provision in the background
    pub async fn deploy(&self, request: &DeployRequest) -> Result<Deployment> {
        if self.engine.is_shutting_down() {
            return Err(Error::InvalidRequest(
                "orchestrator is shutting down".to_string(),
            ));
        }

        let (deployment, entry) = self.admission.admit(request).await?;

        let pipeline = ExecutionPipeline::new(self.engine.clone());
        let mut pipelines = self.pipelines.lock().await;
        while pipelines.try_join_next().is_some() {}
        pipelines.spawn(async move { pipeline.run(entry).await });

        Ok(deployment)
    }

    pub async fn get_deployment(&self, deployment_id: &str) -> Result<Deployment> {
        if let Some(entry) = self.engine.table.get(deployment_id).await {
            return Ok(entry.lock().await.record.clone());
        }
        self.engine
            .store
            .get(deployment_id)
            .await?
            .ok_or_else(|| Error::DeploymentNotFound(deployment_id.to_string()))
    }

    /// Deployments matching the filters, newest first
    pub async fn list_deployments(
        &self,
        customer_id: Option<&str>,
        status: Option<DeploymentStatus>,
    ) -> Vec<Deployment> {
        let mut deployments: Vec<Deployment> = self
            .engine
            .table
            .snapshot()
            .await
            .into_iter()
            .filter(|d| customer_id.map_or(true, |c| d.customer_id == c))
            .filter(|d| status.map_or(true, |s| d.status == s))
            .collect();
        deployments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        deployments
    }

    /// Stop a deployment. Idempotent; a busy deployment is stopped at its
    /// owner's next checkpoint, and a failed one has its container and quota
    /// reclaimed while staying `Failed`.
    pub async fn stop_deployment(&self, deployment_id: &str) -> Result<Deployment> {
        let entry = self
            .engine
            .table
            .get(deployment_id)
            .await
            .ok_or_else(|| Error::DeploymentNotFound(deployment_id.to_string()))?;

        let mut guard = entry.lock().await;
        if guard.busy {
            if !guard.stop_requested {
                info!("Stop of {} requested while busy", deployment_id);
            }
            guard.stop_requested = true;
            return Ok(guard.record.clone());
        }

        let record = &guard.record;
        let holds_resources =
            record.reservation_held || record.instance.is_some() || !record.domains.is_empty();
        if record.status.is_terminal() && !holds_resources {
            return Ok(record.clone());
        }

        guard.busy = true;
        drop(guard);
        info!("Stopping deployment {}", deployment_id);
        self.engine.teardown(&entry).await
    }

    pub async fn update_deployment(
        &self,
        deployment_id: &str,
        request: &UpdateRequest,
    ) -> Result<Deployment> {
        if self.engine.is_shutting_down() {
            return Err(Error::InvalidRequest(
                "orchestrator is shutting down".to_string(),
            ));
        }
        self.updates.update(deployment_id, request).await
    }

    /// Forget a terminal deployment, reclaiming anything it still holds
    pub async fn delete_deployment(&self, deployment_id: &str) -> Result<()> {
        let entry = self
            .engine
            .table
            .get(deployment_id)
            .await
            .ok_or_else(|| Error::DeploymentNotFound(deployment_id.to_string()))?;

        let mut guard = entry.lock().await;
        if guard.busy {
            return Err(Error::Busy(deployment_id.to_string()));
        }
        if !guard.record.status.is_terminal() {
            return Err(Error::InvalidState {
                id: deployment_id.to_string(),
                status: guard.record.status,
                reason: "stop the deployment before deleting it".to_string(),
            });
        }

        let record = &guard.record;
        if record.reservation_held || record.instance.is_some() || !record.domains.is_empty() {
            guard.busy = true;
            drop(guard);
            self.engine.teardown(&entry).await?;
            guard = entry.lock().await;
        }

        self.engine.store.delete(deployment_id).await?;
        self.engine.table.remove(deployment_id).await;

        info!("Deleted deployment {}", deployment_id);
        self.engine.audit.log_event(
            "deployment.deleted",
            json!({
                "deployment_id": deployment_id,
                "customer_id": guard.record.customer_id,
                "status": guard.record.status,
            }),
        );
        Ok(())
    }

    pub async fn get_system_status(&self) -> Result<SystemStatus> {
        let deployments = self.engine.table.snapshot().await;
        let count = |status: DeploymentStatus| deployments.iter().filter(|d| d.status == status).count();

        Ok(SystemStatus {
            total_deployments: deployments.len(),
            active_deployments: deployments.iter().filter(|d| !d.status.is_terminal()).count(),
            running: count(DeploymentStatus::Running),
            degraded: count(DeploymentStatus::Degraded),
            in_progress: count(DeploymentStatus::Pending)
                + count(DeploymentStatus::Deploying)
                + count(DeploymentStatus::Updating),
            failed: count(DeploymentStatus::Failed),
            stopped: count(DeploymentStatus::Stopped),
            customers: self.engine.catalog.customer_count().await?,
            applications: self.engine.catalog.application_count().await?,
        })
    }

    pub async fn customer_usage(&self, customer_id: &str) -> Result<CustomerUsage> {
        let customer = self
            .engine
            .catalog
            .get_customer(customer_id)
            .await?
            .ok_or_else(|| Error::CustomerNotFound(customer_id.to_string()))?;

        Ok(CustomerUsage {
            quotas: customer.effective_quotas(),
            usage: self.engine.ledger.usage(customer_id).await,
            customer_id: customer.id,
        })
    }

    /// Spawn the health monitor and the quota reconciler
    pub async fn start_background(&self) {
        let monitor = HealthMonitor::new(self.engine.clone());
        let reconciler = Reconciler::new(self.engine.clone());

        let mut background = self.background.lock().await;
        background.push(tokio::spawn(
            monitor.run(self.engine.subscribe_shutdown()),
        ));
        background.push(tokio::spawn(
            reconciler.run(self.engine.subscribe_shutdown()),
        ));
        info!("Background tasks started");
    }

    /// Wait for every in-flight pipeline to finish
    pub async fn settle(&self) {
        let mut pipelines = std::mem::take(&mut *self.pipelines.lock().await);
        while let Some(result) = pipelines.join_next().await {
            if let Err(e) = result {
                error!("Pipeline task panicked: {}", e);
            }
        }
    }

    /// Signal every task to stop and wait, bounded, for pipelines to reach
    /// a checkpoint
    pub async fn shutdown(&self) {
        info!("Shutting down orchestrator");
        self.engine.signal_shutdown();

        let grace = self.engine.settings.shutdown_timeout;
        let background = std::mem::take(&mut *self.background.lock().await);
        let wait = async {
            self.settle().await;
            for task in background {
                if let Err(e) = task.await {
                    error!("Background task failed: {}", e);
                }
            }
        };

        if timeout(grace, wait).await.is_err() {
            // Dropping the wait future aborts the pipelines it still held
            warn!("Shutdown timed out after {:?}; abandoning remaining tasks", grace);
        }
        info!("Orchestrator stopped");
    }
}
