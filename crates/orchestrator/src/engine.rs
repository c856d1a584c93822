//! Shared engine context
//!
//! Every role (admission, pipeline, health monitor, update controller)
//! mutates a deployment through [`Engine::commit`], which persists the new
//! record before it replaces the in-memory one.

use std::sync::Arc;

use chrono::Utc;
use fleet_common::{Deployment, DeploymentStatus, Error, InstanceHandle, Result};
use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::audit::AuditSink;
use crate::catalog::CatalogProvider;
use crate::config::Settings;
use crate::ledger::QuotaLedger;
use crate::probe::HealthProbe;
use crate::routing::RouteProvisioner;
use crate::runtime::ContainerDriver;
use crate::source::SourceFetcher;
use crate::store::DeploymentStore;
use crate::table::{DeploymentEntry, DeploymentTable, SharedEntry};

/// External collaborators the engine drives
#[derive(Clone)]
pub struct Collaborators {
    pub catalog: Arc<dyn CatalogProvider>,
    pub store: Arc<dyn DeploymentStore>,
    pub runtime: Arc<dyn ContainerDriver>,
    pub router: Arc<dyn RouteProvisioner>,
    pub source: Arc<dyn SourceFetcher>,
    pub audit: Arc<dyn AuditSink>,
}

/// What the owner of a deployment should do at a scheduling point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Continue,
    /// A stop was requested; tear down instead of continuing
    Stop,
    /// Process is shutting down; leave the persisted state as it is
    Shutdown,
}

pub struct Engine {
    pub catalog: Arc<dyn CatalogProvider>,
    pub store: Arc<dyn DeploymentStore>,
    pub runtime: Arc<dyn ContainerDriver>,
    pub router: Arc<dyn RouteProvisioner>,
    pub source: Arc<dyn SourceFetcher>,
    pub audit: Arc<dyn AuditSink>,
    pub probe: HealthProbe,
    pub ledger: QuotaLedger,
    pub table: DeploymentTable,
    pub settings: Settings,
    shutdown: watch::Sender<bool>,
}

impl Engine {
    pub fn new(collaborators: Collaborators, settings: Settings) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            probe: HealthProbe::new(collaborators.runtime.clone()),
            catalog: collaborators.catalog,
            store: collaborators.store,
            runtime: collaborators.runtime,
            router: collaborators.router,
            source: collaborators.source,
            audit: collaborators.audit,
            ledger: QuotaLedger::new(),
            table: DeploymentTable::new(),
            settings,
            shutdown,
        }
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn signal_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub async fn checkpoint(&self, entry: &SharedEntry) -> Checkpoint {
        if self.is_shutting_down() {
            return Checkpoint::Shutdown;
        }
        if entry.lock().await.stop_requested {
            return Checkpoint::Stop;
        }
        Checkpoint::Continue
    }

    /// Apply `mutate` to a copy of the record, persist it, then install it.
    /// On any error the in-memory record is left untouched.
    pub async fn commit<F>(&self, entry: &mut DeploymentEntry, mutate: F) -> Result<Deployment>
    where
        F: FnOnce(&mut Deployment) -> Result<()>,
    {
        let mut next = entry.record.clone();
        mutate(&mut next)?;
        next.updated_at = Utc::now();

        self.store.put(&next).await?;

        let previous = entry.record.status;
        entry.record = next.clone();
        if previous != next.status {
            self.audit_transition(&next, previous);
        }
        Ok(next)
    }

    /// Like [`Engine::commit`], but installs the record even when the store
    /// rejects it. Used on paths that must not leave a deployment stuck
    /// mid-transition in memory.
    pub async fn commit_best_effort<F>(&self, entry: &mut DeploymentEntry, mutate: F) -> Result<Deployment>
    where
        F: FnOnce(&mut Deployment) -> Result<()>,
    {
        let mut next = entry.record.clone();
        mutate(&mut next)?;
        next.updated_at = Utc::now();

        if let Err(e) = self.store.put(&next).await {
            error!(
                "Failed to persist deployment {} ({}); keeping in-memory state: {}",
                next.id, next.status, e
            );
        }

        let previous = entry.record.status;
        entry.record = next.clone();
        if previous != next.status {
            self.audit_transition(&next, previous);
        }
        Ok(next)
    }

    fn audit_transition(&self, deployment: &Deployment, from: DeploymentStatus) {
        info!(
            "Deployment {} transitioned {} -> {}",
            deployment.id, from, deployment.status
        );
        self.audit.log_event(
            "deployment.transition",
            json!({
                "deployment_id": deployment.id,
                "customer_id": deployment.customer_id,
                "from": from,
                "to": deployment.status,
                "error": deployment.error,
            }),
        );
    }

    /// Return the deployment's quota exactly once
    pub async fn release_reservation(&self, entry: &mut DeploymentEntry) {
        if !entry.record.reservation_held {
            return;
        }
        self.ledger
            .release(&entry.record.customer_id, &entry.record.id)
            .await;
        entry.record.reservation_held = false;
    }

    /// Force-remove an instance; errors are logged because the caller is
    /// already on a cleanup path
    pub async fn discard_instance(&self, instance: &InstanceHandle) {
        if let Err(e) = self.runtime.remove(instance, true).await {
            error!("Failed to remove instance {}: {}", instance.name, e);
        }
    }

    /// Graceful stop followed by forced removal
    pub async fn retire_instance(&self, instance: &InstanceHandle) {
        if let Err(e) = self
            .runtime
            .stop(instance, self.settings.stop_timeout)
            .await
        {
            warn!("Failed to stop instance {}: {}", instance.name, e);
        }
        self.discard_instance(instance).await;
    }

    pub async fn unroute(&self, domains: &[String]) {
        for domain in domains {
            if let Err(e) = self.router.remove_route(domain).await {
                error!("Failed to remove route {}: {}", domain, e);
            }
        }
    }

    /// Tear down an owned deployment: routes, instance, quota, then
    /// `Stopped` (or stays `Failed`). The caller must have set `busy`.
    pub async fn teardown(&self, entry: &SharedEntry) -> Result<Deployment> {
        let (instance, domains) = {
            let guard = entry.lock().await;
            (guard.record.instance.clone(), guard.record.domains.clone())
        };

        self.unroute(&domains).await;
        if let Some(instance) = &instance {
            self.retire_instance(instance).await;
        }

        let mut guard = entry.lock().await;
        self.release_reservation(&mut guard).await;
        let result = self
            .commit_best_effort(&mut guard, |d| {
                d.instance = None;
                d.domains.clear();
                if !d.status.is_terminal() {
                    d.transition_to(DeploymentStatus::Stopped)?;
                }
                Ok(())
            })
            .await;
        guard.busy = false;
        guard.stop_requested = false;
        result
    }

    /// Terminal provisioning failure: clean up what was created, release the
    /// quota and record the error
    pub async fn fail(
        &self,
        entry: &SharedEntry,
        step: &str,
        err: &Error,
        instance: Option<&InstanceHandle>,
    ) -> Result<Deployment> {
        warn!("Provisioning step {} failed: {}", step, err);

        let domains = entry.lock().await.record.domains.clone();
        self.unroute(&domains).await;
        if let Some(instance) = instance {
            self.discard_instance(instance).await;
        }

        let mut guard = entry.lock().await;
        self.release_reservation(&mut guard).await;
        let message = err.to_string();
        let result = self
            .commit_best_effort(&mut guard, |d| {
                d.instance = None;
                d.domains.clear();
                d.metadata.insert("failed_step".to_string(), step.to_string());
                d.mark_failed(message)
            })
            .await;
        guard.busy = false;
        result
    }
}
