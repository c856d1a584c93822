//! Admission control
//!
//! Validates a deploy request against the customer, the catalog, the
//! customer's licenses and the quota ledger. Admission either reserves quota
//! and persists a `Pending` deployment, or leaves no trace at all.

use std::sync::Arc;

use chrono::Utc;
use fleet_common::{
    Application, Customer, DeployRequest, Deployment, DeploymentStatus, Error, HealthStatus,
    License, ResourceProfile, ResourceReservation, Result, validate_version,
};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::ledger::ReservationRequest;
use crate::table::SharedEntry;

pub struct AdmissionController {
    engine: Arc<Engine>,
}

impl AdmissionController {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Admit a request, returning the persisted `Pending` deployment and its
    /// table entry (owned by the caller until the pipeline takes over)
    pub async fn admit(&self, request: &DeployRequest) -> Result<(Deployment, SharedEntry)> {
        match self.try_admit(request).await {
            Ok(admitted) => Ok(admitted),
            Err(err) => {
                if err.is_admission_rejection() {
                    info!(
                        "Rejected deployment of {} for {}: {}",
                        request.application_id, request.customer_id, err
                    );
                    self.engine.audit.log_event(
                        "deployment.rejected",
                        json!({
                            "customer_id": request.customer_id,
                            "application_id": request.application_id,
                            "reason": err.code(),
                            "detail": err.to_string(),
                        }),
                    );
                }
                Err(err)
            }
        }
    }

    async fn try_admit(&self, request: &DeployRequest) -> Result<(Deployment, SharedEntry)> {
        let customer = self
            .engine
            .catalog
            .get_customer(&request.customer_id)
            .await?
            .ok_or_else(|| Error::CustomerNotFound(request.customer_id.clone()))?;

        if !customer.is_active() {
            return Err(Error::CustomerInactive(customer.id));
        }

        let application = self
            .engine
            .catalog
            .get_application(&request.application_id)
            .await?
            .ok_or_else(|| Error::ApplicationNotFound(request.application_id.clone()))?;

        let license = self.find_license(&customer, &application.id).await?;

        let resources = resolve_resources(&application, request);
        let mut reservation = resources.reservation();
        if request.custom_domain.is_some() {
            reservation.custom_domains = 1;
        }
        reservation.validate()?;

        let deployment = new_deployment(request, &application, &license, resources, reservation);
        validate_version(&deployment.version)?;
        let quotas = customer.effective_quotas();

        let usage = self
            .engine
            .ledger
            .reserve(ReservationRequest {
                customer_id: &customer.id,
                deployment_id: &deployment.id,
                application_id: &application.id,
                license_id: &license.id,
                license_limit: license.max_deployments,
                quotas: &quotas,
                amount: reservation,
            })
            .await?;

        if let Err(e) = self.engine.store.put(&deployment).await {
            warn!("Failed to persist admitted deployment {}: {}", deployment.id, e);
            self.engine
                .ledger
                .release(&customer.id, &deployment.id)
                .await;
            return Err(e);
        }

        let entry = self.engine.table.insert(deployment.clone(), true).await;

        info!(
            "Admitted deployment {} of {}@{} for {} (cpu {}m, mem {}MB)",
            deployment.id,
            application.id,
            deployment.version,
            customer.id,
            reservation.cpu_millis,
            reservation.memory_mb
        );
        self.engine.audit.log_event(
            "deployment.admitted",
            json!({
                "deployment_id": deployment.id,
                "customer_id": customer.id,
                "application_id": application.id,
                "license_id": license.id,
                "version": deployment.version,
                "reservation": reservation,
                "usage": usage,
            }),
        );

        Ok((deployment, entry))
    }

    /// First license of the customer valid for the application. When none
    /// is valid, the most specific problem among matching licenses is reported.
    async fn find_license(&self, customer: &Customer, application_id: &str) -> Result<License> {
        let now = Utc::now();
        let mut problem: Option<Error> = None;

        for license_id in &customer.license_ids {
            let Some(license) = self.engine.catalog.get_license(license_id).await? else {
                continue;
            };
            if license.customer_id != customer.id || license.application_id != application_id {
                continue;
            }
            match license.validate_for(application_id, now) {
                Ok(()) => return Ok(license),
                Err(err) => problem = Some(err),
            }
        }

        Err(problem.unwrap_or_else(|| Error::LicenseRequired {
            customer_id: customer.id.clone(),
            application_id: application_id.to_string(),
        }))
    }
}

/// The application's declared profile, with the request's override applied
fn resolve_resources(application: &Application, request: &DeployRequest) -> ResourceProfile {
    let mut resources = application.resources;
    if let Some(custom) = request.resources {
        resources.cpu_millis = custom.cpu_millis;
        resources.memory_mb = custom.memory_mb;
        if let Some(storage_mb) = custom.storage_mb {
            resources.storage_mb = storage_mb;
        }
    }
    resources
}

fn new_deployment(
    request: &DeployRequest,
    application: &Application,
    license: &License,
    resources: ResourceProfile,
    reservation: ResourceReservation,
) -> Deployment {
    let mut environment = application.environment.clone();
    environment.extend(request.environment.clone());
    let now = Utc::now();

    Deployment {
        id: format!("dep_{}", Uuid::new_v4().simple()),
        customer_id: request.customer_id.clone(),
        application_id: application.id.clone(),
        license_id: license.id.clone(),
        version: request
            .version
            .clone()
            .unwrap_or_else(|| application.default_version.clone()),
        environment,
        region: request.region.clone(),
        custom_domain: request.custom_domain.clone(),
        domains: Vec::new(),
        resources,
        reservation,
        reservation_held: true,
        status: DeploymentStatus::Pending,
        health: HealthStatus::default(),
        instance: None,
        revision: 0,
        created_at: now,
        updated_at: now,
        last_checked: None,
        error: None,
        metadata: Default::default(),
    }
}
