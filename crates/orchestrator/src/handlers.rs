//! API handlers for the orchestrator REST surface

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use fleet_common::{DeployRequest, DeploymentStatus, Error, UpdateRequest};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info};

use crate::orchestrator::Orchestrator;

/// Shared application state
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

/// API Error type
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
            "code": self.code,
        });

        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::CustomerNotFound(_)
            | Error::ApplicationNotFound(_)
            | Error::DeploymentNotFound(_) => StatusCode::NOT_FOUND,
            Error::CustomerInactive(_)
            | Error::LicenseRequired { .. }
            | Error::LicenseExpired(_)
            | Error::LicenseInvalid { .. }
            | Error::LicenseLimitReached { .. } => StatusCode::FORBIDDEN,
            Error::QuotaExceeded { .. }
            | Error::Busy(_)
            | Error::InvalidState { .. }
            | Error::InvalidTransition { .. } => StatusCode::CONFLICT,
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::UpdateFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Source(_) | Error::Container(_) | Error::Route(_) => StatusCode::BAD_GATEWAY,
            Error::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::JsonSerialization(_) | Error::Io(_) | Error::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            error!("Request failed: {}", err);
        }

        ApiError {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub customer_id: Option<String>,
    pub status: Option<String>,
}

/// Health check
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "fleet-orchestrator"
    }))
}

/// Aggregate deployment counts
pub async fn status_handler(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state.orchestrator.get_system_status().await?;
    Ok(Json(status))
}

/// Admit a deployment; provisioning continues in the background
pub async fn deploy_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<DeployRequest>,
) -> Result<impl IntoResponse, ApiError> {
    info!(
        "Deploy request: {} for customer {}",
        payload.application_id, payload.customer_id
    );

    let deployment = state.orchestrator.deploy(&payload).await?;

    Ok((StatusCode::ACCEPTED, Json(deployment)))
}

pub async fn list_deployments_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<DeploymentStatus>)
        .transpose()?;

    let deployments = state
        .orchestrator
        .list_deployments(query.customer_id.as_deref(), status)
        .await;

    Ok(Json(serde_json::json!({
        "total": deployments.len(),
        "deployments": deployments,
    })))
}

pub async fn get_deployment_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deployment = state.orchestrator.get_deployment(&id).await?;
    Ok(Json(deployment))
}

pub async fn stop_deployment_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    info!("Stop request for {}", id);
    let deployment = state.orchestrator.stop_deployment(&id).await?;
    Ok(Json(deployment))
}

/// Zero-downtime update; responds once the update settled either way
pub async fn update_deployment_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<UpdateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    info!("Update request for {}: {:?}", id, payload.version);
    let deployment = state.orchestrator.update_deployment(&id, &payload).await?;
    Ok(Json(deployment))
}

pub async fn delete_deployment_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.delete_deployment(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn customer_usage_handler(
    State(state): State<Arc<AppState>>,
    Path(customer_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let usage = state.orchestrator.customer_usage(&customer_id).await?;
    Ok(Json(usage))
}
