//! Fleet Orchestrator
//!
//! Multi-tenant deployment orchestration: admits deployments of cataloged
//! applications against customer licenses and quotas, provisions them on a
//! container runtime, routes them through a reverse proxy and keeps them
//! healthy.
//!
//! ## Architecture
//!
//! **Engine components:**
//! - `ledger`: per-customer quota ledger with atomic reserve/release
//! - `admission`: customer, license and quota checks ahead of provisioning
//! - `pipeline`: asynchronous provisioning from source to a routed instance
//! - `health`: periodic probing with degrade/recover/fail escalation
//! - `update`: zero-downtime instance replacement
//! - `reconcile`: periodic ledger drift correction
//! - `orchestrator`: the public facade owning the deployment table
//!
//! **Collaborators** (traits with production adapters and mocks):
//! - `runtime`: container lifecycle (`docker` CLI)
//! - `routing`: reverse-proxy routes and certificates (Caddy admin API)
//! - `source`: git/registry/archive retrieval
//! - `store`: deployment persistence (Redis)
//! - `catalog`: customers, applications and licenses
//! - `audit`: compliance event sink
//! - `mock`: in-process collaborators for development and testing
//!
//! **Data Flow:**
//! 1. `POST /api/deployments` → admission reserves quota → `Pending`
//! 2. Pipeline fetches, builds, starts and routes → `Running`
//! 3. Health monitor supervises; sustained failure → `Failed`
//! 4. Updates stand up a second instance and repoint routes before retiring the first

pub mod admission;
pub mod audit;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod handlers;
pub mod health;
pub mod ledger;
pub mod mock;
pub mod orchestrator;
pub mod pipeline;
pub mod probe;
pub mod reconcile;
pub mod routing;
pub mod runtime;
pub mod source;
pub mod store;
pub mod table;
pub mod update;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

// Re-export commonly used types
pub use config::{Config, Settings};
pub use engine::{Collaborators, Engine};
pub use handlers::AppState;
pub use orchestrator::{CustomerUsage, Orchestrator};

/// Create the API router
pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = Arc::new(AppState { orchestrator });

    Router::new()
        // Health check
        .route("/health", get(handlers::health_handler))
        .route("/api/status", get(handlers::status_handler))
        // Deployments
        .route(
            "/api/deployments",
            post(handlers::deploy_handler).get(handlers::list_deployments_handler),
        )
        .route(
            "/api/deployments/{id}",
            get(handlers::get_deployment_handler).delete(handlers::delete_deployment_handler),
        )
        .route(
            "/api/deployments/{id}/stop",
            post(handlers::stop_deployment_handler),
        )
        .route(
            "/api/deployments/{id}/update",
            post(handlers::update_deployment_handler),
        )
        // Quota
        .route(
            "/api/customers/{id}/usage",
            get(handlers::customer_usage_handler),
        )
        // Middleware
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
