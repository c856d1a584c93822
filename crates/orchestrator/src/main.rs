//! Fleet Orchestrator Service
//!
//! Main entry point: wires collaborators, serves the REST API and runs the
//! health monitor and quota reconciler until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use fleet_orchestrator::{
    audit::TracingAuditSink,
    catalog::InMemoryCatalog,
    create_router,
    mock::{demo_catalog, MockFleet},
    routing::CaddyRouteProvisioner,
    runtime::DockerCliDriver,
    source::CliSourceFetcher,
    store::RedisDeploymentStore,
    Collaborators, Config, Engine, Orchestrator,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn load_catalog(config: &Config) -> Result<InMemoryCatalog> {
    match &config.catalog_path {
        Some(path) => InMemoryCatalog::load(path),
        None if config.mock_mode => {
            info!("No CATALOG_PATH set; using the demo catalog");
            Ok(InMemoryCatalog::from_file(demo_catalog()))
        }
        None => anyhow::bail!("CATALOG_PATH is required unless MOCK_MODE is enabled"),
    }
}

async fn build_engine(config: &Config) -> Result<Arc<Engine>> {
    let catalog = load_catalog(config)?;

    if config.mock_mode {
        info!("Mock mode: using in-process runtime, proxy and store");
        let fleet = MockFleet::with_catalog(catalog, &config.base_domain, config.settings());
        return Ok(fleet.engine);
    }

    let store = RedisDeploymentStore::new(&config.redis_url)
        .await
        .context("Failed to connect to Redis")?;

    let collaborators = Collaborators {
        catalog: Arc::new(catalog),
        store: Arc::new(store),
        runtime: Arc::new(DockerCliDriver::new(config.docker_bin.clone())),
        router: Arc::new(CaddyRouteProvisioner::new(
            config.proxy_admin_url.clone(),
            config.base_domain.clone(),
        )),
        source: Arc::new(CliSourceFetcher::new(
            config.git_bin.clone(),
            config.docker_bin.clone(),
            config.work_dir.clone(),
        )),
        audit: Arc::new(TracingAuditSink),
    };

    Ok(Arc::new(Engine::new(collaborators, config.settings())))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fleet_orchestrator=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Fleet Orchestrator");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    info!("Configuration loaded");
    info!("  API address: {}", config.api_address());
    info!("  Mock mode: {}", config.mock_mode);
    info!("  Base domain: {}", config.base_domain);
    info!("  Health interval: {}s", config.health_interval_secs);

    let engine = build_engine(&config).await?;
    let orchestrator = Arc::new(Orchestrator::new(engine));
    orchestrator.start_background().await;

    let app = create_router(orchestrator.clone());
    let api_addr = config.api_address();
    let listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", api_addr))?;
    info!("API server listening on {}", api_addr);

    let api_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("API server error: {:#}", e);
        }
    });

    tokio::select! {
        _ = api_task => {
            error!("API task terminated unexpectedly");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    orchestrator.shutdown().await;
    info!("Fleet Orchestrator stopped");

    Ok(())
}
