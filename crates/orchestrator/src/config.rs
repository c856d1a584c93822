//! Configuration management for the Fleet Orchestrator
//!
//! Loads configuration from environment variables with sensible defaults.

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::health::DEFAULT_FAILURE_THRESHOLD;

/// Engine policy knobs shared by the pipeline, health monitor and update controller
#[derive(Debug, Clone)]
pub struct Settings {
    /// Consecutive failed probes tolerated before a deployment is failed
    pub health_failure_threshold: u32,

    /// Health monitor tick
    pub health_interval: Duration,

    /// Quota ledger reconciliation tick
    pub reconcile_interval: Duration,

    /// Bound on initial health verification of a new instance
    pub initial_health_timeout: Duration,

    /// Delay between probes during initial verification
    pub probe_interval: Duration,

    /// Grace period handed to the runtime when stopping an instance
    pub stop_timeout: Duration,

    /// Time the old instance keeps draining after the route is repointed
    pub drain_grace: Duration,

    /// How long shutdown waits for in-flight pipelines
    pub shutdown_timeout: Duration,

    /// Container network instances are attached to
    pub network: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            health_failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            health_interval: Duration::from_secs(30),
            reconcile_interval: Duration::from_secs(300),
            initial_health_timeout: Duration::from_secs(60),
            probe_interval: Duration::from_secs(2),
            stop_timeout: Duration::from_secs(10),
            drain_grace: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
            network: "fleet".to_string(),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Redis connection URL for deployment records
    pub redis_url: String,

    /// API server host
    pub api_host: String,

    /// API server port
    pub api_port: u16,

    /// Use in-process mock collaborators instead of docker/caddy
    pub mock_mode: bool,

    /// JSON file with customers, applications and licenses
    pub catalog_path: Option<PathBuf>,

    /// Parent domain for assigned subdomains
    pub base_domain: String,

    /// Caddy admin endpoint
    pub proxy_admin_url: String,

    pub docker_bin: String,
    pub git_bin: String,

    /// Scratch directory for source checkouts
    pub work_dir: PathBuf,

    pub container_network: String,
    pub health_interval_secs: u64,
    pub health_failure_threshold: u32,
    pub reconcile_interval_secs: u64,
    pub initial_health_timeout_secs: u64,
    pub probe_interval_ms: u64,
    pub stop_timeout_secs: u64,
    pub drain_grace_secs: u64,
    pub shutdown_timeout_secs: u64,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(key: &str, default: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var_or(key, default)
        .parse()
        .with_context(|| format!("Invalid {key}"))
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenvy::dotenv().ok();

        let config = Config {
            redis_url: var_or("REDIS_URL", "redis://127.0.0.1:6379"),
            api_host: var_or("API_HOST", "0.0.0.0"),
            api_port: parse_var("API_PORT", "8090")?,
            mock_mode: parse_var("MOCK_MODE", "false")
                .context("Invalid MOCK_MODE (expected true/false)")?,
            catalog_path: env::var("CATALOG_PATH").ok().map(PathBuf::from),
            base_domain: var_or("BASE_DOMAIN", "apps.localhost"),
            proxy_admin_url: var_or("PROXY_ADMIN_URL", "http://127.0.0.1:2019"),
            docker_bin: var_or("DOCKER_BIN", "docker"),
            git_bin: var_or("GIT_BIN", "git"),
            work_dir: PathBuf::from(var_or("WORK_DIR", "/tmp/fleet")),
            container_network: var_or("CONTAINER_NETWORK", "fleet"),
            health_interval_secs: parse_var("HEALTH_INTERVAL_SECS", "30")?,
            health_failure_threshold: parse_var(
                "HEALTH_FAILURE_THRESHOLD",
                &DEFAULT_FAILURE_THRESHOLD.to_string(),
            )?,
            reconcile_interval_secs: parse_var("RECONCILE_INTERVAL_SECS", "300")?,
            initial_health_timeout_secs: parse_var("INITIAL_HEALTH_TIMEOUT_SECS", "60")?,
            probe_interval_ms: parse_var("PROBE_INTERVAL_MS", "2000")?,
            stop_timeout_secs: parse_var("STOP_TIMEOUT_SECS", "10")?,
            drain_grace_secs: parse_var("DRAIN_GRACE_SECS", "5")?,
            shutdown_timeout_secs: parse_var("SHUTDOWN_TIMEOUT_SECS", "30")?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.api_port == 0 {
            anyhow::bail!("API_PORT must be greater than 0");
        }

        if self.health_interval_secs == 0 {
            anyhow::bail!("HEALTH_INTERVAL_SECS must be greater than 0");
        }

        if self.reconcile_interval_secs == 0 {
            anyhow::bail!("RECONCILE_INTERVAL_SECS must be greater than 0");
        }

        if self.health_failure_threshold == 0 {
            anyhow::bail!("HEALTH_FAILURE_THRESHOLD must be greater than 0");
        }

        if self.probe_interval_ms == 0 {
            anyhow::bail!("PROBE_INTERVAL_MS must be greater than 0");
        }

        if self.base_domain.trim().is_empty() {
            anyhow::bail!("BASE_DOMAIN must not be empty");
        }

        Ok(())
    }

    /// Get the API server address
    pub fn api_address(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }

    /// Engine policy derived from this configuration
    pub fn settings(&self) -> Settings {
        Settings {
            health_failure_threshold: self.health_failure_threshold,
            health_interval: Duration::from_secs(self.health_interval_secs),
            reconcile_interval: Duration::from_secs(self.reconcile_interval_secs),
            initial_health_timeout: Duration::from_secs(self.initial_health_timeout_secs),
            probe_interval: Duration::from_millis(self.probe_interval_ms),
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            drain_grace: Duration::from_secs(self.drain_grace_secs),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            network: self.container_network.clone(),
        }
    }
}
