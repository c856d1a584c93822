//! Mock collaborators for development and testing
//!
//! Simulates the container runtime, reverse proxy and source retrieval
//! in-process, so the orchestrator can run without Docker or Caddy.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use fleet_common::{
    Application, Customer, Deployment, DeploymentStatus, Error, HealthCheck, HealthStatus,
    InstanceHandle, License, LicenseStatus, LicenseType, ResourceProfile, Result, SourceKind,
    SubscriptionPlan,
};
use tracing::debug;

use crate::audit::MemoryAuditSink;
use crate::catalog::{CatalogFile, InMemoryCatalog};
use crate::config::Settings;
use crate::engine::{Collaborators, Engine};
use crate::orchestrator::Orchestrator;
use crate::routing::{subdomain_for, RouteProvisioner};
use crate::runtime::{ContainerDriver, ImageRef, InstanceSpec, RuntimeStatus, SourceArtifact};
use crate::source::{registry_reference, SourceFetcher};
use crate::store::InMemoryDeploymentStore;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Ordered record of side effects across the mock runtime and router
#[derive(Debug, Default)]
pub struct Journal {
    entries: Mutex<Vec<String>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        lock(&self.entries).push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        lock(&self.entries).clone()
    }

    /// Index of the first entry equal to `entry`
    pub fn position(&self, entry: &str) -> Option<usize> {
        lock(&self.entries).iter().position(|e| e == entry)
    }
}

#[derive(Debug, Clone)]
struct MockInstance {
    name: String,
    version: String,
    running: bool,
    healthy: bool,
}

#[derive(Debug, Default)]
struct RuntimeState {
    instances: HashMap<String, MockInstance>,
    unhealthy_versions: HashSet<String>,
    failing_versions: HashSet<String>,
    removed: usize,
}

/// Mock container runtime
pub struct MockContainerDriver {
    state: Mutex<RuntimeState>,
    next_id: AtomicU64,
    fail_prepare: AtomicBool,
    fail_start: AtomicBool,
    start_unhealthy: AtomicBool,
    start_delay_ms: AtomicU64,
    journal: Arc<Journal>,
}

impl Default for MockContainerDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockContainerDriver {
    pub fn new() -> Self {
        Self::with_journal(Arc::new(Journal::new()))
    }

    pub fn with_journal(journal: Arc<Journal>) -> Self {
        Self {
            state: Mutex::new(RuntimeState::default()),
            next_id: AtomicU64::new(1),
            fail_prepare: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            start_unhealthy: AtomicBool::new(false),
            start_delay_ms: AtomicU64::new(0),
            journal,
        }
    }

    pub fn fail_prepare(&self, fail: bool) {
        self.fail_prepare.store(fail, Ordering::SeqCst);
    }

    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Instances of `version` refuse to start
    pub fn fail_version(&self, version: &str) {
        lock(&self.state).failing_versions.insert(version.to_string());
    }

    /// New instances start but never pass a probe
    pub fn start_unhealthy(&self, unhealthy: bool) {
        self.start_unhealthy.store(unhealthy, Ordering::SeqCst);
    }

    /// Instances of `version` start but never pass a probe
    pub fn unhealthy_version(&self, version: &str) {
        lock(&self.state)
            .unhealthy_versions
            .insert(version.to_string());
    }

    pub fn set_start_delay(&self, delay: Duration) {
        self.start_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_healthy(&self, instance_id: &str, healthy: bool) {
        if let Some(instance) = lock(&self.state).instances.get_mut(instance_id) {
            instance.healthy = healthy;
        }
    }

    pub fn is_running(&self, instance_id: &str) -> bool {
        lock(&self.state)
            .instances
            .get(instance_id)
            .map(|i| i.running)
            .unwrap_or(false)
    }

    pub fn version_of(&self, instance_id: &str) -> Option<String> {
        lock(&self.state)
            .instances
            .get(instance_id)
            .map(|i| i.version.clone())
    }

    /// Instances created and not yet removed
    pub fn instance_count(&self) -> usize {
        lock(&self.state).instances.len()
    }

    pub fn removed_count(&self) -> usize {
        lock(&self.state).removed
    }
}

#[async_trait]
impl ContainerDriver for MockContainerDriver {
    async fn prepare(&self, _artifact: &SourceArtifact, tag: &str) -> Result<ImageRef> {
        if self.fail_prepare.load(Ordering::SeqCst) {
            return Err(Error::Container(format!("mock build of {} failed", tag)));
        }
        self.journal.record(format!("prepare {}", tag));
        Ok(ImageRef(tag.to_string()))
    }

    async fn start(&self, spec: &InstanceSpec) -> Result<InstanceHandle> {
        let delay = self.start_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let healthy = {
            let state = lock(&self.state);
            if self.fail_start.load(Ordering::SeqCst) || state.failing_versions.contains(&spec.version) {
                return Err(Error::Container(format!("mock start of {} failed", spec.name)));
            }
            !self.start_unhealthy.load(Ordering::SeqCst)
                && !state.unhealthy_versions.contains(&spec.version)
        };

        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = InstanceHandle {
            id: format!("mock-{}", n),
            name: spec.name.clone(),
            address: Some(format!("127.0.0.1:{}", 30_000 + n)),
        };

        lock(&self.state).instances.insert(
            handle.id.clone(),
            MockInstance {
                name: spec.name.clone(),
                version: spec.version.clone(),
                running: true,
                healthy,
            },
        );
        self.journal.record(format!("start {}", spec.name));
        debug!("Mock runtime: started {} as {}", spec.name, handle.id);
        Ok(handle)
    }

    async fn stop(&self, handle: &InstanceHandle, _timeout: Duration) -> Result<()> {
        if let Some(instance) = lock(&self.state).instances.get_mut(&handle.id) {
            instance.running = false;
        }
        self.journal.record(format!("stop {}", handle.name));
        Ok(())
    }

    async fn remove(&self, handle: &InstanceHandle, _force: bool) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(instance) = state.instances.remove(&handle.id) {
            state.removed += 1;
            self.journal.record(format!("remove {}", instance.name));
        }
        Ok(())
    }

    async fn inspect(&self, handle: &InstanceHandle) -> Result<RuntimeStatus> {
        let status = match lock(&self.state).instances.get(&handle.id) {
            None => RuntimeStatus::Missing,
            Some(i) if i.running && i.healthy => RuntimeStatus::Running,
            Some(_) => RuntimeStatus::Exited,
        };
        Ok(status)
    }
}

/// Mock reverse proxy keeping its routing table in memory
pub struct MockRouteProvisioner {
    base_domain: String,
    routes: Mutex<HashMap<String, String>>,
    certificates: Mutex<Vec<String>>,
    fail_program: AtomicBool,
    rejected_suffix: Mutex<Option<String>>,
    journal: Arc<Journal>,
}

impl MockRouteProvisioner {
    pub fn new(base_domain: impl Into<String>, journal: Arc<Journal>) -> Self {
        Self {
            base_domain: base_domain.into(),
            routes: Mutex::new(HashMap::new()),
            certificates: Mutex::new(Vec::new()),
            fail_program: AtomicBool::new(false),
            rejected_suffix: Mutex::new(None),
            journal,
        }
    }

    pub fn fail_program(&self, fail: bool) {
        self.fail_program.store(fail, Ordering::SeqCst);
    }

    /// Refuse routes to instances whose name ends with `suffix`
    pub fn reject_routes_to(&self, suffix: &str) {
        *lock(&self.rejected_suffix) = Some(suffix.to_string());
    }

    /// Instance id a domain currently routes to
    pub fn route_for(&self, domain: &str) -> Option<String> {
        lock(&self.routes).get(domain).cloned()
    }

    pub fn route_count(&self) -> usize {
        lock(&self.routes).len()
    }

    pub fn certificates(&self) -> Vec<String> {
        lock(&self.certificates).clone()
    }
}

#[async_trait]
impl RouteProvisioner for MockRouteProvisioner {
    async fn assign_subdomain(&self, _customer_id: &str, deployment_id: &str) -> Result<String> {
        Ok(subdomain_for(deployment_id, &self.base_domain))
    }

    async fn program_route(&self, domain: &str, instance: &InstanceHandle) -> Result<()> {
        if self.fail_program.load(Ordering::SeqCst) {
            return Err(Error::Route(format!("mock proxy rejected {}", domain)));
        }
        if let Some(suffix) = lock(&self.rejected_suffix).as_deref() {
            if instance.name.ends_with(suffix) {
                return Err(Error::Route(format!(
                    "mock proxy rejected {} -> {}",
                    domain, instance.name
                )));
            }
        }
        lock(&self.routes).insert(domain.to_string(), instance.id.clone());
        self.journal
            .record(format!("route {} -> {}", domain, instance.name));
        Ok(())
    }

    async fn remove_route(&self, domain: &str) -> Result<()> {
        if lock(&self.routes).remove(domain).is_some() {
            self.journal.record(format!("unroute {}", domain));
        }
        Ok(())
    }

    async fn issue_certificate(&self, domain: &str) {
        lock(&self.certificates).push(domain.to_string());
    }
}

/// Mock source retrieval; never touches the network
#[derive(Default)]
pub struct MockSourceFetcher {
    fail: AtomicBool,
    delay_ms: AtomicU64,
    fetches: AtomicU64,
}

impl MockSourceFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceFetcher for MockSourceFetcher {
    async fn fetch(
        &self,
        source: &SourceKind,
        version: &str,
        deployment_id: &str,
        revision: u32,
    ) -> Result<SourceArtifact> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Source(format!(
                "mock source unavailable for {}",
                deployment_id
            )));
        }

        Ok(match source {
            SourceKind::Git { dockerfile, .. } => SourceArtifact::BuildContext {
                path: format!("/mock/{}/r{}", deployment_id, revision).into(),
                dockerfile: dockerfile.clone(),
            },
            SourceKind::Registry { image } => SourceArtifact::Image {
                reference: registry_reference(image, version),
            },
            SourceKind::Archive { url } => SourceArtifact::RemoteContext {
                url: url.replace("{version}", version),
            },
        })
    }
}

/// Minimal record for storage and table tests
pub fn sample_deployment(id: &str, customer_id: &str) -> Deployment {
    let resources = demo_profile();
    let now = Utc::now();
    Deployment {
        id: id.to_string(),
        customer_id: customer_id.to_string(),
        application_id: "app_a".to_string(),
        license_id: "lic_a".to_string(),
        version: "1.0".to_string(),
        environment: HashMap::new(),
        region: None,
        custom_domain: None,
        domains: Vec::new(),
        resources,
        reservation: resources.reservation(),
        reservation_held: true,
        status: DeploymentStatus::Pending,
        health: HealthStatus::default(),
        instance: None,
        revision: 0,
        created_at: now,
        updated_at: now,
        last_checked: None,
        error: None,
        metadata: HashMap::new(),
    }
}

fn demo_profile() -> ResourceProfile {
    ResourceProfile {
        cpu_millis: 500,
        memory_mb: 256,
        storage_mb: 512,
        pids_limit: 128,
    }
}

fn demo_license(id: &str, customer_id: &str, application_id: &str) -> License {
    License {
        id: id.to_string(),
        customer_id: customer_id.to_string(),
        application_id: application_id.to_string(),
        license_type: LicenseType::Subscription,
        status: LicenseStatus::Active,
        valid_from: Utc::now() - ChronoDuration::days(30),
        valid_until: None,
        max_deployments: None,
    }
}

/// Catalog served in mock mode when no catalog file is configured
pub fn demo_catalog() -> CatalogFile {
    let mut cust_1 = Customer::new("cust_1", "Acme Corp", SubscriptionPlan::Starter);
    cust_1.license_ids = vec!["lic_a".to_string(), "lic_b".to_string()];

    let mut cust_2 = Customer::new("cust_2", "Hobbyist", SubscriptionPlan::Free);
    cust_2.license_ids = vec!["lic_c".to_string()];

    let app_a = Application {
        id: "app_a".to_string(),
        name: "Storefront".to_string(),
        default_version: "1.0".to_string(),
        source: SourceKind::Registry {
            image: "registry.local/storefront".to_string(),
        },
        port: 8080,
        resources: demo_profile(),
        health_check: None,
        environment: HashMap::from([("APP_ENV".to_string(), "production".to_string())]),
    };

    let app_b = Application {
        id: "app_b".to_string(),
        name: "Blog".to_string(),
        default_version: "main".to_string(),
        source: SourceKind::Git {
            repository: "https://git.local/blog.git".to_string(),
            dockerfile: None,
        },
        port: 3000,
        resources: ResourceProfile {
            cpu_millis: 250,
            memory_mb: 128,
            storage_mb: 256,
            pids_limit: 128,
        },
        health_check: Some(HealthCheck {
            path: "/healthz".to_string(),
            timeout_ms: 500,
        }),
        environment: HashMap::new(),
    };

    CatalogFile {
        customers: vec![cust_1, cust_2],
        applications: vec![app_a, app_b],
        licenses: vec![
            demo_license("lic_a", "cust_1", "app_a"),
            demo_license("lic_b", "cust_1", "app_b"),
            demo_license("lic_c", "cust_2", "app_a"),
        ],
    }
}

/// Engine wired entirely to in-process collaborators
pub struct MockFleet {
    pub engine: Arc<Engine>,
    pub catalog: Arc<InMemoryCatalog>,
    pub store: Arc<InMemoryDeploymentStore>,
    pub runtime: Arc<MockContainerDriver>,
    pub router: Arc<MockRouteProvisioner>,
    pub source: Arc<MockSourceFetcher>,
    pub audit: Arc<MemoryAuditSink>,
    pub journal: Arc<Journal>,
}

impl MockFleet {
    /// Demo catalog and short timings suited to tests
    pub async fn new() -> Self {
        Self::with_settings(Self::test_settings()).await
    }

    pub async fn with_settings(settings: Settings) -> Self {
        Self::with_catalog(InMemoryCatalog::from_file(demo_catalog()), "apps.localhost", settings)
    }

    pub fn with_catalog(catalog: InMemoryCatalog, base_domain: &str, settings: Settings) -> Self {
        let journal = Arc::new(Journal::new());
        let catalog = Arc::new(catalog);
        let store = Arc::new(InMemoryDeploymentStore::new());
        let runtime = Arc::new(MockContainerDriver::with_journal(journal.clone()));
        let router = Arc::new(MockRouteProvisioner::new(base_domain, journal.clone()));
        let source = Arc::new(MockSourceFetcher::new());
        let audit = Arc::new(MemoryAuditSink::new());

        let engine = Arc::new(Engine::new(
            Collaborators {
                catalog: catalog.clone(),
                store: store.clone(),
                runtime: runtime.clone(),
                router: router.clone(),
                source: source.clone(),
                audit: audit.clone(),
            },
            settings,
        ));

        Self {
            engine,
            catalog,
            store,
            runtime,
            router,
            source,
            audit,
            journal,
        }
    }

    pub fn test_settings() -> Settings {
        Settings {
            health_interval: Duration::from_millis(50),
            reconcile_interval: Duration::from_millis(200),
            initial_health_timeout: Duration::from_millis(200),
            probe_interval: Duration::from_millis(10),
            stop_timeout: Duration::ZERO,
            drain_grace: Duration::ZERO,
            shutdown_timeout: Duration::from_secs(2),
            ..Settings::default()
        }
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(self.engine.clone())
    }

    pub fn app_a_resources(&self) -> ResourceProfile {
        demo_profile()
    }
}
