//! Durable storage for deployment records

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fleet_common::{Deployment, Error, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Key-value persistence of deployment records, crash-consistent per key
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    async fn put(&self, deployment: &Deployment) -> Result<()>;

    async fn get(&self, deployment_id: &str) -> Result<Option<Deployment>>;

    async fn delete(&self, deployment_id: &str) -> Result<bool>;
}

fn redis_err(e: redis::RedisError) -> Error {
    Error::Storage(e.to_string())
}

/// Redis-backed store; records are JSON under `deployment:{id}`
#[derive(Clone)]
pub struct RedisDeploymentStore {
    conn: ConnectionManager,
}

impl RedisDeploymentStore {
    /// Create a new storage instance
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(redis_err)?;

        let conn = ConnectionManager::new(client).await.map_err(redis_err)?;

        info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn })
    }

    fn key(deployment_id: &str) -> String {
        format!("deployment:{}", deployment_id)
    }

    fn customer_key(customer_id: &str) -> String {
        format!("deployment:customer:{}", customer_id)
    }

    /// All persisted deployments for a customer, newest first
    pub async fn customer_deployments(&self, customer_id: &str) -> Result<Vec<Deployment>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .smembers(Self::customer_key(customer_id))
            .await
            .map_err(redis_err)?;

        let mut deployments = Vec::new();
        for id in ids {
            if let Some(deployment) = self.get(&id).await? {
                deployments.push(deployment);
            }
        }

        deployments.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(deployments)
    }
}

#[async_trait]
impl DeploymentStore for RedisDeploymentStore {
    async fn put(&self, deployment: &Deployment) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(deployment)?;

        let _: () = conn
            .set(Self::key(&deployment.id), json)
            .await
            .map_err(redis_err)?;

        let _: () = conn
            .sadd(Self::customer_key(&deployment.customer_id), &deployment.id)
            .await
            .map_err(redis_err)?;

        debug!(
            "Persisted deployment: {} status: {}",
            deployment.id, deployment.status
        );
        Ok(())
    }

    async fn get(&self, deployment_id: &str) -> Result<Option<Deployment>> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.get(Self::key(deployment_id)).await.map_err(redis_err)?;

        match json {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, deployment_id: &str) -> Result<bool> {
        let existing = self.get(deployment_id).await?;
        let mut conn = self.conn.clone();

        let deleted: bool = conn.del(Self::key(deployment_id)).await.map_err(redis_err)?;

        if let Some(deployment) = existing {
            let _: () = conn
                .srem(Self::customer_key(&deployment.customer_id), deployment_id)
                .await
                .map_err(redis_err)?;
        }

        if deleted {
            info!("Deleted deployment record: {}", deployment_id);
        }
        Ok(deleted)
    }
}

/// In-process store for tests and mock mode
#[derive(Debug, Default)]
pub struct InMemoryDeploymentStore {
    records: Mutex<HashMap<String, Deployment>>,
    unavailable: AtomicBool,
    put_delay_ms: AtomicU64,
}

impl InMemoryDeploymentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail, simulating an outage
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every `put`, emulating a network round trip
    pub fn set_put_delay(&self, delay: Duration) {
        self.put_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Storage("store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DeploymentStore for InMemoryDeploymentStore {
    async fn put(&self, deployment: &Deployment) -> Result<()> {
        let delay = self.put_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.check_available()?;
        self.records
            .lock()
            .await
            .insert(deployment.id.clone(), deployment.clone());
        Ok(())
    }

    async fn get(&self, deployment_id: &str) -> Result<Option<Deployment>> {
        self.check_available()?;
        Ok(self.records.lock().await.get(deployment_id).cloned())
    }

    async fn delete(&self, deployment_id: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self.records.lock().await.remove(deployment_id).is_some())
    }
}
