//! In-memory table of live deployments
//!
//! The table lock is held only to look up, insert or remove an entry. Each
//! deployment has its own lock, so slow work on one deployment never blocks
//! another.

use std::collections::HashMap;
use std::sync::Arc;

use fleet_common::Deployment;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug)]
pub struct DeploymentEntry {
    pub record: Deployment,
    /// A pipeline, update or teardown currently owns this deployment.
    /// The health monitor never writes while this is set.
    pub busy: bool,
    /// Cooperative stop intent, honoured at the owner's next checkpoint
    pub stop_requested: bool,
}

pub type SharedEntry = Arc<Mutex<DeploymentEntry>>;

#[derive(Debug, Default)]
pub struct DeploymentTable {
    entries: RwLock<HashMap<String, SharedEntry>>,
}

impl DeploymentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: Deployment, busy: bool) -> SharedEntry {
        let entry = Arc::new(Mutex::new(DeploymentEntry {
            record,
            busy,
            stop_requested: false,
        }));
        let id = entry.lock().await.record.id.clone();
        self.entries.write().await.insert(id, entry.clone());
        entry
    }

    pub async fn get(&self, deployment_id: &str) -> Option<SharedEntry> {
        self.entries.read().await.get(deployment_id).cloned()
    }

    pub async fn remove(&self, deployment_id: &str) -> Option<SharedEntry> {
        self.entries.write().await.remove(deployment_id)
    }

    pub async fn entries(&self) -> Vec<SharedEntry> {
        self.entries.read().await.values().cloned().collect()
    }

    /// Consistent copy of each record, taken one entry lock at a time
    pub async fn snapshot(&self) -> Vec<Deployment> {
        let entries = self.entries().await;
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            records.push(entry.lock().await.record.clone());
        }
        records
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
