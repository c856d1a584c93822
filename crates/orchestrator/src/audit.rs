//! Audit trail for admission decisions and state transitions
//!
//! Sinks are fire-and-forget: they never block or fail the orchestration path.

use std::sync::Mutex;

use serde_json::Value;

pub trait AuditSink: Send + Sync {
    fn log_event(&self, name: &str, fields: Value);
}

/// Emits audit events as structured `tracing` records on the `audit` target
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn log_event(&self, name: &str, fields: Value) {
        tracing::info!(target: "audit", event = name, fields = %fields);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub name: String,
    pub fields: Value,
}

/// Keeps every event in memory; used by tests and the mock fleet
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| e.name == name).count()
    }
}

impl AuditSink for MemoryAuditSink {
    fn log_event(&self, name: &str, fields: Value) {
        let event = AuditEvent {
            name: name.to_string(),
            fields,
        };
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}
