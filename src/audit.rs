//! Repair audit log
//!
//! Bounded in-memory history of every repair attempt. Nothing here is
//! persisted; the store's own rows remain the source of truth.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::checker::{Anomaly, AnomalyKind};
use crate::repair::RepairOutcome;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub kind: AnomalyKind,
    pub request_id: String,
    pub assignment_ids: Vec<String>,
    /// Writes planned for the anomaly, e.g. `cancel assignments/a1`
    pub actions: Vec<String>,
    pub outcome: RepairOutcome,
}

impl AuditEntry {
    pub fn new(anomaly: &Anomaly, actions: Vec<String>, outcome: RepairOutcome) -> Self {
        Self {
            id: Uuid::new_v4(),
            recorded_at: Utc::now(),
            kind: anomaly.kind(),
            request_id: anomaly.request_id().to_string(),
            assignment_ids: anomaly
                .assignment_ids()
                .into_iter()
                .map(String::from)
                .collect(),
            actions,
            outcome,
        }
    }
}

pub struct AuditLog {
    entries: RwLock<VecDeque<AuditEntry>>,
    capacity: usize,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    pub async fn record(&self, entry: AuditEntry) {
        let mut entries = self.entries.write().await;
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Most recent entries first
    pub async fn recent(&self, count: usize) -> Vec<AuditEntry> {
        let entries = self.entries.read().await;
        entries.iter().rev().take(count).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(1000)
    }
}
