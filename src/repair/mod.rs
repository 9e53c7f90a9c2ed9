//! Repair engine - applies corrective writes for detected anomalies
//!
//! Every write is a single-row conditional update guarded by the version the
//! checker saw. If the row moved on, the repair reports `Skipped` and writes
//! nothing; running the same anomaly twice therefore mutates at most once.
//!
//! Transient store errors are retried with exponential backoff before the
//! repair is reported `Failed`. Every attempt lands in the [`AuditLog`].

pub mod policies;

pub use policies::{GuardedWrite, RepairPlan, RepairPolicies, RepairPolicy};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audit::{AuditEntry, AuditLog};
use crate::checker::{Anomaly, AnomalyKind};
use crate::config::RepairConfig;
use crate::error::{RepairError, StoreError};
use crate::models::UpdateOutcome;
use crate::store::StoreAdapter;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RepairOutcome {
    Repaired {
        writes: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Skipped {
        reason: String,
    },
    Failed {
        reason: String,
    },
}

impl RepairOutcome {
    pub fn is_repaired(&self) -> bool {
        matches!(self, RepairOutcome::Repaired { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, RepairOutcome::Skipped { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, RepairOutcome::Failed { .. })
    }
}

/// Bounded retry with exponential backoff for transient store errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_backoff: Duration) -> Self {
        Self {
            max_retries,
            base_backoff,
        }
    }

    /// Backoff before retry number `retry` (0-based)
    pub fn delay(&self, retry: u32) -> Duration {
        self.base_backoff.saturating_mul(1u32 << retry.min(16))
    }

    /// Attempts made before giving up on a transient error
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Run `op`, retrying while it fails transiently
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut retry = 0;
        loop {
            match op().await {
                Err(e) if e.is_transient() && retry < self.max_retries => {
                    let delay = self.delay(retry);
                    warn!(
                        operation,
                        retry = retry + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient store error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                other => return other,
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(200))
    }
}

pub struct RepairEngine {
    store: Arc<dyn StoreAdapter>,
    policies: RepairPolicies,
    retry: RetryPolicy,
    dry_run: bool,
    audit: Arc<AuditLog>,
}

impl RepairEngine {
    pub fn new(store: Arc<dyn StoreAdapter>, audit: Arc<AuditLog>) -> Self {
        Self {
            store,
            policies: RepairPolicies::default(),
            retry: RetryPolicy::default(),
            dry_run: false,
            audit,
        }
    }

    pub fn from_config(
        store: Arc<dyn StoreAdapter>,
        config: &RepairConfig,
        audit: Arc<AuditLog>,
    ) -> Self {
        let mut policies = RepairPolicies::default();
        for kind in &config.disabled_kinds {
            policies.disable(*kind);
        }

        Self::new(store, audit)
            .with_policies(policies)
            .with_retry(RetryPolicy::new(config.max_retries, config.retry_backoff()))
            .with_dry_run(config.dry_run)
    }

    pub fn with_policies(mut self, policies: RepairPolicies) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn can_repair(&self, kind: AnomalyKind) -> bool {
        self.policies.find(kind).is_some()
    }

    pub fn store(&self) -> &Arc<dyn StoreAdapter> {
        &self.store
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Repair one anomaly. Never panics on store trouble; the outcome says
    /// what happened and the audit log keeps a copy.
    pub async fn repair(&self, anomaly: &Anomaly) -> RepairOutcome {
        let kind = anomaly.kind();

        let planned = match self.policies.find(kind) {
            Some(policy) => policy.plan(anomaly, Utc::now()),
            None => Err(RepairError::Unrepairable(kind)),
        };

        let (actions, outcome) = match planned {
            Ok(plan) => {
                let actions = plan.actions();
                let outcome = if self.dry_run {
                    info!(
                        kind = %kind,
                        request_id = anomaly.request_id(),
                        actions = ?actions,
                        "Dry run, repair not applied"
                    );
                    RepairOutcome::Skipped {
                        reason: "dry run".to_string(),
                    }
                } else {
                    self.execute(&plan).await
                };
                (actions, outcome)
            }
            Err(e) => {
                warn!(
                    kind = %kind,
                    request_id = anomaly.request_id(),
                    error = %e,
                    "Anomaly cannot be repaired"
                );
                (
                    Vec::new(),
                    RepairOutcome::Failed {
                        reason: e.to_string(),
                    },
                )
            }
        };

        match &outcome {
            RepairOutcome::Repaired { writes, detail } => info!(
                kind = %kind,
                request_id = anomaly.request_id(),
                assignments = ?anomaly.assignment_ids(),
                writes,
                detail = detail.as_deref().unwrap_or(""),
                "Anomaly repaired"
            ),
            RepairOutcome::Skipped { reason } => debug!(
                kind = %kind,
                request_id = anomaly.request_id(),
                reason = %reason,
                "Repair skipped"
            ),
            RepairOutcome::Failed { reason } => warn!(
                kind = %kind,
                request_id = anomaly.request_id(),
                reason = %reason,
                "Repair failed"
            ),
        }

        self.audit
            .record(AuditEntry::new(anomaly, actions, outcome.clone()))
            .await;
        outcome
    }

    /// Issue the plan's writes in order, stopping at the first that does not apply
    async fn execute(&self, plan: &RepairPlan) -> RepairOutcome {
        if let Some(request_id) = &plan.requires_missing_request {
            let current = self
                .retry
                .run("request lookup", || self.store.get_request(request_id))
                .await;
            match current {
                Ok(None) => {}
                Ok(Some(request)) => {
                    return RepairOutcome::Skipped {
                        reason: format!("request {} now exists ({})", request.id, request.status),
                    }
                }
                Err(e) => {
                    return RepairOutcome::Failed {
                        reason: format!("lookup of request {}: {}", request_id, e),
                    }
                }
            }
        }

        let total = plan.writes.len();
        let mut applied = 0;

        for write in &plan.writes {
            let result = self
                .retry
                .run("conditional update", || {
                    self.store.conditional_update(
                        write.table,
                        &write.id,
                        write.expected_version,
                        &write.patch,
                    )
                })
                .await;

            let reason = match &result {
                Ok(UpdateOutcome::Applied { version }) => {
                    debug!(action = %write.describe(), version, "Write applied");
                    applied += 1;
                    continue;
                }
                Ok(UpdateOutcome::Conflict { current }) => {
                    let state = match current {
                        Some(v) => format!("is at version {}", v),
                        None => "no longer exists".to_string(),
                    };
                    format!(
                        "{}/{} {} (expected {})",
                        write.table, write.id, state, write.expected_version
                    )
                }
                Err(e) => format!("{}: {}", write.describe(), e),
            };

            let reason = if applied > 0 {
                format!("{}; {} of {} writes applied", reason, applied, total)
            } else {
                reason
            };

            return match result {
                Err(_) => RepairOutcome::Failed { reason },
                Ok(_) => RepairOutcome::Skipped { reason },
            };
        }

        RepairOutcome::Repaired {
            writes: applied,
            detail: plan.detail.clone(),
        }
    }
}
