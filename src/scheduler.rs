//! Repair scheduler - drives detection and repair
//!
//! Runs a consistency pass on a fixed interval and on demand. Passes may
//! overlap: there is no global lock, and whichever pass loses a race sees a
//! version conflict and reports `Skipped`.
//!
//! Shutdown is a watch channel. The interval loop exits on it, and a pass
//! in flight stops handing out repairs; whatever remains is picked up by the
//! next pass.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::audit::AuditLog;
use crate::checker::{Anomaly, InvariantChecker};
use crate::config::Config;
use crate::error::RepairError;
use crate::repair::RepairEngine;
use crate::report::{count_by_kind, HealthReport, PassSummary, UnrepairableAnomaly};
use crate::store::{Snapshot, StoreAdapter};

/// Upper bound on detect-and-repair rounds within one pass
const MAX_ROUNDS: u32 = 4;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerStatus {
    /// The interval loop is active
    pub running: bool,
    /// Passes currently executing
    pub passes_in_flight: u32,
    pub passes_run: u64,
    pub last_pass: Option<PassSummary>,
    pub last_error: Option<String>,
}

pub struct RepairScheduler {
    checker: InvariantChecker,
    engine: RepairEngine,
    interval: Duration,
    max_concurrency: usize,
    status: RwLock<SchedulerStatus>,
    shutdown: watch::Sender<bool>,
}

impl RepairScheduler {
    pub fn new(checker: InvariantChecker, engine: RepairEngine) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            checker,
            engine,
            interval: Duration::from_secs(300),
            max_concurrency: 8,
            status: RwLock::new(SchedulerStatus::default()),
            shutdown,
        }
    }

    pub fn from_config(store: Arc<dyn StoreAdapter>, config: &Config) -> Self {
        let audit = Arc::new(AuditLog::new(config.repair.audit_capacity));
        let engine = RepairEngine::from_config(store, &config.repair, audit);

        Self::new(InvariantChecker::new(config.checker.stale_after()), engine)
            .with_interval(Duration::from_secs(config.scheduler.interval_secs))
            .with_max_concurrency(config.repair.max_concurrency)
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn engine(&self) -> &RepairEngine {
        &self.engine
    }

    pub fn checker(&self) -> &InvariantChecker {
        &self.checker
    }

    pub async fn status(&self) -> SchedulerStatus {
        self.status.read().await.clone()
    }

    /// Read the three collections, retrying transient failures
    pub async fn capture_snapshot(&self) -> Result<Snapshot, RepairError> {
        let retry = self.engine.retry_policy();
        let store = self.engine.store();

        retry
            .run("snapshot", || Snapshot::capture(store.as_ref()))
            .await
            .map_err(|source| RepairError::SnapshotUnavailable {
                attempts: if source.is_transient() { retry.attempts() } else { 1 },
                source,
            })
    }

    /// Detection only; nothing is written
    pub async fn detect(&self) -> Result<Vec<Anomaly>, RepairError> {
        let snapshot = self.capture_snapshot().await?;
        Ok(self.checker.check(&snapshot, Utc::now()))
    }

    /// Detect and repair once. Fails only if the snapshot cannot be read;
    /// individual repair failures are counted in the summary.
    pub async fn run_consistency_pass(&self) -> Result<PassSummary, RepairError> {
        self.status.write().await.passes_in_flight += 1;

        let mut pass = PassSummary::begin(self.engine.is_dry_run());
        let result = self.execute_pass(&mut pass).await;

        let mut status = self.status.write().await;
        status.passes_in_flight = status.passes_in_flight.saturating_sub(1);
        match result {
            Ok(()) => {
                status.passes_run += 1;
                status.last_pass = Some(pass.clone());
                status.last_error = None;
                Ok(pass)
            }
            Err(e) => {
                error!(pass_id = %pass.pass_id, error = %e, "Consistency pass failed");
                status.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn execute_pass(&self, pass: &mut PassSummary) -> Result<(), RepairError> {
        let mut shutdown = self.shutdown.subscribe();
        shutdown.borrow_and_update();

        let anomalies = self.detect().await?;
        pass.found(&anomalies);
        pass.unrepairable = anomalies
            .iter()
            .filter(|a| !self.engine.can_repair(a.kind()))
            .map(UnrepairableAnomaly::from)
            .collect();

        info!(
            pass_id = %pass.pass_id,
            anomalies = anomalies.len(),
            unrepairable = pass.unrepairable.len(),
            dry_run = pass.dry_run,
            "Consistency pass started"
        );

        self.repair_round(&anomalies, pass, &mut shutdown).await;

        // Repairs can expose anomalies of their own, e.g. an older resolved
        // assignment becoming the latest once newer ones are cancelled.
        // Settle those before the pass ends.
        let mut repaired_before = 0;
        while !pass.aborted
            && !pass.dry_run
            && pass.repaired > repaired_before
            && pass.rounds < MAX_ROUNDS
        {
            repaired_before = pass.repaired;
            let follow_on: Vec<Anomaly> = match self.detect().await {
                Ok(anomalies) => anomalies
                    .into_iter()
                    .filter(|a| self.engine.can_repair(a.kind()))
                    .collect(),
                Err(e) => {
                    warn!(pass_id = %pass.pass_id, error = %e, "Follow-on detection failed");
                    break;
                }
            };
            if follow_on.is_empty() {
                break;
            }
            debug!(
                pass_id = %pass.pass_id,
                round = pass.rounds + 1,
                anomalies = follow_on.len(),
                "Repairing follow-on anomalies"
            );
            pass.found_more(&follow_on);
            self.repair_round(&follow_on, pass, &mut shutdown).await;
        }

        pass.finish();
        info!(
            pass_id = %pass.pass_id,
            found = pass.anomalies_found,
            repaired = pass.repaired,
            skipped = pass.skipped,
            failed = pass.failed,
            duration_ms = pass.duration_ms().unwrap_or_default(),
            "Consistency pass complete"
        );
        Ok(())
    }

    /// Repair `anomalies` with bounded concurrency until done or shut down
    async fn repair_round(
        &self,
        anomalies: &[Anomaly],
        pass: &mut PassSummary,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        pass.rounds += 1;

        // Boxed up front so the pass future stays Send across the select loop
        let repairs: Vec<_> = anomalies
            .iter()
            .map(|anomaly| self.engine.repair(anomaly).boxed())
            .collect();
        let mut outcomes = stream::iter(repairs).buffer_unordered(self.max_concurrency);

        loop {
            tokio::select! {
                next = outcomes.next() => match next {
                    Some(outcome) => pass.tally(&outcome),
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        pass.aborted = true;
                        warn!(
                            pass_id = %pass.pass_id,
                            unhandled = pass.unhandled(),
                            "Consistency pass aborted by shutdown"
                        );
                        break;
                    }
                }
            }
        }
    }

    /// Fresh anomaly counts plus the state of the last pass
    pub async fn health_report(&self) -> Result<HealthReport, RepairError> {
        let anomalies = self.detect().await?;
        let status = self.status.read().await;

        Ok(HealthReport {
            generated_at: Utc::now(),
            anomaly_counts: count_by_kind(&anomalies),
            total_anomalies: anomalies.len(),
            unrepairable: anomalies
                .iter()
                .filter(|a| !self.engine.can_repair(a.kind()))
                .map(UnrepairableAnomaly::from)
                .collect(),
            passes_run: status.passes_run,
            last_pass: status.last_pass.clone(),
        })
    }

    /// Run passes on the configured interval until [`shutdown`](Self::shutdown)
    pub async fn run(&self) {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return;
        }

        self.status.write().await.running = true;
        info!(
            interval_secs = self.interval.as_secs(),
            max_concurrency = self.max_concurrency,
            dry_run = self.engine.is_dry_run(),
            "Repair scheduler started"
        );

        let mut tick = interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    // Failure is already logged and recorded in the status
                    let _ = self.run_consistency_pass().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Repair scheduler shutting down");
                        break;
                    }
                }
            }
        }

        self.status.write().await.running = false;
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}
