//! Pass summaries and health reports

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checker::{Anomaly, AnomalyKind};
use crate::repair::RepairOutcome;

/// An anomaly no registered policy can fix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnrepairableAnomaly {
    pub kind: AnomalyKind,
    pub request_id: String,
    pub assignment_ids: Vec<String>,
    pub description: String,
}

impl From<&Anomaly> for UnrepairableAnomaly {
    fn from(anomaly: &Anomaly) -> Self {
        Self {
            kind: anomaly.kind(),
            request_id: anomaly.request_id().to_string(),
            assignment_ids: anomaly
                .assignment_ids()
                .into_iter()
                .map(String::from)
                .collect(),
            description: anomaly.describe(),
        }
    }
}

/// Result of one consistency pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassSummary {
    pub pass_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub anomalies_found: usize,
    pub by_kind: BTreeMap<AnomalyKind, usize>,
    pub repaired: usize,
    pub skipped: usize,
    pub failed: usize,
    pub unrepairable: Vec<UnrepairableAnomaly>,
    /// Detect-and-repair rounds; more than one when repairs exposed
    /// follow-on anomalies
    pub rounds: u32,
    /// Shutdown arrived before every anomaly was handled
    pub aborted: bool,
    pub dry_run: bool,
}

impl PassSummary {
    pub fn begin(dry_run: bool) -> Self {
        Self {
            pass_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            anomalies_found: 0,
            by_kind: BTreeMap::new(),
            repaired: 0,
            skipped: 0,
            failed: 0,
            unrepairable: Vec::new(),
            rounds: 0,
            aborted: false,
            dry_run,
        }
    }

    pub fn found(&mut self, anomalies: &[Anomaly]) {
        self.anomalies_found = anomalies.len();
        self.by_kind = count_by_kind(anomalies);
    }

    /// Add anomalies detected by a follow-on round
    pub fn found_more(&mut self, anomalies: &[Anomaly]) {
        self.anomalies_found += anomalies.len();
        for (kind, count) in count_by_kind(anomalies) {
            *self.by_kind.entry(kind).or_default() += count;
        }
    }

    pub fn tally(&mut self, outcome: &RepairOutcome) {
        match outcome {
            RepairOutcome::Repaired { .. } => self.repaired += 1,
            RepairOutcome::Skipped { .. } => self.skipped += 1,
            RepairOutcome::Failed { .. } => self.failed += 1,
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Anomalies that were detected but never got an outcome
    pub fn unhandled(&self) -> usize {
        self.anomalies_found
            .saturating_sub(self.repaired + self.skipped + self.failed)
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

/// Counts for every kind, zeros included, in priority order
pub fn count_by_kind(anomalies: &[Anomaly]) -> BTreeMap<AnomalyKind, usize> {
    let mut counts: BTreeMap<AnomalyKind, usize> =
        AnomalyKind::ALL.iter().map(|k| (*k, 0)).collect();
    for anomaly in anomalies {
        *counts.entry(anomaly.kind()).or_default() += 1;
    }
    counts
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub anomaly_counts: BTreeMap<AnomalyKind, usize>,
    pub total_anomalies: usize,
    pub unrepairable: Vec<UnrepairableAnomaly>,
    pub passes_run: u64,
    pub last_pass: Option<PassSummary>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.total_anomalies == 0
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_healthy() { "HEALTHY" } else { "DEGRADED" };
        writeln!(
            f,
            "Assignment consistency: {} ({})",
            state,
            self.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
        )?;

        writeln!(f, "Open anomalies: {}", self.total_anomalies)?;
        for (kind, count) in &self.anomaly_counts {
            writeln!(f, "  {:<38} {}", kind.as_str(), count)?;
        }

        if !self.unrepairable.is_empty() {
            writeln!(f, "Unrepairable: {}", self.unrepairable.len())?;
            for item in &self.unrepairable {
                writeln!(f, "  - [{}] {}", item.kind, item.description)?;
            }
        }

        match &self.last_pass {
            Some(pass) => {
                write!(
                    f,
                    "Last pass {} at {}: found {}, repaired {}, skipped {}, failed {}",
                    pass.pass_id,
                    pass.started_at.format("%H:%M:%S"),
                    pass.anomalies_found,
                    pass.repaired,
                    pass.skipped,
                    pass.failed
                )?;
                if pass.dry_run {
                    write!(f, " (dry run)")?;
                }
                if pass.aborted {
                    write!(f, " (aborted)")?;
                }
                writeln!(f)?;
            }
            None => writeln!(f, "No pass has run yet")?,
        }
        write!(f, "Passes run: {}", self.passes_run)
    }
}
