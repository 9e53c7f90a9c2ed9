//! Invariant checker - read-only scan for assignment-state violations
//!
//! Works from a [`Snapshot`] and never touches the store. Each assignment is
//! claimed by at most one anomaly; kinds are evaluated in priority order so
//! the earliest matching kind wins.
//!
//! | Priority | Kind                                | Violation                                   |
//! |----------|-------------------------------------|---------------------------------------------|
//! | 1        | `OrphanAssignment`                  | request reference does not resolve          |
//! | 2        | `DuplicateActiveAssignment`         | more than one active assignment per request |
//! | 3        | `StatusDesync`                      | request and assignment status diverge       |
//! | 4        | `InactiveVolunteerHoldingAssignment`| inactive volunteer holds active work        |
//! | 5        | `StaleActiveAssignment`             | `in_progress` past the staleness threshold  |

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::*;
use crate::store::Snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    OrphanAssignment,
    DuplicateActiveAssignment,
    StatusDesync,
    InactiveVolunteerHoldingAssignment,
    StaleActiveAssignment,
}

impl AnomalyKind {
    /// All kinds in priority order
    pub const ALL: [AnomalyKind; 5] = [
        AnomalyKind::OrphanAssignment,
        AnomalyKind::DuplicateActiveAssignment,
        AnomalyKind::StatusDesync,
        AnomalyKind::InactiveVolunteerHoldingAssignment,
        AnomalyKind::StaleActiveAssignment,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AnomalyKind::OrphanAssignment => "orphan_assignment",
            AnomalyKind::DuplicateActiveAssignment => "duplicate_active_assignment",
            AnomalyKind::StatusDesync => "status_desync",
            AnomalyKind::InactiveVolunteerHoldingAssignment => "inactive_volunteer_holding_assignment",
            AnomalyKind::StaleActiveAssignment => "stale_active_assignment",
        }
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of a desync holds the status to propagate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesyncDirection {
    /// The request is terminal; write its status onto the assignment
    FromRequest,
    /// The assignment is terminal and the request lags behind it
    FromAssignment,
}

/// A detected violation, carrying the rows exactly as observed so repairs
/// can guard on their versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    OrphanAssignment {
        assignment: Assignment,
    },
    DuplicateActiveAssignment {
        request_id: RequestId,
        /// Ordered by `assigned_at` descending, ties by id ascending
        assignments: Vec<Assignment>,
    },
    StatusDesync {
        assignment: Assignment,
        request: AssistanceRequest,
        direction: DesyncDirection,
    },
    InactiveVolunteerHoldingAssignment {
        assignment: Assignment,
        request: AssistanceRequest,
    },
    StaleActiveAssignment {
        assignment: Assignment,
        request: AssistanceRequest,
        stale_for_secs: i64,
    },
}

impl Anomaly {
    pub fn kind(&self) -> AnomalyKind {
        match self {
            Anomaly::OrphanAssignment { .. } => AnomalyKind::OrphanAssignment,
            Anomaly::DuplicateActiveAssignment { .. } => AnomalyKind::DuplicateActiveAssignment,
            Anomaly::StatusDesync { .. } => AnomalyKind::StatusDesync,
            Anomaly::InactiveVolunteerHoldingAssignment { .. } => {
                AnomalyKind::InactiveVolunteerHoldingAssignment
            }
            Anomaly::StaleActiveAssignment { .. } => AnomalyKind::StaleActiveAssignment,
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            Anomaly::OrphanAssignment { assignment } => &assignment.request_id,
            Anomaly::DuplicateActiveAssignment { request_id, .. } => request_id,
            Anomaly::StatusDesync { request, .. }
            | Anomaly::InactiveVolunteerHoldingAssignment { request, .. }
            | Anomaly::StaleActiveAssignment { request, .. } => &request.id,
        }
    }

    pub fn assignment_ids(&self) -> Vec<&str> {
        match self {
            Anomaly::DuplicateActiveAssignment { assignments, .. } => {
                assignments.iter().map(|a| a.id.as_str()).collect()
            }
            Anomaly::OrphanAssignment { assignment }
            | Anomaly::StatusDesync { assignment, .. }
            | Anomaly::InactiveVolunteerHoldingAssignment { assignment, .. }
            | Anomaly::StaleActiveAssignment { assignment, .. } => vec![assignment.id.as_str()],
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Anomaly::OrphanAssignment { assignment } => format!(
                "assignment {} references missing request {}",
                assignment.id, assignment.request_id
            ),
            Anomaly::DuplicateActiveAssignment { request_id, assignments } => format!(
                "request {} has {} active assignments",
                request_id,
                assignments.len()
            ),
            Anomaly::StatusDesync { assignment, request, .. } => format!(
                "request {} is {} but assignment {} is {}",
                request.id, request.status, assignment.id, assignment.status
            ),
            Anomaly::InactiveVolunteerHoldingAssignment { assignment, .. } => format!(
                "inactive volunteer {} holds {} assignment {}",
                assignment.volunteer_id, assignment.status, assignment.id
            ),
            Anomaly::StaleActiveAssignment { assignment, stale_for_secs, .. } => format!(
                "assignment {} in progress for {}s without completion",
                assignment.id, stale_for_secs
            ),
        }
    }
}

/// Most recent first; identical timestamps fall back to the smallest id
pub fn recency_order(a: &Assignment, b: &Assignment) -> std::cmp::Ordering {
    b.assigned_at
        .cmp(&a.assigned_at)
        .then_with(|| a.id.cmp(&b.id))
}

/// Read-only anomaly detector
#[derive(Debug, Clone)]
pub struct InvariantChecker {
    stale_after: Duration,
}

impl InvariantChecker {
    pub fn new(stale_after: Duration) -> Self {
        Self { stale_after }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Scan `snapshot` and return anomalies ordered by kind priority, then
    /// request id, then assignment id.
    pub fn check(&self, snapshot: &Snapshot, now: DateTime<Utc>) -> Vec<Anomaly> {
        let mut claimed: HashSet<&str> = HashSet::new();
        let mut anomalies = Vec::new();

        // Group assignments by request once, ordered by recency within a group
        let mut by_request: BTreeMap<&str, Vec<&Assignment>> = BTreeMap::new();
        for assignment in &snapshot.assignments {
            by_request
                .entry(assignment.request_id.as_str())
                .or_default()
                .push(assignment);
        }
        for group in by_request.values_mut() {
            group.sort_by(|a, b| recency_order(a, b));
        }

        // 1. Orphans. Already-cancelled rows are settled.
        for (request_id, group) in &by_request {
            if snapshot.requests.contains_key(*request_id) {
                continue;
            }
            let mut orphans: Vec<&Assignment> = group
                .iter()
                .copied()
                .filter(|a| a.status != LifecycleStatus::Cancelled)
                .collect();
            orphans.sort_by(|a, b| a.id.cmp(&b.id));
            for assignment in orphans {
                claimed.insert(&assignment.id);
                anomalies.push(Anomaly::OrphanAssignment {
                    assignment: assignment.clone(),
                });
            }
        }

        // 2. Duplicate active assignments. The survivor stays unclaimed so
        //    later kinds can still apply to it.
        for (request_id, group) in &by_request {
            let active: Vec<&Assignment> = group
                .iter()
                .copied()
                .filter(|a| a.is_active() && !claimed.contains(a.id.as_str()))
                .collect();
            if active.len() < 2 {
                continue;
            }
            for loser in &active[1..] {
                claimed.insert(&loser.id);
            }
            anomalies.push(Anomaly::DuplicateActiveAssignment {
                request_id: request_id.to_string(),
                assignments: active.into_iter().cloned().collect(),
            });
        }

        // 3. Status desync
        for (request_id, group) in &by_request {
            let Some(request) = snapshot.requests.get(*request_id) else {
                continue;
            };
            for assignment in self.desynced(request, group, &claimed) {
                claimed.insert(&assignment.id);
                let direction = if request.status.is_terminal()
                    && (assignment.is_active() || request.status == LifecycleStatus::Cancelled)
                {
                    DesyncDirection::FromRequest
                } else {
                    DesyncDirection::FromAssignment
                };
                anomalies.push(Anomaly::StatusDesync {
                    assignment: assignment.clone(),
                    request: request.clone(),
                    direction,
                });
            }
        }

        // 4. Inactive volunteers holding active work
        let mut inactive = Vec::new();
        for assignment in unclaimed_active(snapshot, &claimed) {
            let Some(profile) = snapshot.profiles.get(&assignment.volunteer_id) else {
                continue;
            };
            if profile.volunteer_status != VolunteerStatus::Inactive {
                continue;
            }
            if let Some(request) = snapshot.requests.get(&assignment.request_id) {
                inactive.push((assignment, request));
            }
        }
        for (assignment, request) in inactive {
            claimed.insert(&assignment.id);
            anomalies.push(Anomaly::InactiveVolunteerHoldingAssignment {
                assignment: assignment.clone(),
                request: request.clone(),
            });
        }

        // 5. Stale in-progress work
        for assignment in unclaimed_active(snapshot, &claimed) {
            if assignment.status != LifecycleStatus::InProgress || assignment.completed_at.is_some() {
                continue;
            }
            let age = now - assignment.assigned_at;
            if age <= self.stale_after {
                continue;
            }
            if let Some(request) = snapshot.requests.get(&assignment.request_id) {
                anomalies.push(Anomaly::StaleActiveAssignment {
                    assignment: assignment.clone(),
                    request: request.clone(),
                    stale_for_secs: age.num_seconds(),
                });
            }
        }

        anomalies.sort_by(|a, b| {
            a.kind()
                .cmp(&b.kind())
                .then_with(|| a.request_id().cmp(b.request_id()))
                .then_with(|| a.assignment_ids().cmp(&b.assignment_ids()))
        });

        debug!(
            requests = snapshot.requests.len(),
            assignments = snapshot.assignments.len(),
            anomalies = anomalies.len(),
            "Invariant check complete"
        );
        anomalies
    }

    /// Assignments of one request whose status diverges from it.
    /// `group` is ordered most recent first.
    fn desynced<'a>(
        &self,
        request: &AssistanceRequest,
        group: &[&'a Assignment],
        claimed: &HashSet<&str>,
    ) -> Vec<&'a Assignment> {
        let unclaimed = group.iter().copied().filter(|a| !claimed.contains(a.id.as_str()));

        if request.status.is_terminal() {
            return unclaimed
                .filter(|a| {
                    a.is_active()
                        || (request.status == LifecycleStatus::Cancelled
                            && a.status == LifecycleStatus::Resolved)
                })
                .collect();
        }

        // Open request: only the latest assignment speaks for it, and only
        // once nothing is active any more.
        if group.iter().any(|a| a.is_active()) {
            return Vec::new();
        }
        match group.first() {
            Some(latest) if claimed.contains(latest.id.as_str()) => Vec::new(),
            Some(latest) if latest.status == LifecycleStatus::Resolved => vec![*latest],
            Some(latest)
                if latest.status == LifecycleStatus::Cancelled
                    && request.status == LifecycleStatus::InProgress =>
            {
                vec![*latest]
            }
            _ => Vec::new(),
        }
    }
}

fn unclaimed_active<'a>(
    snapshot: &'a Snapshot,
    claimed: &HashSet<&str>,
) -> Vec<&'a Assignment> {
    let mut rows: Vec<&Assignment> = snapshot
        .assignments
        .iter()
        .filter(|a| a.is_active() && !claimed.contains(a.id.as_str()))
        .collect();
    rows.sort_by(|a, b| a.id.cmp(&b.id));
    rows
}
