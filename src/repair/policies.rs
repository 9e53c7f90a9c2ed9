//! Repair policies - one per anomaly kind
//!
//! A policy turns an anomaly into a [`RepairPlan`]: an ordered list of
//! single-row writes, each guarded by the version the checker observed.
//! Planning is pure; the engine performs the writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checker::{recency_order, Anomaly, AnomalyKind, DesyncDirection};
use crate::error::RepairError;
use crate::models::*;

/// A conditional update the engine will issue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardedWrite {
    pub table: Table,
    pub id: String,
    pub expected_version: u64,
    pub patch: Patch,
}

impl GuardedWrite {
    pub fn assignment(assignment: &Assignment, patch: AssignmentPatch) -> Self {
        Self {
            table: Table::Assignments,
            id: assignment.id.clone(),
            expected_version: assignment.version,
            patch: Patch::Assignment(patch),
        }
    }

    pub fn request(request: &AssistanceRequest, patch: RequestPatch) -> Self {
        Self {
            table: Table::Requests,
            id: request.id.clone(),
            expected_version: request.version,
            patch: Patch::Request(patch),
        }
    }

    /// e.g. `cancel assignments/a1@3`
    pub fn describe(&self) -> String {
        format!(
            "{} {}/{}@{}",
            self.patch.describe(),
            self.table,
            self.id,
            self.expected_version
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepairPlan {
    pub writes: Vec<GuardedWrite>,
    /// Extra context carried into the outcome, e.g. staleness
    pub detail: Option<String>,
    /// Re-read before any write; the plan is abandoned if this request exists
    pub requires_missing_request: Option<RequestId>,
}

impl RepairPlan {
    fn new(writes: Vec<GuardedWrite>) -> Self {
        Self {
            writes,
            ..Self::default()
        }
    }

    fn requiring_missing_request(mut self, request_id: impl Into<RequestId>) -> Self {
        self.requires_missing_request = Some(request_id.into());
        self
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn actions(&self) -> Vec<String> {
        self.writes.iter().map(GuardedWrite::describe).collect()
    }
}

/// Corrective strategy for one anomaly kind
pub trait RepairPolicy: Send + Sync {
    fn kind(&self) -> AnomalyKind;

    fn plan(&self, anomaly: &Anomaly, now: DateTime<Utc>) -> Result<RepairPlan, RepairError>;
}

/// Registered policies, looked up by kind
pub struct RepairPolicies {
    policies: Vec<Box<dyn RepairPolicy>>,
}

impl RepairPolicies {
    pub fn new() -> Self {
        Self { policies: Vec::new() }
    }

    pub fn register(&mut self, policy: Box<dyn RepairPolicy>) {
        self.policies.retain(|p| p.kind() != policy.kind());
        self.policies.push(policy);
    }

    /// Drop the policy for `kind`; its anomalies become unrepairable
    pub fn disable(&mut self, kind: AnomalyKind) {
        self.policies.retain(|p| p.kind() != kind);
    }

    pub fn find(&self, kind: AnomalyKind) -> Option<&dyn RepairPolicy> {
        self.policies
            .iter()
            .find(|p| p.kind() == kind)
            .map(|p| p.as_ref())
    }

    pub fn kinds(&self) -> Vec<AnomalyKind> {
        let mut kinds: Vec<_> = self.policies.iter().map(|p| p.kind()).collect();
        kinds.sort();
        kinds
    }
}

impl Default for RepairPolicies {
    fn default() -> Self {
        let mut policies = Self::new();

        policies.register(Box::new(CancelOrphan));
        policies.register(Box::new(KeepMostRecent));
        policies.register(Box::new(PropagateStatus));
        policies.register(Box::new(ReleaseFromInactiveVolunteer));
        policies.register(Box::new(ReleaseStale));

        policies
    }
}

fn mismatch(policy: AnomalyKind, anomaly: &Anomaly) -> RepairError {
    RepairError::Malformed(format!(
        "{} policy cannot handle {} anomaly",
        policy,
        anomaly.kind()
    ))
}

/// Cancel the assignment. The request is gone, so nothing else is written.
pub struct CancelOrphan;

impl RepairPolicy for CancelOrphan {
    fn kind(&self) -> AnomalyKind {
        AnomalyKind::OrphanAssignment
    }

    fn plan(&self, anomaly: &Anomaly, _now: DateTime<Utc>) -> Result<RepairPlan, RepairError> {
        let Anomaly::OrphanAssignment { assignment } = anomaly else {
            return Err(mismatch(self.kind(), anomaly));
        };
        // The version guard covers the assignment only; the missing request
        // is re-checked by the engine right before the write.
        Ok(RepairPlan::new(vec![GuardedWrite::assignment(
            assignment,
            AssignmentPatch::cancel(),
        )])
        .requiring_missing_request(&assignment.request_id))
    }
}

/// Keep the most recent active assignment and cancel the rest
pub struct KeepMostRecent;

impl RepairPolicy for KeepMostRecent {
    fn kind(&self) -> AnomalyKind {
        AnomalyKind::DuplicateActiveAssignment
    }

    fn plan(&self, anomaly: &Anomaly, _now: DateTime<Utc>) -> Result<RepairPlan, RepairError> {
        let Anomaly::DuplicateActiveAssignment { request_id, assignments } = anomaly else {
            return Err(mismatch(self.kind(), anomaly));
        };
        if assignments.len() < 2 {
            return Err(RepairError::Malformed(format!(
                "duplicate anomaly on {} lists {} assignment(s)",
                request_id,
                assignments.len()
            )));
        }

        // Payload order is not trusted
        let mut ranked: Vec<&Assignment> = assignments.iter().collect();
        ranked.sort_by(|a, b| recency_order(a, b));

        let writes = ranked[1..]
            .iter()
            .map(|a| GuardedWrite::assignment(a, AssignmentPatch::cancel()))
            .collect();
        Ok(RepairPlan::new(writes).with_detail(format!("kept {}", ranked[0].id)))
    }
}

/// Copy the terminal side's status onto the lagging side
pub struct PropagateStatus;

impl RepairPolicy for PropagateStatus {
    fn kind(&self) -> AnomalyKind {
        AnomalyKind::StatusDesync
    }

    fn plan(&self, anomaly: &Anomaly, now: DateTime<Utc>) -> Result<RepairPlan, RepairError> {
        let Anomaly::StatusDesync { assignment, request, direction } = anomaly else {
            return Err(mismatch(self.kind(), anomaly));
        };

        let write = match (*direction, request.status, assignment.status) {
            (DesyncDirection::FromRequest, LifecycleStatus::Resolved, _) => GuardedWrite::assignment(
                assignment,
                AssignmentPatch::resolve(request.resolved_at.unwrap_or(now)),
            ),
            (DesyncDirection::FromRequest, LifecycleStatus::Cancelled, _) => {
                GuardedWrite::assignment(assignment, AssignmentPatch::cancel())
            }
            (DesyncDirection::FromAssignment, _, LifecycleStatus::Resolved) => GuardedWrite::request(
                request,
                RequestPatch::resolve(assignment.completed_at.unwrap_or(now)),
            ),
            (DesyncDirection::FromAssignment, LifecycleStatus::InProgress, LifecycleStatus::Cancelled) => {
                GuardedWrite::request(request, RequestPatch::reset_to_pending())
            }
            (direction, request_status, assignment_status) => {
                return Err(RepairError::Malformed(format!(
                    "no {:?} propagation from request {} ({}) / assignment {} ({})",
                    direction, request.id, request_status, assignment.id, assignment_status
                )));
            }
        };
        Ok(RepairPlan::new(vec![write]))
    }
}

/// Cancel the assignment and put the request back up for matching
pub struct ReleaseFromInactiveVolunteer;

impl RepairPolicy for ReleaseFromInactiveVolunteer {
    fn kind(&self) -> AnomalyKind {
        AnomalyKind::InactiveVolunteerHoldingAssignment
    }

    fn plan(&self, anomaly: &Anomaly, _now: DateTime<Utc>) -> Result<RepairPlan, RepairError> {
        let Anomaly::InactiveVolunteerHoldingAssignment { assignment, request } = anomaly else {
            return Err(mismatch(self.kind(), anomaly));
        };
        Ok(release(assignment, request).with_detail(format!(
            "volunteer {} inactive",
            assignment.volunteer_id
        )))
    }
}

/// Same writes as an inactive volunteer, plus the staleness in the detail
pub struct ReleaseStale;

impl RepairPolicy for ReleaseStale {
    fn kind(&self) -> AnomalyKind {
        AnomalyKind::StaleActiveAssignment
    }

    fn plan(&self, anomaly: &Anomaly, _now: DateTime<Utc>) -> Result<RepairPlan, RepairError> {
        let Anomaly::StaleActiveAssignment { assignment, request, stale_for_secs } = anomaly else {
            return Err(mismatch(self.kind(), anomaly));
        };
        Ok(release(assignment, request).with_detail(format!("stale for {}s", stale_for_secs)))
    }
}

/// Assignment first: if the request write then conflicts, the cancelled
/// assignment surfaces as a desync on the next detection and the request gets reset.
fn release(assignment: &Assignment, request: &AssistanceRequest) -> RepairPlan {
    let mut writes = vec![GuardedWrite::assignment(assignment, AssignmentPatch::cancel())];
    if request.status != LifecycleStatus::Pending || request.resolved_at.is_some() {
        writes.push(GuardedWrite::request(request, RequestPatch::reset_to_pending()));
    }
    RepairPlan::new(writes)
}
