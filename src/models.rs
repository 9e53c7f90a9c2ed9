//! Domain models - requests, assignments, volunteer profiles
//!
//! Rows carry a `version` counter that every write bumps. Repairs are
//! guarded by the version they observed, which is what makes them safe to
//! race against live traffic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type RequestId = String;
pub type AssignmentId = String;
pub type VolunteerId = String;
pub type PilgrimId = String;

//=============================================================================
// ENUMS
//=============================================================================

/// Lifecycle shared by requests and assignments:
/// `pending → in_progress → resolved | cancelled`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    Pending,
    InProgress,
    Resolved,
    Cancelled,
}

impl LifecycleStatus {
    /// Active statuses count toward the one-active-assignment rule
    pub fn is_active(self) -> bool {
        matches!(self, LifecycleStatus::Pending | LifecycleStatus::InProgress)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleStatus::Resolved | LifecycleStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleStatus::Pending => "pending",
            LifecycleStatus::InProgress => "in_progress",
            LifecycleStatus::Resolved => "resolved",
            LifecycleStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for LifecycleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(LifecycleStatus::Pending),
            "in_progress" => Ok(LifecycleStatus::InProgress),
            "resolved" => Ok(LifecycleStatus::Resolved),
            "cancelled" => Ok(LifecycleStatus::Cancelled),
            other => Err(format!("unknown lifecycle status '{}'", other)),
        }
    }
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the assignment for a request was meant to be made. Set at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentMethod {
    Auto,
    Manual,
}

impl AssignmentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            AssignmentMethod::Auto => "auto",
            AssignmentMethod::Manual => "manual",
        }
    }
}

impl FromStr for AssignmentMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(AssignmentMethod::Auto),
            "manual" => Ok(AssignmentMethod::Manual),
            other => Err(format!("unknown assignment method '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DutyStatus {
    OnDuty,
    OffDuty,
}

impl DutyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DutyStatus::OnDuty => "on_duty",
            DutyStatus::OffDuty => "off_duty",
        }
    }
}

impl FromStr for DutyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on_duty" => Ok(DutyStatus::OnDuty),
            "off_duty" => Ok(DutyStatus::OffDuty),
            other => Err(format!("unknown duty status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolunteerStatus {
    Active,
    Inactive,
}

impl VolunteerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VolunteerStatus::Active => "active",
            VolunteerStatus::Inactive => "inactive",
        }
    }
}

impl FromStr for VolunteerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(VolunteerStatus::Active),
            "inactive" => Ok(VolunteerStatus::Inactive),
            other => Err(format!("unknown volunteer status '{}'", other)),
        }
    }
}

/// The three collections of the backing store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Requests,
    Assignments,
    Profiles,
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Table::Requests => "requests",
            Table::Assignments => "assignments",
            Table::Profiles => "profiles",
        })
    }
}

//=============================================================================
// RECORDS
//=============================================================================

/// A pilgrim's request for help
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistanceRequest {
    pub id: RequestId,
    pub requester_id: PilgrimId,
    pub category: String,
    pub description: String,
    pub status: LifecycleStatus,
    pub assignment_method: AssignmentMethod,
    pub created_at: DateTime<Utc>,
    /// Set if and only if `status` is `resolved`
    pub resolved_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl AssistanceRequest {
    pub fn new(
        id: impl Into<String>,
        requester_id: impl Into<String>,
        assignment_method: AssignmentMethod,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            requester_id: requester_id.into(),
            category: "general".to_string(),
            description: String::new(),
            status: LifecycleStatus::Pending,
            assignment_method,
            created_at,
            resolved_at: None,
            version: 1,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>, description: impl Into<String>) -> Self {
        self.category = category.into();
        self.description = description.into();
        self
    }

    /// Set the status, keeping `resolved_at` consistent with it
    pub fn with_status(mut self, status: LifecycleStatus, at: DateTime<Utc>) -> Self {
        self.status = status;
        self.resolved_at = (status == LifecycleStatus::Resolved).then_some(at);
        self
    }
}

/// Join row between a request and the volunteer working it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: AssignmentId,
    pub request_id: RequestId,
    pub volunteer_id: VolunteerId,
    /// Denormalized from the request for fast lookup
    pub pilgrim_id: PilgrimId,
    pub status: LifecycleStatus,
    pub assigned_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl Assignment {
    pub fn new(
        id: impl Into<String>,
        request_id: impl Into<String>,
        volunteer_id: impl Into<String>,
        pilgrim_id: impl Into<String>,
        assigned_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            request_id: request_id.into(),
            volunteer_id: volunteer_id.into(),
            pilgrim_id: pilgrim_id.into(),
            status: LifecycleStatus::Pending,
            assigned_at,
            completed_at: None,
            version: 1,
        }
    }

    pub fn with_status(mut self, status: LifecycleStatus) -> Self {
        self.status = status;
        self
    }

    pub fn completed(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolunteerProfile {
    pub id: VolunteerId,
    pub duty_status: DutyStatus,
    pub volunteer_status: VolunteerStatus,
    pub last_location: Option<GeoPoint>,
    pub location_updated_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl VolunteerProfile {
    pub fn new(id: impl Into<String>, volunteer_status: VolunteerStatus) -> Self {
        Self {
            id: id.into(),
            duty_status: DutyStatus::OnDuty,
            volunteer_status,
            last_location: None,
            location_updated_at: None,
            version: 1,
        }
    }

    pub fn located(mut self, point: GeoPoint, at: DateTime<Utc>) -> Self {
        self.last_location = Some(point);
        self.location_updated_at = Some(at);
        self
    }
}

//=============================================================================
// PATCHES
//=============================================================================

/// Partial update for a request row. `resolved_at: Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestPatch {
    pub status: Option<LifecycleStatus>,
    pub resolved_at: Option<Option<DateTime<Utc>>>,
}

impl RequestPatch {
    /// Back to `pending` so matching can pick the request up again
    pub fn reset_to_pending() -> Self {
        Self {
            status: Some(LifecycleStatus::Pending),
            resolved_at: Some(None),
        }
    }

    pub fn resolve(at: DateTime<Utc>) -> Self {
        Self {
            status: Some(LifecycleStatus::Resolved),
            resolved_at: Some(Some(at)),
        }
    }

    pub fn apply(&self, request: &mut AssistanceRequest) {
        if let Some(status) = self.status {
            request.status = status;
        }
        if let Some(resolved_at) = self.resolved_at {
            request.resolved_at = resolved_at;
        }
    }
}

/// Partial update for an assignment row
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssignmentPatch {
    pub status: Option<LifecycleStatus>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
}

impl AssignmentPatch {
    pub fn cancel() -> Self {
        Self {
            status: Some(LifecycleStatus::Cancelled),
            completed_at: None,
        }
    }

    pub fn resolve(at: DateTime<Utc>) -> Self {
        Self {
            status: Some(LifecycleStatus::Resolved),
            completed_at: Some(Some(at)),
        }
    }

    pub fn apply(&self, assignment: &mut Assignment) {
        if let Some(status) = self.status {
            assignment.status = status;
        }
        if let Some(completed_at) = self.completed_at {
            assignment.completed_at = completed_at;
        }
    }
}

/// Partial update for a profile row (check-in / check-out)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfilePatch {
    pub duty_status: Option<DutyStatus>,
    pub volunteer_status: Option<VolunteerStatus>,
}

impl ProfilePatch {
    pub fn apply(&self, profile: &mut VolunteerProfile) {
        if let Some(duty) = self.duty_status {
            profile.duty_status = duty;
        }
        if let Some(status) = self.volunteer_status {
            profile.volunteer_status = status;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", rename_all = "snake_case")]
pub enum Patch {
    Request(RequestPatch),
    Assignment(AssignmentPatch),
    Profile(ProfilePatch),
}

impl Patch {
    /// The table this patch is shaped for
    pub fn table(&self) -> Table {
        match self {
            Patch::Request(_) => Table::Requests,
            Patch::Assignment(_) => Table::Assignments,
            Patch::Profile(_) => Table::Profiles,
        }
    }

    /// Short human-readable verb for logs and audit entries
    pub fn describe(&self) -> String {
        let status = match self {
            Patch::Request(p) => p.status,
            Patch::Assignment(p) => p.status,
            Patch::Profile(p) => {
                return match (p.duty_status, p.volunteer_status) {
                    (Some(d), Some(v)) => format!("set {} / {}", d.as_str(), v.as_str()),
                    (Some(d), None) => format!("set {}", d.as_str()),
                    (None, Some(v)) => format!("set {}", v.as_str()),
                    (None, None) => "touch".to_string(),
                };
            }
        };
        match status {
            Some(LifecycleStatus::Cancelled) => "cancel".to_string(),
            Some(LifecycleStatus::Resolved) => "resolve".to_string(),
            Some(LifecycleStatus::Pending) => "reset to pending".to_string(),
            Some(LifecycleStatus::InProgress) => "start".to_string(),
            None => "touch".to_string(),
        }
    }
}

/// Result of a guarded single-row write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOutcome {
    /// The row matched the expected version and now carries `version`
    Applied { version: u64 },
    /// The row moved on (or vanished, `current: None`) since it was observed
    Conflict { current: Option<u64> },
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied { .. })
    }
}
