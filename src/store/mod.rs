//! Store adapter - uniform access to requests, assignments and profiles
//!
//! The engine never assumes multi-row transactions. Reads are filtered
//! scans or point lookups; the only write the repair path uses is
//! [`StoreAdapter::conditional_update`], a single-row compare-and-set on the
//! row's `version`.
//!
//! ## Backends
//!
//! - [`MemoryStore`] - concurrent in-process maps, used by tests and demos
//! - [`SqliteStore`] - persistent rows with a `version` column per table

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::models::*;

/// Row filter for request scans
#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    pub method: Option<AssignmentMethod>,
    pub statuses: Option<Vec<LifecycleStatus>>,
    pub created_since: Option<DateTime<Utc>>,
    pub created_until: Option<DateTime<Utc>>,
}

impl RequestFilter {
    pub fn method(mut self, method: AssignmentMethod) -> Self {
        self.method = Some(method);
        self
    }

    pub fn statuses(mut self, statuses: &[LifecycleStatus]) -> Self {
        self.statuses = Some(statuses.to_vec());
        self
    }

    pub fn created_between(
        mut self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Self {
        self.created_since = since;
        self.created_until = until;
        self
    }

    pub fn matches(&self, request: &AssistanceRequest) -> bool {
        if self.method.is_some_and(|m| m != request.assignment_method) {
            return false;
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&request.status) {
                return false;
            }
        }
        if self.created_since.is_some_and(|t| request.created_at < t) {
            return false;
        }
        if self.created_until.is_some_and(|t| request.created_at >= t) {
            return false;
        }
        true
    }
}

/// Row filter for assignment scans
#[derive(Debug, Clone, Default)]
pub struct AssignmentFilter {
    pub request_id: Option<RequestId>,
    pub volunteer_id: Option<VolunteerId>,
    pub statuses: Option<Vec<LifecycleStatus>>,
}

impl AssignmentFilter {
    /// Assignments in `pending` or `in_progress`
    pub fn active() -> Self {
        Self::default().statuses(&[LifecycleStatus::Pending, LifecycleStatus::InProgress])
    }

    pub fn request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn volunteer(mut self, volunteer_id: impl Into<String>) -> Self {
        self.volunteer_id = Some(volunteer_id.into());
        self
    }

    pub fn statuses(mut self, statuses: &[LifecycleStatus]) -> Self {
        self.statuses = Some(statuses.to_vec());
        self
    }

    pub fn matches(&self, assignment: &Assignment) -> bool {
        if self
            .request_id
            .as_ref()
            .is_some_and(|id| *id != assignment.request_id)
        {
            return false;
        }
        if self
            .volunteer_id
            .as_ref()
            .is_some_and(|id| *id != assignment.volunteer_id)
        {
            return false;
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&assignment.status) {
                return false;
            }
        }
        true
    }
}

/// Access to the three collections. Scans return rows ordered by id.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    async fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<AssistanceRequest>, StoreError>;

    async fn list_assignments(&self, filter: &AssignmentFilter) -> Result<Vec<Assignment>, StoreError>;

    async fn list_profiles(&self) -> Result<Vec<VolunteerProfile>, StoreError>;

    async fn get_request(&self, id: &str) -> Result<Option<AssistanceRequest>, StoreError>;

    async fn get_assignment(&self, id: &str) -> Result<Option<Assignment>, StoreError>;

    async fn get_profile(&self, id: &str) -> Result<Option<VolunteerProfile>, StoreError>;

    /// Apply `patch` to row `id` only if it still carries `expected_version`.
    ///
    /// A missing row is reported as `Conflict { current: None }`.
    async fn conditional_update(
        &self,
        table: Table,
        id: &str,
        expected_version: u64,
        patch: &Patch,
    ) -> Result<UpdateOutcome, StoreError>;

    async fn insert_request(&self, request: AssistanceRequest) -> Result<(), StoreError>;

    async fn insert_assignment(&self, assignment: Assignment) -> Result<(), StoreError>;

    async fn insert_profile(&self, profile: VolunteerProfile) -> Result<(), StoreError>;

    /// Returns whether a row was removed
    async fn delete_request(&self, id: &str) -> Result<bool, StoreError>;

    /// Active assignments narrowed by `filter`
    async fn list_active_assignments(
        &self,
        filter: &AssignmentFilter,
    ) -> Result<Vec<Assignment>, StoreError> {
        let mut active = filter.clone();
        active.statuses = Some(vec![LifecycleStatus::Pending, LifecycleStatus::InProgress]);
        self.list_assignments(&active).await
    }
}

/// Point-in-time view the checker works from. It may be slightly stale by
/// the time repairs run; the version guards absorb that.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub requests: HashMap<RequestId, AssistanceRequest>,
    pub assignments: Vec<Assignment>,
    pub profiles: HashMap<VolunteerId, VolunteerProfile>,
}

impl Snapshot {
    /// Read all three collections. Assignments come first, so a request
    /// created alongside its assignment mid-capture is never seen without it.
    pub async fn capture(store: &dyn StoreAdapter) -> Result<Self, StoreError> {
        let assignments = store.list_assignments(&AssignmentFilter::default()).await?;
        let requests = store.list_requests(&RequestFilter::default()).await?;
        let profiles = store.list_profiles().await?;
        Ok(Self::from_parts(requests, assignments, profiles))
    }

    pub fn from_parts(
        requests: Vec<AssistanceRequest>,
        assignments: Vec<Assignment>,
        profiles: Vec<VolunteerProfile>,
    ) -> Self {
        Self {
            taken_at: Utc::now(),
            requests: requests.into_iter().map(|r| (r.id.clone(), r)).collect(),
            assignments,
            profiles: profiles.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }
}
