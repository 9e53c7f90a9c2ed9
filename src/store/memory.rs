//! In-memory store backed by concurrent maps
//!
//! Conditional updates hold the row's shard lock for the whole
//! compare-and-set, so concurrent writers to the same row serialize while
//! other rows stay available. Failure injection and a write counter let
//! tests observe transient errors and "no additional mutation".

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use super::{AssignmentFilter, RequestFilter, StoreAdapter};
use crate::error::StoreError;
use crate::models::*;

#[derive(Default)]
pub struct MemoryStore {
    requests: DashMap<RequestId, AssistanceRequest>,
    assignments: DashMap<AssignmentId, Assignment>,
    profiles: DashMap<VolunteerId, VolunteerProfile>,
    /// Remaining reads that fail with a transient error
    failing_reads: AtomicU32,
    /// Remaining conditional updates that fail with a transient error
    failing_updates: AtomicU32,
    /// Conditional updates that were applied
    applied_updates: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` reads fail with [`StoreError::Transient`]
    pub fn fail_next_reads(&self, count: u32) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` conditional updates fail with [`StoreError::Transient`]
    pub fn fail_next_updates(&self, count: u32) {
        self.failing_updates.store(count, Ordering::SeqCst);
    }

    /// Number of conditional updates applied so far
    pub fn applied_updates(&self) -> u64 {
        self.applied_updates.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_read(&self) -> Result<(), StoreError> {
        if Self::take_failure(&self.failing_reads) {
            return Err(StoreError::Transient("injected read failure".to_string()));
        }
        Ok(())
    }
}

fn sorted<T, K: Ord>(mut rows: Vec<T>, key: impl Fn(&T) -> K) -> Vec<T> {
    rows.sort_by_key(key);
    rows
}

#[async_trait]
impl StoreAdapter for MemoryStore {
    async fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<AssistanceRequest>, StoreError> {
        self.check_read()?;
        let rows = self
            .requests
            .iter()
            .filter(|r| filter.matches(r.value()))
            .map(|r| r.value().clone())
            .collect();
        Ok(sorted(rows, |r: &AssistanceRequest| r.id.clone()))
    }

    async fn list_assignments(&self, filter: &AssignmentFilter) -> Result<Vec<Assignment>, StoreError> {
        self.check_read()?;
        let rows = self
            .assignments
            .iter()
            .filter(|a| filter.matches(a.value()))
            .map(|a| a.value().clone())
            .collect();
        Ok(sorted(rows, |a: &Assignment| a.id.clone()))
    }

    async fn list_profiles(&self) -> Result<Vec<VolunteerProfile>, StoreError> {
        self.check_read()?;
        let rows = self.profiles.iter().map(|p| p.value().clone()).collect();
        Ok(sorted(rows, |p: &VolunteerProfile| p.id.clone()))
    }

    async fn get_request(&self, id: &str) -> Result<Option<AssistanceRequest>, StoreError> {
        self.check_read()?;
        Ok(self.requests.get(id).map(|r| r.value().clone()))
    }

    async fn get_assignment(&self, id: &str) -> Result<Option<Assignment>, StoreError> {
        self.check_read()?;
        Ok(self.assignments.get(id).map(|a| a.value().clone()))
    }

    async fn get_profile(&self, id: &str) -> Result<Option<VolunteerProfile>, StoreError> {
        self.check_read()?;
        Ok(self.profiles.get(id).map(|p| p.value().clone()))
    }

    async fn conditional_update(
        &self,
        table: Table,
        id: &str,
        expected_version: u64,
        patch: &Patch,
    ) -> Result<UpdateOutcome, StoreError> {
        if patch.table() != table {
            return Err(StoreError::PatchMismatch {
                table,
                patch: patch.table(),
            });
        }
        if Self::take_failure(&self.failing_updates) {
            return Err(StoreError::Transient("injected update failure".to_string()));
        }

        let outcome = match patch {
            Patch::Request(p) => match self.requests.get_mut(id) {
                None => UpdateOutcome::Conflict { current: None },
                Some(row) if row.version != expected_version => UpdateOutcome::Conflict {
                    current: Some(row.version),
                },
                Some(mut row) => {
                    p.apply(&mut row);
                    row.version += 1;
                    UpdateOutcome::Applied { version: row.version }
                }
            },
            Patch::Assignment(p) => match self.assignments.get_mut(id) {
                None => UpdateOutcome::Conflict { current: None },
                Some(row) if row.version != expected_version => UpdateOutcome::Conflict {
                    current: Some(row.version),
                },
                Some(mut row) => {
                    p.apply(&mut row);
                    row.version += 1;
                    UpdateOutcome::Applied { version: row.version }
                }
            },
            Patch::Profile(p) => match self.profiles.get_mut(id) {
                None => UpdateOutcome::Conflict { current: None },
                Some(row) if row.version != expected_version => UpdateOutcome::Conflict {
                    current: Some(row.version),
                },
                Some(mut row) => {
                    p.apply(&mut row);
                    row.version += 1;
                    UpdateOutcome::Applied { version: row.version }
                }
            },
        };

        if outcome.is_applied() {
            self.applied_updates.fetch_add(1, Ordering::SeqCst);
        }
        trace!(%table, id, expected_version, ?outcome, "Conditional update");
        Ok(outcome)
    }

    async fn insert_request(&self, request: AssistanceRequest) -> Result<(), StoreError> {
        match self.requests.entry(request.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate {
                table: Table::Requests,
                id: request.id,
            }),
            Entry::Vacant(slot) => {
                slot.insert(request);
                Ok(())
            }
        }
    }

    async fn insert_assignment(&self, assignment: Assignment) -> Result<(), StoreError> {
        match self.assignments.entry(assignment.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate {
                table: Table::Assignments,
                id: assignment.id,
            }),
            Entry::Vacant(slot) => {
                slot.insert(assignment);
                Ok(())
            }
        }
    }

    async fn insert_profile(&self, profile: VolunteerProfile) -> Result<(), StoreError> {
        match self.profiles.entry(profile.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate {
                table: Table::Profiles,
                id: profile.id,
            }),
            Entry::Vacant(slot) => {
                slot.insert(profile);
                Ok(())
            }
        }
    }

    async fn delete_request(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.requests.remove(id).is_some())
    }
}
