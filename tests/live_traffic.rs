//! Passes running while application traffic keeps writing
//!
//! The store wrapper lets a request and its assignment land in the middle of
//! a snapshot capture, between the collection scans.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use assignment_repair::config::{Config, StoreBackend};
use assignment_repair::error::StoreError;
use assignment_repair::models::*;
use assignment_repair::store::{AssignmentFilter, RequestFilter};
use assignment_repair::{MemoryStore, RepairService, StoreAdapter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interleave {
    AfterAssignmentScan,
    AfterRequestScan,
}

/// Creates `r-live` and `a-live` once, right after the chosen scan returns
struct InterleavingStore {
    inner: MemoryStore,
    at: Interleave,
    fired: AtomicBool,
}

impl InterleavingStore {
    fn new(at: Interleave) -> Self {
        Self {
            inner: MemoryStore::new(),
            at,
            fired: AtomicBool::new(false),
        }
    }

    async fn maybe_interleave(&self, point: Interleave) -> Result<(), StoreError> {
        if point != self.at || self.fired.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let now = Utc::now();
        self.inner
            .insert_request(
                AssistanceRequest::new("r-live", "p-live", AssignmentMethod::Auto, now)
                    .with_status(LifecycleStatus::InProgress, now),
            )
            .await?;
        self.inner
            .insert_assignment(
                Assignment::new("a-live", "r-live", "v1", "p-live", now)
                    .with_status(LifecycleStatus::InProgress),
            )
            .await
    }
}

#[async_trait]
impl StoreAdapter for InterleavingStore {
    async fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<AssistanceRequest>, StoreError> {
        let rows = self.inner.list_requests(filter).await?;
        self.maybe_interleave(Interleave::AfterRequestScan).await?;
        Ok(rows)
    }

    async fn list_assignments(&self, filter: &AssignmentFilter) -> Result<Vec<Assignment>, StoreError> {
        let rows = self.inner.list_assignments(filter).await?;
        self.maybe_interleave(Interleave::AfterAssignmentScan).await?;
        Ok(rows)
    }

    async fn list_profiles(&self) -> Result<Vec<VolunteerProfile>, StoreError> {
        self.inner.list_profiles().await
    }

    async fn get_request(&self, id: &str) -> Result<Option<AssistanceRequest>, StoreError> {
        self.inner.get_request(id).await
    }

    async fn get_assignment(&self, id: &str) -> Result<Option<Assignment>, StoreError> {
        self.inner.get_assignment(id).await
    }

    async fn get_profile(&self, id: &str) -> Result<Option<VolunteerProfile>, StoreError> {
        self.inner.get_profile(id).await
    }

    async fn conditional_update(
        &self,
        table: Table,
        id: &str,
        expected_version: u64,
        patch: &Patch,
    ) -> Result<UpdateOutcome, StoreError> {
        self.inner.conditional_update(table, id, expected_version, patch).await
    }

    async fn insert_request(&self, request: AssistanceRequest) -> Result<(), StoreError> {
        self.inner.insert_request(request).await
    }

    async fn insert_assignment(&self, assignment: Assignment) -> Result<(), StoreError> {
        self.inner.insert_assignment(assignment).await
    }

    async fn insert_profile(&self, profile: VolunteerProfile) -> Result<(), StoreError> {
        self.inner.insert_profile(profile).await
    }

    async fn delete_request(&self, id: &str) -> Result<bool, StoreError> {
        self.inner.delete_request(id).await
    }
}

fn service(store: Arc<InterleavingStore>) -> RepairService {
    let mut config = Config::default();
    config.store.backend = StoreBackend::Memory;
    config.repair.retry_backoff_ms = 0;
    RepairService::new(store, config)
}

async fn assert_live_rows_untouched(at: Interleave) {
    let store = Arc::new(InterleavingStore::new(at));
    let service = service(store.clone());

    let pass = service.scheduler().run_consistency_pass().await.unwrap();
    assert_eq!(pass.anomalies_found, 0, "{:?}", pass.by_kind);
    assert_eq!(pass.repaired, 0);

    let assignment = store.get_assignment("a-live").await.unwrap().unwrap();
    assert_eq!(assignment.status, LifecycleStatus::InProgress);
    assert_eq!(store.inner.applied_updates(), 0);

    // The next pass sees both rows and finds them consistent
    let pass = service.scheduler().run_consistency_pass().await.unwrap();
    assert_eq!(pass.anomalies_found, 0);
}

#[tokio::test]
async fn test_rows_created_between_scans_are_not_orphans() {
    assert_live_rows_untouched(Interleave::AfterAssignmentScan).await;
}

#[tokio::test]
async fn test_rows_created_after_request_scan_are_not_orphans() {
    assert_live_rows_untouched(Interleave::AfterRequestScan).await;
}
