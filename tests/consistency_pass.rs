//! End-to-end consistency passes against the in-memory and SQLite stores
//!
//! Covers:
//! - auto-assignment success rate with manual work mixed in
//! - duplicate, orphan, inactive volunteer and stale repairs
//! - idempotence, overlapping passes, dry run and disabled policies

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tempfile::TempDir;

use assignment_repair::checker::AnomalyKind;
use assignment_repair::config::{Config, StoreBackend};
use assignment_repair::models::*;
use assignment_repair::{MemoryStore, MetricsWindow, RepairService, SqliteStore, StoreAdapter};

fn ago(minutes: i64) -> DateTime<Utc> {
    Utc::now() - Duration::minutes(minutes)
}

fn config() -> Config {
    let mut config = Config::default();
    config.store.backend = StoreBackend::Memory;
    config.repair.retry_backoff_ms = 0;
    config
}

fn service(store: Arc<MemoryStore>) -> RepairService {
    RepairService::new(store, config())
}

fn request(id: &str, method: AssignmentMethod, status: LifecycleStatus) -> AssistanceRequest {
    AssistanceRequest::new(id, format!("pilgrim-{}", id), method, ago(120)).with_status(status, ago(60))
}

fn assignment(id: &str, request_id: &str, volunteer: &str, status: LifecycleStatus, at: DateTime<Utc>) -> Assignment {
    Assignment::new(id, request_id, volunteer, format!("pilgrim-{}", request_id), at).with_status(status)
}

async fn active_volunteers(store: &dyn StoreAdapter, ids: &[&str]) {
    for id in ids {
        store
            .insert_profile(VolunteerProfile::new(*id, VolunteerStatus::Active))
            .await
            .unwrap();
    }
}

// =============================================================================
// Metrics
// =============================================================================

async fn seed_rate_scenario(store: &dyn StoreAdapter) {
    active_volunteers(store, &["v1"]).await;

    for i in 0..10 {
        let id = format!("auto-done-{}", i);
        store
            .insert_request(request(&id, AssignmentMethod::Auto, LifecycleStatus::Resolved))
            .await
            .unwrap();
        store
            .insert_assignment(
                assignment(&format!("a-{}", id), &id, "v1", LifecycleStatus::Resolved, ago(90))
                    .completed(ago(60)),
            )
            .await
            .unwrap();
    }
    for i in 0..3 {
        store
            .insert_request(request(&format!("auto-open-{}", i), AssignmentMethod::Auto, LifecycleStatus::Pending))
            .await
            .unwrap();
    }
    for i in 0..5 {
        let id = format!("manual-done-{}", i);
        store
            .insert_request(request(&id, AssignmentMethod::Manual, LifecycleStatus::Resolved))
            .await
            .unwrap();
        store
            .insert_assignment(
                assignment(&format!("a-{}", id), &id, "v1", LifecycleStatus::Resolved, ago(90))
                    .completed(ago(60)),
            )
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_success_rate_excludes_manual_requests() {
    let store = Arc::new(MemoryStore::new());
    seed_rate_scenario(&*store).await;
    let service = service(store.clone());

    let rate = service.metrics().auto_assignment_success_rate(None).await.unwrap();
    assert_eq!(rate.auto_resolved, 10);
    assert_eq!(rate.auto_pending, 3);
    assert_eq!(rate.rate, 77);

    // The data set is consistent; a pass changes nothing
    let pass = service.scheduler().run_consistency_pass().await.unwrap();
    assert_eq!(pass.anomalies_found, 0);
    assert_eq!(store.applied_updates(), 0);
}

#[tokio::test]
async fn test_success_rate_on_sqlite() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteStore::open(&dir.path().join("rate.db")).unwrap());
    seed_rate_scenario(&*store).await;

    let service = RepairService::new(store, config());
    let rate = service.metrics().auto_assignment_success_rate(None).await.unwrap();
    assert_eq!(rate.rate, 77);
}

#[tokio::test]
async fn test_success_rate_window() {
    let store = Arc::new(MemoryStore::new());
    store
        .insert_request(
            AssistanceRequest::new("old", "p1", AssignmentMethod::Auto, ago(60 * 48)),
        )
        .await
        .unwrap();
    store
        .insert_request(AssistanceRequest::new("new", "p2", AssignmentMethod::Auto, ago(30)))
        .await
        .unwrap();
    let service = service(store);

    let all = service.metrics().auto_assignment_success_rate(None).await.unwrap();
    assert_eq!(all.auto_pending, 2);

    let recent = service
        .metrics()
        .auto_assignment_success_rate(Some(MetricsWindow::last(Duration::hours(24))))
        .await
        .unwrap();
    assert_eq!(recent.auto_pending, 1);

    let earlier = service
        .metrics()
        .auto_assignment_success_rate(Some(MetricsWindow::between(ago(60 * 72), ago(60 * 24))))
        .await
        .unwrap();
    assert_eq!(earlier.auto_pending, 1);
}

#[tokio::test]
async fn test_resolved_request_without_resolved_assignment_is_not_counted() {
    let store = Arc::new(MemoryStore::new());
    store
        .insert_request(request("r1", AssignmentMethod::Auto, LifecycleStatus::Resolved))
        .await
        .unwrap();
    store
        .insert_request(request("r2", AssignmentMethod::Auto, LifecycleStatus::InProgress))
        .await
        .unwrap();

    let rate = service(store)
        .metrics()
        .auto_assignment_success_rate(None)
        .await
        .unwrap();
    assert_eq!(rate.auto_resolved, 0);
    assert_eq!(rate.auto_pending, 1);
    assert_eq!(rate.rate, 0);
}

// =============================================================================
// Repairs
// =============================================================================

#[tokio::test]
async fn test_duplicate_keeps_most_recent() {
    let store = Arc::new(MemoryStore::new());
    active_volunteers(&*store, &["v1", "v2"]).await;
    store
        .insert_request(request("r1", AssignmentMethod::Auto, LifecycleStatus::InProgress))
        .await
        .unwrap();
    store
        .insert_assignment(assignment("a-t1", "r1", "v1", LifecycleStatus::InProgress, ago(30)))
        .await
        .unwrap();
    store
        .insert_assignment(assignment("a-t2", "r1", "v2", LifecycleStatus::Pending, ago(20)))
        .await
        .unwrap();

    let pass = service(store.clone()).scheduler().run_consistency_pass().await.unwrap();
    assert_eq!(pass.by_kind[&AnomalyKind::DuplicateActiveAssignment], 1);
    assert_eq!(pass.repaired, 1);

    let older = store.get_assignment("a-t1").await.unwrap().unwrap();
    let newer = store.get_assignment("a-t2").await.unwrap().unwrap();
    assert_eq!(older.status, LifecycleStatus::Cancelled);
    assert_eq!(newer.status, LifecycleStatus::Pending);
    assert_eq!(newer.version, 1);
}

#[tokio::test]
async fn test_orphan_cancelled_without_request_write() {
    let store = Arc::new(MemoryStore::new());
    active_volunteers(&*store, &["v1"]).await;
    store
        .insert_request(request("r1", AssignmentMethod::Auto, LifecycleStatus::InProgress))
        .await
        .unwrap();
    store
        .insert_assignment(assignment("a1", "r1", "v1", LifecycleStatus::InProgress, ago(10)))
        .await
        .unwrap();
    assert!(store.delete_request("r1").await.unwrap());

    let pass = service(store.clone()).scheduler().run_consistency_pass().await.unwrap();
    assert_eq!(pass.by_kind[&AnomalyKind::OrphanAssignment], 1);
    assert_eq!(pass.repaired, 1);

    assert_eq!(store.applied_updates(), 1);
    assert!(store.get_request("r1").await.unwrap().is_none());
    let orphan = store.get_assignment("a1").await.unwrap().unwrap();
    assert_eq!(orphan.status, LifecycleStatus::Cancelled);
}

#[tokio::test]
async fn test_inactive_volunteer_releases_request() {
    let store = Arc::new(MemoryStore::new());
    store
        .insert_profile(VolunteerProfile::new("v-gone", VolunteerStatus::Inactive))
        .await
        .unwrap();
    store
        .insert_request(request("r1", AssignmentMethod::Auto, LifecycleStatus::InProgress))
        .await
        .unwrap();
    store
        .insert_assignment(assignment("a1", "r1", "v-gone", LifecycleStatus::InProgress, ago(10)))
        .await
        .unwrap();

    let pass = service(store.clone()).scheduler().run_consistency_pass().await.unwrap();
    assert_eq!(pass.by_kind[&AnomalyKind::InactiveVolunteerHoldingAssignment], 1);

    let held = store.get_assignment("a1").await.unwrap().unwrap();
    let released = store.get_request("r1").await.unwrap().unwrap();
    assert_eq!(held.status, LifecycleStatus::Cancelled);
    assert_eq!(released.status, LifecycleStatus::Pending);
    assert_eq!(released.resolved_at, None);
}

#[tokio::test]
async fn test_stale_assignment_released_and_audited() {
    let store = Arc::new(MemoryStore::new());
    active_volunteers(&*store, &["v1"]).await;
    store
        .insert_request(request("r1", AssignmentMethod::Auto, LifecycleStatus::InProgress))
        .await
        .unwrap();
    store
        .insert_assignment(assignment("a1", "r1", "v1", LifecycleStatus::InProgress, ago(5 * 60)))
        .await
        .unwrap();

    let service = service(store.clone());
    let pass = service.scheduler().run_consistency_pass().await.unwrap();
    assert_eq!(pass.by_kind[&AnomalyKind::StaleActiveAssignment], 1);

    let entries = service.audit().recent(10).await;
    assert_eq!(entries.len(), 1);
    match &entries[0].outcome {
        assignment_repair::RepairOutcome::Repaired { writes, detail } => {
            assert_eq!(*writes, 2);
            assert!(detail.as_deref().is_some_and(|d| d.starts_with("stale for ")));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    let request = store.get_request("r1").await.unwrap().unwrap();
    assert_eq!(request.status, LifecycleStatus::Pending);
}

#[tokio::test]
async fn test_desync_directions() {
    let store = Arc::new(MemoryStore::new());
    active_volunteers(&*store, &["v1"]).await;

    // Request resolved, assignment still running
    store
        .insert_request(request("r-done", AssignmentMethod::Auto, LifecycleStatus::Resolved))
        .await
        .unwrap();
    store
        .insert_assignment(assignment("a-done", "r-done", "v1", LifecycleStatus::InProgress, ago(90)))
        .await
        .unwrap();

    // Assignment resolved, request lagging
    store
        .insert_request(request("r-lag", AssignmentMethod::Auto, LifecycleStatus::InProgress))
        .await
        .unwrap();
    store
        .insert_assignment(
            assignment("a-lag", "r-lag", "v1", LifecycleStatus::Resolved, ago(90)).completed(ago(15)),
        )
        .await
        .unwrap();

    // Assignment cancelled under an in-progress request
    store
        .insert_request(request("r-drop", AssignmentMethod::Auto, LifecycleStatus::InProgress))
        .await
        .unwrap();
    store
        .insert_assignment(assignment("a-drop", "r-drop", "v1", LifecycleStatus::Cancelled, ago(90)))
        .await
        .unwrap();

    let service = service(store.clone());
    let pass = service.scheduler().run_consistency_pass().await.unwrap();
    assert_eq!(pass.by_kind[&AnomalyKind::StatusDesync], 3);
    assert_eq!(pass.repaired, 3);

    let a_done = store.get_assignment("a-done").await.unwrap().unwrap();
    assert_eq!(a_done.status, LifecycleStatus::Resolved);
    assert!(a_done.completed_at.is_some());

    let r_lag = store.get_request("r-lag").await.unwrap().unwrap();
    assert_eq!(r_lag.status, LifecycleStatus::Resolved);
    assert!(r_lag.resolved_at.is_some());

    let r_drop = store.get_request("r-drop").await.unwrap().unwrap();
    assert_eq!(r_drop.status, LifecycleStatus::Pending);

    // No ping-pong
    assert!(service.scheduler().detect().await.unwrap().is_empty());
}

// =============================================================================
// Idempotence and concurrency
// =============================================================================

#[tokio::test]
async fn test_repeated_repair_does_not_write_again() {
    let store = Arc::new(MemoryStore::new());
    assignment_repair::demo::seed_demo(&*store, Utc::now()).await.unwrap();
    let service = service(store.clone());

    let anomalies = service.scheduler().detect().await.unwrap();
    assert!(!anomalies.is_empty());

    for anomaly in &anomalies {
        assert!(service.scheduler().engine().repair(anomaly).await.is_repaired());
    }
    let writes = store.applied_updates();

    for anomaly in &anomalies {
        assert!(service.scheduler().engine().repair(anomaly).await.is_skipped());
    }
    assert_eq!(store.applied_updates(), writes);

    let pass = service.scheduler().run_consistency_pass().await.unwrap();
    assert_eq!(pass.anomalies_found, 0);
    assert_eq!(store.applied_updates(), writes);
}

#[tokio::test]
async fn test_overlapping_passes_write_once() {
    let store = Arc::new(MemoryStore::new());
    assignment_repair::demo::seed_demo(&*store, Utc::now()).await.unwrap();

    // Two services over one store behave like two engine replicas
    let first = service(store.clone());
    let second = service(store.clone());

    let (a, b) = tokio::join!(
        first.scheduler().run_consistency_pass(),
        second.scheduler().run_consistency_pass()
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    // Each anomaly is repaired by exactly one of the passes, or not found
    // by the slower one at all
    assert_eq!(a.failed + b.failed, 0);
    assert!(a.repaired + b.repaired >= 5);
    assert!(first.scheduler().detect().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_pass_settles_follow_on_desync() {
    let store = Arc::new(MemoryStore::new());
    active_volunteers(&*store, &["v1"]).await;
    store
        .insert_profile(VolunteerProfile::new("v2", VolunteerStatus::Inactive))
        .await
        .unwrap();

    // r1: an older pending assignment held by an inactive volunteer sits
    // under a newer resolved one
    store
        .insert_request(request("r1", AssignmentMethod::Auto, LifecycleStatus::InProgress))
        .await
        .unwrap();
    store
        .insert_assignment(assignment("a1", "r1", "v1", LifecycleStatus::Resolved, ago(30)).completed(ago(20)))
        .await
        .unwrap();
    store
        .insert_assignment(assignment("a2", "r1", "v2", LifecycleStatus::Pending, ago(120)))
        .await
        .unwrap();
    // r2: a desync present from the start
    store
        .insert_request(request("r2", AssignmentMethod::Auto, LifecycleStatus::Resolved))
        .await
        .unwrap();
    store
        .insert_assignment(assignment("a3", "r2", "v1", LifecycleStatus::InProgress, ago(90)))
        .await
        .unwrap();
    let service = service(store.clone());

    let before = service.scheduler().detect().await.unwrap();
    let kinds: Vec<AnomalyKind> = before.iter().map(|a| a.kind()).collect();
    assert_eq!(
        kinds,
        vec![AnomalyKind::StatusDesync, AnomalyKind::InactiveVolunteerHoldingAssignment]
    );

    let pass = service.scheduler().run_consistency_pass().await.unwrap();
    assert_eq!(pass.rounds, 2);
    assert_eq!(pass.anomalies_found, 3);
    assert_eq!(pass.repaired, 3);
    assert_eq!(pass.by_kind[&AnomalyKind::StatusDesync], 2);

    assert!(service.scheduler().detect().await.unwrap().is_empty());
    let r1 = store.get_request("r1").await.unwrap().unwrap();
    assert_eq!(r1.status, LifecycleStatus::Resolved);
    assert_eq!(r1.resolved_at, Some(store.get_assignment("a1").await.unwrap().unwrap().completed_at.unwrap()));
}

#[tokio::test]
async fn test_partial_repair_finished_next_pass() {
    let store = Arc::new(MemoryStore::new());
    active_volunteers(&*store, &["v1"]).await;
    store
        .insert_request(request("r1", AssignmentMethod::Auto, LifecycleStatus::InProgress))
        .await
        .unwrap();
    store
        .insert_assignment(assignment("a1", "r1", "v1", LifecycleStatus::InProgress, ago(6 * 60)))
        .await
        .unwrap();
    let service = service(store.clone());

    let anomalies = service.scheduler().detect().await.unwrap();
    assert_eq!(anomalies.len(), 1);

    // Application traffic touches the request after detection
    store
        .conditional_update(
            Table::Requests,
            "r1",
            1,
            &Patch::Request(RequestPatch {
                status: Some(LifecycleStatus::InProgress),
                resolved_at: None,
            }),
        )
        .await
        .unwrap();

    assert!(service.scheduler().engine().repair(&anomalies[0]).await.is_skipped());

    // The cancelled assignment now disagrees with its in-progress request
    let remaining = service.scheduler().detect().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].kind(), AnomalyKind::StatusDesync);

    service.scheduler().run_consistency_pass().await.unwrap();
    let request = store.get_request("r1").await.unwrap().unwrap();
    assert_eq!(request.status, LifecycleStatus::Pending);
    assert!(service.scheduler().detect().await.unwrap().is_empty());
}

// =============================================================================
// Configuration-driven behavior
// =============================================================================

#[tokio::test]
async fn test_dry_run_reports_but_does_not_write() {
    let store = Arc::new(MemoryStore::new());
    assignment_repair::demo::seed_demo(&*store, Utc::now()).await.unwrap();

    let mut config = config();
    config.repair.dry_run = true;
    let service = RepairService::new(store.clone(), config);

    let pass = service.scheduler().run_consistency_pass().await.unwrap();
    assert!(pass.dry_run);
    assert_eq!(pass.skipped, pass.anomalies_found);
    assert_eq!(store.applied_updates(), 0);
    assert_eq!(service.audit().len().await, pass.anomalies_found);
}

#[tokio::test]
async fn test_disabled_policy_is_unrepairable() {
    let store = Arc::new(MemoryStore::new());
    assignment_repair::demo::seed_demo(&*store, Utc::now()).await.unwrap();

    let mut config = config();
    config.repair.disabled_kinds = vec![AnomalyKind::StaleActiveAssignment];
    let service = RepairService::new(store.clone(), config);

    let pass = service.scheduler().run_consistency_pass().await.unwrap();
    assert_eq!(pass.failed, 1);
    assert_eq!(pass.unrepairable.len(), 1);
    assert_eq!(pass.unrepairable[0].kind, AnomalyKind::StaleActiveAssignment);

    let report = service.scheduler().health_report().await.unwrap();
    assert_eq!(report.total_anomalies, 1);
    assert_eq!(report.unrepairable.len(), 1);
    assert!(report.to_string().contains("Unrepairable: 1"));
}

#[tokio::test]
async fn test_full_pass_on_sqlite() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("assignments.db");

    {
        let store = SqliteStore::open(&path).unwrap();
        assignment_repair::demo::seed_demo(&store, Utc::now()).await.unwrap();
    }

    let mut config = config();
    config.store.backend = StoreBackend::Sqlite;
    config.store.path = path.clone();
    let service = RepairService::open(config).unwrap();

    let pass = service.scheduler().run_consistency_pass().await.unwrap();
    assert_eq!(pass.anomalies_found, 5);
    assert_eq!(pass.repaired, 5);

    // Reopen: repairs were persisted
    let store = SqliteStore::open(&path).unwrap();
    let orphan = store.get_assignment("demo-asg-03").await.unwrap().unwrap();
    assert_eq!(orphan.status, LifecycleStatus::Cancelled);
    assert_eq!(orphan.version, 2);
}
