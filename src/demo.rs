//! Demonstration data set
//!
//! Seeds a store with a small event-day snapshot that exhibits every
//! anomaly kind next to some healthy rows, so a pass has real work to do.
//! Rows already present are left untouched.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::StoreError;
use crate::models::*;
use crate::store::StoreAdapter;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DemoSeed {
    pub inserted: usize,
    pub existing: usize,
}

impl DemoSeed {
    fn record(&mut self, result: Result<(), StoreError>) -> Result<(), StoreError> {
        match result {
            Ok(()) => self.inserted += 1,
            Err(StoreError::Duplicate { .. }) => self.existing += 1,
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

const HARAM_GATE: GeoPoint = GeoPoint { lat: 21.4225, lng: 39.8262 };
const MINA_CAMP: GeoPoint = GeoPoint { lat: 21.4133, lng: 39.8933 };

fn request(
    id: &str,
    pilgrim: &str,
    method: AssignmentMethod,
    category: &str,
    description: &str,
    created_at: DateTime<Utc>,
) -> AssistanceRequest {
    AssistanceRequest::new(id, pilgrim, method, created_at).with_category(category, description)
}

fn profiles(now: DateTime<Utc>) -> Vec<VolunteerProfile> {
    vec![
        VolunteerProfile::new("demo-vol-amina", VolunteerStatus::Active)
            .located(HARAM_GATE, now - Duration::minutes(2)),
        VolunteerProfile::new("demo-vol-yusuf", VolunteerStatus::Active)
            .located(MINA_CAMP, now - Duration::minutes(5)),
        VolunteerProfile::new("demo-vol-idris", VolunteerStatus::Inactive),
    ]
}

fn requests(now: DateTime<Utc>) -> Vec<AssistanceRequest> {
    use AssignmentMethod::{Auto, Manual};
    use LifecycleStatus::*;

    let ago = |minutes| now - Duration::minutes(minutes);
    vec![
        // healthy, resolved by auto matching
        request("demo-req-01", "demo-pilgrim-01", Auto, "navigation", "Lost near gate 79", ago(180))
            .with_status(Resolved, ago(150)),
        // two volunteers matched to the same request
        request("demo-req-02", "demo-pilgrim-02", Auto, "medical", "Heat exhaustion", ago(60))
            .with_status(InProgress, ago(60)),
        // request resolved but the assignment never closed
        request("demo-req-04", "demo-pilgrim-04", Auto, "lost_item", "Missing passport", ago(240))
            .with_status(Resolved, ago(200)),
        // held by a volunteer who has since gone inactive
        request("demo-req-05", "demo-pilgrim-05", Manual, "transport", "Wheelchair to Mina", ago(45))
            .with_status(InProgress, ago(45)),
        // in progress for six hours
        request("demo-req-06", "demo-pilgrim-06", Auto, "navigation", "Find camp 12", ago(400))
            .with_status(InProgress, ago(360)),
        // waiting for a match
        request("demo-req-07", "demo-pilgrim-07", Auto, "general", "Water distribution", ago(10)),
        // manual and resolved; never counts toward the auto rate
        request("demo-req-08", "demo-pilgrim-08", Manual, "medical", "Blister care", ago(300))
            .with_status(Resolved, ago(280)),
    ]
}

fn assignments(now: DateTime<Utc>) -> Vec<Assignment> {
    use LifecycleStatus::*;

    let ago = |minutes| now - Duration::minutes(minutes);
    vec![
        Assignment::new("demo-asg-01", "demo-req-01", "demo-vol-amina", "demo-pilgrim-01", ago(175))
            .with_status(Resolved)
            .completed(ago(150)),
        Assignment::new("demo-asg-02a", "demo-req-02", "demo-vol-amina", "demo-pilgrim-02", ago(55))
            .with_status(Pending),
        Assignment::new("demo-asg-02b", "demo-req-02", "demo-vol-yusuf", "demo-pilgrim-02", ago(50))
            .with_status(InProgress),
        // its request was deleted
        Assignment::new("demo-asg-03", "demo-req-03", "demo-vol-yusuf", "demo-pilgrim-03", ago(90))
            .with_status(InProgress),
        Assignment::new("demo-asg-04", "demo-req-04", "demo-vol-yusuf", "demo-pilgrim-04", ago(230))
            .with_status(InProgress),
        Assignment::new("demo-asg-05", "demo-req-05", "demo-vol-idris", "demo-pilgrim-05", ago(40))
            .with_status(InProgress),
        Assignment::new("demo-asg-06", "demo-req-06", "demo-vol-amina", "demo-pilgrim-06", ago(360))
            .with_status(InProgress),
        Assignment::new("demo-asg-08", "demo-req-08", "demo-vol-yusuf", "demo-pilgrim-08", ago(295))
            .with_status(Resolved)
            .completed(ago(280)),
    ]
}

/// Insert the demonstration rows relative to `now`
pub async fn seed_demo(store: &dyn StoreAdapter, now: DateTime<Utc>) -> Result<DemoSeed, StoreError> {
    let mut seed = DemoSeed::default();

    for profile in profiles(now) {
        seed.record(store.insert_profile(profile).await)?;
    }
    for request in requests(now) {
        seed.record(store.insert_request(request).await)?;
    }
    for assignment in assignments(now) {
        seed.record(store.insert_assignment(assignment).await)?;
    }

    info!(inserted = seed.inserted, existing = seed.existing, "Demo data seeded");
    Ok(seed)
}
