//! Auto-assignment success rate
//!
//! Only requests created with `assignment_method = auto` count. A request
//! marked `resolved` contributes to the numerator only if some assignment
//! actually resolved it; manual work never enters either side.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;
use crate::models::{AssignmentMethod, LifecycleStatus};
use crate::store::{AssignmentFilter, RequestFilter, StoreAdapter};

/// Longest window the operator surfaces accept, about ten years
pub const MAX_WINDOW_HOURS: i64 = 24 * 366 * 10;

/// Half-open `created_at` window: `since <= created_at < until`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsWindow {
    pub since: DateTime<Utc>,
    pub until: Option<DateTime<Utc>>,
}

impl MetricsWindow {
    pub fn since(since: DateTime<Utc>) -> Self {
        Self { since, until: None }
    }

    pub fn between(since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self {
            since,
            until: Some(until),
        }
    }

    /// The trailing `span` ending now. A span reaching past the earliest
    /// representable time covers everything.
    pub fn last(span: Duration) -> Self {
        let since = Utc::now()
            .checked_sub_signed(span)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self::since(since)
    }

    /// The trailing `hours`, capped at [`MAX_WINDOW_HOURS`]
    pub fn last_hours(hours: i64) -> Self {
        Self::last(Duration::hours(hours.min(MAX_WINDOW_HOURS)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessRate {
    /// Whole percent, 0-100
    pub rate: u32,
    pub auto_resolved: usize,
    pub auto_pending: usize,
    pub window: Option<MetricsWindow>,
}

impl SuccessRate {
    pub fn from_counts(auto_resolved: usize, auto_pending: usize) -> Self {
        let total = auto_resolved + auto_pending;
        // round half up without floats
        let rate = if total == 0 {
            0
        } else {
            ((200 * auto_resolved + total) / (2 * total)) as u32
        };
        Self {
            rate,
            auto_resolved,
            auto_pending,
            window: None,
        }
    }
}

/// Read-only metrics over the store
pub struct MetricsEngine {
    store: Arc<dyn StoreAdapter>,
}

impl MetricsEngine {
    pub fn new(store: Arc<dyn StoreAdapter>) -> Self {
        Self { store }
    }

    pub async fn auto_assignment_success_rate(
        &self,
        window: Option<MetricsWindow>,
    ) -> Result<SuccessRate, StoreError> {
        let filter = RequestFilter::default()
            .method(AssignmentMethod::Auto)
            .statuses(&[
                LifecycleStatus::Pending,
                LifecycleStatus::InProgress,
                LifecycleStatus::Resolved,
            ])
            .created_between(window.map(|w| w.since), window.and_then(|w| w.until));
        let requests = self.store.list_requests(&filter).await?;

        let resolved_by_assignment: HashSet<String> = self
            .store
            .list_assignments(&AssignmentFilter::default().statuses(&[LifecycleStatus::Resolved]))
            .await?
            .into_iter()
            .map(|a| a.request_id)
            .collect();

        let mut auto_resolved = 0;
        let mut auto_pending = 0;
        let mut unverified = 0;
        for request in &requests {
            match request.status {
                LifecycleStatus::Resolved if resolved_by_assignment.contains(&request.id) => {
                    auto_resolved += 1
                }
                LifecycleStatus::Resolved => unverified += 1,
                _ => auto_pending += 1,
            }
        }

        let mut rate = SuccessRate::from_counts(auto_resolved, auto_pending);
        rate.window = window;

        debug!(
            auto_resolved,
            auto_pending,
            unverified,
            rate = rate.rate,
            "Auto-assignment success rate computed"
        );
        Ok(rate)
    }
}
