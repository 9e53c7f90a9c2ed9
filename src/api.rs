//! Operator HTTP API
//!
//! - `GET  /health` - liveness
//! - `GET  /api/status` - scheduler status
//! - `GET  /api/report` - anomaly counts, unrepairable anomalies, last pass
//! - `POST /api/pass` - run a consistency pass now
//! - `GET  /api/metrics/auto-assignment?window_hours=N`
//! - `GET  /api/audit?limit=N` - most recent repair attempts

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::audit::AuditEntry;
use crate::metrics::{MetricsWindow, SuccessRate};
use crate::report::{HealthReport, PassSummary};
use crate::scheduler::SchedulerStatus;
use crate::service::RepairService;

pub type SharedService = Arc<RepairService>;

const DEFAULT_AUDIT_LIMIT: usize = 50;
const MAX_AUDIT_LIMIT: usize = 1000;

pub fn create_router(service: SharedService) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(api_status))
        .route("/api/report", get(api_report))
        .route("/api/pass", post(api_run_pass))
        .route("/api/metrics/auto-assignment", get(api_auto_assignment_rate))
        .route("/api/audit", get(api_audit))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// Serve the API until `shutdown` resolves
pub async fn serve(
    service: SharedService,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Operator API listening");

    axum::serve(listener, create_router(service))
        .with_graceful_shutdown(shutdown)
        .await
}

fn unavailable(e: impl std::fmt::Display) -> (StatusCode, String) {
    (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
}

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    "OK"
}

/// GET /api/status
pub async fn api_status(State(service): State<SharedService>) -> Json<SchedulerStatus> {
    Json(service.scheduler().status().await)
}

/// GET /api/report
pub async fn api_report(
    State(service): State<SharedService>,
) -> Result<Json<HealthReport>, (StatusCode, String)> {
    service
        .scheduler()
        .health_report()
        .await
        .map(Json)
        .map_err(unavailable)
}

/// POST /api/pass
pub async fn api_run_pass(
    State(service): State<SharedService>,
) -> Result<Json<PassSummary>, (StatusCode, String)> {
    service
        .scheduler()
        .run_consistency_pass()
        .await
        .map(Json)
        .map_err(unavailable)
}

#[derive(Debug, Default, Deserialize)]
pub struct RateQuery {
    pub window_hours: Option<i64>,
}

/// GET /api/metrics/auto-assignment
pub async fn api_auto_assignment_rate(
    State(service): State<SharedService>,
    Query(query): Query<RateQuery>,
) -> Result<Json<SuccessRate>, (StatusCode, String)> {
    let window = match query.window_hours {
        Some(hours) if hours <= 0 => {
            return Err((
                StatusCode::BAD_REQUEST,
                "window_hours must be positive".to_string(),
            ))
        }
        Some(hours) => Some(MetricsWindow::last_hours(hours)),
        None => None,
    };

    service
        .metrics()
        .auto_assignment_success_rate(window)
        .await
        .map(Json)
        .map_err(unavailable)
}

#[derive(Debug, Default, Deserialize)]
pub struct AuditQuery {
    pub limit: Option<usize>,
}

/// GET /api/audit
pub async fn api_audit(
    State(service): State<SharedService>,
    Query(query): Query<AuditQuery>,
) -> Json<Vec<AuditEntry>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_AUDIT_LIMIT)
        .min(MAX_AUDIT_LIMIT);
    Json(service.audit().recent(limit).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, StoreBackend};
    use crate::models::*;
    use crate::store::StoreAdapter;
    use chrono::Utc;

    async fn service_with_orphan() -> SharedService {
        let mut config = Config::default();
        config.store.backend = StoreBackend::Memory;
        config.repair.retry_backoff_ms = 0;
        let service = RepairService::open(config).unwrap();
        service
            .store()
            .insert_assignment(Assignment::new("a1", "gone", "v1", "p1", Utc::now()))
            .await
            .unwrap();
        Arc::new(service)
    }

    #[tokio::test]
    async fn test_pass_then_audit() {
        let service = service_with_orphan().await;

        let Json(report) = api_report(State(service.clone())).await.unwrap();
        assert_eq!(report.total_anomalies, 1);

        let Json(pass) = api_run_pass(State(service.clone())).await.unwrap();
        assert_eq!(pass.repaired, 1);

        let Json(entries) = api_audit(State(service.clone()), Query(AuditQuery::default())).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].assignment_ids, vec!["a1"]);

        let Json(status) = api_status(State(service)).await;
        assert_eq!(status.passes_run, 1);
    }

    #[tokio::test]
    async fn test_pass_runs_on_spawned_task() {
        let service = service_with_orphan().await;

        let pass = tokio::spawn({
            let service = service.clone();
            async move { service.scheduler().run_consistency_pass().await }
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(pass.repaired, 1);
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let service = service_with_orphan().await;
        let _router = create_router(service.clone());

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let handle = tokio::spawn(serve(service, addr, async {
            let _ = rx.await;
        }));

        tx.send(()).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_rate_rejects_non_positive_window() {
        let service = service_with_orphan().await;
        let query = RateQuery { window_hours: Some(0) };

        let err = api_auto_assignment_rate(State(service), Query(query))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_rate_with_window() {
        let service = service_with_orphan().await;
        service
            .store()
            .insert_request(AssistanceRequest::new("r1", "p1", AssignmentMethod::Auto, Utc::now()))
            .await
            .unwrap();

        let query = RateQuery { window_hours: Some(1) };
        let Json(rate) = api_auto_assignment_rate(State(service), Query(query)).await.unwrap();
        assert_eq!(rate.auto_pending, 1);
        assert_eq!(rate.rate, 0);
        assert!(rate.window.is_some());
    }
}
