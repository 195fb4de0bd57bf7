use crate::state::AppState;
use crate::utils::error::ApiError;
use axum::{extract::Extension, Json};
use serde::Serialize;
use serde_json::json;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness covers the relational store; the model endpoints are allowed
/// to be down (queries degrade, ingestion retries).
pub async fn readiness_check(
    Extension(state): Extension<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state.session.try_current().await;
    Ok(Json(json!({
        "status": "ready",
        "active_project": session.map(|s| s.project_name),
    })))
}

pub async fn get_status(
    Extension(state): Extension<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state.session.try_current().await;
    let last_run_failed = state
        .scheduler
        .as_ref()
        .map(|s| s.last_run_failed())
        .unwrap_or(false);

    Ok(Json(json!({
        "success": true,
        "session": session,
        "sync": {
            "enabled": state.settings.sync.enabled,
            "last_run_failed": last_run_failed,
            "repositories": state.settings.repositories.iter()
                .map(|r| r.name.clone())
                .collect::<Vec<_>>(),
        },
        "doc_types": state.session_service.list_doc_types().len(),
    })))
}

pub async fn get_metrics(
    Extension(state): Extension<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    Ok(Json(json!({
        "success": true,
        "embedding_cache": state.embedding_cache.stats(),
        "rate_limiter_buckets": state.rate_limiter.bucket_count(),
        "pending_events": state.event_bus.pending(),
    })))
}
