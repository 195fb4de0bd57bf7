use crate::document::PromotionLevel;
use crate::services::rag_service::{RagService, SearchHit};
use crate::state::AppState;
use crate::utils::error::ApiError;
use axum::{extract::Extension, Json};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub top_k: Option<usize>,
    pub promotion_floor: Option<PromotionLevel>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub success: bool,
    pub results: Vec<SearchHit>,
    pub total: usize,
}

pub async fn search_handler(
    Extension(state): Extension<AppState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    state.check_rate_limit("semantic_search")?;
    let tenant = state.session.require_tenant().await?;

    info!(tenant = %tenant, query = %request.query, "Search request");
    let results = state
        .rag
        .semantic_search(
            &request.query,
            request.top_k.unwrap_or(10),
            &tenant,
            request.promotion_floor,
        )
        .await?;

    let total = results.len();
    Ok(Json(SearchResponse {
        success: true,
        results,
        total,
    }))
}

/// Read-only search against the shared external documentation index; the
/// active tenant is not consulted.
pub async fn search_external_handler(
    Extension(state): Extension<AppState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    state.check_rate_limit("search_external_docs")?;
    let tenant = RagService::external_tenant();

    let results = state
        .rag
        .semantic_search(
            &request.query,
            request.top_k.unwrap_or(10),
            &tenant,
            request.promotion_floor,
        )
        .await?;

    let total = results.len();
    Ok(Json(SearchResponse {
        success: true,
        results,
        total,
    }))
}
