use crate::document::PromotionLevel;
use crate::services::rag_service::{QueryOptions, RagAnswer, RagService};
use crate::state::AppState;
use crate::utils::error::ApiError;
use axum::{extract::Extension, Json};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct RagQueryRequest {
    pub query: String,
    pub max_chunks: Option<usize>,
    pub graph_hops: Option<usize>,
    pub min_score: Option<f32>,
    pub promotion_floor: Option<PromotionLevel>,
}

#[derive(Debug, Serialize)]
pub struct RagQueryResponse {
    pub success: bool,
    #[serde(flatten)]
    pub answer: RagAnswer,
}

impl RagQueryRequest {
    fn options(&self) -> QueryOptions {
        QueryOptions {
            max_chunks: self.max_chunks,
            graph_hops: self.graph_hops,
            min_score: self.min_score,
            promotion_floor: self.promotion_floor,
        }
    }
}

pub async fn rag_query_handler(
    Extension(state): Extension<AppState>,
    Json(request): Json<RagQueryRequest>,
) -> Result<Json<RagQueryResponse>, ApiError> {
    state.check_rate_limit("rag_query")?;
    let tenant = state.session.require_tenant().await?;

    info!(tenant = %tenant, query = %request.query, "RAG query");
    let answer = state
        .rag
        .query(&request.query, request.options(), &tenant)
        .await?;

    Ok(Json(RagQueryResponse {
        success: true,
        answer,
    }))
}

/// Answers from the shared external documentation scope.
pub async fn rag_query_external_handler(
    Extension(state): Extension<AppState>,
    Json(request): Json<RagQueryRequest>,
) -> Result<Json<RagQueryResponse>, ApiError> {
    state.check_rate_limit("rag_query_external")?;
    let tenant = RagService::external_tenant();

    let answer = state
        .rag
        .query(&request.query, request.options(), &tenant)
        .await?;

    Ok(Json(RagQueryResponse {
        success: true,
        answer,
    }))
}
