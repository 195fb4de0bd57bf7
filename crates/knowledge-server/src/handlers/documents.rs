use crate::document::PromotionLevel;
use crate::services::indexer::IndexResult;
use crate::state::AppState;
use crate::tenant::TenantFilter;
use crate::utils::error::ApiError;
use axum::{extract::Extension, Json};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
pub struct IndexDocumentRequest {
    pub file_path: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct IndexDocumentResponse {
    pub success: bool,
    #[serde(flatten)]
    pub result: IndexResult,
}

pub async fn index_document_handler(
    Extension(state): Extension<AppState>,
    Json(request): Json<IndexDocumentRequest>,
) -> Result<Json<IndexDocumentResponse>, ApiError> {
    state.check_rate_limit("index_document")?;
    let tenant = state.session.require_tenant().await?;

    if request.file_path.trim().is_empty() {
        return Err(ApiError::InvalidArgument("file_path must not be blank".into()));
    }

    let result = state
        .indexer
        .index(&request.file_path, &request.content, &tenant, None)
        .await?;

    Ok(Json(IndexDocumentResponse {
        success: result.success,
        result,
    }))
}

#[derive(Debug, Deserialize)]
pub struct DeleteDocumentsRequest {
    pub project: String,
    pub branch: Option<String>,
    pub path_hash: Option<String>,
    /// Defaults to a dry run; counts come back before anything is removed.
    pub dry_run: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct DeleteDocumentsResponse {
    pub success: bool,
    pub dry_run: bool,
    pub documents: u64,
    pub chunks: u64,
}

pub async fn delete_documents_handler(
    Extension(state): Extension<AppState>,
    Json(request): Json<DeleteDocumentsRequest>,
) -> Result<Json<DeleteDocumentsResponse>, ApiError> {
    state.check_rate_limit("delete_documents")?;

    // Partial scopes are completed from the active session; a filter with
    // fewer than three components never reaches storage.
    let session = state.session.try_current().await;
    let branch = match request.branch {
        Some(branch) => branch,
        None => session
            .as_ref()
            .filter(|s| s.project_name == request.project)
            .map(|s| s.active_branch.clone())
            .ok_or_else(|| {
                ApiError::InvalidArgument(
                    "branch is required when the project is not the active session".into(),
                )
            })?,
    };
    let path_hash = match request.path_hash {
        Some(path_hash) => path_hash,
        None => session
            .as_ref()
            .filter(|s| s.project_name == request.project)
            .map(|s| s.path_hash.clone())
            .ok_or_else(|| {
                ApiError::InvalidArgument(
                    "path_hash is required when the project is not the active session".into(),
                )
            })?,
    };
    let filter = TenantFilter::new(&request.project, &branch, &path_hash)?;

    let documents = state
        .repository
        .count_documents(&filter)
        .await
        .map_err(|e| ApiError::StorageFailed(e.to_string()))? as u64;
    let chunks = state
        .repository
        .count_chunks(&filter)
        .await
        .map_err(|e| ApiError::StorageFailed(e.to_string()))? as u64;

    let dry_run = request.dry_run.unwrap_or(true);
    if dry_run {
        return Ok(Json(DeleteDocumentsResponse {
            success: true,
            dry_run: true,
            documents,
            chunks,
        }));
    }

    // Route every deletion through the indexer so vectors, graph nodes,
    // link-graph entries and events all cascade.
    let tenant = crate::tenant::TenantKey {
        project_name: filter.project_name.clone(),
        branch_name: filter.branch_name.clone(),
        path_hash: filter.path_hash.clone(),
    };
    let all = state
        .repository
        .get_all_documents(&filter)
        .await
        .map_err(|e| ApiError::StorageFailed(e.to_string()))?;
    let mut deleted = 0u64;
    for document in all {
        match state.indexer.delete(&tenant, &document.file_path).await {
            Ok(true) => deleted += 1,
            Ok(false) => {}
            Err(err) => {
                warn!(file_path = %document.file_path, error = %err, "Delete failed");
            }
        }
    }

    info!(tenant = %tenant, deleted, "Bulk delete completed");
    Ok(Json(DeleteDocumentsResponse {
        success: true,
        dry_run: false,
        documents: deleted,
        chunks,
    }))
}

#[derive(Debug, Deserialize)]
pub struct UpdatePromotionRequest {
    pub document_path: String,
    pub level: PromotionLevel,
}

#[derive(Debug, Serialize)]
pub struct UpdatePromotionResponse {
    pub success: bool,
    pub previous_level: String,
    pub new_level: String,
}

pub async fn update_promotion_handler(
    Extension(state): Extension<AppState>,
    Json(request): Json<UpdatePromotionRequest>,
) -> Result<Json<UpdatePromotionResponse>, ApiError> {
    state.check_rate_limit("update_promotion_level")?;
    let tenant = state.session.require_tenant().await?;

    let (previous, new) = state
        .indexer
        .set_promotion_level(&tenant, &request.document_path, request.level)
        .await?;

    Ok(Json(UpdatePromotionResponse {
        success: true,
        previous_level: previous,
        new_level: new,
    }))
}
