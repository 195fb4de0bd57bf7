use crate::state::AppState;
use crate::utils::error::ApiError;
use axum::{extract::Extension, Json};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct ActivateRequest {
    pub config_path: String,
    pub branch_name: String,
}

#[derive(Debug, Serialize)]
pub struct ActivateResponse {
    pub success: bool,
    pub project_name: String,
    pub branch_name: String,
    pub path_hash: String,
    pub tenant: String,
}

pub async fn activate_project_handler(
    Extension(state): Extension<AppState>,
    Json(request): Json<ActivateRequest>,
) -> Result<Json<ActivateResponse>, ApiError> {
    state.check_rate_limit("activate_project")?;

    let context = state
        .session_service
        .activate_project(&request.config_path, &request.branch_name)
        .await?;
    let tenant = context.tenant_key();

    // A locally-backed tenant gets a live watcher on its working tree;
    // re-activation replaces the previous one.
    if let Some(watcher) = &state.watcher {
        let root = PathBuf::from(&context.repo_path);
        let handle = watcher
            .clone()
            .spawn(root, tenant.clone(), state.shutdown.clone());
        let mut slot = state.watcher_task.lock();
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
        info!(tenant = %tenant, "File watcher attached to activated project");
    }

    Ok(Json(ActivateResponse {
        success: true,
        project_name: context.project_name,
        branch_name: context.active_branch,
        path_hash: context.path_hash,
        tenant: tenant.short(),
    }))
}
