use crate::document::doc_type::DocTypeDefinition;
use crate::document::PromotionLevel;
use crate::services::session::DocTypeSummary;
use crate::state::AppState;
use crate::utils::error::ApiError;
use axum::{extract::Extension, Json};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Serialize)]
pub struct ListDocTypesResponse {
    pub success: bool,
    pub doc_types: Vec<DocTypeSummary>,
}

pub async fn list_doc_types_handler(
    Extension(state): Extension<AppState>,
) -> Result<Json<ListDocTypesResponse>, ApiError> {
    state.check_rate_limit("list_doc_types")?;
    Ok(Json(ListDocTypesResponse {
        success: true,
        doc_types: state.session_service.list_doc_types(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct RegisterDocTypeRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub trigger_phrases: Vec<String>,
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub optional_fields: Vec<String>,
    pub json_schema: Option<JsonValue>,
    pub default_promotion_level: Option<PromotionLevel>,
}

#[derive(Debug, Serialize)]
pub struct RegisterDocTypeResponse {
    pub success: bool,
    pub id: String,
}

pub async fn register_doc_type_handler(
    Extension(state): Extension<AppState>,
    Json(request): Json<RegisterDocTypeRequest>,
) -> Result<Json<RegisterDocTypeResponse>, ApiError> {
    state.check_rate_limit("register_doc_type")?;

    let definition = DocTypeDefinition {
        id: request.id,
        name: request.name,
        description: request.description,
        is_built_in: false,
        trigger_phrases: request.trigger_phrases,
        required_fields: request.required_fields,
        optional_fields: request.optional_fields,
        json_schema: request.json_schema,
        default_promotion_level: request.default_promotion_level.unwrap_or_default(),
    };

    let id = state.session_service.register_doc_type(definition).await?;
    Ok(Json(RegisterDocTypeResponse { success: true, id }))
}
