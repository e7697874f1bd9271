use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::{ApiError, AppState};
use crate::models::ModelSummary;
use crate::naming::{FitId, FitName, ModelId, operation_id};
use crate::operations::{FitRequest, Operation};
use crate::storage;
use crate::toolchain::ParamInfo;

#[derive(Debug, Deserialize)]
pub struct CreateModelRequest {
    #[serde(alias = "source_text")]
    pub program_code: String,
}

#[derive(Debug, Serialize)]
pub struct ModelList {
    pub models: Vec<ModelSummary>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ParamsRequest {
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct ParamsResponse {
    pub name: String,
    pub params: Vec<ParamInfo>,
}

pub async fn health() -> &'static str {
    "fitserve is running\n"
}

pub async fn create_model(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateModelRequest>,
) -> Result<(StatusCode, Json<ModelSummary>), ApiError> {
    let summary = state.models.compile(&request.program_code).await?;
    Ok((StatusCode::CREATED, Json(summary)))
}

pub async fn list_models(State(state): State<Arc<AppState>>) -> Result<Json<ModelList>, ApiError> {
    let models = state.models.list().await?;
    Ok(Json(ModelList { models }))
}

pub async fn delete_model(
    State(state): State<Arc<AppState>>,
    Path(model_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = ModelId::parse(&model_id)?;
    state.models.delete(&id).await?;
    info!(model = %id, "Deleted model");
    Ok(Json(serde_json::json!({})))
}

pub async fn model_params(
    State(state): State<Arc<AppState>>,
    Path(model_id): Path<String>,
    Json(request): Json<ParamsRequest>,
) -> Result<Json<ParamsResponse>, ApiError> {
    let id = ModelId::parse(&model_id)?;
    let data = request.data.unwrap_or_else(|| Value::Object(Default::default()));
    let params = state.models.params(&id, data).await?;
    Ok(Json(ParamsResponse {
        name: id.name(),
        params,
    }))
}

/// Always `201`: a failing fit is reported through its operation.
pub async fn create_fit(
    State(state): State<Arc<AppState>>,
    Path(model_id): Path<String>,
    Json(request): Json<FitRequest>,
) -> Result<(StatusCode, Json<Operation>), ApiError> {
    let id = ModelId::parse(&model_id)?;
    let operation = state.operations.start_fit(&id, request).await?;
    Ok((StatusCode::CREATED, Json(operation)))
}

pub async fn get_fit(
    State(state): State<Arc<AppState>>,
    Path((model_id, fit_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let name = FitName::new(ModelId::parse(&model_id)?, FitId::parse(&fit_id)?);
    let cache = state.cache.clone();
    let stream = storage::blocking(move || cache.get_fit(&name)).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        stream,
    ))
}

pub async fn delete_fit(
    State(state): State<Arc<AppState>>,
    Path((model_id, fit_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let name = FitName::new(ModelId::parse(&model_id)?, FitId::parse(&fit_id)?);
    let cache = state.cache.clone();
    let deleted = name.clone();
    storage::blocking(move || cache.delete_fit(&deleted)).await?;
    info!(fit = %name, "Deleted fit");
    Ok(Json(serde_json::json!({})))
}

pub async fn get_operation(
    State(state): State<Arc<AppState>>,
    Path(operation): Path<String>,
) -> Result<Json<Operation>, ApiError> {
    let id = operation_id(&operation)?;
    Ok(Json(state.operations.get_operation(&id).await?))
}

pub async fn cancel_operation(
    State(state): State<Arc<AppState>>,
    Path(operation): Path<String>,
) -> Result<Json<Operation>, ApiError> {
    let id = operation_id(&operation)?;
    Ok(Json(state.operations.cancel(&id).await?))
}
