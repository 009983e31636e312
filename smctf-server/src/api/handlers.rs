//! Request handlers.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use smctf_core::{CreateInput, StackError};

use crate::api::error::{ApiError, ApiResult};
use crate::api::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateStackRequest {
    #[serde(default)]
    pub pod_spec: String,
    #[serde(default)]
    pub target_port: u32,
}

pub async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn create_stack(
    State(state): State<AppState>,
    body: Result<Json<CreateStackRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(req) = body.map_err(|_| StackError::invalid_input("invalid json body"))?;

    let stack = state
        .service
        .create(CreateInput { pod_spec_yaml: req.pod_spec, target_port: req.target_port })
        .await?;

    Ok((StatusCode::CREATED, Json(json!(stack))))
}

pub async fn list_stacks(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let stacks = state.service.list_all().await?;
    Ok(Json(json!({ "stacks": stacks })))
}

pub async fn get_stack(
    State(state): State<AppState>,
    Path(stack_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let stack = state.service.get_details(&stack_id).await?;
    Ok(Json(json!(stack)))
}

pub async fn get_stack_status(
    State(state): State<AppState>,
    Path(stack_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let summary = state.service.get_status_summary(&stack_id).await?;
    Ok(Json(json!(summary)))
}

pub async fn delete_stack(
    State(state): State<AppState>,
    Path(stack_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.service.delete(&stack_id).await?;
    Ok(Json(json!({ "deleted": true, "stack_id": stack_id })))
}

pub async fn get_stats(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let stats = state.service.stats().await?;
    Ok(Json(json!(stats)))
}

#[derive(Debug, Deserialize)]
pub struct BatchDeleteRequest {
    #[serde(default)]
    pub stack_ids: Vec<String>,
}

pub async fn create_batch_delete_job(
    State(state): State<AppState>,
    body: Result<Json<BatchDeleteRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(req) = body.map_err(|_| StackError::invalid_input("invalid json body"))?;

    let mut clean = Vec::with_capacity(req.stack_ids.len());
    let mut seen = std::collections::HashSet::new();
    for id in req.stack_ids {
        let id = id.trim().to_string();
        if id.is_empty() {
            return Err(ApiError(StackError::invalid_input("invalid stack_ids")));
        }

        if seen.insert(id.clone()) {
            clean.push(id);
        }
    }

    let job_id = state.service.start_batch_delete(clean).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": job_id }))))
}

pub async fn get_batch_delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let job = state.service.batch_delete_job(&job_id).await?;
    Ok(Json(json!(job)))
}
