//! HTTP surface for creating and inspecting executions.
//!
//! A thin stand-in for the platform's CRUD layer: it creates QUEUED records,
//! hands them to the [`QueueManager`] and serves the records back.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::artifact::ArtifactSnapshot;
use crate::error::ExecError;
use crate::execution::{ExecutionStore, QueueManager};
use crate::orchestrator::server::{error_response, ApiEnvelope};

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn ExecutionStore>,
    pub manager: QueueManager,
}

/// Body of `POST /api/executions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateExecutionRequest {
    pub artifact: ArtifactSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatusResponse {
    pub pending: usize,
    pub processing: bool,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route(
            "/api/executions",
            get(list_executions_handler).post(create_execution_handler),
        )
        .route("/api/executions/{id}", get(get_execution_handler))
        .route("/api/executions/{id}/cancel", post(cancel_execution_handler))
        .route("/api/queue", get(queue_status_handler))
        .with_state(state)
}

fn exec_error_response(err: &ExecError) -> Response {
    let status = match err {
        ExecError::ExecutionNotFound(_) => StatusCode::NOT_FOUND,
        ExecError::AlreadyExists(_) | ExecError::InvalidTransition { .. } => StatusCode::CONFLICT,
        ExecError::Validation(_) | ExecError::UnauthorizedImports(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.to_string(), err.code())
}

async fn list_executions_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(ApiEnvelope::ok(state.store.list().await))
}

async fn create_execution_handler(
    State(state): State<ApiState>,
    payload: Result<Json<CreateExecutionRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return error_response(StatusCode::BAD_REQUEST, rejection.body_text(), "INVALID_REQUEST")
        }
    };

    match state
        .manager
        .submit(request.artifact, request.input, request.user_id)
        .await
    {
        Ok(execution) => (StatusCode::ACCEPTED, Json(ApiEnvelope::ok(execution))).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to create execution");
            exec_error_response(&e)
        }
    }
}

async fn get_execution_handler(
    State(state): State<ApiState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Response {
    let Path(id) = match id {
        Ok(id) => id,
        Err(rejection) => {
            return error_response(StatusCode::BAD_REQUEST, rejection.body_text(), "INVALID_REQUEST")
        }
    };

    match state.store.get(&id).await {
        Some(execution) => Json(ApiEnvelope::ok(execution)).into_response(),
        None => exec_error_response(&ExecError::ExecutionNotFound(id)),
    }
}

async fn cancel_execution_handler(
    State(state): State<ApiState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Response {
    let Path(id) = match id {
        Ok(id) => id,
        Err(rejection) => {
            return error_response(StatusCode::BAD_REQUEST, rejection.body_text(), "INVALID_REQUEST")
        }
    };

    match state.manager.cancel(&id).await {
        Ok(execution) => Json(ApiEnvelope::ok(execution)).into_response(),
        Err(e) => exec_error_response(&e),
    }
}

async fn queue_status_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(ApiEnvelope::ok(QueueStatusResponse {
        pending: state.manager.pending().await,
        processing: state.manager.is_processing(),
    }))
}
