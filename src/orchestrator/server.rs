use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::{ExecuteRequest, Orchestrator};
use crate::runner::RunnerKind;

/// `{success, data}` on success, `{success, error: {message, code}}` otherwise.
#[derive(Debug, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct ApiEnvelope<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub message: String,
    pub code: String,
}

impl<T> ApiEnvelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiError {
                message: message.into(),
                code: code.into(),
            }),
        }
    }
}

pub(crate) fn error_response(status: StatusCode, message: impl Into<String>, code: &str) -> Response {
    (status, Json(ApiEnvelope::<()>::err(message, code))).into_response()
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    runners: Vec<RunnerKind>,
}

/// Routes served by the orchestrator: `POST /execute` and `GET /health`.
pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/execute", post(execute_handler))
        .route("/health", get(health_handler))
        .with_state(orchestrator)
}

async fn health_handler(State(orchestrator): State<Arc<Orchestrator>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        runners: orchestrator.runner_kinds(),
    })
}

async fn execute_handler(
    State(orchestrator): State<Arc<Orchestrator>>,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            tracing::debug!(error = %rejection, "Rejected execute request");
            return error_response(StatusCode::BAD_REQUEST, rejection.body_text(), "INVALID_REQUEST");
        }
    };

    let execution_id = request.execution_id;
    let task = tokio::spawn(async move {
        orchestrator
            .execute(request.execution_id, &request.artifact, request.input.as_ref())
            .await
    });

    match task.await {
        Ok(result) => (StatusCode::OK, Json(ApiEnvelope::ok(result))).into_response(),
        Err(e) => {
            tracing::error!(execution_id = %execution_id, error = %e, "Orchestration fault");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Orchestration failed: {}", e),
                "ORCHESTRATION_FAULT",
            )
        }
    }
}
