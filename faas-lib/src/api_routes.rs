//! HTTP surface over [`FunctionManager`].

use axum::{
    extract::{
        multipart::MultipartRejection, rejection::JsonRejection, DefaultBodyLimit, Json,
        Multipart, Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use faas_common::{FaasError, Function};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

use crate::manager::FunctionManager;

/// Largest accepted upload, multipart framing included.
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
/// Module path the worker imports uploaded code from.
pub const HANDLER_MODULE: &str = "function.handler";

const CODE_FIELD: &str = "python_file";
const NAME_FIELD: &str = "function_name";

#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<FunctionManager>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub code: String,
    #[serde(skip)]
    pub status: StatusCode,
}

impl ApiError {
    fn bad_request(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: "BAD_REQUEST".to_string(),
            status: StatusCode::BAD_REQUEST,
        }
    }
}

impl From<FaasError> for ApiError {
    fn from(err: FaasError) -> Self {
        let (status, code) = match &err {
            FaasError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            FaasError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            FaasError::NotRunning(_) => (StatusCode::INTERNAL_SERVER_ERROR, "NOT_RUNNING"),
            FaasError::Execution(_) => (StatusCode::INTERNAL_SERVER_ERROR, "EXECUTION_ERROR"),
            FaasError::Provision(_) => (StatusCode::INTERNAL_SERVER_ERROR, "PROVISION_ERROR"),
            FaasError::Teardown(_) => (StatusCode::INTERNAL_SERVER_ERROR, "TEARDOWN_ERROR"),
            FaasError::Storage(_) | FaasError::Io(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR")
            }
            FaasError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR"),
        };
        Self {
            error: err.to_string(),
            code: code.to_string(),
            status,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub payload: String,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub result: Box<RawValue>,
}

pub fn router(manager: Arc<FunctionManager>) -> Router {
    Router::new()
        .route("/functions", post(add_function_handler).get(list_functions_handler))
        .route(
            "/functions/:id",
            get(get_function_handler).delete(remove_function_handler),
        )
        .route("/functions/:id/execute", post(execute_function_handler))
        .route("/health", get(health_handler))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(ApiState { manager })
}

#[instrument(skip(state, multipart))]
async fn add_function_handler(
    State(state): State<ApiState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<(StatusCode, Json<Function>), ApiError> {
    let mut multipart = multipart.map_err(|e| ApiError::bad_request(e.body_text()))?;

    let mut name: Option<String> = None;
    let mut code: Option<Vec<u8>> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.body_text()))?
    {
        match field.name() {
            Some(CODE_FIELD) => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(e.body_text()))?;
                code = Some(bytes.to_vec());
            }
            Some(NAME_FIELD) => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(e.body_text()))?;
                name = Some(text.trim().to_string());
            }
            other => warn!(field = ?other, "Ignoring unexpected upload field"),
        }
    }

    let name = name
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ApiError::bad_request(format!("missing '{NAME_FIELD}' field")))?;
    let code = code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ApiError::bad_request(format!("missing '{CODE_FIELD}' field")))?;

    let handler = format!("{HANDLER_MODULE}.{name}");
    let function = state.manager.add_function(&name, &handler, &code).await?;
    info!(function_id = %function.id, %name, "Function created");
    Ok((StatusCode::CREATED, Json(function)))
}

#[instrument(skip(state))]
async fn list_functions_handler(
    State(state): State<ApiState>,
) -> Result<Json<Vec<Function>>, ApiError> {
    Ok(Json(state.manager.list_functions().await?))
}

#[instrument(skip(state))]
async fn get_function_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Function>, ApiError> {
    Ok(Json(state.manager.get_function(&id).await?))
}

#[instrument(skip(state, request))]
async fn execute_function_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    request: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let Json(request) = request.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let result = state
        .manager
        .execute_function(&id, &request.payload)
        .await?;
    Ok(Json(ExecuteResponse { result }))
}

#[instrument(skip(state))]
async fn remove_function_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.manager.remove_function(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "faas-service"
    }))
}
