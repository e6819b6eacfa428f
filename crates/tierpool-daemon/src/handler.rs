//! JSON-RPC request handling for the admin surface.

use crate::server::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tierpool_core::{DriveHealth, DriveId, TierError};
use tracing::{debug, error};

// ============================================================================
// JSON-RPC types
// ============================================================================

/// JSON-RPC 2.0 request structure.
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[allow(dead_code)]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 response structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 error structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

/// Unknown method.
const METHOD_NOT_FOUND: i32 = -32601;

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError { code, message }),
            id,
        }
    }
}

// ============================================================================
// Parameter extraction helpers
// ============================================================================

/// Extract an optional string parameter, supporting both snake_case and camelCase.
fn get_str_param<'a>(params: &'a Value, snake: &str, camel: &str) -> Option<&'a str> {
    params
        .get(snake)
        .or_else(|| params.get(camel))
        .and_then(|v| v.as_str())
}

/// Extract a required string parameter or return an error.
fn require_str_param(params: &Value, snake: &str, camel: &str) -> tierpool_core::Result<String> {
    get_str_param(params, snake, camel)
        .map(String::from)
        .ok_or_else(|| TierError::Validation {
            field: snake.to_string(),
            message: format!("Missing required parameter: {}", snake),
        })
}

fn require_drive_id(params: &Value) -> tierpool_core::Result<DriveId> {
    require_str_param(params, "drive_id", "driveId").map(DriveId::from)
}

// ============================================================================
// HTTP endpoints
// ============================================================================

/// Health check endpoint.
pub async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Main JSON-RPC handler. Application errors are reported in the body with
/// HTTP 200.
pub async fn handle_rpc(
    State(state): State<Arc<AppState>>,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    let method = request.method.as_str();
    let params = request.params.unwrap_or(Value::Object(Default::default()));
    let id = request.id;

    debug!("RPC call: {}({:?})", method, params);

    let response = match dispatch_method(&state, method, &params).await {
        Some(Ok(value)) => JsonRpcResponse::success(id, value),
        Some(Err(e)) => {
            error!("RPC error for {}: {}", method, e);
            JsonRpcResponse::error(id, e.to_rpc_error_code(), e.to_string())
        }
        None => JsonRpcResponse::error(
            id,
            METHOD_NOT_FOUND,
            format!("Method not found: {}", method),
        ),
    };
    (StatusCode::OK, Json(response))
}

// ============================================================================
// Method dispatcher
// ============================================================================

/// `None` for an unknown method.
async fn dispatch_method(
    state: &AppState,
    method: &str,
    params: &Value,
) -> Option<tierpool_core::Result<Value>> {
    let engine = &state.engine;
    let result = match method {
        "health_check" => Ok(json!({"status": "ok"})),

        // Status & drives
        "status" => engine.status().and_then(to_value),
        "list_drives" => engine.list_drives().and_then(to_value),
        "refresh_capacity" => match get_str_param(params, "drive_id", "driveId") {
            Some(id) => engine.refresh_capacity(&DriveId::from(id)).and_then(to_value),
            None => engine.refresh_all_capacity().and_then(to_value),
        },
        "deregister_drive" => require_drive_id(params)
            .and_then(|id| engine.deregister_drive(&id))
            .map(|_| json!({"success": true})),
        "set_drive_health" => set_drive_health(state, params),

        // Tasks
        "list_tasks" => engine.list_tasks().and_then(to_value),
        "list_failed_tasks" => engine.list_failed_tasks().and_then(to_value),
        "retry_task" => require_str_param(params, "task_id", "taskId")
            .and_then(|id| engine.retry_task(&id))
            .and_then(to_value),
        "dismiss_task" => require_str_param(params, "task_id", "taskId")
            .and_then(|id| engine.dismiss_task(&id))
            .and_then(to_value),

        // Cycles
        "run_cycle" => engine.run_cycle().await.and_then(to_value),
        "reconcile" => engine.reconcile().await.and_then(to_value),
        "sample" => engine.sample_now().await.and_then(to_value),
        "resolve" => require_str_param(params, "path", "path")
            .and_then(|path| engine.resolve(&path))
            .and_then(to_value),

        _ => return None,
    };
    Some(result)
}

fn set_drive_health(state: &AppState, params: &Value) -> tierpool_core::Result<Value> {
    let id = require_drive_id(params)?;
    let raw = require_str_param(params, "health", "health")?;
    let health = DriveHealth::parse(&raw).ok_or_else(|| TierError::Validation {
        field: "health".to_string(),
        message: format!("Unknown drive health: {}", raw),
    })?;
    to_value(state.engine.set_drive_health(&id, health)?)
}

fn to_value<T: Serialize>(value: T) -> tierpool_core::Result<Value> {
    Ok(serde_json::to_value(value)?)
}
