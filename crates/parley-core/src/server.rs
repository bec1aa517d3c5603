use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;

use crate::intent::neural::NeuralIndex;
use crate::intent::IntentMatcher;
use crate::memory::MemoryStore;

/// Shared state accessible by handlers.
#[derive(Clone)]
pub(crate) struct AppState {
    pub memory: Arc<MemoryStore>,
    pub neural: Arc<NeuralIndex>,
    pub matcher: Arc<IntentMatcher>,
}

/// Build the axum router for the worker-facing HTTP surface: the
/// tool-memory endpoint plus runtime classifier registration.
pub fn build_router(
    memory: Arc<MemoryStore>,
    neural: Arc<NeuralIndex>,
    matcher: Arc<IntentMatcher>,
) -> Router {
    let state = AppState {
        memory,
        neural,
        matcher,
    };

    Router::new()
        .route("/memory", post(memory_post).get(memory_get))
        .route("/register-intent", post(register_intent))
        .route("/unregister-intent", post(unregister_intent))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// Wire shape of `/memory` requests and query responses.
#[derive(Debug, Serialize, Deserialize)]
struct MemoryOp {
    event_type: u16,
    dialog_id: String,
    key: String,
    #[serde(default)]
    action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
}

async fn memory_post(
    State(state): State<AppState>,
    Json(op): Json<MemoryOp>,
) -> impl IntoResponse {
    if op.event_type != 3000 {
        return (StatusCode::BAD_REQUEST, "invalid event type").into_response();
    }
    if op.dialog_id.is_empty() || op.key.is_empty() {
        return (StatusCode::BAD_REQUEST, "dialog_id and key are required").into_response();
    }

    match op.action.as_str() {
        "save_tool_memory" => {
            let Some(value) = op.value else {
                return (StatusCode::BAD_REQUEST, "value is required for save").into_response();
            };
            state.memory.save(&op.dialog_id, &op.key, value).await;
            StatusCode::OK.into_response()
        }
        "query_tool_memory" => {
            let value = state.memory.query(&op.dialog_id, &op.key).await;
            Json(MemoryOp {
                event_type: 3000,
                dialog_id: op.dialog_id,
                key: op.key,
                action: "get_tool_memory".into(),
                value: Some(value.unwrap_or(Value::Null)),
            })
            .into_response()
        }
        _ => (StatusCode::BAD_REQUEST, "invalid action").into_response(),
    }
}

async fn memory_get(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let dialog_id = params.get("dialog_id").cloned().unwrap_or_default();
    let key = params.get("key").cloned().unwrap_or_default();
    if dialog_id.is_empty() || key.is_empty() {
        return (StatusCode::BAD_REQUEST, "dialog_id and key are required").into_response();
    }

    let value = state.memory.query(&dialog_id, &key).await;
    Json(MemoryOp {
        event_type: 3000,
        dialog_id,
        key,
        action: "get_tool_memory".into(),
        value: Some(value.unwrap_or(Value::Null)),
    })
    .into_response()
}

/// `{code, info}` body shared by the registration endpoints; code 0 is
/// success, 1 failure.
#[derive(Debug, Serialize, Deserialize)]
pub struct AdminResponse {
    pub code: u8,
    pub info: String,
}

impl AdminResponse {
    fn ok(info: impl Into<String>) -> (StatusCode, Json<Self>) {
        (
            StatusCode::OK,
            Json(Self {
                code: 0,
                info: info.into(),
            }),
        )
    }

    fn fail(status: StatusCode, info: impl Into<String>) -> (StatusCode, Json<Self>) {
        (
            status,
            Json(Self {
                code: 1,
                info: info.into(),
            }),
        )
    }
}

#[derive(Debug, Deserialize)]
struct RegisterIntentRequest {
    intent_name: String,
    #[serde(default)]
    intent_description: String,
    onnx_model_data: String,
    vocab_json_data: String,
    #[serde(default)]
    weight: f32,
}

async fn register_intent(
    State(state): State<AppState>,
    Json(req): Json<RegisterIntentRequest>,
) -> impl IntoResponse {
    if req.intent_name.is_empty() || req.onnx_model_data.is_empty() || req.vocab_json_data.is_empty()
    {
        return AdminResponse::fail(
            StatusCode::BAD_REQUEST,
            "missing required fields: intent_name, onnx_model_data, vocab_json_data",
        );
    }

    let engine = base64::engine::general_purpose::STANDARD;
    let model = match engine.decode(&req.onnx_model_data) {
        Ok(bytes) => bytes,
        Err(_) => {
            return AdminResponse::fail(StatusCode::BAD_REQUEST, "invalid base64 for onnx_model_data")
        }
    };
    let vocab = match engine.decode(&req.vocab_json_data) {
        Ok(bytes) => bytes,
        Err(_) => {
            return AdminResponse::fail(StatusCode::BAD_REQUEST, "invalid base64 for vocab_json_data")
        }
    };

    let weight = if req.weight == 0.0 { 1.0 } else { req.weight };
    let name = req.intent_name.clone();
    let install = tokio::task::spawn_blocking({
        let state = state.clone();
        move || {
            state.neural.install(
                &state.matcher,
                &req.intent_name,
                &model,
                &vocab,
                &req.intent_description,
                weight,
            )
        }
    })
    .await;

    match install {
        Ok(Ok(())) => AdminResponse::ok(format!("intent '{name}' registered successfully")),
        Ok(Err(e)) => AdminResponse::fail(StatusCode::INTERNAL_SERVER_ERROR, e),
        Err(e) => AdminResponse::fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct UnregisterIntentRequest {
    intent_name: String,
}

async fn unregister_intent(
    State(state): State<AppState>,
    Json(req): Json<UnregisterIntentRequest>,
) -> impl IntoResponse {
    if req.intent_name.is_empty() {
        return AdminResponse::fail(StatusCode::BAD_REQUEST, "missing required field: intent_name");
    }
    match state.neural.remove(&state.matcher, &req.intent_name) {
        Ok(()) => AdminResponse::ok(format!(
            "intent '{}' unregistered successfully",
            req.intent_name
        )),
        Err(e) => AdminResponse::fail(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}
