use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::net::TcpListener;

use parley_core::intent::neural::NeuralIndex;
use parley_core::{build_router, IntentMatcher, MemoryStore};

async fn start_server(kv_root: &Path, neural_root: &Path) -> SocketAddr {
    let memory = Arc::new(MemoryStore::new(kv_root));
    let neural = Arc::new(NeuralIndex::new(neural_root));
    let matcher = Arc::new(IntentMatcher::new(neural_root.join("cache.json"), 0.9));
    let app = build_router(memory, neural, matcher);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn save_then_get_roundtrips_and_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_server(dir.path(), &dir.path().join("neural")).await;
    let client = reqwest::Client::new();

    let save = client
        .post(format!("http://{addr}/memory"))
        .json(&json!({
            "event_type": 3000,
            "action": "save_tool_memory",
            "dialog_id": "d1",
            "key": "k",
            "value": 42,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(save.status(), 200);

    let get: Value = client
        .get(format!("http://{addr}/memory?dialog_id=d1&key=k"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(get["action"], "get_tool_memory");
    assert_eq!(get["value"], 42);
    assert_eq!(get["event_type"], 3000);

    // A fresh server over the same root still sees the value.
    let addr = start_server(dir.path(), &dir.path().join("neural")).await;
    let get: Value = client
        .get(format!("http://{addr}/memory?dialog_id=d1&key=k"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(get["value"], 42);
}

#[tokio::test]
async fn query_via_post_returns_the_same_shape() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_server(dir.path(), &dir.path().join("neural")).await;
    let client = reqwest::Client::new();

    client
        .post(format!("http://{addr}/memory"))
        .json(&json!({
            "event_type": 3000,
            "action": "save_tool_memory",
            "dialog_id": "d1",
            "key": "nested",
            "value": {"repo": "app.release.git", "tag": "x64-v2.0"},
        }))
        .send()
        .await
        .unwrap();

    let queried: Value = client
        .post(format!("http://{addr}/memory"))
        .json(&json!({
            "event_type": 3000,
            "action": "query_tool_memory",
            "dialog_id": "d1",
            "key": "nested",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(queried["value"]["tag"], "x64-v2.0");
}

#[tokio::test]
async fn absent_key_queries_as_null() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_server(dir.path(), &dir.path().join("neural")).await;

    let got: Value = reqwest::get(format!("http://{addr}/memory?dialog_id=d9&key=nothing"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(got["value"], Value::Null);
}

#[tokio::test]
async fn malformed_memory_requests_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_server(dir.path(), &dir.path().join("neural")).await;
    let client = reqwest::Client::new();

    // Wrong event type.
    let wrong_event = client
        .post(format!("http://{addr}/memory"))
        .json(&json!({
            "event_type": 1001,
            "action": "save_tool_memory",
            "dialog_id": "d1",
            "key": "k",
            "value": 1,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(wrong_event.status(), 400);

    // Missing key.
    let missing_key = client
        .post(format!("http://{addr}/memory"))
        .json(&json!({
            "event_type": 3000,
            "action": "save_tool_memory",
            "dialog_id": "d1",
            "key": "",
            "value": 1,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(missing_key.status(), 400);

    // Save without a value.
    let missing_value = client
        .post(format!("http://{addr}/memory"))
        .json(&json!({
            "event_type": 3000,
            "action": "save_tool_memory",
            "dialog_id": "d1",
            "key": "k",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(missing_value.status(), 400);

    // Unknown action.
    let bad_action = client
        .post(format!("http://{addr}/memory"))
        .json(&json!({
            "event_type": 3000,
            "action": "drop_everything",
            "dialog_id": "d1",
            "key": "k",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(bad_action.status(), 400);
}

#[tokio::test]
async fn register_intent_rejects_bad_requests() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_server(dir.path(), &dir.path().join("neural")).await;
    let client = reqwest::Client::new();

    // Missing fields.
    let missing: Value = client
        .post(format!("http://{addr}/register-intent"))
        .json(&json!({"intent_name": "x", "onnx_model_data": "", "vocab_json_data": ""}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(missing["code"], 1);

    // Broken base64.
    let bad_b64: Value = client
        .post(format!("http://{addr}/register-intent"))
        .json(&json!({
            "intent_name": "x",
            "onnx_model_data": "!!!not-base64!!!",
            "vocab_json_data": "e30=",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(bad_b64["code"], 1);
    assert!(bad_b64["info"].as_str().unwrap().contains("base64"));

    // Path-escaping intent name (vocab decodes to {"<UNK>":0}).
    let escape: Value = client
        .post(format!("http://{addr}/register-intent"))
        .json(&json!({
            "intent_name": "../evil",
            "onnx_model_data": "AAAA",
            "vocab_json_data": "eyI8VU5LPiI6IDB9",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(escape["code"], 1);
}

#[tokio::test]
async fn unregister_unknown_intent_fails_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_server(dir.path(), &dir.path().join("neural")).await;
    let client = reqwest::Client::new();

    let gone: Value = client
        .post(format!("http://{addr}/unregister-intent"))
        .json(&json!({"intent_name": "ghost"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(gone["code"], 1);
}

#[tokio::test]
async fn health_endpoint_answers() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_server(dir.path(), &dir.path().join("neural")).await;
    let body = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "ok");
}
