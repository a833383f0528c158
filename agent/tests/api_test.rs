//! Local HTTP API tests, driven through the router without a listener.

use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use shopsync_agent::backend::MemoryBackend;
use shopsync_agent::config::Config;
use shopsync_agent::{build_router, open_engine, AppState};
use tower::ServiceExt;

fn test_router(dir: &Path) -> Router {
    let data_dir = dir.display().to_string();
    let config = Config::from_lookup(move |name| match name {
        "BACKEND_URL" => Some("http://backend.invalid".to_string()),
        "DATA_DIR" => Some(data_dir.clone()),
        "NODE_ID" => Some("till-1".to_string()),
        _ => None,
    })
    .unwrap();
    let engine = open_engine(&config).unwrap();
    let state = AppState::new(engine, Arc::new(MemoryBackend::new()), config);
    build_router(state)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn create_product(name: &str) -> Value {
    json!({
        "entityType": "product",
        "kind": "create",
        "change": {"fields": {"name": name, "currentStock": 12}}
    })
}

#[tokio::test]
async fn test_health_reports_offline_at_start() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(dir.path());

    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["online"], false);
    assert_eq!(body["pending"], 0);
}

#[tokio::test]
async fn test_mutation_is_visible_before_sync() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(dir.path());

    let (status, product) = send(&app, post_json("/mutations", create_product("Sugar"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = product["id"].as_str().unwrap().to_string();
    assert!(id.starts_with("temp-"));
    assert_eq!(product["syncState"], "pendingCreate");

    let (status, list) = send(&app, get("/entities/products")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);

    let (_, status_body) = send(&app, get(&format!("/entities/products/{id}/status"))).await;
    assert_eq!(status_body["syncState"], "pendingCreate");
    assert_eq!(status_body["pendingOps"], 1);
    assert_eq!(status_body["deadLettered"], 0);

    let (_, queue) = send(&app, get("/queue")).await;
    assert_eq!(queue["online"], false);
    assert_eq!(queue["pending"], 1);
    assert_eq!(queue["operations"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_invalid_mutation_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(dir.path());

    let mutation = json!({
        "entityType": "product",
        "kind": "create",
        "change": {"fields": {"currentStock": 3}}
    });
    let (status, body) = send(&app, post_json("/mutations", mutation)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (_, queue) = send(&app, get("/queue")).await;
    assert_eq!(queue["pending"], 0);
}

#[tokio::test]
async fn test_unknown_resources_are_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(dir.path());

    let (status, _) = send(&app, get("/entities/invoices")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, get("/entities/products/p-404")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app,
        Request::post("/queue/till-1-99/retry").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_live_operation_cannot_be_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(dir.path());
    send(&app, post_json("/mutations", create_product("Salt"))).await;

    let (_, queue) = send(&app, get("/queue")).await;
    let op_id = queue["operations"][0]["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app,
        Request::delete(format!("/queue/{op_id}")).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("not dead-lettered"));
}
