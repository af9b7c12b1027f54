//! Integration tests for the HTTP adapter.
//!
//! Requests are driven through the router with `tower::ServiceExt::oneshot`.

mod common;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use common::{engine, engine_with_store, slow_mock_request, wait_for, wait_until_state};
use finetune_core::server::{AppState, router};
use finetune_core::{RunLimits, RunStore, SqliteRunStore};
use finetune_training::{MetricValues, RunRequest, RunState};
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

async fn send(app: &axum::Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
    (status, value)
}

#[tokio::test]
async fn test_health() {
    let engine = engine();
    let app = router(AppState::new(Arc::clone(&engine.controller)));

    for uri in ["/health", "/system/health"] {
        let (status, body) = send(&app, Method::GET, uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok", "component": "FineTuneEngine"}));
    }
}

#[tokio::test]
async fn test_hardware_snapshot() {
    let engine = engine();
    let app = router(AppState::new(Arc::clone(&engine.controller)));

    let (status, body) = send(&app, Method::GET, "/system/hardware", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["logical_cores"], 4);
}

#[tokio::test]
async fn test_start_run_and_read_it_back() {
    let engine = engine();
    let app = router(AppState::new(Arc::clone(&engine.controller)));

    let (status, receipt) = send(
        &app,
        Method::POST,
        "/runs/start",
        Some(json!({
            "run_name": "t1",
            "base_model": "demo",
            "backend": "mock",
            "mock": {"total_steps": 2, "step_delay_ms": 5}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(receipt["backend"], "mock");
    assert_eq!(receipt["message"], "Training started");
    let run_id = receipt["run_id"].as_str().unwrap().to_string();

    assert_eq!(wait_for(&engine.controller, &run_id.as_str().into()).await, RunState::Completed);

    let (status, run) = send(&app, Method::GET, &format!("/runs/{run_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["id"], run_id.as_str());
    assert_eq!(run["state"], "Completed");

    let (status, runs) = send(&app, Method::GET, "/runs", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(runs.as_array().unwrap().len(), 1);
    assert_eq!(runs[0]["backend"], "mock");

    let (_, metrics) = send(&app, Method::GET, &format!("/runs/{run_id}/metrics"), None).await;
    let steps: Vec<u64> = metrics.as_array().unwrap().iter().map(|m| m["step"].as_u64().unwrap()).collect();
    assert_eq!(steps, vec![1, 2]);

    let (_, checkpoints) = send(&app, Method::GET, &format!("/runs/{run_id}/checkpoints"), None).await;
    assert_eq!(checkpoints.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_invalid_submission_is_bad_request() {
    let engine = engine();
    let app = router(AppState::new(Arc::clone(&engine.controller)));

    let (status, body) =
        send(&app, Method::POST, "/runs/start", Some(json!({"base_model": "demo"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("run_name"));

    let (status, _) = send(
        &app,
        Method::POST,
        "/runs/start",
        Some(json!({"run_name": "t3", "base_model": "demo", "backend": "tpu-pod"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert!(engine.controller.list().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_run_is_not_found() {
    let engine = engine();
    let app = router(AppState::new(Arc::clone(&engine.controller)));

    for uri in ["/runs/nope", "/runs/nope/metrics", "/runs/nope/checkpoints"] {
        let (status, body) = send(&app, Method::GET, uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        assert!(body["error"].as_str().unwrap().contains("nope"));
    }
    let (status, _) = send(&app, Method::POST, "/runs/nope/cancel", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_run() {
    let engine = engine();
    let controller = &engine.controller;
    let app = router(AppState::new(Arc::clone(controller)));

    let receipt = controller.submit(slow_mock_request("stop")).await.unwrap();
    wait_until_state(controller, &receipt.run_id, RunState::Running).await;

    let uri = format!("/runs/{}/cancel", receipt.run_id);
    let (status, body) = send(&app, Method::POST, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelled"], true);
    assert_eq!(wait_for(controller, &receipt.run_id).await, RunState::Error);

    let (status, body) = send(&app, Method::POST, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelled"], false);

    let (_, run) = send(&app, Method::GET, &format!("/runs/{}", receipt.run_id), None).await;
    assert_eq!(run["error"]["kind"], "cancelled");
}

#[tokio::test]
async fn test_metrics_latest_keeps_last_sample_per_step() {
    let store = Arc::new(SqliteRunStore::open_in_memory().unwrap());
    let engine = engine_with_store(Arc::clone(&store) as Arc<dyn RunStore>, RunLimits::default());
    let app = router(AppState::new(Arc::clone(&engine.controller)));

    let run_id = store.create(&RunRequest::new("dup", "demo").validate().unwrap()).unwrap();
    for (step, loss) in [(1, 1.5), (1, 1.25), (2, 1.0)] {
        store.append_metric(&run_id, step, MetricValues { loss, learning_rate: 1e-4 }).unwrap();
    }

    let (status, all) = send(&app, Method::GET, &format!("/runs/{run_id}/metrics"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(all.as_array().unwrap().len(), 3);

    let (status, latest) = send(&app, Method::GET, &format!("/runs/{run_id}/metrics?latest=true"), None).await;
    assert_eq!(status, StatusCode::OK);
    let latest = latest.as_array().unwrap();
    assert_eq!(latest.len(), 2);
    assert_eq!(latest[0]["step"], 1);
    assert_eq!(latest[0]["loss"], 1.25);
    assert_eq!(latest[1]["step"], 2);
}
