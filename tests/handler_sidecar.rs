//! Tests for the HTTP handler bridge against a mock sidecar: readiness
//! polling, the on-trigger wire shape, and lenient response handling.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::StatusCode;
use axum::{
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use noded::config::NodeConfig;
use noded::model::{TaskStatus, TriggerEvent, TriggerKind};
use noded::state::NodeState;
use noded::store::TaskInstanceStore;
use noded::{AgentContext, Handler, HttpHandler};

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn make_ctx() -> AgentContext {
    AgentContext {
        config: Arc::new(NodeConfig::default()),
        state: Arc::new(NodeState::new("1.0.0")),
        store: Arc::new(TaskInstanceStore::new()),
    }
}

async fn spawn_sidecar(app: Router) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

// ── Readiness ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn init_polls_health_until_the_sidecar_answers() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let app = Router::new().route(
        "/health",
        get(move || {
            let counter = Arc::clone(&counter);
            async move {
                // Not ready on the first poll, healthy afterwards.
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::OK
                }
            }
        }),
    );
    let port = spawn_sidecar(app).await;

    let handler = HttpHandler::new("sidecar", format!("http://127.0.0.1:{port}"))
        .with_ready_timeout(Duration::from_secs(10));
    handler.init(&make_ctx()).await.unwrap();

    assert!(
        calls.load(Ordering::SeqCst) >= 2,
        "init should have retried past the unhealthy first poll"
    );
}

#[tokio::test]
async fn init_fails_when_the_sidecar_never_comes_up() {
    let port = find_free_port();
    let handler = HttpHandler::new("sidecar", format!("http://127.0.0.1:{port}"))
        .with_ready_timeout(Duration::ZERO);

    let err = handler.init(&make_ctx()).await.unwrap_err();
    assert!(
        err.to_string().contains("not ready"),
        "unexpected error: {err:#}"
    );
}

// ── Dispatch round trip ──────────────────────────────────────────────────────

#[tokio::test]
async fn on_trigger_round_trips_task_results() {
    let seen = Arc::new(Mutex::new(Vec::<Value>::new()));
    let sink = Arc::clone(&seen);
    let app = Router::new().route(
        "/on-trigger",
        post(move |Json(body): Json<Value>| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(body);
                Json(json!({
                    "task_results": [
                        {"task_id": "t1", "status": 2, "result": ""},
                        {"task_id": "t2", "status": 4, "result": "exit status 3"},
                    ],
                }))
            }
        }),
    );
    let port = spawn_sidecar(app).await;
    let handler = HttpHandler::new("sidecar", format!("http://127.0.0.1:{port}"));

    let mut event = TriggerEvent::new(TriggerKind::Timer, "minutely");
    event.metadata.insert("nodeID".into(), "n1".into());
    event.payload = serde_json::to_vec(&json!({"tasks": [], "tasks_md5": "empty"})).unwrap();

    let response = handler.on_trigger(event).await.unwrap();
    assert_eq!(response.task_results.len(), 2);
    assert_eq!(response.task_results[0].status, TaskStatus::Success);
    assert_eq!(response.task_results[1].status, TaskStatus::Failed);
    assert_eq!(response.task_results[1].result, "exit status 3");

    let body = seen.lock().unwrap()[0].clone();
    assert_eq!(body["type"], "timer");
    assert_eq!(body["name"], "minutely");
    assert_eq!(body["metadata"]["nodeID"], "n1");
    assert_eq!(
        body["payload"]["tasks_md5"], "empty",
        "JSON payload bytes should arrive as structured JSON"
    );
}

#[tokio::test]
async fn sidecar_error_status_surfaces_as_an_error() {
    let app = Router::new().route(
        "/on-trigger",
        post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "exploded") }),
    );
    let port = spawn_sidecar(app).await;
    let handler = HttpHandler::new("sidecar", format!("http://127.0.0.1:{port}"));

    let err = handler
        .on_trigger(TriggerEvent::new(TriggerKind::Timer, "minutely"))
        .await
        .unwrap_err();
    let text = format!("{err:#}");
    assert!(text.contains("500"), "status should be in the error: {text}");
    assert!(text.contains("exploded"), "body should be in the error: {text}");
}

#[tokio::test]
async fn empty_and_garbage_bodies_yield_empty_responses() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let app = Router::new().route(
        "/on-trigger",
        post(move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    String::new()
                } else {
                    "not json at all".to_string()
                }
            }
        }),
    );
    let port = spawn_sidecar(app).await;
    let handler = HttpHandler::new("sidecar", format!("http://127.0.0.1:{port}"));

    let empty = handler
        .on_trigger(TriggerEvent::new(TriggerKind::Timer, "minutely"))
        .await
        .unwrap();
    assert!(empty.task_results.is_empty());

    let garbage = handler
        .on_trigger(TriggerEvent::new(TriggerKind::Timer, "minutely"))
        .await
        .unwrap();
    assert!(garbage.task_results.is_empty());
}
