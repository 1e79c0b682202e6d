//! Integration tests for the dispatch path: identity stamping, task-snapshot
//! injection, error propagation, and result forwarding to a mock authority.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{routing::post, Json, Router};
use serde_json::Value;
use tokio::net::TcpListener;

use noded::model::{
    TaskInstance, TaskResult, TaskStatus, TriggerEvent, TriggerKind, TriggerResponse,
};
use noded::reporter::ResultReporter;
use noded::retry::RetryConfig;
use noded::state::{NodeState, NODE_ID_ENV};
use noded::store::TaskInstanceStore;
use noded::trigger::Dispatcher;
use noded::{AgentContext, Handler};

/// Handler that records every event it sees and answers with canned results.
struct RecordingHandler {
    events: Mutex<Vec<TriggerEvent>>,
    results: Vec<TaskResult>,
}

impl RecordingHandler {
    fn new() -> Self {
        Self::with_results(Vec::new())
    }

    fn with_results(results: Vec<TaskResult>) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            results,
        }
    }

    fn events(&self) -> Vec<TriggerEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    fn name(&self) -> &str {
        "recording"
    }

    async fn init(&self, _ctx: &AgentContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_trigger(&self, event: TriggerEvent) -> anyhow::Result<TriggerResponse> {
        self.events.lock().unwrap().push(event);
        Ok(TriggerResponse {
            task_results: self.results.clone(),
        })
    }
}

struct FailingHandler;

#[async_trait]
impl Handler for FailingHandler {
    fn name(&self) -> &str {
        "failing"
    }

    async fn init(&self, _ctx: &AgentContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_trigger(&self, _event: TriggerEvent) -> anyhow::Result<TriggerResponse> {
        anyhow::bail!("simulated handler failure")
    }
}

/// Node state with a resolved identity. Every test uses the same id, so the
/// shared environment variable is safe under parallel execution.
fn state_with_identity() -> Arc<NodeState> {
    std::env::set_var(NODE_ID_ENV, "node-itest");
    let state = Arc::new(NodeState::new("1.0.0"));
    state.init_node_id_from_env();
    state
}

fn task(task_id: &str, node: &str) -> TaskInstance {
    TaskInstance {
        id: 0,
        task_id: task_id.into(),
        rule_id: String::new(),
        assigned_node: node.into(),
        task_params: String::new(),
        invalid: false,
        extra: None,
    }
}

/// Mock authority recording every task-status report it receives.
async fn spawn_authority() -> (u16, Arc<Mutex<Vec<Value>>>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let app = Router::new().route(
        "/gateway/collectmgr/ReportTaskStatus",
        post(move |Json(body): Json<Value>| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(body);
                Json(serde_json::json!({"code": 200}))
            }
        }),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (port, received)
}

fn make_dispatcher(handler: Arc<dyn Handler>, state: Arc<NodeState>) -> (Dispatcher, Arc<TaskInstanceStore>) {
    let store = Arc::new(TaskInstanceStore::new());
    let reporter = ResultReporter::new(Arc::clone(&state)).with_retry(RetryConfig::instant());
    let dispatcher = Dispatcher::new(handler, state, Arc::clone(&store), reporter);
    (dispatcher, store)
}

// ── Stamping and snapshot injection ──────────────────────────────────────────

#[tokio::test]
async fn timer_event_carries_snapshot_and_identity() {
    let state = state_with_identity();
    let recording = Arc::new(RecordingHandler::new());
    let (dispatcher, store) = make_dispatcher(recording.clone(), state);
    store.replace(vec![task("t1", "node-itest"), task("t2", "elsewhere")]);

    dispatcher
        .dispatch(TriggerEvent::new(TriggerKind::Timer, "minutely"))
        .await
        .unwrap();

    let events = recording.events();
    assert_eq!(events.len(), 1, "exactly one event should reach the handler");
    let event = &events[0];
    assert_eq!(event.metadata["nodeID"], "node-itest");
    assert_eq!(event.metadata["version"], "1.0.0");

    let payload: Value = serde_json::from_slice(&event.payload).unwrap();
    assert_eq!(payload["tasks_md5"], store.current_hash());
    assert_eq!(
        payload["tasks"].as_array().unwrap().len(),
        2,
        "snapshot should carry the full store, other nodes included"
    );
}

#[tokio::test]
async fn empty_store_injects_an_empty_array() {
    let state = state_with_identity();
    let recording = Arc::new(RecordingHandler::new());
    let (dispatcher, _store) = make_dispatcher(recording.clone(), state);

    dispatcher
        .dispatch(TriggerEvent::new(TriggerKind::Timer, "minutely"))
        .await
        .unwrap();

    let payload: Value = serde_json::from_slice(&recording.events()[0].payload).unwrap();
    assert!(
        payload["tasks"].as_array().unwrap().is_empty(),
        "tasks must be an empty array, not null"
    );
    assert_eq!(payload["tasks_md5"], "empty");
}

#[tokio::test]
async fn stream_payload_passes_through_untouched() {
    let state = state_with_identity();
    let recording = Arc::new(RecordingHandler::new());
    let (dispatcher, store) = make_dispatcher(recording.clone(), state);
    store.replace(vec![task("t1", "node-itest")]);

    let mut event = TriggerEvent::new(TriggerKind::Stream, "events");
    event.payload = br#"{"alert":"disk"}"#.to_vec();
    dispatcher.dispatch(event).await.unwrap();

    let captured = &recording.events()[0];
    assert_eq!(
        captured.payload,
        br#"{"alert":"disk"}"#,
        "a non-empty payload must never be replaced by the snapshot"
    );
    assert_eq!(captured.metadata["nodeID"], "node-itest");
}

// ── Error propagation ────────────────────────────────────────────────────────

#[tokio::test]
async fn handler_failure_propagates_to_the_caller() {
    let state = state_with_identity();
    let (dispatcher, _store) = make_dispatcher(Arc::new(FailingHandler), state);

    let err = dispatcher
        .dispatch(TriggerEvent::new(TriggerKind::Timer, "minutely"))
        .await
        .unwrap_err();
    assert!(
        format!("{err:#}").contains("simulated handler failure"),
        "original error text should survive: {err:#}"
    );
}

// ── Result forwarding ────────────────────────────────────────────────────────

#[tokio::test]
async fn task_results_flow_to_the_authority() {
    let (port, received) = spawn_authority().await;
    let state = state_with_identity();
    state.set_authority("127.0.0.1", port);

    let recording = Arc::new(RecordingHandler::with_results(vec![
        TaskResult {
            task_id: "t1".into(),
            status: TaskStatus::Success,
            result: String::new(),
        },
        TaskResult {
            task_id: "t2".into(),
            status: TaskStatus::Failed,
            result: "exit status 3".into(),
        },
    ]));
    let (dispatcher, _store) = make_dispatcher(recording.clone(), state);

    dispatcher
        .dispatch(TriggerEvent::new(TriggerKind::Timer, "minutely"))
        .await
        .unwrap();

    // Reports detach from the dispatch; poll until both arrive.
    for _ in 0..100 {
        if received.lock().unwrap().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let bodies = received.lock().unwrap().clone();
    assert_eq!(bodies.len(), 2, "both task results should be reported");

    let by_id = |id: &str| {
        bodies
            .iter()
            .find(|b| b["id"] == id)
            .unwrap_or_else(|| panic!("no report for {id}"))
            .clone()
    };
    let ok = by_id("t1");
    assert_eq!(ok["status"], 2);
    assert_eq!(ok["node_id"], "node-itest");
    let failed = by_id("t2");
    assert_eq!(failed["status"], 4);
    assert_eq!(failed["result"], "exit status 3");
}

#[tokio::test]
async fn failed_dispatch_reports_nothing() {
    let (port, received) = spawn_authority().await;
    let state = state_with_identity();
    state.set_authority("127.0.0.1", port);
    let (dispatcher, _store) = make_dispatcher(Arc::new(FailingHandler), state);

    let _ = dispatcher
        .dispatch(TriggerEvent::new(TriggerKind::Timer, "minutely"))
        .await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(
        received.lock().unwrap().is_empty(),
        "a failed handler has no results to report"
    );
}
