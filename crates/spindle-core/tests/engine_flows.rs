//! End-to-end engine tests against in-process stub agents.
//!
//! Each test boots an in-memory engine, registers a stub agent served by
//! axum on an ephemeral port, loads a flow document and drives a real
//! execution through the public engine API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use uuid::Uuid;

use spindle_core::catalog::FlowDocument;
use spindle_core::models::{
    AgentHealth, AgentRecord, AgentType, ExecutionStatus, NodeStatus,
};
use spindle_core::{Engine, EngineConfig, EngineHandle, SubmitOptions};

// ── Stub agent ──────────────────────────────────────────────────────────

#[derive(Default)]
struct StubState {
    // Per-node counters for fail_times behavior.
    failures_seen: std::sync::Mutex<HashMap<String, u32>>,
    calls: AtomicU32,
}

async fn stub_execute(
    State(state): State<Arc<StubState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, axum::http::StatusCode> {
    state.calls.fetch_add(1, Ordering::SeqCst);
    let node_id = body["node_id"].as_str().unwrap_or_default().to_string();
    let config = body.get("config").cloned().unwrap_or(Value::Null);

    if let Some(delay) = config.get("sleep_ms").and_then(|v| v.as_u64()) {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    // Fail the first `fail_times` calls for this node with `fail_status`.
    if let Some(times) = config.get("fail_times").and_then(|v| v.as_u64()) {
        let mut seen = state.failures_seen.lock().unwrap();
        let count = seen.entry(node_id.clone()).or_insert(0);
        if u64::from(*count) < times {
            *count += 1;
            let status = config
                .get("fail_status")
                .and_then(|v| v.as_u64())
                .unwrap_or(500) as u16;
            return Err(axum::http::StatusCode::from_u16(status).unwrap());
        }
    } else if let Some(status) = config.get("fail_status").and_then(|v| v.as_u64()) {
        return Err(axum::http::StatusCode::from_u16(status as u16).unwrap());
    }

    let output = config
        .get("output")
        .cloned()
        .unwrap_or_else(|| body["input"].clone());

    Ok(Json(json!({
        "status": "success",
        "output": output,
        "execution_id": body["execution_id"],
    })))
}

async fn stub_health() -> Json<Value> {
    Json(json!({
        "agent_id": "stub",
        "version": "1.0.0",
        "capabilities": ["echo"],
        "ready": true,
        "agent_type": "processor",
    }))
}

async fn spawn_stub() -> (String, Arc<StubState>) {
    let state = Arc::new(StubState::default());
    let app = Router::new()
        .route("/health", get(stub_health))
        .route("/execute", post(stub_execute))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    (format!("http://{addr}"), state)
}

// ── Harness ─────────────────────────────────────────────────────────────

const TENANT: &str = "acme";

async fn engine_with_stub() -> (EngineHandle, Arc<StubState>) {
    let config = EngineConfig {
        node_timeout_secs: 5,
        execution_deadline_secs: 30,
        retry_base_delay_ms: 100,
        retry_max_delay_ms: 500,
        ..Default::default()
    };
    let engine = Engine::in_memory(config);
    let (endpoint, state) = spawn_stub().await;
    engine
        .register_system_agent(AgentRecord {
            agent_id: "stub".to_string(),
            name: "Stub".to_string(),
            description: String::new(),
            endpoint,
            capabilities: vec!["echo".to_string()],
            agent_type: AgentType::Processor,
            version: "1.0.0".to_string(),
            owner_tenant_id: None,
            auth_token: None,
            health: AgentHealth::Unknown,
            last_probe_at: None,
        })
        .await
        .unwrap();
    (engine, state)
}

async fn load_flow(engine: &EngineHandle, yaml: &str) {
    let definition = FlowDocument::from_yaml(yaml)
        .unwrap()
        .into_definition()
        .unwrap();
    engine.insert_flow(definition).await.unwrap();
}

async fn wait_terminal(engine: &EngineHandle, id: Uuid) -> ExecutionStatus {
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let ctx = engine.status(id, TENANT).await.unwrap();
        if ctx.status.is_terminal() {
            return ctx.status;
        }
        assert!(Instant::now() < deadline, "execution did not finish in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn node_status(
    results: &[spindle_core::models::NodeResult],
    node_id: &str,
) -> Option<NodeStatus> {
    results
        .iter()
        .find(|r| r.node_id == node_id)
        .map(|r| r.status)
}

// ── Scenarios ───────────────────────────────────────────────────────────

#[tokio::test]
async fn linear_two_step_echo() {
    let (engine, _) = engine_with_stub().await;
    load_flow(
        &engine,
        r#"
flow_id: linear
name: "Linear"
version: "1.0.0"
entry_point: a
exit_points: [b]
nodes:
  - id: a
    type: agent
    agent_id: stub
  - id: b
    type: agent
    agent_id: stub
    depends_on: [a]
"#,
    )
    .await;

    let id = engine
        .submit("linear", json!({"x": 1}), TENANT, SubmitOptions::default())
        .await
        .unwrap();
    assert_eq!(wait_terminal(&engine, id).await, ExecutionStatus::Succeeded);

    let ctx = engine.status(id, TENANT).await.unwrap();
    let output = ctx.output_data.unwrap();
    assert_eq!(output["b"], json!({"from_a": {"x": 1}}));

    let messages = engine.messages(id, TENANT).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].from_node, "a");
    assert_eq!(messages[0].to_node, "b");
}

#[tokio::test]
async fn parallel_fan_out_runs_concurrently() {
    let (engine, _) = engine_with_stub().await;
    load_flow(
        &engine,
        r#"
flow_id: fanout
name: "Fanout"
version: "1.0.0"
entry_point: a
exit_points: [d]
nodes:
  - id: a
    type: agent
    agent_id: stub
  - id: b
    type: agent
    agent_id: stub
    depends_on: [a]
    config:
      sleep_ms: 400
  - id: c
    type: agent
    agent_id: stub
    depends_on: [a]
    config:
      sleep_ms: 400
  - id: d
    type: join
    depends_on: [b, c]
    sources: [b, c]
    strategy: all_complete
"#,
    )
    .await;

    let started = Instant::now();
    let id = engine
        .submit("fanout", json!({"seed": true}), TENANT, SubmitOptions::default())
        .await
        .unwrap();
    assert_eq!(wait_terminal(&engine, id).await, ExecutionStatus::Succeeded);
    // b and c overlap: the whole run is far below the 800ms serial time.
    assert!(started.elapsed() < Duration::from_millis(750));

    let messages = engine.messages(id, TENANT).await.unwrap();
    let into_join = messages.iter().filter(|m| m.to_node == "d").count();
    assert_eq!(into_join, 2);
}

#[tokio::test]
async fn conditional_skips_the_untaken_branch() {
    let (engine, _) = engine_with_stub().await;
    load_flow(
        &engine,
        r#"
flow_id: conditional
name: "Conditional"
version: "1.0.0"
entry_point: a
exit_points: [d]
nodes:
  - id: a
    type: agent
    agent_id: stub
    config:
      output:
        score: 0.8
  - id: route
    type: decision
    depends_on: [a]
    condition: "output.a.score > 0.5"
    then: b
    else: c
  - id: b
    type: agent
    agent_id: stub
    depends_on: [route]
  - id: c
    type: agent
    agent_id: stub
    depends_on: [route]
  - id: d
    type: agent
    agent_id: stub
    depends_on: [b, c]
"#,
    )
    .await;

    let id = engine
        .submit("conditional", json!({}), TENANT, SubmitOptions::default())
        .await
        .unwrap();
    assert_eq!(wait_terminal(&engine, id).await, ExecutionStatus::Succeeded);

    let results = engine.node_results(id, TENANT).await.unwrap();
    assert_eq!(node_status(&results, "b"), Some(NodeStatus::Succeeded));
    assert_eq!(node_status(&results, "c"), Some(NodeStatus::Skipped));

    // d consumed only the taken branch.
    let d = results.iter().find(|r| r.node_id == "d").unwrap();
    let input = d.input.as_object().unwrap();
    assert!(input.contains_key("from_b"));
    assert!(!input.contains_key("from_c"));
}

#[tokio::test]
async fn loop_runs_body_exactly_three_times() {
    let (engine, _) = engine_with_stub().await;
    load_flow(
        &engine,
        r#"
flow_id: looped
name: "Looped"
version: "1.0.0"
entry_point: a
exit_points: [c]
nodes:
  - id: a
    type: agent
    agent_id: stub
  - id: l
    type: loop
    depends_on: [a]
    body: [b]
    until: "iteration >= 3"
    max_iterations: 10
  - id: b
    type: agent
    agent_id: stub
    depends_on: [l]
  - id: c
    type: agent
    agent_id: stub
    depends_on: [l]
"#,
    )
    .await;

    let id = engine
        .submit("looped", json!({}), TENANT, SubmitOptions::default())
        .await
        .unwrap();
    assert_eq!(wait_terminal(&engine, id).await, ExecutionStatus::Succeeded);

    let results = engine.node_results(id, TENANT).await.unwrap();
    let mut b_iterations: Vec<u32> = results
        .iter()
        .filter(|r| r.node_id == "b")
        .map(|r| r.iteration)
        .collect();
    b_iterations.sort_unstable();
    assert_eq!(b_iterations, vec![0, 1, 2]);
    assert!(results
        .iter()
        .filter(|r| r.node_id == "b")
        .all(|r| r.status == NodeStatus::Succeeded));
}

#[tokio::test]
async fn loop_respects_max_iterations() {
    let (engine, _) = engine_with_stub().await;
    load_flow(
        &engine,
        r#"
flow_id: capped
name: "Capped"
version: "1.0.0"
entry_point: a
exit_points: [c]
nodes:
  - id: a
    type: agent
    agent_id: stub
  - id: l
    type: loop
    depends_on: [a]
    body: [b]
    until: "1 = 2"
    max_iterations: 2
  - id: b
    type: agent
    agent_id: stub
    depends_on: [l]
  - id: c
    type: agent
    agent_id: stub
    depends_on: [l]
"#,
    )
    .await;

    let id = engine
        .submit("capped", json!({}), TENANT, SubmitOptions::default())
        .await
        .unwrap();
    assert_eq!(wait_terminal(&engine, id).await, ExecutionStatus::Succeeded);

    let results = engine.node_results(id, TENANT).await.unwrap();
    let runs = results.iter().filter(|r| r.node_id == "b").count();
    assert_eq!(runs, 2);
}

#[tokio::test]
async fn cancel_preserves_completed_work() {
    let (engine, _) = engine_with_stub().await;
    load_flow(
        &engine,
        r#"
flow_id: cancellable
name: "Cancellable"
version: "1.0.0"
entry_point: a
exit_points: [b]
nodes:
  - id: a
    type: agent
    agent_id: stub
  - id: b
    type: agent
    agent_id: stub
    depends_on: [a]
    config:
      sleep_ms: 60000
"#,
    )
    .await;

    let id = engine
        .submit("cancellable", json!({}), TENANT, SubmitOptions::default())
        .await
        .unwrap();

    // Let a finish and b get in flight, then cancel.
    tokio::time::sleep(Duration::from_millis(400)).await;
    engine.cancel(id, TENANT).await.unwrap();

    assert_eq!(wait_terminal(&engine, id).await, ExecutionStatus::Cancelled);
    let results = engine.node_results(id, TENANT).await.unwrap();
    assert_eq!(node_status(&results, "a"), Some(NodeStatus::Succeeded));
    assert_eq!(node_status(&results, "b"), Some(NodeStatus::Cancelled));

    // A second cancel is rejected.
    let err = engine.cancel(id, TENANT).await.unwrap_err();
    assert_eq!(err.kind(), "already_terminal");
}

#[tokio::test]
async fn retryable_status_is_retried_with_backoff() {
    let (engine, state) = engine_with_stub().await;
    load_flow(
        &engine,
        r#"
flow_id: retrying
name: "Retrying"
version: "1.0.0"
entry_point: a
exit_points: [a]
nodes:
  - id: a
    type: agent
    agent_id: stub
    config:
      max_retries: 2
      fail_times: 1
      fail_status: 429
"#,
    )
    .await;

    let started = Instant::now();
    let id = engine
        .submit("retrying", json!({}), TENANT, SubmitOptions::default())
        .await
        .unwrap();
    assert_eq!(wait_terminal(&engine, id).await, ExecutionStatus::Succeeded);
    // One failure plus one retry, separated by at least the base delay.
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(state.calls.load(Ordering::SeqCst), 2);

    let results = engine.node_results(id, TENANT).await.unwrap();
    let a = results.iter().find(|r| r.node_id == "a").unwrap();
    assert_eq!(a.attempts, 2);
}

#[tokio::test]
async fn permanent_failure_without_handler_fails_the_execution() {
    let (engine, _) = engine_with_stub().await;
    load_flow(
        &engine,
        r#"
flow_id: doomed
name: "Doomed"
version: "1.0.0"
entry_point: a
exit_points: [b]
nodes:
  - id: a
    type: agent
    agent_id: stub
    config:
      fail_status: 422
  - id: b
    type: agent
    agent_id: stub
    depends_on: [a]
"#,
    )
    .await;

    let id = engine
        .submit("doomed", json!({}), TENANT, SubmitOptions::default())
        .await
        .unwrap();
    assert_eq!(wait_terminal(&engine, id).await, ExecutionStatus::Failed);

    let ctx = engine.status(id, TENANT).await.unwrap();
    assert_eq!(ctx.error.unwrap().kind, "agent_status");
}

#[tokio::test]
async fn on_error_node_takes_over() {
    let (engine, _) = engine_with_stub().await;
    load_flow(
        &engine,
        r#"
flow_id: rescued
name: "Rescued"
version: "1.0.0"
entry_point: a
exit_points: [rescue]
nodes:
  - id: a
    type: agent
    agent_id: stub
    config:
      fail_status: 422
    on_error_node: rescue
  - id: rescue
    type: agent
    agent_id: stub
"#,
    )
    .await;

    let id = engine
        .submit("rescued", json!({"x": 9}), TENANT, SubmitOptions::default())
        .await
        .unwrap();
    assert_eq!(wait_terminal(&engine, id).await, ExecutionStatus::Succeeded);

    let results = engine.node_results(id, TENANT).await.unwrap();
    assert_eq!(node_status(&results, "a"), Some(NodeStatus::Failed));
    let rescue = results.iter().find(|r| r.node_id == "rescue").unwrap();
    assert_eq!(rescue.status, NodeStatus::Succeeded);
    // The handler received the original input plus the error object.
    assert_eq!(rescue.input["x"], 9);
    assert_eq!(rescue.input["error"]["kind"], "agent_status");
}

#[tokio::test]
async fn first_complete_join_picks_the_fastest_branch() {
    let (engine, _) = engine_with_stub().await;
    load_flow(
        &engine,
        r#"
flow_id: race
name: "Race"
version: "1.0.0"
entry_point: a
exit_points: [j]
nodes:
  - id: a
    type: fork
    branches: [fast, slow]
  - id: fast
    type: agent
    agent_id: stub
    depends_on: [a]
    config:
      output:
        winner: fast
  - id: slow
    type: agent
    agent_id: stub
    depends_on: [a]
    config:
      sleep_ms: 3000
      output:
        winner: slow
  - id: j
    type: join
    depends_on: [fast, slow]
    sources: [fast, slow]
    strategy: first_complete
"#,
    )
    .await;

    let started = Instant::now();
    let id = engine
        .submit("race", json!({}), TENANT, SubmitOptions::default())
        .await
        .unwrap();
    assert_eq!(wait_terminal(&engine, id).await, ExecutionStatus::Succeeded);
    // The slow branch never gates completion.
    assert!(started.elapsed() < Duration::from_millis(1500));

    let ctx = engine.status(id, TENANT).await.unwrap();
    assert_eq!(ctx.output_data.unwrap()["j"]["from_fast"]["winner"], "fast");

    let results = engine.node_results(id, TENANT).await.unwrap();
    assert_eq!(node_status(&results, "slow"), Some(NodeStatus::Cancelled));
}

#[tokio::test]
async fn first_complete_join_absorbs_a_failing_branch() {
    let (engine, _) = engine_with_stub().await;
    load_flow(
        &engine,
        r#"
flow_id: resilient
name: "Resilient"
version: "1.0.0"
entry_point: a
exit_points: [j]
nodes:
  - id: a
    type: fork
    branches: [broken, healthy]
  - id: broken
    type: agent
    agent_id: stub
    depends_on: [a]
    config:
      fail_status: 400
  - id: healthy
    type: agent
    agent_id: stub
    depends_on: [a]
    config:
      sleep_ms: 100
      output:
        ok: true
  - id: j
    type: join
    depends_on: [broken, healthy]
    sources: [broken, healthy]
    strategy: first_complete
"#,
    )
    .await;

    let id = engine
        .submit("resilient", json!({}), TENANT, SubmitOptions::default())
        .await
        .unwrap();
    assert_eq!(wait_terminal(&engine, id).await, ExecutionStatus::Succeeded);

    let ctx = engine.status(id, TENANT).await.unwrap();
    assert_eq!(ctx.output_data.unwrap()["j"]["from_healthy"]["ok"], true);
}

#[tokio::test]
async fn best_by_join_maximizes_the_expression() {
    let (engine, _) = engine_with_stub().await;
    load_flow(
        &engine,
        r#"
flow_id: tournament
name: "Tournament"
version: "1.0.0"
entry_point: a
exit_points: [j]
nodes:
  - id: a
    type: fork
    branches: [low, high]
  - id: low
    type: agent
    agent_id: stub
    depends_on: [a]
    config:
      output:
        score: 0.3
  - id: high
    type: agent
    agent_id: stub
    depends_on: [a]
    config:
      output:
        score: 0.9
  - id: j
    type: join
    depends_on: [low, high]
    sources: [low, high]
    strategy: best_by
    best_by: "input.score"
"#,
    )
    .await;

    let id = engine
        .submit("tournament", json!({}), TENANT, SubmitOptions::default())
        .await
        .unwrap();
    assert_eq!(wait_terminal(&engine, id).await, ExecutionStatus::Succeeded);

    let ctx = engine.status(id, TENANT).await.unwrap();
    let output = ctx.output_data.unwrap();
    assert_eq!(output["j"]["from_high"]["score"], 0.9);
    assert!(output["j"].get("from_low").is_none());
}

#[tokio::test]
async fn deadline_fails_the_execution_mid_node() {
    let (engine, _) = engine_with_stub().await;
    load_flow(
        &engine,
        r#"
flow_id: slowpoke
name: "Slowpoke"
version: "1.0.0"
entry_point: a
exit_points: [a]
nodes:
  - id: a
    type: agent
    agent_id: stub
    config:
      sleep_ms: 30000
"#,
    )
    .await;

    let id = engine
        .submit(
            "slowpoke",
            json!({}),
            TENANT,
            SubmitOptions {
                deadline_secs: Some(1),
            },
        )
        .await
        .unwrap();
    assert_eq!(wait_terminal(&engine, id).await, ExecutionStatus::Failed);

    let ctx = engine.status(id, TENANT).await.unwrap();
    assert_eq!(ctx.error.unwrap().kind, "deadline_exceeded");
    let results = engine.node_results(id, TENANT).await.unwrap();
    let a = results.iter().find(|r| r.node_id == "a").unwrap();
    assert_eq!(a.status, NodeStatus::Failed);
}

#[tokio::test]
async fn expression_on_unknown_output_fails_the_node() {
    let (engine, _) = engine_with_stub().await;
    load_flow(
        &engine,
        r#"
flow_id: bad-expr
name: "Bad Expr"
version: "1.0.0"
entry_point: a
exit_points: [b, c]
nodes:
  - id: a
    type: agent
    agent_id: stub
  - id: route
    type: decision
    depends_on: [a]
    condition: "output.ghost.score > 0.5"
    then: b
    else: c
  - id: b
    type: agent
    agent_id: stub
    depends_on: [route]
  - id: c
    type: agent
    agent_id: stub
    depends_on: [route]
"#,
    )
    .await;

    let id = engine
        .submit("bad-expr", json!({}), TENANT, SubmitOptions::default())
        .await
        .unwrap();
    assert_eq!(wait_terminal(&engine, id).await, ExecutionStatus::Failed);

    let ctx = engine.status(id, TENANT).await.unwrap();
    assert_eq!(ctx.error.unwrap().kind, "expression_error");
}

#[tokio::test]
async fn tenant_isolation_hides_foreign_executions() {
    let (engine, _) = engine_with_stub().await;
    load_flow(
        &engine,
        r#"
flow_id: private
name: "Private"
version: "1.0.0"
entry_point: a
exit_points: [a]
nodes:
  - id: a
    type: agent
    agent_id: stub
"#,
    )
    .await;

    let id = engine
        .submit("private", json!({}), TENANT, SubmitOptions::default())
        .await
        .unwrap();
    wait_terminal(&engine, id).await;

    let err = engine.status(id, "globex").await.unwrap_err();
    assert_eq!(err.kind(), "not_found");
    let err = engine.cancel(id, "globex").await.unwrap_err();
    assert_eq!(err.kind(), "not_found");
    assert!(engine
        .list_executions("globex", Default::default(), Default::default())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn submit_unknown_flow_is_rejected_synchronously() {
    let (engine, _) = engine_with_stub().await;
    let err = engine
        .submit("missing", json!({}), TENANT, SubmitOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn events_stream_the_execution_lifecycle() {
    use tokio_stream::StreamExt;

    let (engine, _) = engine_with_stub().await;
    load_flow(
        &engine,
        r#"
flow_id: observed
name: "Observed"
version: "1.0.0"
entry_point: a
exit_points: [a]
nodes:
  - id: a
    type: agent
    agent_id: stub
    config:
      sleep_ms: 100
"#,
    )
    .await;

    // Subscribe to the firehose before submitting so the early lifecycle
    // events cannot be missed; `subscribe` requires an existing execution.
    let mut receiver = engine.events().subscribe_all();
    let id = engine
        .submit("observed", json!({}), TENANT, SubmitOptions::default())
        .await
        .unwrap();

    let mut kinds = Vec::new();
    let collect = async {
        while let Ok(event) = receiver.recv().await {
            if event.execution_id != Some(id) {
                continue;
            }
            let kind = event.kind.as_str().to_string();
            let done = kind == "execution.succeeded";
            kinds.push(kind);
            if done {
                break;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), collect)
        .await
        .expect("event stream timed out");

    assert!(kinds.contains(&"execution.started".to_string()));
    assert!(kinds.contains(&"node.started".to_string()));
    assert!(kinds.contains(&"node.succeeded".to_string()));
    assert_eq!(kinds.last().unwrap(), "execution.succeeded");

    // The tenant-checked per-execution stream is also available.
    let mut stream = engine.subscribe(id, TENANT).await.unwrap();
    engine
        .events()
        .publish(spindle_core::events::ExecutionEvent::execution(
            spindle_core::events::EventKind::ExecutionSucceeded,
            id,
        ));
    let event = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("stream timed out")
        .expect("stream closed");
    assert_eq!(event.execution_id, Some(id));
}

#[tokio::test]
async fn flows_survive_an_engine_restart() {
    let db_path = std::env::temp_dir()
        .join(format!("spindle-restart-{}.db", std::process::id()))
        .to_string_lossy()
        .to_string();
    let _ = std::fs::remove_file(&db_path);

    {
        let engine = Engine::with_sqlite(EngineConfig::default(), &db_path).unwrap();
        load_flow(
            &engine,
            r#"
flow_id: restartable
name: "Restartable"
version: "1.0.0"
entry_point: a
exit_points: [a]
nodes:
  - id: a
    type: agent
    agent_id: stub
"#,
        )
        .await;
        engine.shutdown();
    }

    let engine = Engine::with_sqlite(EngineConfig::default(), &db_path).unwrap();
    assert!(engine.list_flows(TENANT).await.is_empty());
    engine.load_from_store().await.unwrap();
    let flows = engine.list_flows(TENANT).await;
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].flow_id, "restartable");

    std::fs::remove_file(&db_path).ok();
    std::fs::remove_file(format!("{db_path}-wal")).ok();
    std::fs::remove_file(format!("{db_path}-shm")).ok();
}

#[tokio::test]
async fn unknown_agent_fails_the_node() {
    let (engine, _) = engine_with_stub().await;
    load_flow(
        &engine,
        r#"
flow_id: ghost-agent
name: "Ghost Agent"
version: "1.0.0"
entry_point: a
exit_points: [a]
nodes:
  - id: a
    type: agent
    agent_id: nobody
"#,
    )
    .await;

    let id = engine
        .submit("ghost-agent", json!({}), TENANT, SubmitOptions::default())
        .await
        .unwrap();
    assert_eq!(wait_terminal(&engine, id).await, ExecutionStatus::Failed);
    let ctx = engine.status(id, TENANT).await.unwrap();
    assert_eq!(ctx.error.unwrap().kind, "agent_unknown");
}
