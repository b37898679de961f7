//! Reference agent daemon.
//!
//! Implements the agent HTTP contract the engine dispatches against:
//!
//! - `GET /health` — readiness report
//! - `POST /execute` — run one node; echoes its input by default
//!
//! Node `config` keys steer behavior for local experiments:
//!
//! - `sleep_ms`: delay before responding
//! - `fail_status`: respond with that HTTP status instead of a result
//! - `fail_message`: respond `200 {status: "error", ...}` with the message
//!
//! Environment: `AGENTD_PORT` (default 7410), `AGENTD_ID` (default
//! `echo-agent`), `AGENTD_TOKEN` (when set, bearer auth is required).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
struct AgentState {
    agent_id: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    execution_id: uuid::Uuid,
    node_id: String,
    #[serde(default)]
    input: serde_json::Value,
    #[serde(default)]
    config: serde_json::Value,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spindle_agentd=info,tower_http=info".into()),
        )
        .init();

    let port: u16 = std::env::var("AGENTD_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(7410);
    let state = Arc::new(AgentState {
        agent_id: std::env::var("AGENTD_ID").unwrap_or_else(|_| "echo-agent".to_string()),
        token: std::env::var("AGENTD_TOKEN").ok(),
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/execute", post(execute))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind agent port");
    tracing::info!(agent_id = %state.agent_id, %addr, "agent daemon listening");
    axum::serve(listener, app).await.expect("server error");
}

async fn health(State(state): State<Arc<AgentState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "agent_id": state.agent_id,
        "version": env!("CARGO_PKG_VERSION"),
        "capabilities": ["echo"],
        "ready": true,
        "agent_type": "processor",
    }))
}

async fn execute(
    State(state): State<Arc<AgentState>>,
    headers: HeaderMap,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if let Some(expected) = &state.token {
        let authorized = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(|v| v == format!("Bearer {expected}"))
            .unwrap_or(false);
        if !authorized {
            return Err(StatusCode::UNAUTHORIZED);
        }
    }

    tracing::info!(
        execution_id = %request.execution_id,
        node_id = %request.node_id,
        "executing node"
    );

    if let Some(delay) = request.config.get("sleep_ms").and_then(|v| v.as_u64()) {
        tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
    }

    if let Some(status) = request.config.get("fail_status").and_then(|v| v.as_u64()) {
        return Err(StatusCode::from_u16(status as u16).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR));
    }

    if let Some(message) = request.config.get("fail_message").and_then(|v| v.as_str()) {
        return Ok(Json(serde_json::json!({
            "status": "error",
            "error_message": message,
            "execution_id": request.execution_id,
        })));
    }

    Ok(Json(serde_json::json!({
        "status": "success",
        "output": request.input,
        "execution_id": request.execution_id,
    })))
}
