//! Agent proxy: the stateless outbound HTTP client the orchestrator
//! dispatches through.
//!
//! Responsibilities: per-node timeout, bearer auth from the registry
//! record, response size cap and JSON validation, translation of transport
//! errors into engine error kinds, a process-wide concurrency semaphore
//! with a bounded wait queue, the per-agent circuit breaker, and latency
//! samples onto the event bus.

mod breaker;

pub use breaker::CircuitBreaker;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::{EventBus, ExecutionEvent};
use crate::models::AgentRecord;

/// Body of `POST /execute`.
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteRequest {
    pub execution_id: Uuid,
    pub node_id: String,
    pub input: serde_json::Value,
    pub config: serde_json::Value,
}

/// Body of a `POST /execute` response. Unknown extra fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteResponse {
    pub status: String,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub execution_id: Option<String>,
    #[serde(default)]
    pub cost_usd: Option<f64>,
}

/// What the orchestrator gets back from a successful dispatch.
#[derive(Debug, Clone)]
pub struct AgentReply {
    pub output: serde_json::Value,
    pub cost_usd: Option<f64>,
}

pub struct AgentProxy {
    client: reqwest::Client,
    semaphore: Arc<Semaphore>,
    waiters: AtomicUsize,
    queue_bound: usize,
    response_size_cap: usize,
    breaker: CircuitBreaker,
    bus: EventBus,
}

impl AgentProxy {
    pub fn new(config: &EngineConfig, bus: EventBus) -> Self {
        Self {
            client: reqwest::Client::new(),
            semaphore: Arc::new(Semaphore::new(config.proxy_concurrency)),
            waiters: AtomicUsize::new(0),
            queue_bound: config.proxy_queue_bound,
            response_size_cap: config.response_size_cap,
            breaker: CircuitBreaker::new(config.breaker_threshold, config.breaker_open()),
            bus,
        }
    }

    /// Dispatch one `/execute` call. `timeout` is the effective per-node
    /// timeout (already clamped to the execution deadline by the caller).
    pub async fn execute(
        &self,
        record: &AgentRecord,
        request: &ExecuteRequest,
        timeout: Duration,
    ) -> Result<AgentReply, EngineError> {
        let agent_id = record.agent_id.as_str();
        self.breaker.check(agent_id)?;

        let _permit = self.acquire_slot().await?;

        let started = Instant::now();
        let result = self.call(record, request, timeout).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.bus
            .publish(ExecutionEvent::agent_latency(agent_id, elapsed_ms));

        match &result {
            Ok(_) => self.breaker.record_success(agent_id),
            Err(_) => self.breaker.record_failure(agent_id),
        }
        result
    }

    /// Enforce the global concurrency cap with a bounded wait queue.
    async fn acquire_slot(&self) -> Result<tokio::sync::OwnedSemaphorePermit, EngineError> {
        if self.semaphore.available_permits() == 0
            && self.waiters.load(Ordering::Acquire) >= self.queue_bound
        {
            return Err(EngineError::Saturated);
        }
        self.waiters.fetch_add(1, Ordering::AcqRel);
        let permit = self.semaphore.clone().acquire_owned().await;
        self.waiters.fetch_sub(1, Ordering::AcqRel);
        permit.map_err(|_| EngineError::Internal("proxy semaphore closed".into()))
    }

    async fn call(
        &self,
        record: &AgentRecord,
        request: &ExecuteRequest,
        timeout: Duration,
    ) -> Result<AgentReply, EngineError> {
        let agent_id = record.agent_id.clone();
        let url = format!("{}/execute", record.endpoint.trim_end_matches('/'));

        let mut builder = self.client.post(&url).timeout(timeout).json(request);
        if let Some(token) = &record.auth_token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::AgentTimeout {
                    agent_id: agent_id.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                }
            } else {
                EngineError::AgentNetwork {
                    agent_id: agent_id.clone(),
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status();

        if let Some(length) = response.content_length() {
            if length as usize > self.response_size_cap {
                return Err(EngineError::AgentContract {
                    agent_id,
                    message: format!("response of {length} bytes exceeds cap"),
                    status: Some(status.as_u16()),
                });
            }
        }

        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::AgentTimeout {
                    agent_id: agent_id.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                }
            } else {
                EngineError::AgentNetwork {
                    agent_id: agent_id.clone(),
                    message: e.to_string(),
                }
            }
        })?;

        if body.len() > self.response_size_cap {
            return Err(EngineError::AgentContract {
                agent_id,
                message: format!("response of {} bytes exceeds cap", body.len()),
                status: Some(status.as_u16()),
            });
        }

        if !status.is_success() {
            let snippet = String::from_utf8_lossy(&body[..body.len().min(512)]).to_string();
            return Err(EngineError::AgentStatus {
                agent_id,
                status: status.as_u16(),
                body: Some(snippet),
            });
        }

        let parsed: ExecuteResponse = serde_json::from_slice(&body).map_err(|e| {
            EngineError::AgentContract {
                agent_id: agent_id.clone(),
                message: format!("invalid JSON response: {e}"),
                status: Some(status.as_u16()),
            }
        })?;

        match parsed.status.as_str() {
            "success" => Ok(AgentReply {
                output: parsed.output.unwrap_or(serde_json::Value::Null),
                cost_usd: parsed.cost_usd,
            }),
            "error" => Err(EngineError::AgentReported {
                agent_id,
                message: parsed
                    .error_message
                    .unwrap_or_else(|| "unspecified agent error".to_string()),
            }),
            other => Err(EngineError::AgentContract {
                agent_id,
                message: format!("unknown response status `{other}`"),
                status: Some(status.as_u16()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentHealth, AgentType};
    use axum::routing::post;
    use axum::{Json, Router};

    fn record(endpoint: String) -> AgentRecord {
        AgentRecord {
            agent_id: "stub".to_string(),
            name: "stub".to_string(),
            description: String::new(),
            endpoint,
            capabilities: vec![],
            agent_type: AgentType::Processor,
            version: "1.0.0".to_string(),
            owner_tenant_id: None,
            auth_token: Some("sekrit".to_string()),
            health: AgentHealth::Ready,
            last_probe_at: None,
        }
    }

    fn request() -> ExecuteRequest {
        ExecuteRequest {
            execution_id: Uuid::new_v4(),
            node_id: "a".to_string(),
            input: serde_json::json!({"x": 1}),
            config: serde_json::json!({}),
        }
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        format!("http://{addr}")
    }

    fn proxy() -> AgentProxy {
        AgentProxy::new(&EngineConfig::default(), EventBus::new(64))
    }

    #[tokio::test]
    async fn successful_dispatch_carries_auth_and_parses_output() {
        let router = Router::new().route(
            "/execute",
            post(|headers: axum::http::HeaderMap, Json(body): Json<serde_json::Value>| async move {
                assert_eq!(
                    headers.get("authorization").unwrap().to_str().unwrap(),
                    "Bearer sekrit"
                );
                Json(serde_json::json!({
                    "status": "success",
                    "output": {"echo": body["input"]},
                    "execution_id": body["execution_id"],
                    "cost_usd": 0.01,
                }))
            }),
        );
        let endpoint = serve(router).await;

        let reply = proxy()
            .execute(&record(endpoint), &request(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply.output["echo"]["x"], 1);
        assert_eq!(reply.cost_usd, Some(0.01));
    }

    #[tokio::test]
    async fn http_500_maps_to_retryable_status_error() {
        let router = Router::new().route(
            "/execute",
            post(|| async { (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let endpoint = serve(router).await;

        let err = proxy()
            .execute(&record(endpoint), &request(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "agent_status");
        assert_eq!(err.recovery(), crate::error::Recovery::Retryable);
    }

    #[tokio::test]
    async fn agent_reported_error_is_permanent() {
        let router = Router::new().route(
            "/execute",
            post(|| async {
                Json(serde_json::json!({"status": "error", "error_message": "no can do"}))
            }),
        );
        let endpoint = serve(router).await;

        let err = proxy()
            .execute(&record(endpoint), &request(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "agent_error");
        assert_eq!(err.recovery(), crate::error::Recovery::Permanent);
    }

    #[tokio::test]
    async fn malformed_body_is_a_contract_violation() {
        let router = Router::new().route("/execute", post(|| async { "not json" }));
        let endpoint = serve(router).await;

        let err = proxy()
            .execute(&record(endpoint), &request(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "agent_contract");
    }

    #[tokio::test]
    async fn timeout_maps_to_agent_timeout() {
        let router = Router::new().route(
            "/execute",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(serde_json::json!({"status": "success", "output": {}}))
            }),
        );
        let endpoint = serve(router).await;

        let err = proxy()
            .execute(&record(endpoint), &request(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "agent_timeout");
    }

    #[tokio::test]
    async fn breaker_opens_after_consecutive_failures() {
        let router = Router::new().route(
            "/execute",
            post(|| async { (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let endpoint = serve(router).await;
        let proxy = proxy();
        let record = record(endpoint);

        for _ in 0..5 {
            let err = proxy
                .execute(&record, &request(), Duration::from_secs(5))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), "agent_status");
        }

        // Sixth dispatch fails fast without touching the network.
        let started = Instant::now();
        let err = proxy
            .execute(&record, &request(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "agent_breaker_open");
        assert!(started.elapsed() < Duration::from_millis(10));
    }
}
