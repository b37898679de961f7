//! Event bus: typed execution events fanned out to subscribers.
//!
//! Publishing is decoupled from the orchestrator's critical path: the bus
//! wraps a broadcast channel, `publish` never blocks and never fails, and
//! slow subscribers lag (dropping their oldest events) rather than
//! applying backpressure to executions.

mod metrics;
mod webhook;

pub use metrics::MetricsAggregator;
pub use webhook::{WebhookConfig, WebhookDispatcher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use uuid::Uuid;

use crate::error::ErrorDetail;
use crate::models::AgentHealth;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ExecutionStarted,
    ExecutionSucceeded,
    ExecutionFailed,
    ExecutionCancelled,
    NodeStarted,
    NodeSucceeded,
    NodeFailed,
    NodeSkipped,
    NodeRetrying,
    AgentProbed,
    AgentLatency,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecutionStarted => "execution.started",
            Self::ExecutionSucceeded => "execution.succeeded",
            Self::ExecutionFailed => "execution.failed",
            Self::ExecutionCancelled => "execution.cancelled",
            Self::NodeStarted => "node.started",
            Self::NodeSucceeded => "node.succeeded",
            Self::NodeFailed => "node.failed",
            Self::NodeSkipped => "node.skipped",
            Self::NodeRetrying => "node.retrying",
            Self::AgentProbed => "agent.probed",
            Self::AgentLatency => "agent.latency",
        }
    }
}

/// One event on the bus. Which optional fields are set depends on the kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionEvent {
    fn base(kind: EventKind) -> Self {
        Self {
            kind,
            execution_id: None,
            node_id: None,
            agent_id: None,
            data: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn execution(kind: EventKind, execution_id: Uuid) -> Self {
        Self {
            execution_id: Some(execution_id),
            ..Self::base(kind)
        }
    }

    pub fn execution_failed(execution_id: Uuid, error: &ErrorDetail) -> Self {
        Self {
            execution_id: Some(execution_id),
            data: serde_json::to_value(error).unwrap_or_default(),
            ..Self::base(EventKind::ExecutionFailed)
        }
    }

    pub fn node(kind: EventKind, execution_id: Uuid, node_id: &str, iteration: u32) -> Self {
        Self {
            execution_id: Some(execution_id),
            node_id: Some(node_id.to_string()),
            data: serde_json::json!({ "iteration": iteration }),
            ..Self::base(kind)
        }
    }

    pub fn node_failed(
        execution_id: Uuid,
        node_id: &str,
        iteration: u32,
        error: &ErrorDetail,
    ) -> Self {
        Self {
            execution_id: Some(execution_id),
            node_id: Some(node_id.to_string()),
            data: serde_json::json!({ "iteration": iteration, "error": error }),
            ..Self::base(EventKind::NodeFailed)
        }
    }

    pub fn node_retrying(
        execution_id: Uuid,
        node_id: &str,
        attempt: u32,
        delay_ms: u64,
    ) -> Self {
        Self {
            execution_id: Some(execution_id),
            node_id: Some(node_id.to_string()),
            data: serde_json::json!({ "attempt": attempt, "delay_ms": delay_ms }),
            ..Self::base(EventKind::NodeRetrying)
        }
    }

    pub fn agent_probed(agent_id: &str, health: AgentHealth) -> Self {
        Self {
            agent_id: Some(agent_id.to_string()),
            data: serde_json::json!({ "healthy": health == AgentHealth::Ready }),
            ..Self::base(EventKind::AgentProbed)
        }
    }

    pub fn agent_latency(agent_id: &str, millis: u64) -> Self {
        Self {
            agent_id: Some(agent_id.to_string()),
            data: serde_json::json!({ "millis": millis }),
            ..Self::base(EventKind::AgentLatency)
        }
    }
}

/// Cloneable handle to the bus.
#[derive(Clone)]
pub struct EventBus {
    sender: tokio::sync::broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Fire-and-forget. A send with no subscribers is not an error.
    pub fn publish(&self, event: ExecutionEvent) {
        tracing::debug!(kind = event.kind.as_str(), "event published");
        let _ = self.sender.send(event);
    }

    /// Raw firehose subscription (webhooks, metrics).
    pub fn subscribe_all(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    /// Stream of events for a single execution. Lagged events are dropped
    /// silently; subscribers observing state must read the store.
    pub fn subscribe_execution(
        &self,
        execution_id: Uuid,
    ) -> impl Stream<Item = ExecutionEvent> + Send + Unpin {
        let stream = BroadcastStream::new(self.sender.subscribe());
        Box::pin(stream.filter_map(move |item| match item {
            Ok(event) if event.execution_id == Some(execution_id) => Some(event),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event subscriber lagged");
                None
            }
        }))
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn execution_streams_are_filtered() {
        let bus = EventBus::new(16);
        let target = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut stream = bus.subscribe_execution(target);

        bus.publish(ExecutionEvent::execution(EventKind::ExecutionStarted, other));
        bus.publish(ExecutionEvent::execution(EventKind::ExecutionStarted, target));
        bus.publish(ExecutionEvent::node(
            EventKind::NodeSucceeded,
            target,
            "a",
            0,
        ));

        let first = stream.next().await.unwrap();
        assert_eq!(first.kind, EventKind::ExecutionStarted);
        assert_eq!(first.execution_id, Some(target));
        let second = stream.next().await.unwrap();
        assert_eq!(second.kind, EventKind::NodeSucceeded);
        assert_eq!(second.node_id.as_deref(), Some("a"));
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.publish(ExecutionEvent::agent_probed("echo", AgentHealth::Ready));
    }

    #[test]
    fn kinds_render_dotted_names() {
        assert_eq!(EventKind::NodeRetrying.as_str(), "node.retrying");
        assert_eq!(EventKind::AgentProbed.as_str(), "agent.probed");
    }
}
