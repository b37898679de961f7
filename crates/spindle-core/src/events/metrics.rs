//! In-process metrics aggregator: counts events by kind and tracks agent
//! dispatch latency samples published by the proxy.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::{EventBus, EventKind};

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub events_by_kind: HashMap<&'static str, u64>,
    pub latency_samples: u64,
    pub latency_total_ms: u64,
}

impl MetricsSnapshot {
    pub fn average_latency_ms(&self) -> Option<f64> {
        if self.latency_samples == 0 {
            return None;
        }
        Some(self.latency_total_ms as f64 / self.latency_samples as f64)
    }
}

#[derive(Clone, Default)]
pub struct MetricsAggregator {
    state: Arc<RwLock<MetricsSnapshot>>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the bus and aggregate until the token cancels.
    pub fn spawn(&self, bus: &EventBus, shutdown: CancellationToken) {
        let mut receiver = bus.subscribe_all();
        let state = self.state.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = receiver.recv() => match received {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                };

                let mut snapshot = state.write().await;
                *snapshot
                    .events_by_kind
                    .entry(event.kind.as_str())
                    .or_insert(0) += 1;
                if event.kind == EventKind::AgentLatency {
                    if let Some(ms) = event.data.get("millis").and_then(|v| v.as_u64()) {
                        snapshot.latency_samples += 1;
                        snapshot.latency_total_ms += ms;
                    }
                }
            }
        });
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        self.state.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ExecutionEvent;

    #[tokio::test]
    async fn aggregates_counts_and_latency() {
        let bus = EventBus::new(16);
        let aggregator = MetricsAggregator::new();
        let shutdown = CancellationToken::new();
        aggregator.spawn(&bus, shutdown.clone());

        // Give the subscriber task a chance to attach.
        tokio::task::yield_now().await;

        bus.publish(ExecutionEvent::agent_latency("echo", 40));
        bus.publish(ExecutionEvent::agent_latency("echo", 60));

        // Drain asynchronously; poll until the aggregator catches up.
        for _ in 0..50 {
            if aggregator.snapshot().await.latency_samples == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let snapshot = aggregator.snapshot().await;
        assert_eq!(snapshot.latency_samples, 2);
        assert_eq!(snapshot.average_latency_ms(), Some(50.0));
        assert_eq!(snapshot.events_by_kind.get("agent.latency"), Some(&2));
        shutdown.cancel();
    }
}
