//! Engine tunables.
//!
//! Every limit the scheduler, proxy and registry enforce lives here so a
//! deployment can override them field by field. `Default` is the documented
//! production baseline.

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-execution parallel node dispatch cap.
    pub parallelism: usize,
    /// Default per-node agent call timeout, seconds.
    pub node_timeout_secs: u64,
    /// Per-execution wall-clock deadline, seconds.
    pub execution_deadline_secs: u64,
    /// Base delay for exponential backoff, milliseconds.
    pub retry_base_delay_ms: u64,
    /// Backoff cap, milliseconds.
    pub retry_max_delay_ms: u64,
    /// Consecutive failures that open an agent's circuit breaker.
    pub breaker_threshold: u32,
    /// How long an open breaker rejects dispatches, seconds.
    pub breaker_open_secs: u64,
    /// Process-wide concurrent outbound dispatch cap.
    pub proxy_concurrency: usize,
    /// Dispatches allowed to queue behind the concurrency cap.
    pub proxy_queue_bound: usize,
    /// Maximum accepted agent response body, bytes.
    pub response_size_cap: usize,
    /// Health sweep interval, seconds.
    pub probe_interval_secs: u64,
    /// Per-probe timeout, seconds.
    pub probe_timeout_secs: u64,
    /// Consecutive probe failures before an agent is marked unhealthy.
    pub probe_failure_threshold: u32,
    /// Parallel executions allowed per tenant.
    pub tenant_parallel_executions: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: 8,
            node_timeout_secs: 30,
            execution_deadline_secs: 300,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            breaker_threshold: 5,
            breaker_open_secs: 60,
            proxy_concurrency: 256,
            proxy_queue_bound: 1024,
            response_size_cap: 4 * 1024 * 1024,
            probe_interval_secs: 30,
            probe_timeout_secs: 5,
            probe_failure_threshold: 3,
            tenant_parallel_executions: 4,
        }
    }
}

impl EngineConfig {
    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }

    pub fn execution_deadline(&self) -> Duration {
        Duration::from_secs(self.execution_deadline_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn breaker_open(&self) -> Duration {
        Duration::from_secs(self.breaker_open_secs)
    }
}
