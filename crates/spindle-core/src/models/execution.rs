use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorDetail;

/// Lifecycle of one flow execution. Transitions are linear and terminal
/// states are absorbing: pending -> running -> {succeeded, failed, cancelled}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// The legal transition table enforced by the store's compare-and-set.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Cancelled)
                | (Self::Pending, Self::Failed)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

/// One run of a flow with concrete input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution_id: Uuid,
    pub flow_id: String,
    pub tenant_id: String,
    pub status: ExecutionStatus,
    pub input_data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(flow_id: &str, tenant_id: &str, input_data: serde_json::Value) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            flow_id: flow_id.to_string(),
            tenant_id: tenant_id.to_string(),
            status: ExecutionStatus::Pending,
            input_data,
            output_data: None,
            started_at: None,
            completed_at: None,
            error: None,
            created_at: Utc::now(),
        }
    }
}

/// Terminal and in-flight states of a single node within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Record of one node attempt set, keyed by
/// `(execution_id, node_id, iteration)`. Loop bodies produce one row per
/// iteration; everything else uses iteration 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    pub execution_id: Uuid,
    pub node_id: String,
    #[serde(default)]
    pub iteration: u32,
    pub status: NodeStatus,
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Dispatch attempts consumed; never exceeds `max_retries + 1`.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

impl NodeResult {
    pub fn started(execution_id: Uuid, node_id: &str, iteration: u32, input: serde_json::Value) -> Self {
        Self {
            execution_id,
            node_id: node_id.to_string(),
            iteration,
            status: NodeStatus::Running,
            input,
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
            attempts: 0,
            cost_usd: None,
        }
    }
}

/// Durable trace of one edge traversal: the payload node `from_node`
/// contributed to `to_node`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub message_id: Uuid,
    pub execution_id: Uuid,
    pub from_node: String,
    pub to_node: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AgentMessage {
    pub fn new(
        execution_id: Uuid,
        from_node: &str,
        to_node: &str,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            execution_id,
            from_node: from_node.to_string(),
            to_node: to_node.to_string(),
            payload,
            created_at: Utc::now(),
        }
    }
}

/// Tenant-scoped execution aggregates served by the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreMetrics {
    pub total_executions: u64,
    pub succeeded_executions: u64,
    pub failed_executions: u64,
    pub cancelled_executions: u64,
    pub running_executions: u64,
    /// Mean wall time of completed executions, milliseconds.
    pub average_execution_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_absorb() {
        for s in [
            ExecutionStatus::Succeeded,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
        ] {
            assert!(s.is_terminal());
            for next in [
                ExecutionStatus::Pending,
                ExecutionStatus::Running,
                ExecutionStatus::Succeeded,
                ExecutionStatus::Failed,
                ExecutionStatus::Cancelled,
            ] {
                assert!(!s.can_transition_to(next), "{s:?} -> {next:?}");
            }
        }
    }

    #[test]
    fn no_backward_transitions() {
        assert!(!ExecutionStatus::Running.can_transition_to(ExecutionStatus::Pending));
        assert!(ExecutionStatus::Pending.can_transition_to(ExecutionStatus::Running));
        assert!(ExecutionStatus::Running.can_transition_to(ExecutionStatus::Succeeded));
    }
}
