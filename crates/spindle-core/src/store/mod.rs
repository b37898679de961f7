//! Execution store: the durable backend for contexts, node results and
//! inter-node messages.
//!
//! Two interchangeable implementations share one contract: an in-memory
//! store for development and tests, and the SQLite-backed relational store
//! for production. No code path branches on which one is active.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{EngineError, ErrorDetail};
use crate::models::{
    AgentMessage, AgentRecord, ExecutionContext, ExecutionStatus, FlowDefinition, NodeResult,
    StoreMetrics,
};

/// Optional fields applied together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionFields {
    pub output_data: Option<serde_json::Value>,
    pub error: Option<ErrorDetail>,
}

/// Filters for execution listings. All reads are tenant-scoped.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub flow_id: Option<String>,
    pub status: Option<ExecutionStatus>,
}

#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

/// The store contract. Replayed writes are no-ops: `upsert_node_result`
/// keys on `(execution_id, node_id, iteration)` and `append_message` on
/// `message_id`.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Persist a new context; the context must be `pending`.
    async fn create_execution(&self, ctx: &ExecutionContext) -> Result<(), EngineError>;

    async fn get_execution(&self, execution_id: Uuid)
        -> Result<Option<ExecutionContext>, EngineError>;

    /// Compare-and-set on status. Illegal transitions are rejected with
    /// `IllegalTransition`; `started_at`/`completed_at` are stamped by the
    /// store on entry to `running` and to any terminal state.
    async fn transition(
        &self,
        execution_id: Uuid,
        new_status: ExecutionStatus,
        fields: TransitionFields,
    ) -> Result<ExecutionContext, EngineError>;

    async fn upsert_node_result(&self, result: &NodeResult) -> Result<(), EngineError>;

    async fn node_results(&self, execution_id: Uuid) -> Result<Vec<NodeResult>, EngineError>;

    /// Messages are returned in `created_at` order within an execution.
    async fn append_message(&self, msg: &AgentMessage) -> Result<(), EngineError>;

    async fn messages(&self, execution_id: Uuid) -> Result<Vec<AgentMessage>, EngineError>;

    async fn list_executions(
        &self,
        tenant_id: &str,
        filter: ExecutionFilter,
        page: Page,
    ) -> Result<Vec<ExecutionContext>, EngineError>;

    async fn metrics(&self, tenant_id: &str) -> Result<StoreMetrics, EngineError>;

    // ── Agent records (registry persistence) ────────────────────────────

    async fn save_agent(&self, record: &AgentRecord) -> Result<(), EngineError>;

    async fn load_agents(&self) -> Result<Vec<AgentRecord>, EngineError>;

    async fn delete_agent(
        &self,
        agent_id: &str,
        owner_tenant_id: Option<&str>,
    ) -> Result<(), EngineError>;

    // ── Flow definitions (catalog persistence) ──────────────────────────

    /// Upsert on `(flow_id, owner_tenant_id)`.
    async fn save_flow(&self, definition: &FlowDefinition) -> Result<(), EngineError>;

    async fn load_flows(&self) -> Result<Vec<FlowDefinition>, EngineError>;
}

#[cfg(test)]
mod contract_tests {
    //! The same assertions run against both implementations.

    use super::*;
    use crate::models::{NodeKind, NodeSpec, NodeStatus};
    use chrono::Utc;
    use serde_json::json;

    async fn exercise(store: &dyn ExecutionStore) {
        let ctx = ExecutionContext::new("flow-a", "tenant-a", json!({"x": 1}));
        let id = ctx.execution_id;
        store.create_execution(&ctx).await.unwrap();

        // Duplicate create is rejected.
        assert!(store.create_execution(&ctx).await.is_err());

        // pending -> running stamps started_at.
        let running = store
            .transition(id, ExecutionStatus::Running, TransitionFields::default())
            .await
            .unwrap();
        assert_eq!(running.status, ExecutionStatus::Running);
        assert!(running.started_at.is_some());

        // Backward transition is illegal.
        let err = store
            .transition(id, ExecutionStatus::Pending, TransitionFields::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "illegal_transition");

        // Node results upsert idempotently on (execution, node, iteration).
        let mut result = NodeResult::started(id, "a", 0, json!({"x": 1}));
        result.attempts = 1;
        store.upsert_node_result(&result).await.unwrap();
        result.status = NodeStatus::Succeeded;
        result.output = Some(json!({"y": 2}));
        result.completed_at = Some(Utc::now());
        store.upsert_node_result(&result).await.unwrap();
        let rows = store.node_results(id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, NodeStatus::Succeeded);
        assert_eq!(rows[0].attempts, 1);

        // Messages preserve order; replay of a message id is a no-op.
        let m1 = AgentMessage::new(id, "a", "b", json!({"k": 1}));
        let m2 = AgentMessage::new(id, "b", "c", json!({"k": 2}));
        store.append_message(&m1).await.unwrap();
        store.append_message(&m2).await.unwrap();
        store.append_message(&m1).await.unwrap();
        let msgs = store.messages(id).await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].from_node, "a");
        assert_eq!(msgs[1].from_node, "b");

        // running -> succeeded stamps completed_at and stores output.
        let done = store
            .transition(
                id,
                ExecutionStatus::Succeeded,
                TransitionFields {
                    output_data: Some(json!({"out": true})),
                    error: None,
                },
            )
            .await
            .unwrap();
        assert!(done.completed_at.is_some());
        assert_eq!(done.output_data, Some(json!({"out": true})));

        // Terminal states absorb.
        let err = store
            .transition(id, ExecutionStatus::Cancelled, TransitionFields::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "illegal_transition");

        // Listing is tenant-scoped.
        let mine = store
            .list_executions("tenant-a", ExecutionFilter::default(), Page::default())
            .await
            .unwrap();
        assert_eq!(mine.len(), 1);
        let theirs = store
            .list_executions("tenant-b", ExecutionFilter::default(), Page::default())
            .await
            .unwrap();
        assert!(theirs.is_empty());

        // Status filter.
        let succeeded = store
            .list_executions(
                "tenant-a",
                ExecutionFilter {
                    status: Some(ExecutionStatus::Succeeded),
                    ..Default::default()
                },
                Page::default(),
            )
            .await
            .unwrap();
        assert_eq!(succeeded.len(), 1);

        let metrics = store.metrics("tenant-a").await.unwrap();
        assert_eq!(metrics.total_executions, 1);
        assert_eq!(metrics.succeeded_executions, 1);

        // Flow definitions upsert on (flow_id, owner) and round-trip.
        let mut nodes = std::collections::BTreeMap::new();
        nodes.insert(
            "a".to_string(),
            NodeSpec {
                id: "a".to_string(),
                depends_on: vec![],
                kind: NodeKind::Output,
            },
        );
        let mut flow = FlowDefinition {
            flow_id: "echo".to_string(),
            name: "Echo".to_string(),
            description: String::new(),
            version: "1.0.0".to_string(),
            entry_point: "a".to_string(),
            exit_points: vec!["a".to_string()],
            nodes,
            owner_tenant_id: None,
        };
        store.save_flow(&flow).await.unwrap();
        flow.name = "Echo v2".to_string();
        store.save_flow(&flow).await.unwrap();
        let flows = store.load_flows().await.unwrap();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].name, "Echo v2");
        assert_eq!(flows[0].nodes.len(), 1);
    }

    #[tokio::test]
    async fn memory_store_contract() {
        let store = MemoryStore::new();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn sqlite_store_contract() {
        let store = SqliteStore::in_memory().unwrap();
        exercise(&store).await;
    }
}
