//! In-memory execution store for development and tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{
    AgentMessage, AgentRecord, ExecutionContext, ExecutionStatus, FlowDefinition, NodeResult,
    StoreMetrics,
};

use super::{ExecutionFilter, ExecutionStore, Page, TransitionFields};

#[derive(Default)]
struct Inner {
    executions: HashMap<Uuid, ExecutionContext>,
    // Keyed by (node_id, iteration); insertion order is irrelevant, reads
    // sort by (node_id, iteration).
    node_results: HashMap<Uuid, HashMap<(String, u32), NodeResult>>,
    messages: HashMap<Uuid, Vec<AgentMessage>>,
    agents: HashMap<(String, Option<String>), AgentRecord>,
    flows: HashMap<(String, Option<String>), FlowDefinition>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn create_execution(&self, ctx: &ExecutionContext) -> Result<(), EngineError> {
        let mut inner = self.inner.write().await;
        if inner.executions.contains_key(&ctx.execution_id) {
            return Err(EngineError::Internal(format!(
                "execution {} already exists",
                ctx.execution_id
            )));
        }
        inner.executions.insert(ctx.execution_id, ctx.clone());
        Ok(())
    }

    async fn get_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<ExecutionContext>, EngineError> {
        let inner = self.inner.read().await;
        Ok(inner.executions.get(&execution_id).cloned())
    }

    async fn transition(
        &self,
        execution_id: Uuid,
        new_status: ExecutionStatus,
        fields: TransitionFields,
    ) -> Result<ExecutionContext, EngineError> {
        let mut inner = self.inner.write().await;
        let ctx = inner
            .executions
            .get_mut(&execution_id)
            .ok_or_else(|| EngineError::NotFound(format!("execution {execution_id}")))?;

        if !ctx.status.can_transition_to(new_status) {
            return Err(EngineError::IllegalTransition {
                from: ctx.status.as_str().to_string(),
                to: new_status.as_str().to_string(),
            });
        }

        ctx.status = new_status;
        if new_status == ExecutionStatus::Running {
            ctx.started_at = Some(Utc::now());
        }
        if new_status.is_terminal() {
            ctx.completed_at = Some(Utc::now());
        }
        if let Some(output) = fields.output_data {
            ctx.output_data = Some(output);
        }
        if let Some(error) = fields.error {
            ctx.error = Some(error);
        }
        Ok(ctx.clone())
    }

    async fn upsert_node_result(&self, result: &NodeResult) -> Result<(), EngineError> {
        let mut inner = self.inner.write().await;
        let rows = inner.node_results.entry(result.execution_id).or_default();
        let key = (result.node_id.clone(), result.iteration);
        let mut row = result.clone();
        // The original start time survives updates, matching the SQL upsert.
        if let Some(existing) = rows.get(&key) {
            row.started_at = existing.started_at;
        }
        rows.insert(key, row);
        Ok(())
    }

    async fn node_results(&self, execution_id: Uuid) -> Result<Vec<NodeResult>, EngineError> {
        let inner = self.inner.read().await;
        let mut rows: Vec<NodeResult> = inner
            .node_results
            .get(&execution_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        rows.sort_by(|a, b| (&a.node_id, a.iteration).cmp(&(&b.node_id, b.iteration)));
        Ok(rows)
    }

    async fn append_message(&self, msg: &AgentMessage) -> Result<(), EngineError> {
        let mut inner = self.inner.write().await;
        let messages = inner.messages.entry(msg.execution_id).or_default();
        if messages.iter().any(|m| m.message_id == msg.message_id) {
            return Ok(());
        }
        messages.push(msg.clone());
        Ok(())
    }

    async fn messages(&self, execution_id: Uuid) -> Result<Vec<AgentMessage>, EngineError> {
        let inner = self.inner.read().await;
        Ok(inner.messages.get(&execution_id).cloned().unwrap_or_default())
    }

    async fn list_executions(
        &self,
        tenant_id: &str,
        filter: ExecutionFilter,
        page: Page,
    ) -> Result<Vec<ExecutionContext>, EngineError> {
        let inner = self.inner.read().await;
        let mut rows: Vec<ExecutionContext> = inner
            .executions
            .values()
            .filter(|ctx| ctx.tenant_id == tenant_id)
            .filter(|ctx| filter.flow_id.as_deref().map_or(true, |f| ctx.flow_id == f))
            .filter(|ctx| filter.status.map_or(true, |s| ctx.status == s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows.into_iter().skip(page.offset).take(page.limit).collect())
    }

    async fn metrics(&self, tenant_id: &str) -> Result<StoreMetrics, EngineError> {
        let inner = self.inner.read().await;
        let mut metrics = StoreMetrics::default();
        let mut total_ms = 0.0;
        let mut completed = 0u64;
        for ctx in inner.executions.values().filter(|c| c.tenant_id == tenant_id) {
            metrics.total_executions += 1;
            match ctx.status {
                ExecutionStatus::Succeeded => metrics.succeeded_executions += 1,
                ExecutionStatus::Failed => metrics.failed_executions += 1,
                ExecutionStatus::Cancelled => metrics.cancelled_executions += 1,
                ExecutionStatus::Running => metrics.running_executions += 1,
                ExecutionStatus::Pending => {}
            }
            if let (Some(start), Some(end)) = (ctx.started_at, ctx.completed_at) {
                total_ms += (end - start).num_milliseconds() as f64;
                completed += 1;
            }
        }
        if completed > 0 {
            metrics.average_execution_ms = total_ms / completed as f64;
        }
        Ok(metrics)
    }

    async fn save_agent(&self, record: &AgentRecord) -> Result<(), EngineError> {
        let mut inner = self.inner.write().await;
        inner.agents.insert(
            (record.agent_id.clone(), record.owner_tenant_id.clone()),
            record.clone(),
        );
        Ok(())
    }

    async fn load_agents(&self) -> Result<Vec<AgentRecord>, EngineError> {
        let inner = self.inner.read().await;
        Ok(inner.agents.values().cloned().collect())
    }

    async fn delete_agent(
        &self,
        agent_id: &str,
        owner_tenant_id: Option<&str>,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.write().await;
        inner
            .agents
            .remove(&(agent_id.to_string(), owner_tenant_id.map(String::from)));
        Ok(())
    }

    async fn save_flow(&self, definition: &FlowDefinition) -> Result<(), EngineError> {
        let mut inner = self.inner.write().await;
        inner.flows.insert(
            (definition.flow_id.clone(), definition.owner_tenant_id.clone()),
            definition.clone(),
        );
        Ok(())
    }

    async fn load_flows(&self) -> Result<Vec<FlowDefinition>, EngineError> {
        let inner = self.inner.read().await;
        Ok(inner.flows.values().cloned().collect())
    }
}
