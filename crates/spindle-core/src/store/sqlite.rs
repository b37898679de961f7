//! SQLite-backed execution store (the relational implementation).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{EngineError, ErrorDetail};
use crate::models::{
    AgentHealth, AgentMessage, AgentRecord, AgentType, ExecutionContext, ExecutionStatus,
    FlowDefinition, NodeResult, NodeStatus, StoreMetrics,
};

use super::{ExecutionFilter, ExecutionStore, Page, TransitionFields};

#[derive(Clone)]
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn open(db_path: &str) -> Result<Self, EngineError> {
        Ok(Self::new(Database::open(db_path)?))
    }

    pub fn in_memory() -> Result<Self, EngineError> {
        Ok(Self::new(Database::open_in_memory()?))
    }
}

#[async_trait]
impl ExecutionStore for SqliteStore {
    async fn create_execution(&self, ctx: &ExecutionContext) -> Result<(), EngineError> {
        let ctx = ctx.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO executions
                       (execution_id, flow_id, tenant_id, status, input_data, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![
                        ctx.execution_id.to_string(),
                        ctx.flow_id,
                        ctx.tenant_id,
                        ctx.status.as_str(),
                        ctx.input_data.to_string(),
                        ctx.created_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn get_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<ExecutionContext>, EngineError> {
        let id = execution_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT execution_id, flow_id, tenant_id, status, input_data, output_data,
                            error, created_at, started_at, completed_at
                     FROM executions WHERE execution_id = ?1",
                )?;
                stmt.query_row(rusqlite::params![id], row_to_execution)
                    .optional()
            })
            .await
    }

    async fn transition(
        &self,
        execution_id: Uuid,
        new_status: ExecutionStatus,
        fields: TransitionFields,
    ) -> Result<ExecutionContext, EngineError> {
        let id = execution_id.to_string();
        let result = self
            .db
            .with_conn_async(move |conn| {
                // The connection mutex serializes the read-check-write, so
                // this compare-and-set is atomic per process.
                let mut stmt = conn.prepare(
                    "SELECT execution_id, flow_id, tenant_id, status, input_data, output_data,
                            error, created_at, started_at, completed_at
                     FROM executions WHERE execution_id = ?1",
                )?;
                let current = stmt
                    .query_row(rusqlite::params![id], row_to_execution)
                    .optional()?;
                let Some(mut ctx) = current else {
                    return Ok(Err(EngineError::NotFound(format!("execution {id}"))));
                };

                if !ctx.status.can_transition_to(new_status) {
                    return Ok(Err(EngineError::IllegalTransition {
                        from: ctx.status.as_str().to_string(),
                        to: new_status.as_str().to_string(),
                    }));
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

                conn.execute(
                    "UPDATE executions
                     SET status = ?2, output_data = ?3, error = ?4, started_at = ?5,
                         completed_at = ?6
                     WHERE execution_id = ?1",
                    rusqlite::params![
                        id,
                        ctx.status.as_str(),
                        ctx.output_data.as_ref().map(|v| v.to_string()),
                        ctx.error
                            .as_ref()
                            .and_then(|e| serde_json::to_string(e).ok()),
                        ctx.started_at.map(|t| t.timestamp_millis()),
                        ctx.completed_at.map(|t| t.timestamp_millis()),
                    ],
                )?;
                Ok(Ok(ctx))
            })
            .await?;
        result
    }

    async fn upsert_node_result(&self, result: &NodeResult) -> Result<(), EngineError> {
        let r = result.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO node_results
                       (execution_id, node_id, iteration, status, input, output, error,
                        started_at, completed_at, attempts, cost_usd)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                     ON CONFLICT(execution_id, node_id, iteration) DO UPDATE SET
                       status = excluded.status,
                       input = excluded.input,
                       output = excluded.output,
                       error = excluded.error,
                       completed_at = excluded.completed_at,
                       attempts = excluded.attempts,
                       cost_usd = excluded.cost_usd",
                    rusqlite::params![
                        r.execution_id.to_string(),
                        r.node_id,
                        r.iteration,
                        r.status.as_str(),
                        r.input.to_string(),
                        r.output.as_ref().map(|v| v.to_string()),
                        r.error.as_ref().and_then(|e| serde_json::to_string(e).ok()),
                        r.started_at.timestamp_millis(),
                        r.completed_at.map(|t| t.timestamp_millis()),
                        r.attempts,
                        r.cost_usd,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn node_results(&self, execution_id: Uuid) -> Result<Vec<NodeResult>, EngineError> {
        let id = execution_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT execution_id, node_id, iteration, status, input, output, error,
                            started_at, completed_at, attempts, cost_usd
                     FROM node_results WHERE execution_id = ?1
                     ORDER BY node_id, iteration",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![id], row_to_node_result)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    async fn append_message(&self, msg: &AgentMessage) -> Result<(), EngineError> {
        let m = msg.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO agent_messages
                       (message_id, execution_id, from_node, to_node, payload, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![
                        m.message_id.to_string(),
                        m.execution_id.to_string(),
                        m.from_node,
                        m.to_node,
                        m.payload.to_string(),
                        m.created_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn messages(&self, execution_id: Uuid) -> Result<Vec<AgentMessage>, EngineError> {
        let id = execution_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT message_id, execution_id, from_node, to_node, payload, created_at
                     FROM agent_messages WHERE execution_id = ?1
                     ORDER BY created_at, rowid",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![id], row_to_message)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    async fn list_executions(
        &self,
        tenant_id: &str,
        filter: ExecutionFilter,
        page: Page,
    ) -> Result<Vec<ExecutionContext>, EngineError> {
        let tenant = tenant_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut sql = String::from(
                    "SELECT execution_id, flow_id, tenant_id, status, input_data, output_data,
                            error, created_at, started_at, completed_at
                     FROM executions WHERE tenant_id = ?1",
                );
                let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(tenant)];
                if let Some(flow_id) = filter.flow_id {
                    sql.push_str(&format!(" AND flow_id = ?{}", params.len() + 1));
                    params.push(Box::new(flow_id));
                }
                if let Some(status) = filter.status {
                    sql.push_str(&format!(" AND status = ?{}", params.len() + 1));
                    params.push(Box::new(status.as_str().to_string()));
                }
                sql.push_str(&format!(
                    " ORDER BY created_at DESC LIMIT {} OFFSET {}",
                    page.limit, page.offset
                ));

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(
                        rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
                        row_to_execution,
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    async fn metrics(&self, tenant_id: &str) -> Result<StoreMetrics, EngineError> {
        let tenant = tenant_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT status, COUNT(*),
                            AVG(CASE WHEN completed_at IS NOT NULL AND started_at IS NOT NULL
                                     THEN completed_at - started_at END)
                     FROM executions WHERE tenant_id = ?1 GROUP BY status",
                )?;
                let rows = stmt.query_map(rusqlite::params![tenant], |row| {
                    let status: String = row.get(0)?;
                    let count: u64 = row.get(1)?;
                    let avg: Option<f64> = row.get(2)?;
                    Ok((status, count, avg))
                })?;

                let mut metrics = StoreMetrics::default();
                let mut weighted_ms = 0.0;
                let mut completed = 0u64;
                for row in rows {
                    let (status, count, avg) = row?;
                    metrics.total_executions += count;
                    match ExecutionStatus::parse(&status) {
                        Some(ExecutionStatus::Succeeded) => metrics.succeeded_executions += count,
                        Some(ExecutionStatus::Failed) => metrics.failed_executions += count,
                        Some(ExecutionStatus::Cancelled) => metrics.cancelled_executions += count,
                        Some(ExecutionStatus::Running) => metrics.running_executions += count,
                        _ => {}
                    }
                    if let Some(avg) = avg {
                        weighted_ms += avg * count as f64;
                        completed += count;
                    }
                }
                if completed > 0 {
                    metrics.average_execution_ms = weighted_ms / completed as f64;
                }
                Ok(metrics)
            })
            .await
    }

    async fn save_agent(&self, record: &AgentRecord) -> Result<(), EngineError> {
        let r = record.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO agents
                       (agent_id, owner_tenant_id, name, description, endpoint, capabilities,
                        agent_type, version, auth_token, health, last_probe_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                     ON CONFLICT(agent_id, owner_tenant_id) DO UPDATE SET
                       name = excluded.name,
                       description = excluded.description,
                       endpoint = excluded.endpoint,
                       capabilities = excluded.capabilities,
                       agent_type = excluded.agent_type,
                       version = excluded.version,
                       auth_token = excluded.auth_token,
                       health = excluded.health,
                       last_probe_at = excluded.last_probe_at",
                    rusqlite::params![
                        r.agent_id,
                        r.owner_tenant_id.clone().unwrap_or_default(),
                        r.name,
                        r.description,
                        r.endpoint,
                        serde_json::to_string(&r.capabilities).unwrap_or_else(|_| "[]".into()),
                        r.agent_type.as_str(),
                        r.version,
                        r.auth_token,
                        r.health.as_str(),
                        r.last_probe_at.map(|t| t.timestamp_millis()),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn load_agents(&self) -> Result<Vec<AgentRecord>, EngineError> {
        self.db
            .with_conn_async(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT agent_id, owner_tenant_id, name, description, endpoint, capabilities,
                            agent_type, version, auth_token, health, last_probe_at
                     FROM agents",
                )?;
                let rows = stmt
                    .query_map([], row_to_agent)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    async fn delete_agent(
        &self,
        agent_id: &str,
        owner_tenant_id: Option<&str>,
    ) -> Result<(), EngineError> {
        let id = agent_id.to_string();
        let owner = owner_tenant_id.unwrap_or_default().to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "DELETE FROM agents WHERE agent_id = ?1 AND owner_tenant_id = ?2",
                    rusqlite::params![id, owner],
                )?;
                Ok(())
            })
            .await
    }

    async fn save_flow(&self, definition: &FlowDefinition) -> Result<(), EngineError> {
        let flow_id = definition.flow_id.clone();
        let owner = definition.owner_tenant_id.clone().unwrap_or_default();
        let body = serde_json::to_string(definition)
            .map_err(|e| EngineError::Internal(format!("unserializable flow definition: {e}")))?;
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO flows (flow_id, owner_tenant_id, definition, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(flow_id, owner_tenant_id) DO UPDATE SET
                       definition = excluded.definition,
                       updated_at = excluded.updated_at",
                    rusqlite::params![flow_id, owner, body, Utc::now().timestamp_millis()],
                )?;
                Ok(())
            })
            .await
    }

    async fn load_flows(&self) -> Result<Vec<FlowDefinition>, EngineError> {
        self.db
            .with_conn_async(|conn| {
                let mut stmt = conn.prepare("SELECT definition FROM flows")?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?
            .into_iter()
            .map(|body| {
                serde_json::from_str(&body).map_err(|e| {
                    EngineError::StoreUnavailable(format!("corrupt flow definition row: {e}"))
                })
            })
            .collect()
    }
}

// ── Row mappers ─────────────────────────────────────────────────────────

fn parse_uuid(s: String) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(e),
        )
    })
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

fn row_to_execution(row: &Row<'_>) -> rusqlite::Result<ExecutionContext> {
    let error: Option<String> = row.get(6)?;
    Ok(ExecutionContext {
        execution_id: parse_uuid(row.get(0)?)?,
        flow_id: row.get(1)?,
        tenant_id: row.get(2)?,
        status: ExecutionStatus::parse(&row.get::<_, String>(3)?)
            .unwrap_or(ExecutionStatus::Pending),
        input_data: serde_json::from_str(&row.get::<_, String>(4)?)
            .unwrap_or(serde_json::Value::Null),
        output_data: row
            .get::<_, Option<String>>(5)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        error: error.and_then(|s| serde_json::from_str::<ErrorDetail>(&s).ok()),
        created_at: millis_to_datetime(row.get(7)?),
        started_at: row.get::<_, Option<i64>>(8)?.map(millis_to_datetime),
        completed_at: row.get::<_, Option<i64>>(9)?.map(millis_to_datetime),
    })
}

fn row_to_node_result(row: &Row<'_>) -> rusqlite::Result<NodeResult> {
    Ok(NodeResult {
        execution_id: parse_uuid(row.get(0)?)?,
        node_id: row.get(1)?,
        iteration: row.get(2)?,
        status: NodeStatus::parse(&row.get::<_, String>(3)?).unwrap_or(NodeStatus::Failed),
        input: serde_json::from_str(&row.get::<_, String>(4)?).unwrap_or(serde_json::Value::Null),
        output: row
            .get::<_, Option<String>>(5)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        error: row
            .get::<_, Option<String>>(6)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        started_at: millis_to_datetime(row.get(7)?),
        completed_at: row.get::<_, Option<i64>>(8)?.map(millis_to_datetime),
        attempts: row.get(9)?,
        cost_usd: row.get(10)?,
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<AgentMessage> {
    Ok(AgentMessage {
        message_id: parse_uuid(row.get(0)?)?,
        execution_id: parse_uuid(row.get(1)?)?,
        from_node: row.get(2)?,
        to_node: row.get(3)?,
        payload: serde_json::from_str(&row.get::<_, String>(4)?)
            .unwrap_or(serde_json::Value::Null),
        created_at: millis_to_datetime(row.get(5)?),
    })
}

fn row_to_agent(row: &Row<'_>) -> rusqlite::Result<AgentRecord> {
    let owner: String = row.get(1)?;
    Ok(AgentRecord {
        agent_id: row.get(0)?,
        owner_tenant_id: if owner.is_empty() { None } else { Some(owner) },
        name: row.get(2)?,
        description: row.get(3)?,
        endpoint: row.get(4)?,
        capabilities: serde_json::from_str(&row.get::<_, String>(5)?).unwrap_or_default(),
        agent_type: AgentType::parse(&row.get::<_, String>(6)?).unwrap_or(AgentType::Processor),
        version: row.get(7)?,
        auth_token: row.get(8)?,
        health: match row.get::<_, String>(9)?.as_str() {
            "ready" => AgentHealth::Ready,
            "unhealthy" => AgentHealth::Unhealthy,
            _ => AgentHealth::Unknown,
        },
        last_probe_at: row.get::<_, Option<i64>>(10)?.map(millis_to_datetime),
    })
}
