//! The engine handle.
//!
//! `Engine` owns every sub-component (catalog, registry, store, proxy,
//! event bus) and exposes the API the transport layer consumes. There is
//! no module-level state: construct an engine, share it behind an `Arc`,
//! and pass it by capability.
//!
//! Tenant isolation: every read or mutation takes an opaque `tenant_id`
//! and probes against another tenant's resources answer `NotFound`, never
//! `Forbidden`, so existence does not leak across scopes.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, Semaphore};
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::catalog::FlowCatalog;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::{
    EventBus, EventKind, ExecutionEvent, MetricsAggregator, WebhookConfig, WebhookDispatcher,
};
use crate::models::{
    AgentMessage, AgentRecord, ExecutionContext, ExecutionStatus, FlowDefinition, NodeResult,
    StoreMetrics,
};
use crate::orchestrator::{self, OrchestratorDeps};
use crate::proxy::AgentProxy;
use crate::registry::AgentRegistry;
use crate::store::{ExecutionFilter, ExecutionStore, Page, TransitionFields};

/// Per-submission overrides.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Execution deadline override, seconds.
    pub deadline_secs: Option<u64>,
}

pub type EngineHandle = Arc<Engine>;

pub struct Engine {
    config: Arc<EngineConfig>,
    catalog: FlowCatalog,
    registry: AgentRegistry,
    store: Arc<dyn ExecutionStore>,
    proxy: Arc<AgentProxy>,
    bus: EventBus,
    metrics: MetricsAggregator,
    tenant_slots: RwLock<HashMap<String, Arc<Semaphore>>>,
    live: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
    shutdown: CancellationToken,
}

impl Engine {
    pub fn new(config: EngineConfig, store: Arc<dyn ExecutionStore>) -> EngineHandle {
        let config = Arc::new(config);
        let bus = EventBus::default();
        let proxy = Arc::new(AgentProxy::new(&config, bus.clone()));
        let registry = AgentRegistry::new(&config, store.clone(), bus.clone());
        let metrics = MetricsAggregator::new();
        let shutdown = CancellationToken::new();

        registry.spawn_sweeper(&config, shutdown.clone());
        metrics.spawn(&bus, shutdown.clone());

        Arc::new(Self {
            config,
            catalog: FlowCatalog::new(),
            registry,
            store,
            proxy,
            bus,
            metrics,
            tenant_slots: RwLock::new(HashMap::new()),
            live: Arc::new(RwLock::new(HashMap::new())),
            shutdown,
        })
    }

    /// Development engine: in-memory store.
    pub fn in_memory(config: EngineConfig) -> EngineHandle {
        Self::new(config, Arc::new(crate::store::MemoryStore::new()))
    }

    /// Production engine: SQLite-backed store at `db_path`.
    pub fn with_sqlite(config: EngineConfig, db_path: &str) -> Result<EngineHandle, EngineError> {
        Ok(Self::new(
            config,
            Arc::new(crate::store::SqliteStore::open(db_path)?),
        ))
    }

    pub fn catalog(&self) -> &FlowCatalog {
        &self.catalog
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn metrics_aggregator(&self) -> &MetricsAggregator {
        &self.metrics
    }

    /// Attach a webhook subscriber; runs until engine shutdown.
    pub fn attach_webhook(&self, config: WebhookConfig) {
        WebhookDispatcher::spawn(&self.bus, config, self.shutdown.clone());
    }

    /// Stop background tasks (sweeper, subscribers). In-flight executions
    /// keep running; cancel them individually first if needed.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    // ── Executions ──────────────────────────────────────────────────────

    /// Validate the flow, persist a pending context and start the
    /// coordinator. Returns immediately with the execution id.
    pub async fn submit(
        &self,
        flow_id: &str,
        input: serde_json::Value,
        tenant_id: &str,
        options: SubmitOptions,
    ) -> Result<Uuid, EngineError> {
        let flow = self.catalog.get(flow_id, tenant_id).await?;
        let ctx = ExecutionContext::new(flow_id, tenant_id, input);
        let execution_id = ctx.execution_id;
        self.store.create_execution(&ctx).await?;

        let token = CancellationToken::new();
        self.live.write().await.insert(execution_id, token.clone());

        let mut config = (*self.config).clone();
        if let Some(deadline) = options.deadline_secs {
            config.execution_deadline_secs = deadline;
        }
        let deps = OrchestratorDeps {
            config: Arc::new(config),
            store: self.store.clone(),
            registry: self.registry.clone(),
            proxy: self.proxy.clone(),
            bus: self.bus.clone(),
        };

        let slot = self.tenant_slot(tenant_id).await;
        let store = self.store.clone();
        let bus = self.bus.clone();
        let live = self.live.clone();

        tokio::spawn(async move {
            // The per-tenant cap gates here: the execution stays pending
            // until a slot frees up.
            let permit = tokio::select! {
                _ = token.cancelled() => None,
                permit = slot.acquire_owned() => permit.ok(),
            };

            match permit {
                None => {
                    // Cancelled (or the engine dropped) while queued.
                    let _ = store
                        .transition(
                            execution_id,
                            ExecutionStatus::Cancelled,
                            TransitionFields::default(),
                        )
                        .await;
                    bus.publish(ExecutionEvent::execution(
                        EventKind::ExecutionCancelled,
                        execution_id,
                    ));
                }
                Some(_permit) => {
                    match store
                        .transition(
                            execution_id,
                            ExecutionStatus::Running,
                            TransitionFields::default(),
                        )
                        .await
                    {
                        Ok(running) => {
                            orchestrator::run_execution(deps, flow, running, token.clone()).await;
                        }
                        Err(e) => {
                            // A cancel can race the slot acquisition; the
                            // context is already terminal then.
                            tracing::debug!(%execution_id, error = %e, "execution did not start");
                        }
                    }
                }
            }
            live.write().await.remove(&execution_id);
        });

        Ok(execution_id)
    }

    pub async fn status(
        &self,
        execution_id: Uuid,
        tenant_id: &str,
    ) -> Result<ExecutionContext, EngineError> {
        self.owned_execution(execution_id, tenant_id).await
    }

    pub async fn cancel(&self, execution_id: Uuid, tenant_id: &str) -> Result<(), EngineError> {
        let ctx = self.owned_execution(execution_id, tenant_id).await?;
        if ctx.status.is_terminal() {
            return Err(EngineError::AlreadyTerminal(execution_id.to_string()));
        }
        if let Some(token) = self.live.read().await.get(&execution_id) {
            token.cancel();
            return Ok(());
        }
        // No coordinator owns it (crash recovery); flip the store directly.
        self.store
            .transition(
                execution_id,
                ExecutionStatus::Cancelled,
                TransitionFields::default(),
            )
            .await?;
        self.bus.publish(ExecutionEvent::execution(
            EventKind::ExecutionCancelled,
            execution_id,
        ));
        Ok(())
    }

    /// Live event stream for one execution.
    pub async fn subscribe(
        &self,
        execution_id: Uuid,
        tenant_id: &str,
    ) -> Result<impl Stream<Item = ExecutionEvent> + Send + Unpin, EngineError> {
        self.owned_execution(execution_id, tenant_id).await?;
        Ok(self.bus.subscribe_execution(execution_id))
    }

    pub async fn list_executions(
        &self,
        tenant_id: &str,
        filter: ExecutionFilter,
        page: Page,
    ) -> Result<Vec<ExecutionContext>, EngineError> {
        self.store.list_executions(tenant_id, filter, page).await
    }

    pub async fn node_results(
        &self,
        execution_id: Uuid,
        tenant_id: &str,
    ) -> Result<Vec<NodeResult>, EngineError> {
        self.owned_execution(execution_id, tenant_id).await?;
        self.store.node_results(execution_id).await
    }

    pub async fn messages(
        &self,
        execution_id: Uuid,
        tenant_id: &str,
    ) -> Result<Vec<AgentMessage>, EngineError> {
        self.owned_execution(execution_id, tenant_id).await?;
        self.store.messages(execution_id).await
    }

    pub async fn execution_metrics(&self, tenant_id: &str) -> Result<StoreMetrics, EngineError> {
        self.store.metrics(tenant_id).await
    }

    // ── Agents ──────────────────────────────────────────────────────────

    /// Register an agent owned by the calling tenant.
    pub async fn register_agent(
        &self,
        mut record: AgentRecord,
        tenant_id: &str,
    ) -> Result<AgentRecord, EngineError> {
        record.owner_tenant_id = Some(tenant_id.to_string());
        self.registry.register(record).await
    }

    /// Register a system-scope agent, visible to every tenant.
    pub async fn register_system_agent(
        &self,
        mut record: AgentRecord,
    ) -> Result<AgentRecord, EngineError> {
        record.owner_tenant_id = None;
        self.registry.register(record).await
    }

    pub async fn deregister_agent(
        &self,
        agent_id: &str,
        tenant_id: &str,
    ) -> Result<(), EngineError> {
        self.registry.deregister(agent_id, tenant_id).await
    }

    pub async fn list_agents(
        &self,
        tenant_id: &str,
        capability: Option<&str>,
    ) -> Vec<AgentRecord> {
        self.registry.list(tenant_id, capability).await
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    // ── Flows ───────────────────────────────────────────────────────────

    /// Validate, index and persist a flow definition.
    pub async fn insert_flow(&self, definition: FlowDefinition) -> Result<(), EngineError> {
        self.catalog.insert(definition.clone()).await?;
        self.store.save_flow(&definition).await
    }

    pub async fn list_flows(&self, tenant_id: &str) -> Vec<Arc<FlowDefinition>> {
        self.catalog.list(tenant_id).await
    }

    /// Restore persisted agents and flows into the in-memory registry and
    /// catalog, typically right after constructing an engine over an
    /// existing database.
    pub async fn load_from_store(&self) -> Result<(), EngineError> {
        let agents = self.registry.load_from_store().await?;
        let mut flows = 0usize;
        for definition in self.store.load_flows().await? {
            match self.catalog.insert(definition).await {
                Ok(()) => flows += 1,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping persisted flow that no longer validates");
                }
            }
        }
        tracing::info!(agents, flows, "restored state from store");
        Ok(())
    }

    // ── Internals ───────────────────────────────────────────────────────

    /// Fetch an execution under a tenant scope. A miss and a cross-tenant
    /// probe are indistinguishable.
    async fn owned_execution(
        &self,
        execution_id: Uuid,
        tenant_id: &str,
    ) -> Result<ExecutionContext, EngineError> {
        match self.store.get_execution(execution_id).await? {
            Some(ctx) if ctx.tenant_id == tenant_id => Ok(ctx),
            _ => Err(EngineError::NotFound(format!("execution {execution_id}"))),
        }
    }

    async fn tenant_slot(&self, tenant_id: &str) -> Arc<Semaphore> {
        let mut slots = self.tenant_slots.write().await;
        slots
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.tenant_parallel_executions)))
            .clone()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
