//! Agent registry: discovery and liveness for remote agents.
//!
//! Records live in an ownership-scoped map with a secondary index from
//! capability tag to agent ids. A background sweeper probes `GET /health`
//! on every record; three consecutive failures mark an agent `unhealthy`,
//! a single success restores `ready`. Health is advisory only — the
//! registry never refuses a lookup because an agent is unhealthy.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::{EventBus, ExecutionEvent};
use crate::models::{AgentHealth, AgentRecord};
use crate::models::agent::HealthReport;
use crate::store::ExecutionStore;

type ScopeKey = (String, Option<String>);

#[derive(Default)]
struct Inner {
    agents: HashMap<ScopeKey, AgentRecord>,
    capability_index: HashMap<String, HashSet<ScopeKey>>,
    consecutive_failures: HashMap<ScopeKey, u32>,
}

#[derive(Clone)]
pub struct AgentRegistry {
    inner: Arc<RwLock<Inner>>,
    client: reqwest::Client,
    store: Arc<dyn ExecutionStore>,
    bus: EventBus,
    probe_failure_threshold: u32,
}

impl AgentRegistry {
    pub fn new(config: &EngineConfig, store: Arc<dyn ExecutionStore>, bus: EventBus) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.probe_timeout())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            client,
            store,
            bus,
            probe_failure_threshold: config.probe_failure_threshold,
        }
    }

    /// Restore persisted records, typically at startup.
    pub async fn load_from_store(&self) -> Result<usize, EngineError> {
        let records = self.store.load_agents().await?;
        let count = records.len();
        let mut inner = self.inner.write().await;
        for record in records {
            index_record(&mut inner, &record);
            let key = scope_key(&record);
            inner.agents.insert(key, record);
        }
        Ok(count)
    }

    /// Register an agent under a tenant scope (`None` = system scope).
    ///
    /// Re-registering the same id within the same scope returns the
    /// existing record unchanged; the same id under a different scope is a
    /// conflict.
    pub async fn register(&self, record: AgentRecord) -> Result<AgentRecord, EngineError> {
        let key = scope_key(&record);
        {
            let mut inner = self.inner.write().await;
            if let Some(existing) = inner.agents.get(&key) {
                return Ok(existing.clone());
            }
            let collides = inner
                .agents
                .keys()
                .any(|(id, scope)| *id == record.agent_id && *scope != key.1);
            if collides {
                return Err(EngineError::AgentConflict(format!(
                    "agent `{}` is already registered under a different scope",
                    record.agent_id
                )));
            }
            index_record(&mut inner, &record);
            inner.agents.insert(key, record.clone());
        }
        self.store.save_agent(&record).await?;
        tracing::info!(agent_id = %record.agent_id, endpoint = %record.endpoint, "agent registered");
        Ok(record)
    }

    pub async fn deregister(&self, agent_id: &str, tenant_id: &str) -> Result<(), EngineError> {
        let mut inner = self.inner.write().await;
        // A tenant may remove its own record; system records require the
        // system scope (empty owner is never a tenant id).
        let key = (agent_id.to_string(), Some(tenant_id.to_string()));
        let Some(record) = inner.agents.remove(&key) else {
            return Err(EngineError::AgentUnknown(agent_id.to_string()));
        };
        for capability in &record.capabilities {
            if let Some(set) = inner.capability_index.get_mut(capability) {
                set.remove(&key);
                if set.is_empty() {
                    inner.capability_index.remove(capability);
                }
            }
        }
        inner.consecutive_failures.remove(&key);
        drop(inner);
        self.store.delete_agent(agent_id, Some(tenant_id)).await?;
        tracing::info!(agent_id, "agent deregistered");
        Ok(())
    }

    /// Tenant lookup with system-scope fallback.
    pub async fn lookup(&self, agent_id: &str, tenant_id: &str) -> Result<AgentRecord, EngineError> {
        let inner = self.inner.read().await;
        if let Some(record) = inner
            .agents
            .get(&(agent_id.to_string(), Some(tenant_id.to_string())))
        {
            return Ok(record.clone());
        }
        inner
            .agents
            .get(&(agent_id.to_string(), None))
            .cloned()
            .ok_or_else(|| EngineError::AgentUnknown(agent_id.to_string()))
    }

    /// All records visible to the tenant, optionally filtered by capability
    /// via the secondary index.
    pub async fn list(&self, tenant_id: &str, capability: Option<&str>) -> Vec<AgentRecord> {
        let inner = self.inner.read().await;
        let mut out: Vec<AgentRecord> = match capability {
            Some(cap) => inner
                .capability_index
                .get(cap)
                .into_iter()
                .flatten()
                .filter_map(|key| inner.agents.get(key))
                .filter(|r| r.visible_to(tenant_id))
                .cloned()
                .collect(),
            None => inner
                .agents
                .values()
                .filter(|r| r.visible_to(tenant_id))
                .cloned()
                .collect(),
        };
        out.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        out
    }

    /// Best-effort probe of one agent's `/health`. Transitions the health
    /// state and updates `last_probe_at`.
    pub async fn health_probe(&self, agent_id: &str, owner: Option<&str>) -> AgentHealth {
        let key = (agent_id.to_string(), owner.map(String::from));
        let endpoint = {
            let inner = self.inner.read().await;
            match inner.agents.get(&key) {
                Some(record) => record.endpoint.clone(),
                None => return AgentHealth::Unknown,
            }
        };

        let healthy = self.probe_endpoint(&endpoint, agent_id).await;

        let mut inner = self.inner.write().await;
        let threshold = self.probe_failure_threshold;
        let health = if healthy {
            inner.consecutive_failures.insert(key.clone(), 0);
            AgentHealth::Ready
        } else {
            let failures = inner
                .consecutive_failures
                .entry(key.clone())
                .and_modify(|f| *f += 1)
                .or_insert(1);
            if *failures >= threshold {
                AgentHealth::Unhealthy
            } else {
                // Not enough strikes yet; keep the previous state.
                inner
                    .agents
                    .get(&key)
                    .map(|r| r.health)
                    .unwrap_or(AgentHealth::Unknown)
            }
        };

        if let Some(record) = inner.agents.get_mut(&key) {
            let changed = record.health != health;
            record.health = health;
            record.last_probe_at = Some(Utc::now());
            if changed {
                tracing::info!(agent_id, health = health.as_str(), "agent health changed");
            }
        }
        drop(inner);

        self.bus.publish(ExecutionEvent::agent_probed(agent_id, health));
        health
    }

    async fn probe_endpoint(&self, endpoint: &str, agent_id: &str) -> bool {
        let url = format!("{}/health", endpoint.trim_end_matches('/'));
        let response = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(agent_id, error = %e, "health probe failed");
                return false;
            }
        };
        if !response.status().is_success() {
            return false;
        }
        // Any missing field or malformed body counts as unhealthy.
        match response.json::<HealthReport>().await {
            Ok(report) => report.ready,
            Err(e) => {
                tracing::debug!(agent_id, error = %e, "health probe returned malformed body");
                false
            }
        }
    }

    /// Spawn the periodic sweeper. Cancel the token to stop it.
    pub fn spawn_sweeper(&self, config: &EngineConfig, shutdown: CancellationToken) {
        let registry = self.clone();
        let interval = config.probe_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let keys: Vec<ScopeKey> = {
                    let inner = registry.inner.read().await;
                    inner.agents.keys().cloned().collect()
                };
                for (agent_id, owner) in keys {
                    registry.health_probe(&agent_id, owner.as_deref()).await;
                }
            }
            tracing::debug!("registry sweeper stopped");
        });
    }
}

fn scope_key(record: &AgentRecord) -> ScopeKey {
    (record.agent_id.clone(), record.owner_tenant_id.clone())
}

fn index_record(inner: &mut Inner, record: &AgentRecord) {
    let key = scope_key(record);
    for capability in &record.capabilities {
        inner
            .capability_index
            .entry(capability.clone())
            .or_default()
            .insert(key.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentType;
    use crate::store::MemoryStore;

    fn record(agent_id: &str, owner: Option<&str>) -> AgentRecord {
        AgentRecord {
            agent_id: agent_id.to_string(),
            name: agent_id.to_string(),
            description: String::new(),
            endpoint: "http://127.0.0.1:9".to_string(),
            capabilities: vec!["echo".to_string()],
            agent_type: AgentType::Processor,
            version: "1.0.0".to_string(),
            owner_tenant_id: owner.map(String::from),
            auth_token: None,
            health: AgentHealth::Unknown,
            last_probe_at: None,
        }
    }

    fn registry() -> AgentRegistry {
        AgentRegistry::new(
            &EngineConfig::default(),
            Arc::new(MemoryStore::new()),
            EventBus::new(16),
        )
    }

    #[tokio::test]
    async fn same_scope_collision_returns_existing() {
        let registry = registry();
        let first = registry.register(record("echo", None)).await.unwrap();
        let mut second = record("echo", None);
        second.endpoint = "http://other:1".to_string();
        let returned = registry.register(second).await.unwrap();
        assert_eq!(returned.endpoint, first.endpoint);
    }

    #[tokio::test]
    async fn cross_scope_collision_conflicts() {
        let registry = registry();
        registry.register(record("echo", None)).await.unwrap();
        let err = registry.register(record("echo", Some("acme"))).await.unwrap_err();
        assert_eq!(err.kind(), "agent_conflict");
    }

    #[tokio::test]
    async fn lookup_prefers_tenant_scope() {
        let registry = registry();
        registry.register(record("shared", None)).await.unwrap();
        let mut tenant_record = record("mine", Some("acme"));
        tenant_record.endpoint = "http://tenant:1".to_string();
        registry.register(tenant_record).await.unwrap();

        assert!(registry.lookup("shared", "acme").await.is_ok());
        assert!(registry.lookup("mine", "acme").await.is_ok());
        let err = registry.lookup("mine", "globex").await.unwrap_err();
        assert_eq!(err.kind(), "agent_unknown");
    }

    #[tokio::test]
    async fn capability_filter() {
        let registry = registry();
        registry.register(record("echo", None)).await.unwrap();
        let mut other = record("score", None);
        other.capabilities = vec!["scoring".to_string()];
        registry.register(other).await.unwrap();

        let echoes = registry.list("acme", Some("echo")).await;
        assert_eq!(echoes.len(), 1);
        assert_eq!(echoes[0].agent_id, "echo");
        assert_eq!(registry.list("acme", None).await.len(), 2);
    }

    #[tokio::test]
    async fn probe_failure_needs_three_strikes() {
        let registry = registry();
        // Endpoint points at a closed port, so probes fail fast.
        registry.register(record("flaky", Some("acme"))).await.unwrap();

        assert_eq!(
            registry.health_probe("flaky", Some("acme")).await,
            AgentHealth::Unknown
        );
        assert_eq!(
            registry.health_probe("flaky", Some("acme")).await,
            AgentHealth::Unknown
        );
        assert_eq!(
            registry.health_probe("flaky", Some("acme")).await,
            AgentHealth::Unhealthy
        );
    }
}
