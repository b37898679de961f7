use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse classification of what an agent does in a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Input,
    Processor,
    Output,
    Conditional,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Processor => "processor",
            Self::Output => "output",
            Self::Conditional => "conditional",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "input" => Some(Self::Input),
            "processor" => Some(Self::Processor),
            "output" => Some(Self::Output),
            "conditional" => Some(Self::Conditional),
            _ => None,
        }
    }
}

/// Probe-derived liveness state. Advisory only: the orchestrator is free to
/// dispatch to an unhealthy agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentHealth {
    #[default]
    Unknown,
    Ready,
    Unhealthy,
}

impl AgentHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Ready => "ready",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// A registered remote agent reachable over HTTP.
///
/// Records without an `owner_tenant_id` are system-scope and visible to
/// every tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Base URL; the proxy appends `/execute`, the registry `/health`.
    pub endpoint: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub agent_type: AgentType,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_tenant_id: Option<String>,
    /// Bearer token the proxy injects on every call to this agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub health: AgentHealth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_at: Option<DateTime<Utc>>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl AgentRecord {
    pub fn is_system_scope(&self) -> bool {
        self.owner_tenant_id.is_none()
    }

    /// Whether this record is visible under the given tenant scope.
    pub fn visible_to(&self, tenant_id: &str) -> bool {
        match &self.owner_tenant_id {
            None => true,
            Some(owner) => owner == tenant_id,
        }
    }
}

/// Expected shape of a `GET /health` response body. Any deviation marks the
/// agent unhealthy.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthReport {
    pub agent_id: String,
    pub version: String,
    pub capabilities: Vec<String>,
    pub ready: bool,
    pub agent_type: AgentType,
}
