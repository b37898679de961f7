use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// How a join resolves its sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Resolve on the first succeeded source; the rest are cancelled.
    FirstComplete,
    /// Resolve when every source is terminal; fail if any failed.
    AllComplete,
    /// Wait for all sources, then pick the succeeded one maximizing the
    /// expression evaluated over its output.
    BestBy { expr: String },
}

/// What a node does when it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Agent {
        agent_id: String,
        #[serde(default)]
        config: serde_json::Value,
        /// Seconds; falls back to the engine default when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<u64>,
        #[serde(default)]
        max_retries: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_error_node: Option<String>,
    },
    Decision {
        condition: String,
        then_node: String,
        else_node: String,
    },
    Loop {
        body: Vec<String>,
        until: String,
        max_iterations: u32,
    },
    Fork {
        branches: Vec<String>,
    },
    Join {
        sources: Vec<String>,
        strategy: MergeStrategy,
    },
    /// Terminal aggregator; carries only dependencies.
    Output,
}

/// One node of a flow DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(flatten)]
    pub kind: NodeKind,
}

impl NodeSpec {
    pub fn is_agent(&self) -> bool {
        matches!(self.kind, NodeKind::Agent { .. })
    }
}

/// A validated, immutable flow definition.
///
/// Nodes are kept in a `BTreeMap` so serialization is deterministic and a
/// parse -> serialize -> parse round trip yields the same normalized form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub flow_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub version: String,
    pub entry_point: String,
    pub exit_points: Vec<String>,
    pub nodes: BTreeMap<String, NodeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_tenant_id: Option<String>,
}

impl FlowDefinition {
    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.get(id)
    }

    /// Node ids that list `id` in their `depends_on`.
    pub fn successors<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a NodeSpec> {
        self.nodes
            .values()
            .filter(move |n| n.depends_on.iter().any(|d| d == id))
    }

    pub fn is_exit_point(&self, id: &str) -> bool {
        self.exit_points.iter().any(|e| e == id)
    }
}
