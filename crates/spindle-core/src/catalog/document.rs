//! YAML document schema for flow definitions.
//!
//! A flow document describes a DAG of agent calls and control-flow nodes:
//!
//! ```yaml
//! flow_id: credit_check
//! name: "Credit Check"
//! description: "Score an application and route it"
//! version: "1.0.0"
//! entry_point: intake
//! exit_points: [report]
//!
//! nodes:
//!   - id: intake
//!     type: agent
//!     agent_id: intake-agent
//!
//!   - id: classify
//!     type: agent
//!     agent_id: scoring-agent
//!     depends_on: [intake]
//!     config:
//!       timeout: 60
//!       max_retries: 2
//!
//!   - id: route
//!     type: decision
//!     depends_on: [classify]
//!     condition: "output.classify.score > 0.5"
//!     then: approve
//!     else: reject
//!
//!   - id: approve
//!     type: agent
//!     agent_id: approval-agent
//!     depends_on: [route]
//!
//!   - id: reject
//!     type: agent
//!     agent_id: rejection-agent
//!     depends_on: [route]
//!
//!   - id: report
//!     type: output
//!     depends_on: [approve, reject]
//! ```
//!
//! Unknown fields are rejected. The document is converted into the typed
//! [`FlowDefinition`] model before validation.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::models::{FlowDefinition, MergeStrategy, NodeKind, NodeSpec};

/// Bounds on per-node agent settings carried in `config`.
const TIMEOUT_RANGE: std::ops::RangeInclusive<u64> = 30..=600;
const MAX_RETRIES_CAP: u32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowDocument {
    pub flow_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub version: String,
    pub entry_point: String,
    pub exit_points: Vec<String>,
    pub nodes: Vec<NodeDocument>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Agent,
    Decision,
    Loop,
    Fork,
    Join,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStrategy {
    FirstComplete,
    AllComplete,
    BestBy,
}

/// One node entry. Which optional fields are required depends on `type`;
/// the conversion into [`NodeSpec`] enforces that.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeDocument {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,

    // agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error_node: Option<String>,

    // decision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, rename = "then", skip_serializing_if = "Option::is_none")]
    pub then_node: Option<String>,
    #[serde(default, rename = "else", skip_serializing_if = "Option::is_none")]
    pub else_node: Option<String>,

    // loop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,

    // fork
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branches: Option<Vec<String>>,

    // join
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<JoinStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_by: Option<String>,
}

impl FlowDocument {
    pub fn from_yaml(yaml: &str) -> Result<Self, EngineError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| EngineError::FlowInvalid(format!("failed to parse flow document: {e}")))
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::FlowInvalid(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&content)
    }

    /// Convert into the typed model, enforcing the per-type field rules.
    /// Graph-level validation happens in [`super::validate`].
    pub fn into_definition(self) -> Result<FlowDefinition, EngineError> {
        let flow_id = self.flow_id.clone();
        let mut nodes = std::collections::BTreeMap::new();

        for doc in self.nodes {
            let node = doc.into_spec(&flow_id)?;
            if nodes.insert(node.id.clone(), node.clone()).is_some() {
                return Err(EngineError::FlowInvalid(format!(
                    "duplicate node id `{}` in flow `{flow_id}`",
                    node.id
                )));
            }
        }

        Ok(FlowDefinition {
            flow_id: self.flow_id,
            name: self.name,
            description: self.description,
            version: self.version,
            entry_point: self.entry_point,
            exit_points: self.exit_points,
            nodes,
            owner_tenant_id: None,
        })
    }
}

impl NodeDocument {
    fn into_spec(self, flow_id: &str) -> Result<NodeSpec, EngineError> {
        let id = self.id;
        let invalid = |msg: String| {
            EngineError::FlowInvalid(format!("node `{id}` in flow `{flow_id}`: {msg}"))
        };

        let kind = match self.node_type {
            NodeType::Agent => {
                let agent_id = self
                    .agent_id
                    .ok_or_else(|| invalid("agent node requires `agent_id`".into()))?;
                let config = self.config.unwrap_or_else(|| serde_json::json!({}));
                let timeout = extract_u64(&config, "timeout")?;
                if let Some(t) = timeout {
                    if !TIMEOUT_RANGE.contains(&t) {
                        return Err(invalid(format!(
                            "timeout {t}s outside allowed range {}..={}",
                            TIMEOUT_RANGE.start(),
                            TIMEOUT_RANGE.end()
                        )));
                    }
                }
                let max_retries = extract_u64(&config, "max_retries")?.unwrap_or(0) as u32;
                if max_retries > MAX_RETRIES_CAP {
                    return Err(invalid(format!(
                        "max_retries {max_retries} exceeds cap {MAX_RETRIES_CAP}"
                    )));
                }
                NodeKind::Agent {
                    agent_id,
                    config,
                    timeout,
                    max_retries,
                    on_error_node: self.on_error_node,
                }
            }
            NodeType::Decision => NodeKind::Decision {
                condition: self
                    .condition
                    .ok_or_else(|| invalid("decision node requires `condition`".into()))?,
                then_node: self
                    .then_node
                    .ok_or_else(|| invalid("decision node requires `then`".into()))?,
                else_node: self
                    .else_node
                    .ok_or_else(|| invalid("decision node requires `else`".into()))?,
            },
            NodeType::Loop => {
                let body = self
                    .body
                    .ok_or_else(|| invalid("loop node requires `body`".into()))?;
                if body.is_empty() {
                    return Err(invalid("loop body must not be empty".into()));
                }
                let max_iterations = self
                    .max_iterations
                    .ok_or_else(|| invalid("loop node requires `max_iterations`".into()))?;
                if max_iterations == 0 {
                    return Err(invalid("max_iterations must be at least 1".into()));
                }
                NodeKind::Loop {
                    body,
                    until: self
                        .until
                        .ok_or_else(|| invalid("loop node requires `until`".into()))?,
                    max_iterations,
                }
            }
            NodeType::Fork => {
                let branches = self
                    .branches
                    .ok_or_else(|| invalid("fork node requires `branches`".into()))?;
                if branches.is_empty() {
                    return Err(invalid("fork must declare at least one branch".into()));
                }
                NodeKind::Fork { branches }
            }
            NodeType::Join => {
                let sources = self
                    .sources
                    .ok_or_else(|| invalid("join node requires `sources`".into()))?;
                if sources.is_empty() {
                    return Err(invalid("join must declare at least one source".into()));
                }
                let strategy = match self
                    .strategy
                    .ok_or_else(|| invalid("join node requires `strategy`".into()))?
                {
                    JoinStrategy::FirstComplete => MergeStrategy::FirstComplete,
                    JoinStrategy::AllComplete => MergeStrategy::AllComplete,
                    JoinStrategy::BestBy => MergeStrategy::BestBy {
                        expr: self.best_by.clone().ok_or_else(|| {
                            invalid("strategy `best_by` requires a `best_by` expression".into())
                        })?,
                    },
                };
                if self.best_by.is_some() && !matches!(strategy, MergeStrategy::BestBy { .. }) {
                    return Err(invalid(
                        "`best_by` is only allowed with strategy `best_by`".into(),
                    ));
                }
                NodeKind::Join { sources, strategy }
            }
            NodeType::Output => NodeKind::Output,
        };

        Ok(NodeSpec {
            id,
            depends_on: self.depends_on,
            kind,
        })
    }
}

fn extract_u64(config: &serde_json::Value, key: &str) -> Result<Option<u64>, EngineError> {
    match config.get(key) {
        None => Ok(None),
        Some(serde_json::Value::Number(n)) => n.as_u64().map(Some).ok_or_else(|| {
            EngineError::FlowInvalid(format!("`{key}` must be a non-negative integer"))
        }),
        Some(other) => Err(EngineError::FlowInvalid(format!(
            "`{key}` must be an integer, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
flow_id: echo
name: "Echo"
version: "1.0.0"
entry_point: a
exit_points: [b]
nodes:
  - id: a
    type: agent
    agent_id: echo-agent
  - id: b
    type: agent
    agent_id: echo-agent
    depends_on: [a]
"#;

    #[test]
    fn parses_minimal_document() {
        let doc = FlowDocument::from_yaml(MINIMAL).unwrap();
        assert_eq!(doc.flow_id, "echo");
        assert_eq!(doc.nodes.len(), 2);
        let def = doc.into_definition().unwrap();
        assert!(def.node("a").unwrap().is_agent());
        assert_eq!(def.node("b").unwrap().depends_on, vec!["a"]);
    }

    #[test]
    fn rejects_unknown_fields() {
        let yaml = MINIMAL.replace("name: \"Echo\"", "name: \"Echo\"\nshiny: true");
        assert!(FlowDocument::from_yaml(&yaml).is_err());
    }

    #[test]
    fn rejects_duplicate_node_ids() {
        let yaml = r#"
flow_id: dup
name: "Dup"
version: "1.0.0"
entry_point: a
exit_points: [a]
nodes:
  - id: a
    type: agent
    agent_id: x
  - id: a
    type: agent
    agent_id: y
"#;
        let err = FlowDocument::from_yaml(yaml).unwrap().into_definition();
        assert!(matches!(err, Err(EngineError::FlowInvalid(_))));
    }

    #[test]
    fn agent_timeout_range_is_enforced() {
        let yaml = r#"
flow_id: t
name: "T"
version: "1.0.0"
entry_point: a
exit_points: [a]
nodes:
  - id: a
    type: agent
    agent_id: x
    config:
      timeout: 5
"#;
        let err = FlowDocument::from_yaml(yaml).unwrap().into_definition();
        assert!(matches!(err, Err(EngineError::FlowInvalid(_))));
    }

    #[test]
    fn best_by_requires_expression() {
        let yaml = r#"
flow_id: j
name: "J"
version: "1.0.0"
entry_point: a
exit_points: [j]
nodes:
  - id: a
    type: agent
    agent_id: x
  - id: j
    type: join
    depends_on: [a]
    sources: [a]
    strategy: best_by
"#;
        let err = FlowDocument::from_yaml(yaml).unwrap().into_definition();
        assert!(matches!(err, Err(EngineError::FlowInvalid(_))));
    }

    #[test]
    fn document_round_trip_is_stable() {
        let def = FlowDocument::from_yaml(MINIMAL).unwrap().into_definition().unwrap();
        let serialized = serde_yaml::to_string(&def).unwrap();
        let reparsed: FlowDefinition = serde_yaml::from_str(&serialized).unwrap();
        assert_eq!(def, reparsed);
    }
}
