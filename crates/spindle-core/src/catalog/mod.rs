//! Flow catalog: parse, validate and index flow definitions.
//!
//! On load every flow goes through the full validation pass: id and version
//! shape, dependency existence, acyclicity (Kahn), reachability of exits,
//! and structural rules for control-flow nodes. Valid flows are compiled
//! into topological layers with per-node indegrees for the scheduler.

pub mod document;

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::EngineError;
use crate::models::{FlowDefinition, NodeKind};

pub use document::FlowDocument;

/// A validated flow plus the scheduling metadata computed at load time.
#[derive(Debug, Clone)]
pub struct CompiledFlow {
    pub definition: Arc<FlowDefinition>,
    /// Nodes grouped by topological depth; layer 0 is the entry point.
    pub layers: Vec<Vec<String>>,
    /// Number of `depends_on` edges into each node.
    pub indegree: HashMap<String, usize>,
}

/// Tenant-scoped flow index. Lookups fall back to system scope on miss.
#[derive(Clone, Default)]
pub struct FlowCatalog {
    flows: Arc<RwLock<HashMap<(Option<String>, String), Arc<CompiledFlow>>>>,
}

impl FlowCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate, compile and index a definition under its owner scope.
    pub async fn insert(&self, definition: FlowDefinition) -> Result<(), EngineError> {
        let compiled = compile(definition)?;
        let key = (
            compiled.definition.owner_tenant_id.clone(),
            compiled.definition.flow_id.clone(),
        );
        let mut flows = self.flows.write().await;
        flows.insert(key, Arc::new(compiled));
        Ok(())
    }

    /// Load every `*.yaml` / `*.yml` file in a directory as a system-scope
    /// flow. Invalid documents are skipped with a warning so one bad file
    /// does not block startup.
    pub async fn load_dir(&self, dir: &Path) -> Result<usize, EngineError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| EngineError::Internal(format!("cannot read {}: {e}", dir.display())))?;

        let mut loaded = 0;
        let mut flows = self.flows.write().await;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e == "yaml" || e == "yml")
                .unwrap_or(false);
            if !is_yaml {
                continue;
            }
            let result = FlowDocument::from_file(&path)
                .and_then(|doc| doc.into_definition())
                .and_then(compile);
            match result {
                Ok(compiled) => {
                    let key = (
                        compiled.definition.owner_tenant_id.clone(),
                        compiled.definition.flow_id.clone(),
                    );
                    tracing::info!(flow_id = %compiled.definition.flow_id, path = %path.display(), "flow loaded");
                    flows.insert(key, Arc::new(compiled));
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping invalid flow document");
                }
            }
        }
        Ok(loaded)
    }

    /// Tenant lookup with system-scope fallback.
    pub async fn get(&self, flow_id: &str, tenant_id: &str) -> Result<Arc<CompiledFlow>, EngineError> {
        let flows = self.flows.read().await;
        if let Some(flow) = flows.get(&(Some(tenant_id.to_string()), flow_id.to_string())) {
            return Ok(flow.clone());
        }
        flows
            .get(&(None, flow_id.to_string()))
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("flow `{flow_id}`")))
    }

    /// Flows visible to a tenant: its own plus system scope.
    pub async fn list(&self, tenant_id: &str) -> Vec<Arc<FlowDefinition>> {
        let flows = self.flows.read().await;
        let mut out: Vec<_> = flows
            .iter()
            .filter(|((scope, _), _)| {
                scope.is_none() || scope.as_deref() == Some(tenant_id)
            })
            .map(|(_, f)| f.definition.clone())
            .collect();
        out.sort_by(|a, b| a.flow_id.cmp(&b.flow_id));
        out
    }
}

/// Run the full validation pass and compute scheduling metadata.
pub fn compile(definition: FlowDefinition) -> Result<CompiledFlow, EngineError> {
    validate_identity(&definition)?;
    validate_references(&definition)?;
    let (layers, indegree) = topological_layers(&definition)?;
    validate_reachability(&definition)?;
    validate_control_nodes(&definition)?;

    Ok(CompiledFlow {
        definition: Arc::new(definition),
        layers,
        indegree,
    })
}

fn validate_identity(def: &FlowDefinition) -> Result<(), EngineError> {
    let id_re = regex::Regex::new(r"^[a-z0-9_-]{1,64}$").expect("static pattern");
    if !id_re.is_match(&def.flow_id) {
        return Err(EngineError::FlowInvalid(format!(
            "flow_id `{}` must match ^[a-z0-9_-]{{1,64}}$",
            def.flow_id
        )));
    }
    let ver_re =
        regex::Regex::new(r"^[0-9]+\.[0-9]+\.[0-9]+([-+][0-9A-Za-z.-]+)?$").expect("static pattern");
    if !ver_re.is_match(&def.version) {
        return Err(EngineError::FlowInvalid(format!(
            "version `{}` is not a semver string",
            def.version
        )));
    }
    if def.exit_points.is_empty() {
        return Err(EngineError::FlowInvalid("at least one exit point required".into()));
    }
    Ok(())
}

fn validate_references(def: &FlowDefinition) -> Result<(), EngineError> {
    let exists = |id: &str| def.nodes.contains_key(id);

    if !exists(&def.entry_point) {
        return Err(EngineError::FlowInvalid(format!(
            "entry point `{}` is not a node",
            def.entry_point
        )));
    }
    if !def.nodes[&def.entry_point].depends_on.is_empty() {
        return Err(EngineError::FlowInvalid(format!(
            "entry point `{}` must not have dependencies",
            def.entry_point
        )));
    }
    for exit in &def.exit_points {
        if !exists(exit) {
            return Err(EngineError::FlowInvalid(format!(
                "exit point `{exit}` is not a node"
            )));
        }
    }

    for node in def.nodes.values() {
        for dep in &node.depends_on {
            if !exists(dep) {
                return Err(EngineError::FlowInvalid(format!(
                    "node `{}` depends on unknown node `{dep}`",
                    node.id
                )));
            }
        }
        let referenced: Vec<&String> = match &node.kind {
            NodeKind::Decision {
                then_node,
                else_node,
                ..
            } => vec![then_node, else_node],
            NodeKind::Loop { body, .. } => body.iter().collect(),
            NodeKind::Fork { branches } => branches.iter().collect(),
            NodeKind::Join { sources, .. } => sources.iter().collect(),
            NodeKind::Agent { on_error_node, .. } => on_error_node.iter().collect(),
            NodeKind::Output => vec![],
        };
        for id in referenced {
            if !exists(id) {
                return Err(EngineError::FlowInvalid(format!(
                    "node `{}` references unknown node `{id}`",
                    node.id
                )));
            }
        }
    }
    Ok(())
}

/// Kahn's algorithm over `depends_on` edges. Rejects cycles and yields both
/// the layer structure and indegrees.
fn topological_layers(
    def: &FlowDefinition,
) -> Result<(Vec<Vec<String>>, HashMap<String, usize>), EngineError> {
    let indegree: HashMap<String, usize> = def
        .nodes
        .values()
        .map(|n| (n.id.clone(), n.depends_on.len()))
        .collect();

    let mut remaining = indegree.clone();
    let mut layers: Vec<Vec<String>> = Vec::new();
    let mut placed: HashSet<String> = HashSet::new();

    loop {
        let mut layer: Vec<String> = remaining
            .iter()
            .filter(|(id, deg)| **deg == 0 && !placed.contains(*id))
            .map(|(id, _)| id.clone())
            .collect();
        if layer.is_empty() {
            break;
        }
        layer.sort();
        for id in &layer {
            placed.insert(id.clone());
            for succ in def.successors(id) {
                if let Some(deg) = remaining.get_mut(&succ.id) {
                    *deg = deg.saturating_sub(1);
                }
            }
        }
        layers.push(layer);
    }

    if placed.len() != def.nodes.len() {
        let mut stuck: Vec<&str> = def
            .nodes
            .keys()
            .filter(|id| !placed.contains(*id))
            .map(|s| s.as_str())
            .collect();
        stuck.sort();
        return Err(EngineError::FlowInvalid(format!(
            "cycle at {}",
            stuck.join(", ")
        )));
    }

    Ok((layers, indegree))
}

/// Forward edges for reachability: dependency successors plus the edges
/// control nodes emit (branches, bodies).
fn forward_edges(def: &FlowDefinition, id: &str) -> Vec<String> {
    let mut out: Vec<String> = def.successors(id).map(|n| n.id.clone()).collect();
    if let Some(node) = def.node(id) {
        match &node.kind {
            NodeKind::Decision {
                then_node,
                else_node,
                ..
            } => {
                out.push(then_node.clone());
                out.push(else_node.clone());
            }
            NodeKind::Fork { branches } => out.extend(branches.iter().cloned()),
            NodeKind::Loop { body, .. } => out.extend(body.iter().cloned()),
            NodeKind::Agent {
                on_error_node: Some(handler),
                ..
            } => out.push(handler.clone()),
            _ => {}
        }
    }
    out.sort();
    out.dedup();
    out
}

fn reachable_from(def: &FlowDefinition, start: &str) -> HashSet<String> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([start.to_string()]);
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id.clone()) {
            continue;
        }
        for next in forward_edges(def, &id) {
            if !seen.contains(&next) {
                queue.push_back(next);
            }
        }
    }
    seen
}

fn validate_reachability(def: &FlowDefinition) -> Result<(), EngineError> {
    let reachable = reachable_from(def, &def.entry_point);

    for exit in &def.exit_points {
        if !reachable.contains(exit) {
            return Err(EngineError::FlowInvalid(format!(
                "exit point `{exit}` is unreachable from entry `{}`",
                def.entry_point
            )));
        }
    }
    for id in def.nodes.keys() {
        if !reachable.contains(id) {
            return Err(EngineError::FlowInvalid(format!(
                "node `{id}` is unreachable from entry `{}`",
                def.entry_point
            )));
        }
    }
    Ok(())
}

fn validate_control_nodes(def: &FlowDefinition) -> Result<(), EngineError> {
    for node in def.nodes.values() {
        match &node.kind {
            NodeKind::Decision {
                then_node,
                else_node,
                ..
            } => {
                // Branches must converge at a shared successor or each end
                // at an exit point.
                let from_then = reachable_from(def, then_node);
                let from_else = reachable_from(def, else_node);
                let converge = from_then.intersection(&from_else).next().is_some();
                let then_exits =
                    from_then.iter().any(|n| def.is_exit_point(n));
                let else_exits =
                    from_else.iter().any(|n| def.is_exit_point(n));
                if !converge && !(then_exits && else_exits) {
                    return Err(EngineError::FlowInvalid(format!(
                        "decision `{}` branches neither converge nor reach exits",
                        node.id
                    )));
                }
            }
            NodeKind::Loop { body, .. } => {
                let body_set: HashSet<&str> = body.iter().map(|s| s.as_str()).collect();
                for member in body {
                    let member_node = def.node(member).expect("validated reference");
                    for dep in &member_node.depends_on {
                        if dep != &node.id && !body_set.contains(dep.as_str()) {
                            return Err(EngineError::FlowInvalid(format!(
                                "loop body node `{member}` depends on `{dep}` outside loop `{}`",
                                node.id
                            )));
                        }
                    }
                    // Nothing outside the loop may reach into the body.
                    for succ in def.successors(member) {
                        if succ.id != node.id && !body_set.contains(succ.id.as_str()) {
                            return Err(EngineError::FlowInvalid(format!(
                                "node `{}` outside loop `{}` depends on body node `{member}`",
                                succ.id, node.id
                            )));
                        }
                    }
                }
            }
            NodeKind::Fork { branches } => {
                // Every fork needs a join all branches can reach.
                let mut common: Option<HashSet<String>> = None;
                for branch in branches {
                    let reach = reachable_from(def, branch);
                    common = Some(match common {
                        None => reach,
                        Some(prev) => prev.intersection(&reach).cloned().collect(),
                    });
                }
                let has_join = common
                    .unwrap_or_default()
                    .iter()
                    .any(|id| matches!(def.node(id).map(|n| &n.kind), Some(NodeKind::Join { .. })));
                if !has_join {
                    return Err(EngineError::FlowInvalid(format!(
                        "fork `{}` has no join reachable from every branch",
                        node.id
                    )));
                }
            }
            NodeKind::Join { sources, .. } => {
                for source in sources {
                    if !node.depends_on.contains(source) {
                        return Err(EngineError::FlowInvalid(format!(
                            "join `{}` source `{source}` must also be listed in depends_on",
                            node.id
                        )));
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(yaml: &str) -> Result<CompiledFlow, EngineError> {
        FlowDocument::from_yaml(yaml)
            .and_then(|doc| doc.into_definition())
            .and_then(compile)
    }

    const DIAMOND: &str = r#"
flow_id: diamond
name: "Diamond"
version: "1.0.0"
entry_point: a
exit_points: [d]
nodes:
  - id: a
    type: agent
    agent_id: x
  - id: b
    type: agent
    agent_id: x
    depends_on: [a]
  - id: c
    type: agent
    agent_id: x
    depends_on: [a]
  - id: d
    type: join
    depends_on: [b, c]
    sources: [b, c]
    strategy: all_complete
"#;

    #[test]
    fn layers_follow_dependency_depth() {
        let compiled = load(DIAMOND).unwrap();
        assert_eq!(compiled.layers[0], vec!["a"]);
        assert_eq!(compiled.layers[1], vec!["b", "c"]);
        assert_eq!(compiled.layers[2], vec!["d"]);
        assert_eq!(compiled.indegree["d"], 2);
    }

    #[test]
    fn cycles_are_rejected() {
        let yaml = r#"
flow_id: cyclic
name: "Cyclic"
version: "1.0.0"
entry_point: a
exit_points: [c]
nodes:
  - id: a
    type: agent
    agent_id: x
  - id: b
    type: agent
    agent_id: x
    depends_on: [a, c]
  - id: c
    type: agent
    agent_id: x
    depends_on: [b]
"#;
        let err = load(yaml).unwrap_err();
        match err {
            EngineError::FlowInvalid(msg) => assert!(msg.contains("cycle at"), "{msg}"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let yaml = DIAMOND.replace("depends_on: [b, c]", "depends_on: [b, ghost]");
        assert!(load(&yaml).is_err());
    }

    #[test]
    fn unreachable_exit_is_rejected() {
        let yaml = r#"
flow_id: island
name: "Island"
version: "1.0.0"
entry_point: a
exit_points: [b]
nodes:
  - id: a
    type: agent
    agent_id: x
  - id: b
    type: agent
    agent_id: x
"#;
        assert!(load(yaml).is_err());
    }

    #[test]
    fn loop_body_must_be_private() {
        let yaml = r#"
flow_id: leaky
name: "Leaky"
version: "1.0.0"
entry_point: a
exit_points: [c]
nodes:
  - id: a
    type: loop
    body: [b]
    until: "iteration >= 2"
    max_iterations: 5
  - id: b
    type: agent
    agent_id: x
    depends_on: [a]
  - id: c
    type: agent
    agent_id: x
    depends_on: [b]
"#;
        let err = load(yaml).unwrap_err();
        match err {
            EngineError::FlowInvalid(msg) => {
                assert!(msg.contains("outside loop"), "{msg}")
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn fork_requires_matching_join() {
        let yaml = r#"
flow_id: forked
name: "Forked"
version: "1.0.0"
entry_point: a
exit_points: [b, c]
nodes:
  - id: a
    type: fork
    branches: [b, c]
  - id: b
    type: agent
    agent_id: x
    depends_on: [a]
  - id: c
    type: agent
    agent_id: x
    depends_on: [a]
"#;
        assert!(load(yaml).is_err());
    }

    #[test]
    fn bad_flow_id_shape() {
        let yaml = DIAMOND.replace("flow_id: diamond", "flow_id: Diamond!");
        assert!(load(&yaml).is_err());
    }

    #[tokio::test]
    async fn load_dir_skips_invalid_documents() {
        let dir = std::env::temp_dir().join(format!("spindle-catalog-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("good.yaml"), DIAMOND).unwrap();
        std::fs::write(dir.join("bad.yaml"), "flow_id: [not, a, string]").unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let catalog = FlowCatalog::new();
        let loaded = catalog.load_dir(&dir).await.unwrap();
        assert_eq!(loaded, 1);
        assert!(catalog.get("diamond", "anyone").await.is_ok());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn tenant_lookup_falls_back_to_system_scope() {
        let catalog = FlowCatalog::new();
        let def = FlowDocument::from_yaml(DIAMOND)
            .unwrap()
            .into_definition()
            .unwrap();
        catalog.insert(def.clone()).await.unwrap();

        let mut tenant_def = def;
        tenant_def.name = "Tenant Diamond".to_string();
        tenant_def.owner_tenant_id = Some("acme".to_string());
        catalog.insert(tenant_def).await.unwrap();

        let acme = catalog.get("diamond", "acme").await.unwrap();
        assert_eq!(acme.definition.name, "Tenant Diamond");
        let other = catalog.get("diamond", "globex").await.unwrap();
        assert_eq!(other.definition.name, "Diamond");
        assert!(catalog.get("missing", "acme").await.is_err());
    }
}
