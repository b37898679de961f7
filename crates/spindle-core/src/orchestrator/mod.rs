//! Orchestrator: the per-execution coordinator.
//!
//! One coordinator task owns all mutable state of a single execution. Agent
//! dispatches fan out as worker tasks and report back over an mpsc channel,
//! so per-execution state is never shared across tasks. Control-flow nodes
//! (decision, fork, join, loop, output) are pure and evaluated inline by
//! the coordinator.
//!
//! Scheduling: a node becomes ready when every effective dependency
//! (declared `depends_on` plus the controlling decision/fork edges) is
//! terminal and at least one succeeded. Ready agent nodes dispatch up to
//! the per-execution parallelism cap; the overflow waits in FIFO order.
//! A node whose upstream produced nothing (all skipped or failed-and-
//! absorbed) is skipped, which propagates branch exclusion transitively.

mod backoff;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::catalog::CompiledFlow;
use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorDetail, Recovery};
use crate::events::{EventBus, EventKind, ExecutionEvent};
use crate::expr::{self, EvalContext};
use crate::models::{
    AgentMessage, ExecutionContext, ExecutionStatus, MergeStrategy, NodeKind, NodeResult,
    NodeSpec, NodeStatus,
};
use crate::proxy::{AgentProxy, AgentReply, ExecuteRequest};
use crate::registry::AgentRegistry;
use crate::store::{ExecutionStore, TransitionFields};

/// Shared collaborators handed to every coordinator.
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub config: Arc<EngineConfig>,
    pub store: Arc<dyn ExecutionStore>,
    pub registry: AgentRegistry,
    pub proxy: Arc<AgentProxy>,
    pub bus: EventBus,
}

/// Drive one execution to a terminal state. The context must already be
/// `running` in the store. Cancelling `cancel` requests cooperative
/// cancellation.
pub async fn run_execution(
    deps: OrchestratorDeps,
    flow: Arc<CompiledFlow>,
    ctx: ExecutionContext,
    cancel: CancellationToken,
) {
    let execution_id = ctx.execution_id;
    let mut coordinator = Coordinator::new(deps, flow, ctx, cancel);
    if let Err(e) = coordinator.run().await {
        tracing::error!(%execution_id, error = %e, "execution aborted");
        coordinator.finish_failed(e.to_detail()).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Blocked,
    Queued,
    Running,
    Done(NodeStatus),
}

impl NodeState {
    fn terminal_status(&self) -> Option<NodeStatus> {
        match self {
            Self::Done(status) => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug)]
enum DispatchOutcome {
    Succeeded(AgentReply),
    Failed(EngineError),
    Cancelled,
}

#[derive(Debug)]
struct NodeCompletion {
    node_id: String,
    iteration: u32,
    outcome: DispatchOutcome,
    attempts: u32,
}

struct Coordinator {
    config: Arc<EngineConfig>,
    store: Arc<dyn ExecutionStore>,
    registry: AgentRegistry,
    proxy: Arc<AgentProxy>,
    bus: EventBus,

    flow: Arc<CompiledFlow>,
    execution_id: Uuid,
    tenant_id: String,
    input: Value,
    scratch: Value,

    cancel: CancellationToken,
    /// Parent of every worker token; cancelled on cancel or deadline.
    work_token: CancellationToken,
    deadline: Instant,

    states: HashMap<String, NodeState>,
    /// Raw output per succeeded node, visible to expressions.
    outputs: HashMap<String, Value>,
    /// Succeeded nodes in completion order (first_complete resolution).
    completion_seq: Vec<String>,
    node_errors: HashMap<String, ErrorDetail>,
    node_inputs: HashMap<String, Value>,
    /// Error-handler transfers: target -> (payload, failing node).
    forced_inputs: HashMap<String, (Value, String)>,
    node_tokens: HashMap<String, CancellationToken>,

    /// `depends_on` plus controlling decision/fork edges, per node.
    effective_deps: HashMap<String, Vec<String>>,
    effective_successors: HashMap<String, Vec<String>>,
    body_owner: HashMap<String, String>,
    loop_iterations: HashMap<String, u32>,
    /// Per active loop: body nodes not yet terminal this iteration.
    active_loops: HashMap<String, HashSet<String>>,
    loop_base_payload: HashMap<String, Value>,

    in_flight: usize,
    dispatch_queue: VecDeque<String>,
    recheck: VecDeque<String>,
    fatal: Option<ErrorDetail>,

    tx: mpsc::Sender<NodeCompletion>,
    rx: mpsc::Receiver<NodeCompletion>,
}

impl Coordinator {
    fn new(
        deps: OrchestratorDeps,
        flow: Arc<CompiledFlow>,
        ctx: ExecutionContext,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(deps.config.parallelism.max(1) * 2);

        let definition = flow.definition.clone();
        let mut body_owner = HashMap::new();
        let mut effective_deps: HashMap<String, Vec<String>> = definition
            .nodes
            .values()
            .map(|n| (n.id.clone(), n.depends_on.clone()))
            .collect();

        for node in definition.nodes.values() {
            match &node.kind {
                NodeKind::Decision {
                    then_node,
                    else_node,
                    ..
                } => {
                    for target in [then_node, else_node] {
                        let deps = effective_deps.entry(target.clone()).or_default();
                        if !deps.contains(&node.id) {
                            deps.push(node.id.clone());
                        }
                    }
                }
                NodeKind::Fork { branches } => {
                    for target in branches {
                        let deps = effective_deps.entry(target.clone()).or_default();
                        if !deps.contains(&node.id) {
                            deps.push(node.id.clone());
                        }
                    }
                }
                NodeKind::Loop { body, .. } => {
                    for member in body {
                        body_owner.insert(member.clone(), node.id.clone());
                        let deps = effective_deps.entry(member.clone()).or_default();
                        if !deps.contains(&node.id) {
                            deps.push(node.id.clone());
                        }
                    }
                }
                _ => {}
            }
        }

        let mut effective_successors: HashMap<String, Vec<String>> = HashMap::new();
        for (node, deps) in &effective_deps {
            for dep in deps {
                effective_successors
                    .entry(dep.clone())
                    .or_default()
                    .push(node.clone());
            }
        }

        let states = definition
            .nodes
            .keys()
            .map(|id| (id.clone(), NodeState::Blocked))
            .collect();

        let deadline = Instant::now() + deps.config.execution_deadline();

        Self {
            config: deps.config,
            store: deps.store,
            registry: deps.registry,
            proxy: deps.proxy,
            bus: deps.bus,
            flow,
            execution_id: ctx.execution_id,
            tenant_id: ctx.tenant_id,
            input: ctx.input_data,
            scratch: Value::Object(serde_json::Map::new()),
            cancel,
            work_token: CancellationToken::new(),
            deadline,
            states,
            outputs: HashMap::new(),
            completion_seq: Vec::new(),
            node_errors: HashMap::new(),
            node_inputs: HashMap::new(),
            forced_inputs: HashMap::new(),
            node_tokens: HashMap::new(),
            effective_deps,
            effective_successors,
            body_owner,
            loop_iterations: HashMap::new(),
            active_loops: HashMap::new(),
            loop_base_payload: HashMap::new(),
            in_flight: 0,
            dispatch_queue: VecDeque::new(),
            recheck: VecDeque::new(),
            fatal: None,
            tx,
            rx,
        }
    }

    // ── Main loop ───────────────────────────────────────────────────────

    async fn run(&mut self) -> Result<(), EngineError> {
        tracing::info!(execution_id = %self.execution_id, flow_id = %self.flow.definition.flow_id, "execution started");
        self.bus.publish(ExecutionEvent::execution(
            EventKind::ExecutionStarted,
            self.execution_id,
        ));

        let entry = self.flow.definition.entry_point.clone();
        self.recheck.push_back(entry);
        self.drain().await?;

        enum Wake {
            Cancelled,
            Deadline,
            Completion(Option<NodeCompletion>),
        }

        let cancel = self.cancel.clone();
        loop {
            if let Some(detail) = self.fatal.take() {
                self.drain_in_flight_as_cancelled().await?;
                self.finish_failed(detail).await;
                return Ok(());
            }
            if self.all_exits_terminal() {
                self.finish_by_exits().await?;
                return Ok(());
            }
            if self.in_flight == 0 && self.dispatch_queue.is_empty() {
                // Nothing running and nothing startable: the graph cannot
                // make progress.
                let detail = EngineError::Internal(
                    "execution stalled before reaching its exit points".into(),
                )
                .to_detail();
                self.finish_failed(detail).await;
                return Ok(());
            }

            let deadline = self.deadline;
            let wake = tokio::select! {
                _ = cancel.cancelled() => Wake::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Wake::Deadline,
                completion = self.rx.recv() => Wake::Completion(completion),
            };
            match wake {
                Wake::Cancelled => {
                    self.handle_cancel().await?;
                    return Ok(());
                }
                Wake::Deadline => {
                    self.handle_deadline().await?;
                    return Ok(());
                }
                Wake::Completion(completion) => {
                    let Some(completion) = completion else {
                        return Err(EngineError::Internal("completion channel closed".into()));
                    };
                    self.handle_completion(completion).await?;
                    self.drain().await?;
                }
            }
        }
    }

    /// Promote everything promotable, then fill free dispatch slots.
    async fn drain(&mut self) -> Result<(), EngineError> {
        while let Some(id) = self.recheck.pop_front() {
            self.try_promote(&id).await?;
        }
        while self.in_flight < self.config.parallelism {
            let Some(id) = self.dispatch_queue.pop_front() else {
                break;
            };
            // Entries cancelled while queued are dropped.
            if self.states.get(&id) != Some(&NodeState::Queued) {
                continue;
            }
            self.start_agent_node(&id).await?;
            // Starting a node never produces immediate terminals, but a
            // failed lookup can; flush those before the next slot.
            while let Some(next) = self.recheck.pop_front() {
                self.try_promote(&next).await?;
            }
        }
        Ok(())
    }

    // ── Readiness ───────────────────────────────────────────────────────

    fn dep_state(&self, dep: &str, for_node: &str) -> NodeState {
        // A loop's body sees the loop itself as satisfied while an
        // iteration is active.
        if let Some(owner) = self.body_owner.get(for_node) {
            if owner == dep {
                return if self.active_loops.contains_key(owner) {
                    NodeState::Done(NodeStatus::Succeeded)
                } else {
                    NodeState::Blocked
                };
            }
        }
        *self.states.get(dep).unwrap_or(&NodeState::Blocked)
    }

    async fn try_promote(&mut self, id: &str) -> Result<(), EngineError> {
        if self.states.get(id) != Some(&NodeState::Blocked) {
            return Ok(());
        }
        // Body nodes wait for their loop to activate the iteration.
        if let Some(owner) = self.body_owner.get(id) {
            match self.active_loops.get(owner) {
                Some(remaining) if remaining.contains(id) => {}
                _ => return Ok(()),
            }
        }

        // Error-handler transfer bypasses dependency evaluation.
        if self.forced_inputs.contains_key(id) {
            self.queue_node(id.to_string()).await?;
            return Ok(());
        }

        let node = self.flow.definition.node(id).expect("known node").clone();
        if let NodeKind::Join { sources, strategy } = &node.kind {
            return self.try_resolve_join(&node, sources, strategy.clone()).await;
        }

        let deps = self.effective_deps.get(id).cloned().unwrap_or_default();
        let mut succeeded = 0usize;
        let mut skipped = 0usize;
        let mut failed = 0usize;
        for dep in &deps {
            match self.dep_state(dep, id).terminal_status() {
                None => return Ok(()),
                Some(NodeStatus::Succeeded) => succeeded += 1,
                Some(NodeStatus::Skipped) => skipped += 1,
                Some(_) => failed += 1,
            }
        }

        if deps.is_empty() || succeeded > 0 {
            self.queue_node(id.to_string()).await?;
        } else if skipped > 0 || failed > 0 {
            // Nothing upstream produced output: branch exclusion or an
            // absorbed failure shadows this node.
            self.mark_skipped(id).await?;
        }
        Ok(())
    }

    async fn queue_node(&mut self, id: String) -> Result<(), EngineError> {
        let node = self.flow.definition.node(&id).expect("known node").clone();
        if node.is_agent() {
            self.states.insert(id.clone(), NodeState::Queued);
            self.dispatch_queue.push_back(id);
        } else {
            self.execute_control_node(&node).await?;
        }
        Ok(())
    }

    // ── Input threading ─────────────────────────────────────────────────

    /// Contribution of one succeeded dependency to a consumer's payload:
    /// agent outputs nest under `from_<id>`, control-node payloads (already
    /// `from_*`-keyed) merge transparently.
    fn merge_contribution(&self, map: &mut serde_json::Map<String, Value>, dep: &str) {
        let Some(output) = self.outputs.get(dep) else {
            return;
        };
        let dep_node = self.flow.definition.node(dep).expect("known node");
        match dep_node.kind {
            NodeKind::Agent { .. } | NodeKind::Output => {
                map.insert(format!("from_{dep}"), output.clone());
            }
            _ => {
                if let Value::Object(fields) = output {
                    for (k, v) in fields {
                        map.insert(k.clone(), v.clone());
                    }
                } else {
                    map.insert(format!("from_{dep}"), output.clone());
                }
            }
        }
    }

    /// The payload a node consumes: merged succeeded-dependency outputs,
    /// or the execution input at the entry point.
    fn upstream_payload(&self, id: &str) -> Value {
        let deps = self.effective_deps.get(id).cloned().unwrap_or_default();
        let mut map = serde_json::Map::new();
        let mut any = false;
        for dep in &deps {
            if self.dep_state(dep, id).terminal_status() == Some(NodeStatus::Succeeded)
                && self.outputs.contains_key(dep)
            {
                any = true;
                self.merge_contribution(&mut map, dep);
            }
        }
        if any {
            Value::Object(map)
        } else {
            self.input.clone()
        }
    }

    fn eval_context(&self, iteration: Option<u32>) -> EvalContext<'_> {
        EvalContext {
            input: &self.input,
            outputs: &self.outputs,
            scratch: &self.scratch,
            iteration,
        }
    }

    fn iteration_of(&self, id: &str) -> u32 {
        self.body_owner
            .get(id)
            .and_then(|owner| self.loop_iterations.get(owner).copied())
            .unwrap_or(0)
    }

    /// Agents can update the shared scratch by returning a `context`
    /// object; keys merge over previous values.
    fn merge_scratch(&mut self, output: &Value) {
        let Some(Value::Object(updates)) = output.get("context") else {
            return;
        };
        if let Value::Object(scratch) = &mut self.scratch {
            for (k, v) in updates {
                scratch.insert(k.clone(), v.clone());
            }
        }
    }

    // ── Agent dispatch ──────────────────────────────────────────────────

    async fn start_agent_node(&mut self, id: &str) -> Result<(), EngineError> {
        let node = self.flow.definition.node(id).expect("known node").clone();
        let NodeKind::Agent {
            agent_id,
            config,
            timeout,
            max_retries,
            ..
        } = &node.kind
        else {
            return Err(EngineError::Internal(format!(
                "node `{id}` queued as agent but is not one"
            )));
        };
        let iteration = self.iteration_of(id);

        let (payload, forced_from) = match self.forced_inputs.remove(id) {
            Some((payload, from)) => (payload, Some(from)),
            None => (self.upstream_payload(id), None),
        };
        self.node_inputs.insert(id.to_string(), payload.clone());

        // One message per traversed edge, in observation order.
        if let Some(from) = forced_from {
            self.append_message(&from, id, payload.clone()).await?;
        } else {
            self.record_incoming_edges(id).await?;
        }

        let remaining = self
            .deadline
            .checked_duration_since(Instant::now())
            .unwrap_or(Duration::ZERO);
        if remaining.is_zero() {
            self.states.insert(id.to_string(), NodeState::Running);
            self.handle_node_failure(
                id,
                iteration,
                EngineError::DeadlineExceeded,
                0,
                payload,
            )
            .await?;
            return Ok(());
        }

        // The execution deadline overrides the node timeout when smaller.
        // A small grace keeps the coordinator's deadline path (which
        // classifies the failure as DeadlineExceeded) ahead of the
        // per-dispatch timeout.
        let mut node_timeout = timeout
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.node_timeout());
        if node_timeout > remaining {
            node_timeout = remaining + Duration::from_millis(100);
        }

        let record = match self.registry.lookup(agent_id, &self.tenant_id).await {
            Ok(record) => record,
            Err(e) => {
                self.states.insert(id.to_string(), NodeState::Running);
                self.handle_node_failure(id, iteration, e, 0, payload).await?;
                return Ok(());
            }
        };

        self.states.insert(id.to_string(), NodeState::Running);
        self.in_flight += 1;

        let row = NodeResult::started(self.execution_id, id, iteration, payload.clone());
        self.save_result(&row).await?;
        self.bus.publish(ExecutionEvent::node(
            EventKind::NodeStarted,
            self.execution_id,
            id,
            iteration,
        ));

        let token = self.work_token.child_token();
        self.node_tokens.insert(id.to_string(), token.clone());

        let request = ExecuteRequest {
            execution_id: self.execution_id,
            node_id: id.to_string(),
            input: payload,
            config: config.clone(),
        };
        let proxy = self.proxy.clone();
        let bus = self.bus.clone();
        let tx = self.tx.clone();
        let max_retries = *max_retries;
        let base_delay = self.config.retry_base_delay_ms;
        let max_delay = self.config.retry_max_delay_ms;
        let execution_id = self.execution_id;
        let node_id = id.to_string();

        tokio::spawn(async move {
            let mut attempts = 0u32;
            let outcome = loop {
                attempts += 1;
                let result = tokio::select! {
                    _ = token.cancelled() => break DispatchOutcome::Cancelled,
                    r = proxy.execute(&record, &request, node_timeout) => r,
                };
                match result {
                    Ok(reply) => break DispatchOutcome::Succeeded(reply),
                    Err(e) => {
                        if e.recovery() == Recovery::Retryable && attempts <= max_retries {
                            let delay = backoff::retry_delay(base_delay, max_delay, attempts);
                            bus.publish(ExecutionEvent::node_retrying(
                                execution_id,
                                &node_id,
                                attempts,
                                delay.as_millis() as u64,
                            ));
                            tracing::debug!(
                                %execution_id,
                                node_id,
                                attempts,
                                delay_ms = delay.as_millis() as u64,
                                "retrying node dispatch"
                            );
                            tokio::select! {
                                _ = token.cancelled() => break DispatchOutcome::Cancelled,
                                _ = tokio::time::sleep(delay) => continue,
                            }
                        }
                        break DispatchOutcome::Failed(e);
                    }
                }
            };
            let _ = tx
                .send(NodeCompletion {
                    node_id,
                    iteration,
                    outcome,
                    attempts,
                })
                .await;
        });
        Ok(())
    }

    async fn handle_completion(&mut self, completion: NodeCompletion) -> Result<(), EngineError> {
        self.in_flight = self.in_flight.saturating_sub(1);
        let id = completion.node_id.clone();
        self.node_tokens.remove(&id);
        let input = self
            .node_inputs
            .get(&id)
            .cloned()
            .unwrap_or(Value::Null);

        match completion.outcome {
            DispatchOutcome::Succeeded(reply) => {
                self.merge_scratch(&reply.output);
                self.outputs.insert(id.clone(), reply.output.clone());
                self.completion_seq.push(id.clone());

                let mut row =
                    NodeResult::started(self.execution_id, &id, completion.iteration, input);
                row.status = NodeStatus::Succeeded;
                row.output = Some(reply.output);
                row.completed_at = Some(Utc::now());
                row.attempts = completion.attempts;
                row.cost_usd = reply.cost_usd;
                self.save_result(&row).await?;

                self.states
                    .insert(id.clone(), NodeState::Done(NodeStatus::Succeeded));
                self.bus.publish(ExecutionEvent::node(
                    EventKind::NodeSucceeded,
                    self.execution_id,
                    &id,
                    completion.iteration,
                ));
                self.after_terminal(&id).await?;
            }
            DispatchOutcome::Failed(error) => {
                self.handle_node_failure(
                    &id,
                    completion.iteration,
                    error,
                    completion.attempts,
                    input,
                )
                .await?;
            }
            DispatchOutcome::Cancelled => {
                let mut row =
                    NodeResult::started(self.execution_id, &id, completion.iteration, input);
                row.status = NodeStatus::Cancelled;
                row.completed_at = Some(Utc::now());
                row.attempts = completion.attempts;
                self.save_result(&row).await?;
                self.states
                    .insert(id.clone(), NodeState::Done(NodeStatus::Cancelled));
                self.after_terminal(&id).await?;
            }
        }
        Ok(())
    }

    /// Node-level failure: record it, then transfer to the error handler,
    /// let a downstream join absorb it, or escalate to execution failure.
    async fn handle_node_failure(
        &mut self,
        id: &str,
        iteration: u32,
        error: EngineError,
        attempts: u32,
        input: Value,
    ) -> Result<(), EngineError> {
        let detail = error.to_detail();
        tracing::warn!(
            execution_id = %self.execution_id,
            node_id = id,
            kind = detail.kind,
            "node failed: {}",
            detail.message
        );

        let mut row = NodeResult::started(self.execution_id, id, iteration, input.clone());
        row.status = NodeStatus::Failed;
        row.error = Some(detail.clone());
        row.completed_at = Some(Utc::now());
        row.attempts = attempts;
        self.save_result(&row).await?;

        self.states
            .insert(id.to_string(), NodeState::Done(NodeStatus::Failed));
        self.node_errors.insert(id.to_string(), detail.clone());
        self.bus.publish(ExecutionEvent::node_failed(
            self.execution_id,
            id,
            iteration,
            &detail,
        ));

        let handler = match &self.flow.definition.node(id).expect("known node").kind {
            NodeKind::Agent { on_error_node, .. } => on_error_node.clone(),
            _ => None,
        };

        if let Some(handler) = handler {
            let mut payload = match input {
                Value::Object(map) => map,
                other => {
                    let mut map = serde_json::Map::new();
                    if !other.is_null() {
                        map.insert("original_input".to_string(), other);
                    }
                    map
                }
            };
            payload.insert(
                "error".to_string(),
                serde_json::to_value(&detail).unwrap_or_default(),
            );
            self.forced_inputs
                .insert(handler.clone(), (Value::Object(payload), id.to_string()));
            // A handler sitting on an untaken branch may already be marked
            // skipped; the transfer revives it.
            if self.states.get(&handler) == Some(&NodeState::Done(NodeStatus::Skipped)) {
                self.states.insert(handler.clone(), NodeState::Blocked);
            }
            self.recheck.push_back(handler);
            self.after_terminal(id).await?;
        } else if self.absorbable(id) {
            self.after_terminal(id).await?;
        } else {
            self.fatal = Some(detail);
        }
        Ok(())
    }

    /// Whether a failure at `id` can be absorbed downstream: some join with
    /// a `first_complete` or `best_by` strategy is reachable from it.
    fn absorbable(&self, id: &str) -> bool {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([id.to_string()]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if current != id {
                if let Some(node) = self.flow.definition.node(&current) {
                    if let NodeKind::Join { strategy, .. } = &node.kind {
                        if matches!(
                            strategy,
                            MergeStrategy::FirstComplete | MergeStrategy::BestBy { .. }
                        ) {
                            return true;
                        }
                    }
                }
            }
            if let Some(successors) = self.effective_successors.get(&current) {
                for succ in successors {
                    if !seen.contains(succ) {
                        queue.push_back(succ.clone());
                    }
                }
            }
        }
        false
    }

    // ── Control-flow nodes ──────────────────────────────────────────────

    async fn execute_control_node(&mut self, node: &NodeSpec) -> Result<(), EngineError> {
        let id = node.id.clone();
        let iteration = self.iteration_of(&id);
        self.states.insert(id.clone(), NodeState::Running);
        self.bus.publish(ExecutionEvent::node(
            EventKind::NodeStarted,
            self.execution_id,
            &id,
            iteration,
        ));

        match &node.kind {
            NodeKind::Decision {
                condition,
                then_node,
                else_node,
            } => {
                let payload = self.upstream_payload(&id);
                self.record_incoming_edges(&id).await?;
                let ctx = self.eval_context(self.body_owner.get(&id).map(|_| iteration));
                match expr::evaluate_bool(condition, &ctx) {
                    Ok(result) => {
                        let (chosen, rejected) = if result {
                            (then_node.clone(), else_node.clone())
                        } else {
                            (else_node.clone(), then_node.clone())
                        };
                        tracing::debug!(
                            execution_id = %self.execution_id,
                            node_id = %id,
                            chosen = %chosen,
                            "decision evaluated"
                        );
                        self.complete_control_node(&id, iteration, payload).await?;
                        if self.states.get(&rejected) == Some(&NodeState::Blocked) {
                            self.mark_skipped(&rejected).await?;
                        }
                    }
                    Err(e) => {
                        self.handle_node_failure(&id, iteration, e, 0, payload).await?;
                    }
                }
            }
            NodeKind::Fork { .. } => {
                let payload = self.upstream_payload(&id);
                self.record_incoming_edges(&id).await?;
                self.complete_control_node(&id, iteration, payload).await?;
            }
            NodeKind::Output => {
                let payload = self.upstream_payload(&id);
                self.record_incoming_edges(&id).await?;
                self.complete_control_node(&id, iteration, payload).await?;
            }
            NodeKind::Loop { .. } => {
                let payload = self.upstream_payload(&id);
                self.record_incoming_edges(&id).await?;
                self.node_inputs.insert(id.clone(), payload.clone());
                let row = NodeResult::started(self.execution_id, &id, 0, payload.clone());
                self.save_result(&row).await?;
                self.loop_base_payload.insert(id.clone(), payload.clone());
                self.outputs.insert(id.clone(), payload);
                self.loop_iterations.insert(id.clone(), 0);
                self.advance_loop(&id).await?;
            }
            NodeKind::Join { .. } | NodeKind::Agent { .. } => {
                return Err(EngineError::Internal(format!(
                    "node `{id}` is not an inline control node"
                )));
            }
        }
        Ok(())
    }

    /// Record a terminal succeeded row for a pure control node.
    async fn complete_control_node(
        &mut self,
        id: &str,
        iteration: u32,
        payload: Value,
    ) -> Result<(), EngineError> {
        self.node_inputs.insert(id.to_string(), payload.clone());
        let mut row = NodeResult::started(self.execution_id, id, iteration, payload.clone());
        row.status = NodeStatus::Succeeded;
        row.output = Some(payload.clone());
        row.completed_at = Some(Utc::now());
        self.save_result(&row).await?;

        self.outputs.insert(id.to_string(), payload);
        self.completion_seq.push(id.to_string());
        self.states
            .insert(id.to_string(), NodeState::Done(NodeStatus::Succeeded));
        self.bus.publish(ExecutionEvent::node(
            EventKind::NodeSucceeded,
            self.execution_id,
            id,
            iteration,
        ));
        self.after_terminal(id).await?;
        Ok(())
    }

    async fn mark_skipped(&mut self, id: &str) -> Result<(), EngineError> {
        let iteration = self.iteration_of(id);
        let mut row = NodeResult::started(self.execution_id, id, iteration, Value::Null);
        row.status = NodeStatus::Skipped;
        row.completed_at = Some(Utc::now());
        self.save_result(&row).await?;

        self.states
            .insert(id.to_string(), NodeState::Done(NodeStatus::Skipped));
        self.bus.publish(ExecutionEvent::node(
            EventKind::NodeSkipped,
            self.execution_id,
            id,
            iteration,
        ));
        self.after_terminal(id).await?;
        Ok(())
    }

    // ── Joins ───────────────────────────────────────────────────────────

    async fn try_resolve_join(
        &mut self,
        node: &NodeSpec,
        sources: &[String],
        strategy: MergeStrategy,
    ) -> Result<(), EngineError> {
        let id = node.id.clone();
        let iteration = self.iteration_of(&id);
        let terminal: Vec<(String, Option<NodeStatus>)> = sources
            .iter()
            .map(|s| (s.clone(), self.states[s].terminal_status()))
            .collect();
        let all_terminal = terminal.iter().all(|(_, s)| s.is_some());

        match strategy {
            MergeStrategy::FirstComplete => {
                let winner = self
                    .completion_seq
                    .iter()
                    .find(|n| sources.contains(*n))
                    .cloned();
                if let Some(winner) = winner {
                    // Losing sources still in flight are cancelled; queued
                    // ones are dropped before dispatch.
                    for (source, status) in &terminal {
                        if source == &winner || status.is_some() {
                            continue;
                        }
                        if let Some(token) = self.node_tokens.get(source) {
                            token.cancel();
                        }
                        if self.states.get(source) == Some(&NodeState::Queued)
                            || self.states.get(source) == Some(&NodeState::Blocked)
                        {
                            self.states
                                .insert(source.clone(), NodeState::Done(NodeStatus::Cancelled));
                            if let Some(successors) =
                                self.effective_successors.get(source).cloned()
                            {
                                self.recheck.extend(successors);
                            }
                        }
                    }
                    let mut map = serde_json::Map::new();
                    self.merge_contribution(&mut map, &winner);
                    let payload = Value::Object(map);
                    self.append_message(&winner, &id, self.outputs[&winner].clone())
                        .await?;
                    self.states.insert(id.clone(), NodeState::Running);
                    self.complete_control_node(&id, iteration, payload).await?;
                } else if all_terminal {
                    self.states.insert(id.clone(), NodeState::Running);
                    let error = self.join_sources_error(sources);
                    self.handle_node_failure(&id, iteration, error, 0, Value::Null)
                        .await?;
                }
            }
            MergeStrategy::AllComplete => {
                if !all_terminal {
                    return Ok(());
                }
                if let Some((failed, _)) = terminal.iter().find(|(_, s)| {
                    matches!(s, Some(NodeStatus::Failed) | Some(NodeStatus::Cancelled))
                }) {
                    self.states.insert(id.clone(), NodeState::Running);
                    let error = EngineError::Internal(format!(
                        "join source `{failed}` did not succeed: {}",
                        self.node_errors
                            .get(failed)
                            .map(|e| e.message.clone())
                            .unwrap_or_else(|| "terminal without output".into())
                    ));
                    self.handle_node_failure(&id, iteration, error, 0, Value::Null)
                        .await?;
                    return Ok(());
                }
                let succeeded: Vec<String> = terminal
                    .iter()
                    .filter(|(_, s)| *s == Some(NodeStatus::Succeeded))
                    .map(|(n, _)| n.clone())
                    .collect();
                if succeeded.is_empty() {
                    // Every source was skipped; the join is skipped too.
                    self.mark_skipped(&id).await?;
                    return Ok(());
                }
                let mut map = serde_json::Map::new();
                for source in &succeeded {
                    self.append_message(source, &id, self.outputs[source].clone())
                        .await?;
                    self.merge_contribution(&mut map, source);
                }
                self.states.insert(id.clone(), NodeState::Running);
                self.complete_control_node(&id, iteration, Value::Object(map))
                    .await?;
            }
            MergeStrategy::BestBy { expr: score_expr } => {
                if !all_terminal {
                    return Ok(());
                }
                let succeeded: Vec<String> = terminal
                    .iter()
                    .filter(|(_, s)| *s == Some(NodeStatus::Succeeded))
                    .map(|(n, _)| n.clone())
                    .collect();
                if succeeded.is_empty() {
                    self.states.insert(id.clone(), NodeState::Running);
                    let error = self.join_sources_error(sources);
                    self.handle_node_failure(&id, iteration, error, 0, Value::Null)
                        .await?;
                    return Ok(());
                }
                let mut best: Option<(String, f64)> = None;
                for source in &succeeded {
                    // The candidate's output is the expression's `input`.
                    let ctx = EvalContext {
                        input: &self.outputs[source],
                        outputs: &self.outputs,
                        scratch: &self.scratch,
                        iteration: None,
                    };
                    let score = match expr::evaluate_number(&score_expr, &ctx) {
                        Ok(score) => score,
                        Err(e) => {
                            self.states.insert(id.clone(), NodeState::Running);
                            self.handle_node_failure(&id, iteration, e, 0, Value::Null)
                                .await?;
                            return Ok(());
                        }
                    };
                    if best.as_ref().map_or(true, |(_, b)| score > *b) {
                        best = Some((source.clone(), score));
                    }
                }
                let (winner, score) = best.expect("non-empty succeeded set");
                tracing::debug!(
                    execution_id = %self.execution_id,
                    join = %id,
                    winner = %winner,
                    score,
                    "best_by join resolved"
                );
                let mut map = serde_json::Map::new();
                self.merge_contribution(&mut map, &winner);
                self.append_message(&winner, &id, self.outputs[&winner].clone())
                    .await?;
                self.states.insert(id.clone(), NodeState::Running);
                self.complete_control_node(&id, iteration, Value::Object(map))
                    .await?;
            }
        }
        Ok(())
    }

    fn join_sources_error(&self, sources: &[String]) -> EngineError {
        let detail = sources
            .iter()
            .find_map(|s| self.node_errors.get(s))
            .map(|e| e.message.clone())
            .unwrap_or_else(|| "no source succeeded".to_string());
        EngineError::Internal(format!("join failed: {detail}"))
    }

    // ── Loops ───────────────────────────────────────────────────────────

    /// Evaluate the loop guard and either start the next body iteration or
    /// complete the loop.
    ///
    /// Boxed: loop completion re-enters the terminal path (`after_terminal`
    /// -> `note_body_terminal` -> here for a nested loop), and a recursive
    /// async fn needs the indirection.
    fn advance_loop<'a>(
        &'a mut self,
        id: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), EngineError>> + Send + 'a>>
    {
        Box::pin(self.advance_loop_inner(id))
    }

    async fn advance_loop_inner(&mut self, id: &str) -> Result<(), EngineError> {
        let NodeKind::Loop {
            body,
            until,
            max_iterations,
        } = self
            .flow
            .definition
            .node(id)
            .expect("known node")
            .kind
            .clone()
        else {
            return Err(EngineError::Internal(format!("`{id}` is not a loop")));
        };
        let iteration = self.loop_iterations[id];

        let done = if iteration >= max_iterations {
            true
        } else {
            let ctx = self.eval_context(Some(iteration));
            match expr::evaluate_bool(&until, &ctx) {
                Ok(done) => done,
                Err(e) => {
                    self.active_loops.remove(id);
                    self.handle_node_failure(
                        id,
                        0,
                        e,
                        0,
                        self.loop_base_payload.get(id).cloned().unwrap_or(Value::Null),
                    )
                    .await?;
                    return Ok(());
                }
            }
        };

        if done {
            self.active_loops.remove(id);
            // The loop's contribution: its upstream payload plus the last
            // iteration's body outputs.
            let mut map = match self.loop_base_payload.get(id) {
                Some(Value::Object(base)) => base.clone(),
                _ => serde_json::Map::new(),
            };
            if iteration > 0 {
                for member in &body {
                    if self.states.get(member).and_then(|s| s.terminal_status())
                        == Some(NodeStatus::Succeeded)
                    {
                        self.merge_contribution(&mut map, member);
                    }
                }
            }
            tracing::debug!(
                execution_id = %self.execution_id,
                loop_id = id,
                iterations = iteration,
                "loop completed"
            );
            self.complete_control_node(id, 0, Value::Object(map)).await?;
        } else {
            let members: HashSet<String> = body.iter().cloned().collect();
            for member in &body {
                self.states.insert(member.clone(), NodeState::Blocked);
                self.outputs.remove(member);
                self.node_tokens.remove(member);
            }
            self.active_loops.insert(id.to_string(), members);
            for member in &body {
                self.recheck.push_back(member.clone());
            }
        }
        Ok(())
    }

    /// Loop bookkeeping on body-node completion.
    async fn note_body_terminal(&mut self, id: &str) -> Result<(), EngineError> {
        let Some(owner) = self.body_owner.get(id).cloned() else {
            return Ok(());
        };
        let Some(remaining) = self.active_loops.get_mut(&owner) else {
            return Ok(());
        };
        remaining.remove(id);
        if remaining.is_empty() {
            *self.loop_iterations.get_mut(&owner).expect("active loop") += 1;
            self.advance_loop(&owner).await?;
        }
        Ok(())
    }

    // ── Propagation ─────────────────────────────────────────────────────

    async fn after_terminal(&mut self, id: &str) -> Result<(), EngineError> {
        if let Some(successors) = self.effective_successors.get(id).cloned() {
            for succ in successors {
                self.recheck.push_back(succ);
            }
        }
        self.note_body_terminal(id).await?;
        Ok(())
    }

    /// One message per incoming succeeded edge, observed at dispatch time.
    async fn record_incoming_edges(&mut self, id: &str) -> Result<(), EngineError> {
        let deps = self.effective_deps.get(id).cloned().unwrap_or_default();
        for dep in deps {
            if self.dep_state(&dep, id).terminal_status() == Some(NodeStatus::Succeeded) {
                if let Some(output) = self.outputs.get(&dep).cloned() {
                    self.append_message(&dep, id, output).await?;
                }
            }
        }
        Ok(())
    }

    async fn append_message(
        &self,
        from: &str,
        to: &str,
        payload: Value,
    ) -> Result<(), EngineError> {
        let msg = AgentMessage::new(self.execution_id, from, to, payload);
        if let Err(first) = self.store.append_message(&msg).await {
            tracing::warn!(error = %first, "message append failed, retrying");
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.store.append_message(&msg).await?;
        }
        Ok(())
    }

    async fn save_result(&self, row: &NodeResult) -> Result<(), EngineError> {
        if let Err(first) = self.store.upsert_node_result(row).await {
            tracing::warn!(error = %first, "node result write failed, retrying");
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.store.upsert_node_result(row).await?;
        }
        Ok(())
    }

    // ── Terminal paths ──────────────────────────────────────────────────

    fn all_exits_terminal(&self) -> bool {
        self.flow
            .definition
            .exit_points
            .iter()
            .all(|exit| self.states[exit].terminal_status().is_some())
    }

    async fn finish_by_exits(&mut self) -> Result<(), EngineError> {
        let mut output = serde_json::Map::new();
        let mut failed_exit: Option<String> = None;
        let mut any_succeeded = false;
        for exit in &self.flow.definition.exit_points {
            match self.states[exit].terminal_status() {
                Some(NodeStatus::Succeeded) => {
                    any_succeeded = true;
                    output.insert(
                        exit.clone(),
                        self.outputs.get(exit).cloned().unwrap_or(Value::Null),
                    );
                }
                Some(NodeStatus::Failed) | Some(NodeStatus::Cancelled) => {
                    failed_exit = Some(exit.clone());
                }
                _ => {}
            }
        }

        if let Some(exit) = failed_exit {
            let detail = self.node_errors.get(&exit).cloned().unwrap_or(ErrorDetail {
                kind: "internal".to_string(),
                message: format!("exit point `{exit}` did not succeed"),
            });
            self.finish_failed(detail).await;
        } else if !any_succeeded {
            let detail = ErrorDetail {
                kind: "internal".to_string(),
                message: "no exit point produced output".to_string(),
            };
            self.finish_failed(detail).await;
        } else {
            // A first_complete join may leave losing dispatches in flight;
            // abort them and record their rows before declaring success.
            self.drain_in_flight_as_cancelled().await?;
            let result = self
                .store
                .transition(
                    self.execution_id,
                    ExecutionStatus::Succeeded,
                    TransitionFields {
                        output_data: Some(Value::Object(output)),
                        error: None,
                    },
                )
                .await;
            if let Err(e) = result {
                tracing::error!(execution_id = %self.execution_id, error = %e, "failed to record success");
            }
            tracing::info!(execution_id = %self.execution_id, "execution succeeded");
            self.bus.publish(ExecutionEvent::execution(
                EventKind::ExecutionSucceeded,
                self.execution_id,
            ));
        }
        Ok(())
    }

    async fn finish_failed(&mut self, detail: ErrorDetail) {
        self.work_token.cancel();
        let result = self
            .store
            .transition(
                self.execution_id,
                ExecutionStatus::Failed,
                TransitionFields {
                    output_data: None,
                    error: Some(detail.clone()),
                },
            )
            .await;
        match result {
            Ok(_) => {
                tracing::info!(
                    execution_id = %self.execution_id,
                    kind = %detail.kind,
                    "execution failed: {}",
                    detail.message
                );
                self.bus
                    .publish(ExecutionEvent::execution_failed(self.execution_id, &detail));
            }
            Err(e) => {
                // Already terminal (e.g. a racing cancel) or store trouble.
                tracing::warn!(execution_id = %self.execution_id, error = %e, "could not record failure");
            }
        }
    }

    /// Fail fast: abort in-flight dispatches and record their rows with the
    /// given error (used by the deadline path).
    async fn cancel_in_flight_as_failed(&mut self, detail: ErrorDetail) -> Result<(), EngineError> {
        self.work_token.cancel();
        while self.in_flight > 0 {
            let Some(completion) = self.rx.recv().await else {
                break;
            };
            self.in_flight = self.in_flight.saturating_sub(1);
            let id = completion.node_id;
            let input = self.node_inputs.get(&id).cloned().unwrap_or(Value::Null);
            let mut row = NodeResult::started(self.execution_id, &id, completion.iteration, input);
            row.status = NodeStatus::Failed;
            row.error = Some(detail.clone());
            row.completed_at = Some(Utc::now());
            row.attempts = completion.attempts;
            self.save_result(&row).await?;
            self.states
                .insert(id.clone(), NodeState::Done(NodeStatus::Failed));
            self.bus.publish(ExecutionEvent::node_failed(
                self.execution_id,
                &id,
                completion.iteration,
                &detail,
            ));
        }
        Ok(())
    }

    async fn handle_deadline(&mut self) -> Result<(), EngineError> {
        tracing::warn!(execution_id = %self.execution_id, "execution deadline exceeded");
        let detail = EngineError::DeadlineExceeded.to_detail();
        self.cancel_in_flight_as_failed(detail.clone()).await?;
        self.finish_failed(detail).await;
        Ok(())
    }

    /// Abort outstanding dispatches and record each as cancelled.
    async fn drain_in_flight_as_cancelled(&mut self) -> Result<(), EngineError> {
        self.work_token.cancel();
        while self.in_flight > 0 {
            let Some(completion) = self.rx.recv().await else {
                break;
            };
            self.in_flight = self.in_flight.saturating_sub(1);
            let id = completion.node_id;
            let input = self.node_inputs.get(&id).cloned().unwrap_or(Value::Null);
            let mut row = NodeResult::started(self.execution_id, &id, completion.iteration, input);
            row.status = NodeStatus::Cancelled;
            row.completed_at = Some(Utc::now());
            row.attempts = completion.attempts;
            self.save_result(&row).await?;
            self.states
                .insert(id, NodeState::Done(NodeStatus::Cancelled));
        }
        Ok(())
    }

    async fn handle_cancel(&mut self) -> Result<(), EngineError> {
        tracing::info!(execution_id = %self.execution_id, "execution cancelled");
        // Queued-but-not-started nodes are dropped without a result row;
        // in-flight dispatches abort at their next suspension point and are
        // recorded as cancelled. Nothing succeeds after this point.
        self.dispatch_queue.clear();
        self.drain_in_flight_as_cancelled().await?;

        let result = self
            .store
            .transition(
                self.execution_id,
                ExecutionStatus::Cancelled,
                TransitionFields::default(),
            )
            .await;
        if let Err(e) = result {
            tracing::warn!(execution_id = %self.execution_id, error = %e, "could not record cancellation");
        }
        self.bus.publish(ExecutionEvent::execution(
            EventKind::ExecutionCancelled,
            self.execution_id,
        ));
        Ok(())
    }
}
