//! Pregel-style execution engine.
//!
//! One engine drives one run, single-threaded and cooperative. A superstep
//! determines the frontier (steps whose dependencies are satisfied and whose
//! `when` guard passes), invokes the frontier nodes in the compiler-produced
//! topological order, applies channel reducers, persists a checkpoint, and
//! repeats until the frontier is empty or a HITL node suspends the run.
//!
//! Cycles run as super-nodes: each iteration is one full topological pass of
//! the internal nodes followed by a guard evaluation, with its own checkpoint
//! boundary. The cancel flag is observed between nodes and before each cycle
//! iteration.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::callable::CallableResolver;
use crate::checkpoint::{CheckpointStore, NodeTrace, Snapshot, StoreError, WriteKind, WriteRecord};
use crate::eval::ExpressionEvaluator;
use crate::graph::{CompiledNode, CycleId, InputSource, NodeId, Step, Workflow};
use crate::reducers;
use crate::value::Value;

/// Cooperative cancellation flag shared between a worker and its engine.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeErrorKind {
    MissingCallable,
    CallFailed,
    Reducer,
    Guard,
}

impl fmt::Display for NodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeErrorKind::MissingCallable => "MissingCallable",
            NodeErrorKind::CallFailed => "NodeError",
            NodeErrorKind::Reducer => "ReducerError",
            NodeErrorKind::Guard => "GuardError",
        };
        f.write_str(name)
    }
}

/// A run-fatal node failure, surfaced to the orchestrator.
#[derive(Debug, Clone, Error)]
#[error("{kind} in node '{node}': {message}")]
pub struct NodeError {
    pub node: String,
    pub kind: NodeErrorKind,
    pub message: String,
}

/// What the engine returned control with.
#[derive(Debug)]
pub enum RunOutcome {
    Completed {
        result: BTreeMap<String, Value>,
    },
    /// HITL suspension: the run is paused awaiting external input for `node`.
    Suspended {
        node: String,
        correlation: BTreeMap<String, Value>,
    },
    Canceled,
    Failed {
        error: NodeError,
    },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Engine<'a> {
    workflow: &'a Workflow,
    resolver: Arc<dyn CallableResolver>,
    store: &'a dyn CheckpointStore,
    run_id: Uuid,
    cancel: CancelFlag,

    superstep: u32,
    channels: BTreeMap<String, Value>,
    completed: BTreeSet<String>,
    skipped: BTreeSet<String>,
    cycle_iterations: BTreeMap<String, u32>,
    active_cycle: Option<CycleId>,
    /// Internal nodes still pending in the current cycle iteration.
    pending: Vec<String>,
    suspended_node: Option<String>,
    resume: Option<Value>,
    traces: Vec<NodeTrace>,
    error: Option<String>,
    fresh: bool,
}

impl<'a> Engine<'a> {
    /// Engine for a fresh run starting from the workflow inputs.
    pub fn new(
        workflow: &'a Workflow,
        resolver: Arc<dyn CallableResolver>,
        store: &'a dyn CheckpointStore,
        run_id: Uuid,
        cancel: CancelFlag,
        inputs: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            workflow,
            resolver,
            store,
            run_id,
            cancel,
            superstep: 0,
            channels: inputs,
            completed: BTreeSet::new(),
            skipped: BTreeSet::new(),
            cycle_iterations: BTreeMap::new(),
            active_cycle: None,
            pending: Vec::new(),
            suspended_node: None,
            resume: None,
            traces: Vec::new(),
            error: None,
            fresh: true,
        }
    }

    /// Engine resuming from a checkpoint snapshot.
    pub fn from_snapshot(
        workflow: &'a Workflow,
        resolver: Arc<dyn CallableResolver>,
        store: &'a dyn CheckpointStore,
        run_id: Uuid,
        cancel: CancelFlag,
        snapshot: Snapshot,
    ) -> Self {
        let active_cycle = snapshot
            .active_cycle
            .as_deref()
            .and_then(|name| workflow.cycles.iter().position(|cycle| cycle.name == name));
        // A restored mid-iteration continuation checkpoints at its own
        // boundary rather than overwriting the one it resumed from.
        let superstep = if snapshot.pending.is_empty() {
            snapshot.superstep
        } else {
            snapshot.superstep + 1
        };
        Self {
            workflow,
            resolver,
            store,
            run_id,
            cancel,
            superstep,
            channels: snapshot.channels,
            completed: snapshot.completed,
            skipped: snapshot.skipped,
            cycle_iterations: snapshot.cycle_iterations,
            active_cycle,
            pending: snapshot.pending,
            suspended_node: snapshot.suspended_node,
            resume: None,
            traces: Vec::new(),
            error: None,
            fresh: false,
        }
    }

    /// Drive the run until completion, suspension, cancellation, or failure.
    ///
    /// `resume` carries the HITL payload when continuing a suspended run; it
    /// is delivered to the suspended node as its `answer` input.
    pub async fn run(&mut self, resume: Option<Value>) -> Result<RunOutcome, EngineError> {
        let workflow = self.workflow;
        self.resume = resume;
        // Retrying a failed run re-executes from the last boundary.
        self.error = None;

        if self.fresh {
            self.fresh = false;
            self.checkpoint().await?;
        }

        info!(
            run_id = %self.run_id,
            template = %workflow.template_name,
            superstep = self.superstep,
            "engine started"
        );

        loop {
            if self.cancel.is_canceled() {
                return self.finish_canceled().await;
            }

            if let Some(cycle_id) = self.active_cycle {
                match self.run_cycle_superstep(cycle_id).await? {
                    Some(outcome) => return Ok(outcome),
                    None => continue,
                }
            }

            // Frontier over workflow-level steps.
            let mut ready_nodes: Vec<NodeId> = Vec::new();
            let mut ready_cycle: Option<CycleId> = None;
            for step in &workflow.order {
                let name = workflow.step_name(*step);
                if self.completed.contains(name) || self.skipped.contains(name) {
                    continue;
                }
                if !self.deps_satisfied(*step) {
                    continue;
                }
                match *step {
                    Step::Node(id) => match self.when_passes(&workflow.nodes[id]) {
                        Ok(true) => ready_nodes.push(id),
                        Ok(false) => {
                            debug!(node = %workflow.nodes[id].name, "skipped by when guard");
                            self.skipped.insert(workflow.nodes[id].name.clone());
                        }
                        Err(error) => return self.finish_failed(error).await,
                    },
                    Step::Cycle(id) => {
                        if ready_cycle.is_none() {
                            ready_cycle = Some(id);
                        }
                    }
                }
            }

            if !ready_nodes.is_empty() {
                self.superstep += 1;
                self.traces.clear();
                for node_id in ready_nodes {
                    if self.cancel.is_canceled() {
                        return self.finish_canceled().await;
                    }
                    let node = &workflow.nodes[node_id];
                    if node.hitl.is_some() && !self.resume_is_for(&node.name) {
                        return self.suspend_on(node_id).await;
                    }
                    let answer = self.take_resume_for(&node.name);
                    match self.invoke_node(node_id, answer).await {
                        Ok(mut trace) => {
                            let before = self.ready_step_names();
                            self.completed.insert(node.name.clone());
                            let after = self.ready_step_names();
                            trace.branches = after
                                .into_iter()
                                .filter(|name| !before.contains(name))
                                .collect();
                            for branch in &trace.branches {
                                trace.writes.push(WriteRecord {
                                    kind: WriteKind::Branch,
                                    channel: format!("branch:to:{}", branch),
                                    value: Value::Null,
                                });
                            }
                            self.traces.push(trace);
                        }
                        Err(error) => return self.finish_failed(error).await,
                    }
                }
                self.checkpoint().await?;
                continue;
            }

            if let Some(cycle_id) = ready_cycle {
                self.enter_cycle(cycle_id);
                continue;
            }

            // Frontier empty: the run is complete.
            return self.finish_completed();
        }
    }

    // -------------------------------------------------------------------------
    // Frontier helpers
    // -------------------------------------------------------------------------

    fn deps_satisfied(&self, step: Step) -> bool {
        let deps = match step {
            Step::Node(id) => &self.workflow.nodes[id].depends_on,
            Step::Cycle(id) => &self.workflow.cycles[id].depends_on,
        };
        deps.iter().all(|channel| self.channel_settled(channel))
    }

    /// A channel is settled when it is a workflow input or when its producer
    /// step has completed or been skipped. Skipped producers settle their
    /// channels as null.
    fn channel_settled(&self, channel: &str) -> bool {
        if self.workflow.is_input_channel(channel) {
            return true;
        }
        let producer = channel.split('.').next().unwrap_or(channel);
        self.completed.contains(producer) || self.skipped.contains(producer)
    }

    fn when_passes(&self, node: &CompiledNode) -> Result<bool, NodeError> {
        let Some(when) = &node.when else {
            return Ok(true);
        };
        ExpressionEvaluator::evaluate(when, &self.channels).map_err(|err| NodeError {
            node: node.name.clone(),
            kind: NodeErrorKind::Guard,
            message: err.to_string(),
        })
    }

    fn ready_step_names(&self) -> Vec<String> {
        self.workflow
            .order
            .iter()
            .filter(|step| {
                let name = self.workflow.step_name(**step);
                !self.completed.contains(name)
                    && !self.skipped.contains(name)
                    && self.deps_satisfied(**step)
            })
            .map(|step| self.workflow.step_name(*step).to_string())
            .collect()
    }

    fn resume_is_for(&self, node: &str) -> bool {
        self.resume.is_some() && self.suspended_node.as_deref() == Some(node)
    }

    fn take_resume_for(&mut self, node: &str) -> Option<Value> {
        if self.resume_is_for(node) {
            self.suspended_node = None;
            self.resume.take()
        } else {
            None
        }
    }

    // -------------------------------------------------------------------------
    // Cycle execution
    // -------------------------------------------------------------------------

    fn enter_cycle(&mut self, cycle_id: CycleId) {
        let cycle = self.workflow.cycle(cycle_id);
        debug!(cycle = %cycle.name, "entering cycle");
        // Cycle inputs are bound once, at entry, and stay fixed across
        // iterations.
        for input in &cycle.inputs {
            let value = match &input.source {
                InputSource::Channel(channel) => {
                    self.channels.get(channel).cloned().unwrap_or(Value::Null)
                }
                InputSource::Literal(value) => value.clone(),
            };
            self.channels
                .insert(format!("{}.{}", cycle.name, input.name), value);
        }
        self.active_cycle = Some(cycle_id);
        self.pending.clear();
    }

    /// Run one cycle iteration (or continue a partially executed one) as a
    /// superstep. Returns Some(outcome) when the run leaves the engine.
    async fn run_cycle_superstep(
        &mut self,
        cycle_id: CycleId,
    ) -> Result<Option<RunOutcome>, EngineError> {
        let workflow = self.workflow;
        let cycle = workflow.cycle(cycle_id);

        if self.pending.is_empty() {
            // Cancel is observed before each cycle iteration.
            if self.cancel.is_canceled() {
                return self.finish_canceled().await.map(Some);
            }
            self.pending = cycle
                .nodes
                .iter()
                .map(|&id| workflow.nodes[id].name.clone())
                .collect();
            self.superstep += 1;
            self.traces.clear();
        }

        while let Some(node_name) = self.pending.first().cloned() {
            if self.cancel.is_canceled() {
                return self.finish_canceled().await.map(Some);
            }
            let node_id = cycle
                .nodes
                .iter()
                .copied()
                .find(|&id| workflow.nodes[id].name == node_name)
                .expect("pending node belongs to cycle");
            let node = &workflow.nodes[node_id];

            match self.when_passes(node) {
                Ok(true) => {}
                Ok(false) => {
                    self.pending.remove(0);
                    continue;
                }
                Err(error) => return self.finish_failed(error).await.map(Some),
            }

            if node.hitl.is_some() && !self.resume_is_for(&node.name) {
                return self.suspend_on(node_id).await.map(Some);
            }
            let answer = self.take_resume_for(&node_name);
            match self.invoke_node(node_id, answer).await {
                Ok(trace) => self.traces.push(trace),
                Err(error) => return self.finish_failed(error).await.map(Some),
            }
            self.pending.remove(0);
        }

        // Iteration complete: bump the counter, evaluate the guard.
        let iterations = self.cycle_iterations.get(&cycle.name).copied().unwrap_or(0) + 1;
        self.cycle_iterations.insert(cycle.name.clone(), iterations);

        let guard = match ExpressionEvaluator::evaluate(&cycle.guard, &self.channels) {
            Ok(value) => value,
            Err(err) => {
                let error = NodeError {
                    node: cycle.name.clone(),
                    kind: NodeErrorKind::Guard,
                    message: err.to_string(),
                };
                return self.finish_failed(error).await.map(Some);
            }
        };

        if guard && iterations < cycle.max_iterations {
            debug!(cycle = %cycle.name, iterations, "cycle guard true, next iteration");
            self.checkpoint().await?;
            return Ok(None);
        }

        // Terminate: publish declared outputs to the outer channel map.
        let mut trace_writes = Vec::new();
        for output in &cycle.outputs {
            let value = self
                .channels
                .get(&output.internal_channel)
                .cloned()
                .unwrap_or(Value::Null);
            let channel = cycle.output_channel(&output.name);
            trace_writes.push(WriteRecord {
                kind: WriteKind::State,
                channel: channel.clone(),
                value: value.clone(),
            });
            self.channels.insert(channel, value);
        }
        self.traces.push(NodeTrace {
            node: cycle.name.clone(),
            task_id: Uuid::new_v4().to_string(),
            writes: trace_writes,
            branches: Vec::new(),
        });

        info!(cycle = %cycle.name, iterations, "cycle terminated");
        self.completed.insert(cycle.name.clone());
        self.active_cycle = None;
        self.checkpoint().await?;
        Ok(None)
    }

    // -------------------------------------------------------------------------
    // Node invocation
    // -------------------------------------------------------------------------

    async fn invoke_node(
        &mut self,
        node_id: NodeId,
        answer: Option<Value>,
    ) -> Result<NodeTrace, NodeError> {
        let workflow = self.workflow;
        let node = &workflow.nodes[node_id];
        let task_id = Uuid::new_v4().to_string();

        let mut inputs: BTreeMap<String, Value> = BTreeMap::new();
        for input in &node.inputs {
            let value = match &input.source {
                InputSource::Channel(channel) => {
                    self.channels.get(channel).cloned().unwrap_or(Value::Null)
                }
                InputSource::Literal(value) => value.clone(),
            };
            inputs.insert(input.name.clone(), value);
        }
        if let Some(payload) = answer {
            inputs.insert("answer".to_string(), payload);
        }

        let mut config = node.consts.clone();
        config.insert(
            "configurable".to_string(),
            Value::Map(BTreeMap::from([(
                "thread_id".to_string(),
                Value::String(self.run_id.to_string()),
            )])),
        );

        let Some(callable) = self.resolver.resolve(&node.call_target) else {
            return Err(NodeError {
                node: node.name.clone(),
                kind: NodeErrorKind::MissingCallable,
                message: format!("no callable named '{}'", node.call_target),
            });
        };

        debug!(node = %node.name, call = %node.call_target, task_id = %task_id, "invoking node");
        let outputs = callable.call(inputs, config).await.map_err(|err| {
            let mut message = format!("{}: {}", err.kind, err.message);
            if let Some(trace) = &err.trace {
                message.push('\n');
                message.push_str(trace);
            }
            NodeError {
                node: node.name.clone(),
                kind: NodeErrorKind::CallFailed,
                message,
            }
        })?;

        for key in outputs.keys() {
            if !node.outputs.iter().any(|slot| slot == key) {
                return Err(NodeError {
                    node: node.name.clone(),
                    kind: NodeErrorKind::CallFailed,
                    message: format!("returned undeclared output '{}'", key),
                });
            }
        }

        // Apply reducers in declared-slot order for determinism.
        let mut writes = Vec::new();
        for slot in &node.outputs {
            let Some(value) = outputs.get(slot) else {
                continue;
            };
            let channel = node.output_channel(slot);
            let reducer = workflow.reducer_for(&channel);
            let merged = reducers::apply(
                reducer,
                &channel,
                self.channels.get(&channel),
                value.clone(),
            )
            .map_err(|err| NodeError {
                node: node.name.clone(),
                kind: NodeErrorKind::Reducer,
                message: err.to_string(),
            })?;
            writes.push(WriteRecord {
                kind: WriteKind::State,
                channel: channel.clone(),
                value: merged.clone(),
            });
            self.channels.insert(channel, merged);
        }

        Ok(NodeTrace {
            node: node.name.clone(),
            task_id,
            writes,
            branches: Vec::new(),
        })
    }

    // -------------------------------------------------------------------------
    // Terminal transitions
    // -------------------------------------------------------------------------

    async fn suspend_on(&mut self, node_id: NodeId) -> Result<RunOutcome, EngineError> {
        let node = &self.workflow.nodes[node_id];
        let name = node.name.clone();
        let correlation = node.hitl.clone().unwrap_or_default();
        self.suspended_node = Some(name.clone());
        info!(run_id = %self.run_id, node = %name, "suspending for external input");
        self.checkpoint().await?;
        Ok(RunOutcome::Suspended {
            node: name,
            correlation,
        })
    }

    fn finish_completed(&self) -> Result<RunOutcome, EngineError> {
        let mut result = BTreeMap::new();
        for output in &self.workflow.outputs {
            let value = self
                .channels
                .get(&output.channel)
                .cloned()
                .unwrap_or(Value::Null);
            result.insert(output.name.clone(), value);
        }
        info!(run_id = %self.run_id, superstep = self.superstep, "run completed");
        Ok(RunOutcome::Completed { result })
    }

    async fn finish_canceled(&mut self) -> Result<RunOutcome, EngineError> {
        warn!(run_id = %self.run_id, superstep = self.superstep, "run canceled");
        self.checkpoint().await?;
        Ok(RunOutcome::Canceled)
    }

    async fn finish_failed(&mut self, error: NodeError) -> Result<RunOutcome, EngineError> {
        warn!(run_id = %self.run_id, %error, "run failed");
        self.error = Some(error.to_string());
        self.checkpoint().await?;
        Ok(RunOutcome::Failed { error })
    }

    async fn checkpoint(&mut self) -> Result<(), EngineError> {
        let snapshot = Snapshot {
            superstep: self.superstep,
            ts: chrono::Utc::now(),
            channels: self.channels.clone(),
            completed: self.completed.clone(),
            skipped: self.skipped.clone(),
            cycle_iterations: self.cycle_iterations.clone(),
            active_cycle: self
                .active_cycle
                .map(|id| self.workflow.cycle(id).name.clone()),
            pending: self.pending.clone(),
            suspended_node: self.suspended_node.clone(),
            traces: std::mem::take(&mut self.traces),
            error: self.error.clone(),
        };
        self.store.save(self.run_id, &snapshot).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callable::{CallError, InProcessRegistry};
    use crate::checkpoint_sqlite::SqliteCheckpointStore;
    use crate::compiler::compile;
    use crate::parser::parse;

    fn compile_src(source: &str) -> Workflow {
        let ast = parse(source).unwrap();
        compile(&ast, "test", "hash").unwrap()
    }

    fn int_input(key: &str, value: i64) -> BTreeMap<String, Value> {
        BTreeMap::from([(key.to_string(), Value::Int(value))])
    }

    async fn run_once(
        workflow: &Workflow,
        registry: InProcessRegistry,
        inputs: BTreeMap<String, Value>,
    ) -> (RunOutcome, Uuid, SqliteCheckpointStore) {
        let store = SqliteCheckpointStore::open_in_memory().await.unwrap();
        let run_id = Uuid::new_v4();
        let mut engine = Engine::new(
            workflow,
            Arc::new(registry),
            &store,
            run_id,
            CancelFlag::new(),
            inputs,
        );
        let outcome = engine.run(None).await.unwrap();
        (outcome, run_id, store)
    }

    const LINEAR: &str = r#"
workflow linear_sum {
  inputs { int x; }
  outputs { int y = B.out; }
  node A {
    call add_one;
    inputs { int x = x; }
    outputs { int out; }
  }
  node B {
    call double;
    inputs { int value = A.out; }
    outputs { int out; }
  }
}
"#;

    fn linear_registry() -> InProcessRegistry {
        let mut registry = InProcessRegistry::new();
        registry.register_fn("add_one", |inputs, _| {
            let x = inputs.get("x").and_then(Value::as_i64).unwrap_or(0);
            Ok(BTreeMap::from([("out".to_string(), Value::Int(x + 1))]))
        });
        registry.register_fn("double", |inputs, _| {
            let v = inputs.get("value").and_then(Value::as_i64).unwrap_or(0);
            Ok(BTreeMap::from([("out".to_string(), Value::Int(v * 2))]))
        });
        registry
    }

    #[tokio::test]
    async fn test_linear_sum() {
        let workflow = compile_src(LINEAR);
        let (outcome, _, _) = run_once(&workflow, linear_registry(), int_input("x", 3)).await;
        let RunOutcome::Completed { result } = outcome else {
            panic!("expected completion, got {:?}", outcome);
        };
        assert_eq!(result.get("y"), Some(&Value::Int(8)));
    }

    #[tokio::test]
    async fn test_checkpoint_sequence_is_recorded() {
        let workflow = compile_src(LINEAR);
        let (_, run_id, store) =
            run_once(&workflow, linear_registry(), int_input("x", 3)).await;
        let snapshots = store.list(run_id).await.unwrap();
        // Initial snapshot plus one per superstep.
        assert!(snapshots.len() >= 3);
        assert_eq!(snapshots[0].superstep, 0);
        assert!(snapshots.last().unwrap().completed.contains("B"));
    }

    #[tokio::test]
    async fn test_branch_skipped_resolves_null() {
        let source = r#"
workflow branch {
  inputs { int x; }
  outputs { out = B.out; }
  node A {
    call probe;
    inputs { int x = x; }
    outputs { bool flag; }
  }
  node B {
    call double;
    inputs { int value = x; }
    outputs { int out; }
    when A.flag
  }
}
"#;
        let workflow = compile_src(source);
        let mut registry = InProcessRegistry::new();
        registry.register_fn("probe", |_, _| {
            Ok(BTreeMap::from([("flag".to_string(), Value::Bool(false))]))
        });
        registry.register_fn("double", |inputs, _| {
            let v = inputs.get("value").and_then(Value::as_i64).unwrap_or(0);
            Ok(BTreeMap::from([("out".to_string(), Value::Int(v * 2))]))
        });
        let (outcome, _, _) = run_once(&workflow, registry, int_input("x", 3)).await;
        let RunOutcome::Completed { result } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(result.get("out"), Some(&Value::Null));
    }

    const CYCLE_APPEND: &str = r#"
workflow collect {
  inputs { list items; }
  outputs { list gathered = C.collected; }
  cycle C {
    inputs { list pending = items; }
    outputs { list collected = Accumulate.items (append); }
    nodes {
      node Pick {
        call pick_next;
        inputs { list pending = C.pending; prior = Pick.index; }
        outputs { item; bool done; int index; }
      }
      node Accumulate {
        call accumulate;
        inputs { item = Pick.item; }
        outputs { list items; }
      }
    }
    guard !Pick.done
    max_iterations 10
  }
}
"#;

    fn cycle_registry() -> InProcessRegistry {
        let mut registry = InProcessRegistry::new();
        registry.register_fn("pick_next", |inputs, _| {
            let pending = inputs
                .get("pending")
                .and_then(Value::as_list)
                .cloned()
                .unwrap_or_default();
            let index = inputs.get("prior").and_then(Value::as_i64).unwrap_or(-1) + 1;
            let item = pending.get(index as usize).cloned().unwrap_or(Value::Null);
            let done = index as usize + 1 >= pending.len();
            Ok(BTreeMap::from([
                ("item".to_string(), item),
                ("done".to_string(), Value::Bool(done)),
                ("index".to_string(), Value::Int(index)),
            ]))
        });
        registry.register_fn("accumulate", |inputs, _| {
            let item = inputs.get("item").cloned().unwrap_or(Value::Null);
            Ok(BTreeMap::from([(
                "items".to_string(),
                Value::List(vec![item]),
            )]))
        });
        registry
    }

    #[tokio::test]
    async fn test_cycle_with_append() {
        let workflow = compile_src(CYCLE_APPEND);
        let inputs = BTreeMap::from([(
            "items".to_string(),
            Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
        )]);
        let (outcome, _, _) = run_once(&workflow, cycle_registry(), inputs).await;
        let RunOutcome::Completed { result } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(
            result.get("gathered"),
            Some(&Value::List(vec![
                Value::Int(1),
                Value::Int(2),
                Value::Int(3)
            ]))
        );
    }

    #[tokio::test]
    async fn test_cycle_max_iterations_is_hard_cap() {
        let source = r#"
workflow spin {
  inputs { int x; }
  outputs { int count = C.count; }
  cycle C {
    inputs { int seed = x; }
    outputs { int count = Tick.count; }
    nodes {
      node Tick {
        call tick;
        inputs { prior = Tick.count; seed = C.seed; }
        outputs { int count; }
      }
    }
    guard Tick.count < 1000
    max_iterations 5
  }
}
"#;
        let workflow = compile_src(source);
        let mut registry = InProcessRegistry::new();
        registry.register_fn("tick", |inputs, _| {
            let prior = inputs.get("prior").and_then(Value::as_i64).unwrap_or(0);
            Ok(BTreeMap::from([("count".to_string(), Value::Int(prior + 1))]))
        });
        let (outcome, _, _) = run_once(&workflow, registry, int_input("x", 0)).await;
        let RunOutcome::Completed { result } = outcome else {
            panic!("expected completion");
        };
        // Guard never falsifies; the cap bounds each internal node to 5 runs.
        assert_eq!(result.get("count"), Some(&Value::Int(5)));
    }

    const HITL: &str = r#"
workflow approval {
  inputs { text; }
  outputs { result = Act.done; }
  node Ask {
    call ask_user;
    inputs { text = text; }
    outputs { answer; }
    hitl { prompt: "Approve?" }
  }
  node Act {
    call act;
    inputs { answer = Ask.answer; }
    outputs { done; }
  }
}
"#;

    fn hitl_registry() -> InProcessRegistry {
        let mut registry = InProcessRegistry::new();
        registry.register_fn("ask_user", |inputs, _| {
            let answer = inputs.get("answer").cloned().unwrap_or(Value::Null);
            Ok(BTreeMap::from([("answer".to_string(), answer)]))
        });
        registry.register_fn("act", |inputs, _| {
            Ok(BTreeMap::from([(
                "done".to_string(),
                inputs.get("answer").cloned().unwrap_or(Value::Null),
            )]))
        });
        registry
    }

    #[tokio::test]
    async fn test_hitl_suspend_and_resume() {
        let workflow = compile_src(HITL);
        let store = SqliteCheckpointStore::open_in_memory().await.unwrap();
        let run_id = Uuid::new_v4();
        let inputs = BTreeMap::from([("text".to_string(), Value::String("hi".into()))]);

        let mut engine = Engine::new(
            &workflow,
            Arc::new(hitl_registry()),
            &store,
            run_id,
            CancelFlag::new(),
            inputs,
        );
        let outcome = engine.run(None).await.unwrap();
        let RunOutcome::Suspended { node, correlation } = outcome else {
            panic!("expected suspension, got {:?}", outcome);
        };
        assert_eq!(node, "Ask");
        assert_eq!(
            correlation.get("prompt"),
            Some(&Value::String("Approve?".into()))
        );

        // Continue from the checkpoint with the answer payload.
        let snapshot = store.load_latest(run_id).await.unwrap().unwrap();
        assert_eq!(snapshot.suspended_node.as_deref(), Some("Ask"));
        let mut engine = Engine::from_snapshot(
            &workflow,
            Arc::new(hitl_registry()),
            &store,
            run_id,
            CancelFlag::new(),
            snapshot,
        );
        let outcome = engine
            .run(Some(Value::String("ok".into())))
            .await
            .unwrap();
        let RunOutcome::Completed { result } = outcome else {
            panic!("expected completion, got {:?}", outcome);
        };
        assert_eq!(result.get("result"), Some(&Value::String("ok".into())));
    }

    #[tokio::test]
    async fn test_node_error_marks_failed_and_checkpoints() {
        let workflow = compile_src(LINEAR);
        let mut registry = InProcessRegistry::new();
        registry.register_fn("add_one", |_, _| {
            Err(CallError::new("ValueError", "cannot add"))
        });
        registry.register_fn("double", |_, _| Ok(BTreeMap::new()));
        let store = SqliteCheckpointStore::open_in_memory().await.unwrap();
        let run_id = Uuid::new_v4();
        let mut engine = Engine::new(
            &workflow,
            Arc::new(registry),
            &store,
            run_id,
            CancelFlag::new(),
            int_input("x", 1),
        );
        let outcome = engine.run(None).await.unwrap();
        let RunOutcome::Failed { error } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(error.node, "A");
        assert_eq!(error.kind, NodeErrorKind::CallFailed);
        let latest = store.load_latest(run_id).await.unwrap().unwrap();
        assert!(latest.error.as_deref().unwrap().contains("cannot add"));
    }

    #[tokio::test]
    async fn test_missing_callable() {
        let workflow = compile_src(LINEAR);
        let registry = InProcessRegistry::new();
        let (outcome, _, _) = run_once(&workflow, registry, int_input("x", 1)).await;
        let RunOutcome::Failed { error } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(error.kind, NodeErrorKind::MissingCallable);
    }

    #[tokio::test]
    async fn test_cancel_between_supersteps() {
        let workflow = compile_src(LINEAR);
        let store = SqliteCheckpointStore::open_in_memory().await.unwrap();
        let run_id = Uuid::new_v4();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let mut engine = Engine::new(
            &workflow,
            Arc::new(linear_registry()),
            &store,
            run_id,
            cancel,
            int_input("x", 1),
        );
        let outcome = engine.run(None).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Canceled));
        // Final checkpoint retained.
        assert!(store.load_latest(run_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_resume_equivalence_after_crash() {
        // Run to completion once, then replay from every checkpoint boundary
        // and verify the final result is identical.
        let workflow = compile_src(CYCLE_APPEND);
        let inputs = BTreeMap::from([(
            "items".to_string(),
            Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
        )]);
        let (outcome, run_id, store) =
            run_once(&workflow, cycle_registry(), inputs.clone()).await;
        let RunOutcome::Completed { result: expected } = outcome else {
            panic!("expected completion");
        };

        let snapshots = store.list(run_id).await.unwrap();
        assert!(snapshots.len() > 2);
        for snapshot in snapshots {
            let replay_store = SqliteCheckpointStore::open_in_memory().await.unwrap();
            let replay_id = Uuid::new_v4();
            let mut engine = Engine::from_snapshot(
                &workflow,
                Arc::new(cycle_registry()),
                &replay_store,
                replay_id,
                CancelFlag::new(),
                snapshot,
            );
            let outcome = engine.run(None).await.unwrap();
            let RunOutcome::Completed { result } = outcome else {
                panic!("expected completion on replay");
            };
            assert_eq!(result, expected);
        }
    }
}
