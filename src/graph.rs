//! Compiled workflow graph.
//!
//! The compiler lowers the AST into this arena representation: nodes live in
//! parallel arrays indexed by integer ids, references are resolved to channel
//! names, and execution order is precomputed. A compiled workflow is immutable
//! and shared between concurrent runs of the same template.

use std::collections::BTreeMap;

use crate::ast::{BoolExpr, ReducerKind};
use crate::value::Value;

pub type NodeId = usize;
pub type CycleId = usize;

/// One step of the workflow-level execution order: either a plain node or a
/// cycle super-node whose outputs become available after the cycle terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Node(NodeId),
    Cycle(CycleId),
}

/// Where a node input gets its value from.
#[derive(Debug, Clone)]
pub enum InputSource {
    /// A resolved channel name: a workflow input (`x`), a node output
    /// (`A.out`), or a cycle output (`C.items`).
    Channel(String),
    Literal(Value),
}

#[derive(Debug, Clone)]
pub struct CompiledInput {
    pub name: String,
    pub source: InputSource,
}

#[derive(Debug, Clone)]
pub struct CompiledNode {
    pub name: String,
    pub call_target: String,
    pub inputs: Vec<CompiledInput>,
    /// Declared output slot names; the node publishes channel `name.slot`.
    pub outputs: Vec<String>,
    pub consts: BTreeMap<String, Value>,
    pub when: Option<BoolExpr>,
    /// HITL correlation data; `Some` marks the node as a suspension point.
    pub hitl: Option<BTreeMap<String, Value>>,
    /// Channels this node reads, including `when` references.
    pub depends_on: Vec<String>,
    /// Owning cycle, None for workflow-level nodes.
    pub cycle: Option<CycleId>,
}

impl CompiledNode {
    /// Channel name published for a given output slot.
    pub fn output_channel(&self, slot: &str) -> String {
        format!("{}.{}", self.name, slot)
    }
}

#[derive(Debug, Clone)]
pub struct CycleOutput {
    pub name: String,
    /// Cycle-internal channel the output reads when the cycle terminates.
    pub internal_channel: String,
}

#[derive(Debug, Clone)]
pub struct CompiledCycle {
    pub name: String,
    /// Bound once at cycle entry; exposed internally as `CycleName.input`.
    pub inputs: Vec<CompiledInput>,
    pub outputs: Vec<CycleOutput>,
    /// Internal nodes in topological order (lexicographic tie-break).
    pub nodes: Vec<NodeId>,
    pub guard: BoolExpr,
    pub max_iterations: u32,
    /// Outer channels read by the cycle's input bindings.
    pub depends_on: Vec<String>,
}

impl CompiledCycle {
    pub fn output_channel(&self, name: &str) -> String {
        format!("{}.{}", self.name, name)
    }
}

/// Declared workflow input.
#[derive(Debug, Clone)]
pub struct WorkflowInput {
    pub name: String,
    pub ty: Option<String>,
}

/// Workflow-level output binding: exposes `channel` under `name` in the
/// final result.
#[derive(Debug, Clone)]
pub struct WorkflowOutput {
    pub name: String,
    pub channel: String,
}

/// A compiled, validated workflow. Identified by `(template_name, source_hash)`.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub template_name: String,
    pub source_hash: String,
    /// Workflow name as written in the source.
    pub name: String,
    pub inputs: Vec<WorkflowInput>,
    pub outputs: Vec<WorkflowOutput>,
    pub nodes: Vec<CompiledNode>,
    pub cycles: Vec<CompiledCycle>,
    /// Workflow-level execution order (topological, lexicographic tie-break).
    /// Cycle-internal nodes appear only in their cycle's `nodes` list.
    pub order: Vec<Step>,
    /// Declared reducer per channel; channels not present use `replace`.
    pub reducers: BTreeMap<String, ReducerKind>,
}

impl Workflow {
    pub fn node(&self, id: NodeId) -> &CompiledNode {
        &self.nodes[id]
    }

    pub fn cycle(&self, id: CycleId) -> &CompiledCycle {
        &self.cycles[id]
    }

    pub fn reducer_for(&self, channel: &str) -> ReducerKind {
        self.reducers
            .get(channel)
            .copied()
            .unwrap_or(ReducerKind::Replace)
    }

    /// Step name for progress tracking: node or cycle name.
    pub fn step_name(&self, step: Step) -> &str {
        match step {
            Step::Node(id) => &self.nodes[id].name,
            Step::Cycle(id) => &self.cycles[id].name,
        }
    }

    /// Find a workflow-level step by name.
    pub fn find_step(&self, name: &str) -> Option<Step> {
        self.order
            .iter()
            .copied()
            .find(|step| self.step_name(*step) == name)
    }

    /// True when the named channel is a declared workflow input.
    pub fn is_input_channel(&self, channel: &str) -> bool {
        self.inputs.iter().any(|input| input.name == channel)
    }
}
