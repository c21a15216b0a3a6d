//! Graph compiler: lowers a parsed workflow AST into an executable graph.
//!
//! Validation is single-pass in spirit but exhaustive in effect: every
//! violation found anywhere in the AST is collected and reported together,
//! each with its own error kind. A workflow only compiles when the error
//! list is empty.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use thiserror::Error;

use crate::ast::{
    BlockDecl, BoolExpr, CycleDecl, Literal, NodeDecl, ReducerKind, ValueExpr, WorkflowAst,
};
use crate::graph::{
    CompiledCycle, CompiledInput, CompiledNode, CycleOutput, InputSource, Step, Workflow,
    WorkflowInput, WorkflowOutput,
};
use crate::value::Value;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CompileError {
    #[error("duplicate name '{name}' in {scope}")]
    DuplicateName { name: String, scope: String },

    #[error("workflow declares no inputs")]
    MissingInputs,

    #[error("workflow declares no outputs")]
    MissingOutputs,

    #[error("no node input transitively depends on a workflow input")]
    DeadStartGraph,

    #[error("unresolved reference '{reference}' in {context}")]
    UnresolvedReference { reference: String, context: String },

    #[error("reference '{reference}' in {context} crosses a cycle boundary")]
    CrossCycleReference { reference: String, context: String },

    #[error("reference '{reference}' inside cycle '{cycle}' must use dotted notation")]
    NonDottedReferenceInCycle { reference: String, cycle: String },

    #[error("reducer tag on '{reference}' in {context} is not allowed there")]
    IllegalReducerPlacement { reference: String, context: String },

    #[error("channel '{channel}' carries conflicting reducer tags")]
    ReducerConflict { channel: String },

    #[error("workflow output '{name}' must reference a declared channel")]
    BadOutputSource { name: String },

    #[error("cycle '{cycle}' has max_iterations {value}; must be a positive integer")]
    InvalidMaxIterations { cycle: String, value: i64 },

    #[error("cycle '{cycle}' contains a dependency cycle among its nodes")]
    InternalCycle { cycle: String },

    #[error("workflow-level dependencies form a cycle")]
    CyclicDependency,
}

/// Compile a parsed workflow into an executable graph, reporting every
/// violation at once.
pub fn compile(
    ast: &WorkflowAst,
    template_name: &str,
    source_hash: &str,
) -> Result<Workflow, Vec<CompileError>> {
    Compiler::new(ast, template_name, source_hash).run()
}

pub fn literal_to_value(literal: &Literal) -> Value {
    match literal {
        Literal::Null => Value::Null,
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Int(i) => Value::Int(*i),
        Literal::Float(f) => Value::Float(*f),
        Literal::String(s) => Value::String(s.clone()),
        Literal::List(items) => Value::List(items.iter().map(literal_to_value).collect()),
        Literal::Object(entries) => Value::Map(
            entries
                .iter()
                .map(|(key, value)| (key.clone(), literal_to_value(value)))
                .collect(),
        ),
    }
}

struct Compiler<'a> {
    ast: &'a WorkflowAst,
    template_name: &'a str,
    source_hash: &'a str,
    errors: Vec<CompileError>,
    /// Workflow input names.
    input_names: HashSet<String>,
    /// Outer-scope step name -> declared output slots (cycles expose their
    /// declared outputs).
    outer_outputs: HashMap<String, HashSet<String>>,
    /// Step names that are cycles.
    cycle_names: HashSet<String>,
    /// All names that own channels anywhere (for cross-cycle diagnostics):
    /// name -> owning cycle name (None for outer scope).
    name_owner: HashMap<String, Option<String>>,
    reducers: BTreeMap<String, ReducerKind>,
}

impl<'a> Compiler<'a> {
    fn new(ast: &'a WorkflowAst, template_name: &'a str, source_hash: &'a str) -> Self {
        Self {
            ast,
            template_name,
            source_hash,
            errors: Vec::new(),
            input_names: HashSet::new(),
            outer_outputs: HashMap::new(),
            cycle_names: HashSet::new(),
            name_owner: HashMap::new(),
            reducers: BTreeMap::new(),
        }
    }

    fn run(mut self) -> Result<Workflow, Vec<CompileError>> {
        let ast = self.ast;
        self.index_names();
        self.check_shape();

        let mut nodes = Vec::new();
        let mut cycles = Vec::new();

        for block in &ast.blocks {
            match block {
                BlockDecl::Node(decl) => {
                    let compiled = self.compile_outer_node(decl);
                    nodes.push(compiled);
                }
                BlockDecl::Cycle(decl) => {
                    let cycle_id = cycles.len();
                    let compiled = self.compile_cycle(decl, cycle_id, &mut nodes);
                    cycles.push(compiled);
                }
            }
        }

        let outputs = self.compile_workflow_outputs();
        let order = self.order_steps(&nodes, &cycles);
        self.check_dead_start(&nodes, &cycles);

        if !self.errors.is_empty() {
            return Err(self.errors);
        }

        Ok(Workflow {
            template_name: self.template_name.to_string(),
            source_hash: self.source_hash.to_string(),
            name: ast.name.clone(),
            inputs: ast
                .inputs
                .iter()
                .map(|decl| WorkflowInput {
                    name: decl.name.clone(),
                    ty: decl.ty.clone(),
                })
                .collect(),
            outputs,
            nodes,
            cycles,
            order,
            reducers: self.reducers,
        })
    }

    // -------------------------------------------------------------------------
    // Name indexing and shape checks
    // -------------------------------------------------------------------------

    fn index_names(&mut self) {
        let ast = self.ast;
        let mut seen_inputs = HashSet::new();
        for input in &ast.inputs {
            if !seen_inputs.insert(input.name.clone()) {
                self.errors.push(CompileError::DuplicateName {
                    name: input.name.clone(),
                    scope: "workflow inputs".to_string(),
                });
            }
            self.input_names.insert(input.name.clone());
        }

        let mut seen_steps: HashSet<&str> = HashSet::new();
        for block in &ast.blocks {
            let name = block.name();
            if !seen_steps.insert(name) {
                self.errors.push(CompileError::DuplicateName {
                    name: name.to_string(),
                    scope: format!("workflow '{}'", ast.name),
                });
            }
            match block {
                BlockDecl::Node(decl) => {
                    self.index_node_outputs(decl, None);
                }
                BlockDecl::Cycle(decl) => {
                    self.cycle_names.insert(decl.name.clone());
                    self.name_owner.insert(decl.name.clone(), None);
                    let mut outputs = HashSet::new();
                    let mut seen_outputs = HashSet::new();
                    for output in &decl.outputs {
                        if !seen_outputs.insert(output.name.clone()) {
                            self.errors.push(CompileError::DuplicateName {
                                name: output.name.clone(),
                                scope: format!("cycle '{}' outputs", decl.name),
                            });
                        }
                        outputs.insert(output.name.clone());
                    }
                    self.outer_outputs.insert(decl.name.clone(), outputs);

                    let mut seen_internal: HashSet<&str> = HashSet::new();
                    for node in &decl.nodes {
                        if !seen_internal.insert(&node.name) {
                            self.errors.push(CompileError::DuplicateName {
                                name: node.name.clone(),
                                scope: format!("cycle '{}'", decl.name),
                            });
                        }
                        self.index_node_outputs(node, Some(&decl.name));
                    }
                }
            }
        }
    }

    fn index_node_outputs(&mut self, decl: &NodeDecl, cycle: Option<&str>) {
        // A node name that collides with one in another scope would alias its
        // channels, so uniqueness is enforced across the whole workflow.
        // Same-scope duplicates are reported by the per-scope checks.
        let owner = cycle.map(str::to_string);
        if let Some(previous_owner) = self.name_owner.insert(decl.name.clone(), owner.clone())
            && previous_owner != owner
        {
            self.errors.push(CompileError::DuplicateName {
                name: decl.name.clone(),
                scope: format!("workflow '{}'", self.ast.name),
            });
        }
        if cycle.is_none() {
            let mut outputs = HashSet::new();
            for slot in &decl.outputs {
                outputs.insert(slot.name.clone());
            }
            self.outer_outputs.insert(decl.name.clone(), outputs);
        }
        let mut seen = HashSet::new();
        for slot in &decl.outputs {
            if !seen.insert(slot.name.clone()) {
                self.errors.push(CompileError::DuplicateName {
                    name: slot.name.clone(),
                    scope: format!("node '{}' outputs", decl.name),
                });
            }
        }
        let mut seen_inputs = HashSet::new();
        for input in &decl.inputs {
            if !seen_inputs.insert(input.name.clone()) {
                self.errors.push(CompileError::DuplicateName {
                    name: input.name.clone(),
                    scope: format!("node '{}' inputs", decl.name),
                });
            }
        }
    }

    fn check_shape(&mut self) {
        if self.ast.inputs.is_empty() {
            self.errors.push(CompileError::MissingInputs);
        }
        if self.ast.outputs.is_empty() {
            self.errors.push(CompileError::MissingOutputs);
        }
    }

    // -------------------------------------------------------------------------
    // Reference resolution
    // -------------------------------------------------------------------------

    /// Resolve a value expression in the outer (workflow-level) scope.
    /// Returns the input source; errors are collected.
    fn resolve_outer_expr(&mut self, expr: &ValueExpr, context: &str) -> InputSource {
        match expr {
            ValueExpr::Input(name) => {
                if !self.input_names.contains(name) {
                    self.errors.push(CompileError::UnresolvedReference {
                        reference: name.clone(),
                        context: context.to_string(),
                    });
                }
                InputSource::Channel(name.clone())
            }
            ValueExpr::Ref {
                scope,
                output,
                reducer,
            } => {
                let reference = format!("{}.{}", scope, output);
                if reducer.is_some() {
                    self.errors.push(CompileError::IllegalReducerPlacement {
                        reference: reference.clone(),
                        context: context.to_string(),
                    });
                }
                self.check_outer_ref(scope, output, &reference, context);
                InputSource::Channel(reference)
            }
            ValueExpr::Literal(literal) => InputSource::Literal(literal_to_value(literal)),
        }
    }

    fn check_outer_ref(&mut self, scope: &str, output: &str, reference: &str, context: &str) {
        match self.outer_outputs.get(scope) {
            Some(outputs) => {
                if !outputs.contains(output) {
                    self.errors.push(CompileError::UnresolvedReference {
                        reference: reference.to_string(),
                        context: context.to_string(),
                    });
                }
            }
            None => {
                // Reads of cycle-internal channels from the outer scope cross
                // the cycle boundary.
                if matches!(self.name_owner.get(scope), Some(Some(_))) {
                    self.errors.push(CompileError::CrossCycleReference {
                        reference: reference.to_string(),
                        context: context.to_string(),
                    });
                } else {
                    self.errors.push(CompileError::UnresolvedReference {
                        reference: reference.to_string(),
                        context: context.to_string(),
                    });
                }
            }
        }
    }

    /// Resolve a value expression inside a cycle. Every reference must be
    /// dotted and resolve to the cycle's own inputs or a sibling node.
    /// Reducer tags are legal only on sibling-node channels, the channels
    /// reduced across iterations.
    fn resolve_cycle_expr(
        &mut self,
        expr: &ValueExpr,
        cycle: &CycleDecl,
        context: &str,
    ) -> InputSource {
        match expr {
            ValueExpr::Input(name) => {
                self.errors.push(CompileError::NonDottedReferenceInCycle {
                    reference: name.clone(),
                    cycle: cycle.name.clone(),
                });
                InputSource::Channel(name.clone())
            }
            ValueExpr::Ref {
                scope,
                output,
                reducer,
            } => {
                let reference = format!("{}.{}", scope, output);
                let resolved = self.check_cycle_ref(cycle, scope, output, &reference, context);
                if let Some(kind) = reducer {
                    self.apply_reducer_tag(&reference, context, *kind, resolved);
                }
                InputSource::Channel(reference)
            }
            ValueExpr::Literal(literal) => InputSource::Literal(literal_to_value(literal)),
        }
    }

    /// Check a dotted reference inside a cycle; returns whether it resolved
    /// to a sibling node's output (as opposed to a cycle input).
    fn check_cycle_ref(
        &mut self,
        cycle: &CycleDecl,
        scope: &str,
        output: &str,
        reference: &str,
        context: &str,
    ) -> ResolvedCycleRef {
        if scope == cycle.name {
            if cycle.inputs.iter().any(|input| input.name == output) {
                return ResolvedCycleRef::CycleInput;
            }
            self.errors.push(CompileError::UnresolvedReference {
                reference: reference.to_string(),
                context: context.to_string(),
            });
            return ResolvedCycleRef::Invalid;
        }
        if let Some(node) = cycle.nodes.iter().find(|node| node.name == scope) {
            if node.outputs.iter().any(|slot| slot.name == output) {
                return ResolvedCycleRef::Sibling;
            }
            self.errors.push(CompileError::UnresolvedReference {
                reference: reference.to_string(),
                context: context.to_string(),
            });
            return ResolvedCycleRef::Invalid;
        }
        // Anything defined outside this cycle is out of reach.
        if self.name_owner.contains_key(scope) || self.input_names.contains(scope) {
            self.errors.push(CompileError::CrossCycleReference {
                reference: reference.to_string(),
                context: context.to_string(),
            });
        } else {
            self.errors.push(CompileError::UnresolvedReference {
                reference: reference.to_string(),
                context: context.to_string(),
            });
        }
        ResolvedCycleRef::Invalid
    }

    fn apply_reducer_tag(
        &mut self,
        reference: &str,
        context: &str,
        kind: ReducerKind,
        resolved: ResolvedCycleRef,
    ) {
        if resolved != ResolvedCycleRef::Sibling {
            self.errors.push(CompileError::IllegalReducerPlacement {
                reference: reference.to_string(),
                context: context.to_string(),
            });
            return;
        }
        match self.reducers.get(reference) {
            Some(existing) if *existing != kind => {
                self.errors.push(CompileError::ReducerConflict {
                    channel: reference.to_string(),
                });
            }
            _ => {
                self.reducers.insert(reference.to_string(), kind);
            }
        }
    }

    fn check_outer_when(&mut self, expr: &BoolExpr, context: &str) -> Vec<String> {
        let mut refs = Vec::new();
        expr.collect_refs(&mut refs);
        let mut channels = Vec::new();
        for (scope, name) in refs {
            match scope {
                None => {
                    if !self.input_names.contains(name) {
                        self.errors.push(CompileError::UnresolvedReference {
                            reference: name.to_string(),
                            context: context.to_string(),
                        });
                    }
                    channels.push(name.to_string());
                }
                Some(scope) => {
                    let reference = format!("{}.{}", scope, name);
                    self.check_outer_ref(scope, name, &reference, context);
                    channels.push(reference);
                }
            }
        }
        channels
    }

    fn check_cycle_bool_expr(
        &mut self,
        expr: &BoolExpr,
        cycle: &CycleDecl,
        context: &str,
    ) -> Vec<String> {
        let mut refs = Vec::new();
        expr.collect_refs(&mut refs);
        let mut channels = Vec::new();
        for (scope, name) in refs {
            match scope {
                None => {
                    self.errors.push(CompileError::NonDottedReferenceInCycle {
                        reference: name.to_string(),
                        cycle: cycle.name.clone(),
                    });
                    channels.push(name.to_string());
                }
                Some(scope) => {
                    let reference = format!("{}.{}", scope, name);
                    self.check_cycle_ref(cycle, scope, name, &reference, context);
                    channels.push(reference);
                }
            }
        }
        channels
    }

    // -------------------------------------------------------------------------
    // Lowering
    // -------------------------------------------------------------------------

    fn compile_outer_node(&mut self, decl: &NodeDecl) -> CompiledNode {
        let context = format!("node '{}'", decl.name);
        let mut depends = BTreeSet::new();
        let inputs = decl
            .inputs
            .iter()
            .map(|input| {
                let source = self.resolve_outer_expr(&input.value, &context);
                if let InputSource::Channel(channel) = &source {
                    depends.insert(channel.clone());
                }
                CompiledInput {
                    name: input.name.clone(),
                    source,
                }
            })
            .collect();

        if let Some(when) = &decl.when {
            for channel in self.check_outer_when(when, &context) {
                depends.insert(channel);
            }
        }

        self.build_node(decl, inputs, depends, None)
    }

    fn compile_cycle_node(
        &mut self,
        decl: &NodeDecl,
        cycle: &CycleDecl,
        cycle_id: usize,
    ) -> CompiledNode {
        let context = format!("node '{}' in cycle '{}'", decl.name, cycle.name);
        let mut depends = BTreeSet::new();
        let inputs = decl
            .inputs
            .iter()
            .map(|input| {
                let source = self.resolve_cycle_expr(&input.value, cycle, &context);
                if let InputSource::Channel(channel) = &source {
                    depends.insert(channel.clone());
                }
                CompiledInput {
                    name: input.name.clone(),
                    source,
                }
            })
            .collect();

        if let Some(when) = &decl.when {
            for channel in self.check_cycle_bool_expr(when, cycle, &context) {
                depends.insert(channel);
            }
        }

        self.build_node(decl, inputs, depends, Some(cycle_id))
    }

    fn build_node(
        &mut self,
        decl: &NodeDecl,
        inputs: Vec<CompiledInput>,
        depends: BTreeSet<String>,
        cycle: Option<usize>,
    ) -> CompiledNode {
        let consts = decl
            .consts
            .iter()
            .map(|(key, literal)| (key.clone(), literal_to_value(literal)))
            .collect();
        let hitl = decl.hitl.as_ref().map(|hitl| {
            hitl.fields
                .iter()
                .map(|(key, literal)| (key.clone(), literal_to_value(literal)))
                .collect()
        });

        CompiledNode {
            name: decl.name.clone(),
            call_target: decl.call_target.clone(),
            inputs,
            outputs: decl.outputs.iter().map(|slot| slot.name.clone()).collect(),
            consts,
            when: decl.when.clone(),
            hitl,
            depends_on: depends.into_iter().collect(),
            cycle,
        }
    }

    fn compile_cycle(
        &mut self,
        decl: &CycleDecl,
        cycle_id: usize,
        nodes: &mut Vec<CompiledNode>,
    ) -> CompiledCycle {
        let context = format!("cycle '{}'", decl.name);

        if decl.max_iterations < 1 {
            self.errors.push(CompileError::InvalidMaxIterations {
                cycle: decl.name.clone(),
                value: decl.max_iterations,
            });
        }

        // Cycle inputs bind against the outer scope.
        let mut depends = BTreeSet::new();
        let inputs = decl
            .inputs
            .iter()
            .map(|input| {
                let source = self.resolve_outer_expr(&input.value, &context);
                if let InputSource::Channel(channel) = &source {
                    depends.insert(channel.clone());
                }
                CompiledInput {
                    name: input.name.clone(),
                    source,
                }
            })
            .collect();

        // Internal nodes.
        let mut internal_ids = Vec::new();
        for node_decl in &decl.nodes {
            let compiled = self.compile_cycle_node(node_decl, decl, cycle_id);
            internal_ids.push(nodes.len());
            nodes.push(compiled);
        }

        // Guard references cycle-internal channels.
        self.check_cycle_bool_expr(&decl.guard, decl, &format!("guard of {}", context));

        // Declared cycle outputs read internal channels; reducer tags are
        // legal here.
        let outputs = decl
            .outputs
            .iter()
            .map(|output| {
                let source =
                    self.resolve_cycle_expr(&output.source, decl, &format!("outputs of {}", context));
                let internal_channel = match source {
                    InputSource::Channel(channel) => channel,
                    InputSource::Literal(_) => {
                        self.errors.push(CompileError::BadOutputSource {
                            name: format!("{}.{}", decl.name, output.name),
                        });
                        String::new()
                    }
                };
                CycleOutput {
                    name: output.name.clone(),
                    internal_channel,
                }
            })
            .collect();

        let ordered = self.order_cycle_nodes(decl, &internal_ids, nodes);

        CompiledCycle {
            name: decl.name.clone(),
            inputs,
            outputs,
            nodes: ordered,
            guard: decl.guard.clone(),
            max_iterations: decl.max_iterations.max(1) as u32,
            depends_on: depends.into_iter().collect(),
        }
    }

    fn compile_workflow_outputs(&mut self) -> Vec<WorkflowOutput> {
        let ast = self.ast;
        let mut seen = HashSet::new();
        let mut outputs = Vec::new();
        for decl in &ast.outputs {
            if !seen.insert(decl.name.clone()) {
                self.errors.push(CompileError::DuplicateName {
                    name: decl.name.clone(),
                    scope: "workflow outputs".to_string(),
                });
            }
            let context = format!("workflow output '{}'", decl.name);
            let channel = match &decl.source {
                ValueExpr::Literal(_) => {
                    self.errors.push(CompileError::BadOutputSource {
                        name: decl.name.clone(),
                    });
                    String::new()
                }
                expr => match self.resolve_outer_expr(expr, &context) {
                    InputSource::Channel(channel) => channel,
                    InputSource::Literal(_) => unreachable!("literal handled above"),
                },
            };
            outputs.push(WorkflowOutput {
                name: decl.name.clone(),
                channel,
            });
        }
        outputs
    }

    // -------------------------------------------------------------------------
    // Ordering
    // -------------------------------------------------------------------------

    /// Topologically order the workflow-level steps. Among ready steps the
    /// lexicographically smallest name runs first, which makes execution
    /// order deterministic.
    fn order_steps(&mut self, nodes: &[CompiledNode], cycles: &[CompiledCycle]) -> Vec<Step> {
        // Channel prefix ("A" of "A.out") -> producing step name; workflow
        // inputs have no producer.
        let mut steps: BTreeMap<&str, Step> = BTreeMap::new();
        for (id, node) in nodes.iter().enumerate() {
            if node.cycle.is_none() {
                steps.insert(&node.name, Step::Node(id));
            }
        }
        for (id, cycle) in cycles.iter().enumerate() {
            steps.insert(&cycle.name, Step::Cycle(id));
        }

        let mut remaining: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (name, step) in &steps {
            let deps: &[String] = match *step {
                Step::Node(id) => &nodes[id].depends_on,
                Step::Cycle(id) => &cycles[id].depends_on,
            };
            let mut upstream = Vec::new();
            for channel in deps {
                let producer = channel.split('.').next().unwrap_or(channel);
                if steps.contains_key(producer) && producer != *name {
                    upstream.push(producer);
                }
            }
            remaining.insert(*name, upstream);
        }

        let mut order = Vec::new();
        let mut done: HashSet<&str> = HashSet::new();
        while order.len() < steps.len() {
            let next = remaining
                .iter()
                .filter(|(name, _)| !done.contains(*name))
                .find(|(_, upstream)| upstream.iter().all(|dep| done.contains(dep)))
                .map(|(name, _)| *name);
            let Some(name) = next else {
                self.errors.push(CompileError::CyclicDependency);
                break;
            };
            done.insert(name);
            order.push(steps[name]);
        }
        order
    }

    /// Topologically order the nodes inside one cycle. Self-references (a
    /// node reading its own channel from the previous iteration) are not
    /// ordering edges.
    fn order_cycle_nodes(
        &mut self,
        decl: &CycleDecl,
        internal_ids: &[usize],
        nodes: &[CompiledNode],
    ) -> Vec<usize> {
        let by_name: BTreeMap<&str, usize> = internal_ids
            .iter()
            .map(|&id| (nodes[id].name.as_str(), id))
            .collect();

        let mut remaining: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (&name, &id) in &by_name {
            let mut upstream = Vec::new();
            for channel in &nodes[id].depends_on {
                let producer = channel.split('.').next().unwrap_or(channel);
                if producer != name && by_name.contains_key(producer) {
                    upstream.push(producer);
                }
            }
            remaining.insert(name, upstream);
        }

        let mut order = Vec::new();
        let mut done: HashSet<&str> = HashSet::new();
        while order.len() < by_name.len() {
            let next = remaining
                .iter()
                .filter(|(name, _)| !done.contains(*name))
                .find(|(_, upstream)| upstream.iter().all(|dep| done.contains(dep)))
                .map(|(name, _)| *name);
            let Some(name) = next else {
                self.errors.push(CompileError::InternalCycle {
                    cycle: decl.name.clone(),
                });
                // Fall back to declaration order so later passes can proceed.
                return internal_ids.to_vec();
            };
            done.insert(name);
            order.push(by_name[name]);
        }
        order
    }

    // -------------------------------------------------------------------------
    // Reachability
    // -------------------------------------------------------------------------

    /// At least one node input must transitively depend on a workflow input,
    /// otherwise the graph can never start.
    fn check_dead_start(&mut self, nodes: &[CompiledNode], cycles: &[CompiledCycle]) {
        let mut tainted: HashSet<String> = self.input_names.iter().cloned().collect();
        let mut any_node_tainted = false;

        // Propagate taint to a fixpoint; graphs are small.
        loop {
            let mut changed = false;
            for node in nodes {
                let reads_tainted = node
                    .depends_on
                    .iter()
                    .any(|channel| tainted.contains(channel));
                if reads_tainted {
                    any_node_tainted = true;
                    for slot in &node.outputs {
                        changed |= tainted.insert(node.output_channel(slot));
                    }
                }
            }
            for cycle in cycles {
                for input in &cycle.inputs {
                    if let InputSource::Channel(channel) = &input.source
                        && tainted.contains(channel)
                    {
                        changed |= tainted.insert(format!("{}.{}", cycle.name, input.name));
                    }
                }
                for output in &cycle.outputs {
                    if tainted.contains(&output.internal_channel) {
                        changed |= tainted.insert(cycle.output_channel(&output.name));
                    }
                }
            }
            if !changed {
                break;
            }
        }

        if !any_node_tainted {
            self.errors.push(CompileError::DeadStartGraph);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResolvedCycleRef {
    CycleInput,
    Sibling,
    Invalid,
}
