//! Syntax tree for parsed WIRL sources.
//!
//! AST nodes carry only names; the compiler resolves names to arena indices
//! when lowering to an executable graph. Nothing here is shared or cyclic.

use std::fmt;

/// A parsed `.wirl` file: exactly one workflow definition.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowAst {
    pub name: String,
    pub metadata: Vec<(String, Literal)>,
    pub inputs: Vec<InputDecl>,
    pub outputs: Vec<OutputDecl>,
    /// Nodes and cycles in source order.
    pub blocks: Vec<BlockDecl>,
}

/// Declared workflow input: optional documentary type + name.
#[derive(Debug, Clone, PartialEq)]
pub struct InputDecl {
    pub ty: Option<String>,
    pub name: String,
}

/// Output binding: `TYPE? NAME = EXPR`.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputDecl {
    pub ty: Option<String>,
    pub name: String,
    pub source: ValueExpr,
}

/// Declared output slot of a node: `TYPE? NAME;`.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSlot {
    pub ty: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlockDecl {
    Node(NodeDecl),
    Cycle(CycleDecl),
}

impl BlockDecl {
    pub fn name(&self) -> &str {
        match self {
            BlockDecl::Node(n) => &n.name,
            BlockDecl::Cycle(c) => &c.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeDecl {
    pub name: String,
    pub call_target: String,
    pub inputs: Vec<NodeInput>,
    pub outputs: Vec<OutputSlot>,
    pub consts: Vec<(String, Literal)>,
    pub when: Option<BoolExpr>,
    pub hitl: Option<HitlDecl>,
}

/// Node input binding: `TYPE? NAME = VEXPR`.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInput {
    pub ty: Option<String>,
    pub name: String,
    pub value: ValueExpr,
}

/// Marks a node as a human-in-the-loop suspension point. Fields are
/// correlation data surfaced with the suspend token.
#[derive(Debug, Clone, PartialEq)]
pub struct HitlDecl {
    pub fields: Vec<(String, Literal)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleDecl {
    pub name: String,
    pub inputs: Vec<NodeInput>,
    pub outputs: Vec<OutputDecl>,
    pub nodes: Vec<NodeDecl>,
    pub guard: BoolExpr,
    pub max_iterations: i64,
}

/// Value expression on the right-hand side of an input or output binding.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueExpr {
    /// Plain identifier, bound to a workflow input.
    Input(String),
    /// Dotted reference `Scope.output`, optionally reducer-tagged.
    Ref {
        scope: String,
        output: String,
        reducer: Option<ReducerKind>,
    },
    Literal(Literal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReducerKind {
    Replace,
    Append,
    Merge,
}

impl ReducerKind {
    pub fn name(&self) -> &'static str {
        match self {
            ReducerKind::Replace => "replace",
            ReducerKind::Append => "append",
            ReducerKind::Merge => "merge",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "replace" => Some(ReducerKind::Replace),
            "append" => Some(ReducerKind::Append),
            "merge" => Some(ReducerKind::Merge),
            _ => None,
        }
    }
}

impl fmt::Display for ReducerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Literal>),
    Object(Vec<(String, Literal)>),
}

/// Boolean expression used by `when` and `guard` clauses.
#[derive(Debug, Clone, PartialEq)]
pub enum BoolExpr {
    Or(Box<BoolExpr>, Box<BoolExpr>),
    And(Box<BoolExpr>, Box<BoolExpr>),
    Not(Box<BoolExpr>),
    Cmp {
        op: CmpOp,
        lhs: Operand,
        rhs: Operand,
    },
    /// Bare reference or literal in boolean position, tested for truthiness.
    Operand(Operand),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Gt => ">",
            CmpOp::Le => "<=",
            CmpOp::Ge => ">=",
        };
        f.write_str(op)
    }
}

/// Leaf of a boolean expression: a channel reference or a literal.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Reference {
        /// None for a plain identifier (workflow input); Some for `Scope.name`.
        scope: Option<String>,
        name: String,
    },
    Literal(Literal),
}

impl BoolExpr {
    /// Collect every channel reference appearing in the expression, as
    /// `(scope, name)` pairs with `scope = None` for plain identifiers.
    pub fn collect_refs<'a>(&'a self, out: &mut Vec<(Option<&'a str>, &'a str)>) {
        match self {
            BoolExpr::Or(lhs, rhs) | BoolExpr::And(lhs, rhs) => {
                lhs.collect_refs(out);
                rhs.collect_refs(out);
            }
            BoolExpr::Not(inner) => inner.collect_refs(out),
            BoolExpr::Cmp { lhs, rhs, .. } => {
                collect_operand_refs(lhs, out);
                collect_operand_refs(rhs, out);
            }
            BoolExpr::Operand(op) => collect_operand_refs(op, out),
        }
    }
}

fn collect_operand_refs<'a>(operand: &'a Operand, out: &mut Vec<(Option<&'a str>, &'a str)>) {
    if let Operand::Reference { scope, name } = operand {
        out.push((scope.as_deref(), name));
    }
}
