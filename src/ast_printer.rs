//! AST pretty printer - converts a parsed workflow back to canonical source.
//!
//! The printer emits the canonical WIRL form: parse → print → parse is
//! structurally identical for every valid source, which the round-trip
//! tests rely on.

use crate::ast::{
    BlockDecl, BoolExpr, CycleDecl, InputDecl, Literal, NodeDecl, NodeInput, Operand, OutputDecl,
    OutputSlot, ValueExpr, WorkflowAst,
};

/// Print a workflow AST as canonical WIRL source.
pub fn print_workflow(ast: &WorkflowAst) -> String {
    AstPrinter::new().print_workflow(ast)
}

/// Pretty printer for WIRL ASTs.
pub struct AstPrinter {
    indent_level: usize,
    indent_str: String,
}

impl Default for AstPrinter {
    fn default() -> Self {
        Self::new()
    }
}

impl AstPrinter {
    /// Create a printer with the default 2-space indent.
    pub fn new() -> Self {
        Self {
            indent_level: 0,
            indent_str: "  ".to_string(),
        }
    }

    fn indent(&self) -> String {
        self.indent_str.repeat(self.indent_level)
    }

    pub fn print_workflow(&mut self, ast: &WorkflowAst) -> String {
        let mut out = String::new();
        out.push_str(&format!("workflow {} {{\n", ast.name));
        self.indent_level += 1;

        if !ast.metadata.is_empty() {
            out.push_str(&format!(
                "{}metadata {}\n",
                self.indent(),
                print_entries(&ast.metadata)
            ));
        }

        out.push_str(&format!("{}inputs {{", self.indent()));
        if ast.inputs.is_empty() {
            out.push_str("}\n");
        } else {
            out.push('\n');
            self.indent_level += 1;
            for input in &ast.inputs {
                out.push_str(&format!("{}{};\n", self.indent(), print_typed_name(&input.ty, &input.name)));
            }
            self.indent_level -= 1;
            out.push_str(&format!("{}}}\n", self.indent()));
        }

        out.push_str(&self.print_output_decls(&ast.outputs));

        for block in &ast.blocks {
            out.push('\n');
            match block {
                BlockDecl::Node(node) => out.push_str(&self.print_node(node)),
                BlockDecl::Cycle(cycle) => out.push_str(&self.print_cycle(cycle)),
            }
        }

        self.indent_level -= 1;
        out.push_str("}\n");
        out
    }

    fn print_output_decls(&mut self, outputs: &[OutputDecl]) -> String {
        let mut out = format!("{}outputs {{", self.indent());
        if outputs.is_empty() {
            out.push_str("}\n");
            return out;
        }
        out.push('\n');
        self.indent_level += 1;
        for decl in outputs {
            out.push_str(&format!(
                "{}{} = {};\n",
                self.indent(),
                print_typed_name(&decl.ty, &decl.name),
                print_value_expr(&decl.source)
            ));
        }
        self.indent_level -= 1;
        out.push_str(&format!("{}}}\n", self.indent()));
        out
    }

    fn print_node_inputs(&mut self, inputs: &[NodeInput]) -> String {
        let mut out = format!("{}inputs {{", self.indent());
        if inputs.is_empty() {
            out.push_str("}\n");
            return out;
        }
        out.push('\n');
        self.indent_level += 1;
        for input in inputs {
            out.push_str(&format!(
                "{}{} = {};\n",
                self.indent(),
                print_typed_name(&input.ty, &input.name),
                print_value_expr(&input.value)
            ));
        }
        self.indent_level -= 1;
        out.push_str(&format!("{}}}\n", self.indent()));
        out
    }

    fn print_output_slots(&mut self, slots: &[OutputSlot]) -> String {
        let mut out = format!("{}outputs {{", self.indent());
        if slots.is_empty() {
            out.push_str("}\n");
            return out;
        }
        out.push('\n');
        self.indent_level += 1;
        for slot in slots {
            out.push_str(&format!("{}{};\n", self.indent(), print_typed_name(&slot.ty, &slot.name)));
        }
        self.indent_level -= 1;
        out.push_str(&format!("{}}}\n", self.indent()));
        out
    }

    fn print_node(&mut self, node: &NodeDecl) -> String {
        let mut out = format!("{}node {} {{\n", self.indent(), node.name);
        self.indent_level += 1;

        out.push_str(&format!("{}call {};\n", self.indent(), node.call_target));
        out.push_str(&self.print_node_inputs(&node.inputs));
        out.push_str(&self.print_output_slots(&node.outputs));

        if !node.consts.is_empty() {
            out.push_str(&format!(
                "{}const {}\n",
                self.indent(),
                print_entries(&node.consts)
            ));
        }
        if let Some(when) = &node.when {
            out.push_str(&format!("{}when {}\n", self.indent(), print_bool_expr(when)));
        }
        if let Some(hitl) = &node.hitl {
            if hitl.fields.is_empty() {
                out.push_str(&format!("{}hitl {{}}\n", self.indent()));
            } else {
                out.push_str(&format!(
                    "{}hitl {}\n",
                    self.indent(),
                    print_entries(&hitl.fields)
                ));
            }
        }

        self.indent_level -= 1;
        out.push_str(&format!("{}}}\n", self.indent()));
        out
    }

    fn print_cycle(&mut self, cycle: &CycleDecl) -> String {
        let mut out = format!("{}cycle {} {{\n", self.indent(), cycle.name);
        self.indent_level += 1;

        out.push_str(&self.print_node_inputs(&cycle.inputs));
        out.push_str(&self.print_output_decls(&cycle.outputs));

        out.push_str(&format!("{}nodes {{\n", self.indent()));
        self.indent_level += 1;
        for (i, node) in cycle.nodes.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push_str(&self.print_node(node));
        }
        self.indent_level -= 1;
        out.push_str(&format!("{}}}\n", self.indent()));

        out.push_str(&format!(
            "{}guard {}\n",
            self.indent(),
            print_bool_expr(&cycle.guard)
        ));
        out.push_str(&format!(
            "{}max_iterations {}\n",
            self.indent(),
            cycle.max_iterations
        ));

        self.indent_level -= 1;
        out.push_str(&format!("{}}}\n", self.indent()));
        out
    }
}

fn print_typed_name(ty: &Option<String>, name: &str) -> String {
    match ty {
        Some(ty) => format!("{} {}", ty, name),
        None => name.to_string(),
    }
}

fn print_value_expr(expr: &ValueExpr) -> String {
    match expr {
        ValueExpr::Input(name) => name.clone(),
        ValueExpr::Ref {
            scope,
            output,
            reducer,
        } => match reducer {
            Some(kind) => format!("{}.{} ({})", scope, output, kind.name()),
            None => format!("{}.{}", scope, output),
        },
        ValueExpr::Literal(lit) => print_literal(lit),
    }
}

fn print_literal(lit: &Literal) -> String {
    match lit {
        Literal::Null => "null".to_string(),
        Literal::Bool(true) => "true".to_string(),
        Literal::Bool(false) => "false".to_string(),
        Literal::Int(i) => i.to_string(),
        Literal::Float(f) => format!("{:?}", f),
        Literal::String(s) => print_string(s),
        Literal::List(items) => {
            let inner: Vec<String> = items.iter().map(print_literal).collect();
            format!("[{}]", inner.join(", "))
        }
        Literal::Object(entries) => print_entries(entries),
    }
}

fn print_entries(entries: &[(String, Literal)]) -> String {
    if entries.is_empty() {
        return "{}".to_string();
    }
    let inner: Vec<String> = entries
        .iter()
        .map(|(key, value)| format!("{}: {}", print_key(key), print_literal(value)))
        .collect();
    format!("{{ {} }}", inner.join(", "))
}

fn is_plain_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// Keywords would re-lex as keyword tokens, so they must be quoted as keys.
const KEYWORDS: &[&str] = &[
    "workflow",
    "node",
    "cycle",
    "nodes",
    "inputs",
    "outputs",
    "metadata",
    "call",
    "const",
    "when",
    "guard",
    "hitl",
    "max_iterations",
    "true",
    "false",
    "null",
];

fn print_key(key: &str) -> String {
    if is_plain_ident(key) && !KEYWORDS.contains(&key) {
        key.to_string()
    } else {
        print_string(key)
    }
}

fn print_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{{{:x}}}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Boolean expression precedence for minimal parenthesization.
/// `||` < `&&` < `!` < comparison/operand.
fn bool_prec(expr: &BoolExpr) -> u8 {
    match expr {
        BoolExpr::Or(_, _) => 1,
        BoolExpr::And(_, _) => 2,
        BoolExpr::Not(_) => 3,
        BoolExpr::Cmp { .. } | BoolExpr::Operand(_) => 4,
    }
}

pub fn print_bool_expr(expr: &BoolExpr) -> String {
    print_bool_prec(expr, 1)
}

fn print_bool_prec(expr: &BoolExpr, min_prec: u8) -> String {
    let printed = match expr {
        BoolExpr::Or(lhs, rhs) => format!(
            "{} || {}",
            print_bool_prec(lhs, 1),
            print_bool_prec(rhs, 2)
        ),
        BoolExpr::And(lhs, rhs) => format!(
            "{} && {}",
            print_bool_prec(lhs, 2),
            print_bool_prec(rhs, 3)
        ),
        BoolExpr::Not(inner) => format!("!{}", print_bool_prec(inner, 3)),
        BoolExpr::Cmp { op, lhs, rhs } => {
            format!("{} {} {}", print_operand(lhs), op, print_operand(rhs))
        }
        BoolExpr::Operand(operand) => print_operand(operand),
    };
    if bool_prec(expr) < min_prec {
        format!("({})", printed)
    } else {
        printed
    }
}

fn print_operand(operand: &Operand) -> String {
    match operand {
        Operand::Reference { scope, name } => match scope {
            Some(scope) => format!("{}.{}", scope, name),
            None => name.clone(),
        },
        Operand::Literal(lit) => print_literal(lit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn round_trip(source: &str) {
        let first = parse(source).unwrap();
        let printed = print_workflow(&first);
        let second = parse(&printed).unwrap_or_else(|err| {
            panic!("re-parse failed: {}\nprinted source:\n{}", err, printed)
        });
        assert_eq!(first, second, "printed source:\n{}", printed);
    }

    #[test]
    fn test_round_trip_linear() {
        round_trip(
            r#"
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
"#,
        );
    }

    #[test]
    fn test_round_trip_cycle_and_hitl() {
        round_trip(
            r#"
workflow review {
  metadata { owner: "data", "strange key": 1 }
  inputs { list docs; str reviewer; }
  outputs { list approved = Gate.kept; }
  cycle Scan {
    inputs { list pending = docs; }
    outputs { list seen = Check.seen (append); }
    nodes {
      node Check {
        call check_doc;
        inputs { list pending = Scan.pending; }
        outputs { seen; bool done; }
        const { strict: true }
      }
    }
    guard !Check.done && Check.seen != null
    max_iterations 25
  }
  node Gate {
    call gate;
    inputs { list seen = Scan.seen; reviewer = reviewer; }
    outputs { list kept; }
    when Scan.seen
    hitl { prompt: "Keep these?", channel: "review" }
  }
}
"#,
        );
    }

    #[test]
    fn test_round_trip_literals() {
        round_trip(
            r#"
workflow lits {
  inputs { x; }
  outputs { y = A.out; }
  node A {
    call f;
    inputs { x = x; }
    outputs { out; }
    const { a: -3, b: 2.5, c: "s\n\"q\"", d: [1, [2], {}], e: { k: null }, "max_iterations": 1 }
  }
}
"#,
        );
    }

    #[test]
    fn test_bool_expr_parens_minimal() {
        let mut parser = crate::parser::Parser::new("!(A.x || B.y) && C.z == 1").unwrap();
        let expr = parser.parse_bool_expr().unwrap();
        assert_eq!(print_bool_expr(&expr), "!(A.x || B.y) && C.z == 1");
    }
}
