//! Recursive descent parser for the WIRL workflow language.
//!
//! Parses a token stream from the lexer into the AST in `crate::ast`. The
//! grammar is LL(1): one token of lookahead decides every production, so
//! there is no backtracking and errors point at the exact offending token.

use std::fmt;

use crate::ast::{
    BlockDecl, BoolExpr, CmpOp, CycleDecl, HitlDecl, InputDecl, Literal, NodeDecl, NodeInput,
    Operand, OutputDecl, OutputSlot, ReducerKind, ValueExpr, WorkflowAst,
};
use crate::lexer::{LexerError, Span, SpannedToken, Token, lex};

/// Parse error with 1-based line/column location.
#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
    pub line: u32,
    pub col: u32,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parse error at {}:{}: {}", self.line, self.col, self.message)
    }
}

impl std::error::Error for ParseError {}

/// Parse WIRL source into a workflow AST.
pub fn parse(source: &str) -> Result<WorkflowAst, ParseError> {
    Parser::new(source)?.parse_workflow()
}

/// Parser state
pub struct Parser<'source> {
    source: &'source str,
    tokens: Vec<SpannedToken>,
    pos: usize,
}

impl<'source> Parser<'source> {
    pub fn new(source: &'source str) -> Result<Self, ParseError> {
        let tokens = lex(source).map_err(|err| lexer_error(source, err))?;
        Ok(Self {
            source,
            tokens,
            pos: 0,
        })
    }

    // -------------------------------------------------------------------------
    // Token navigation
    // -------------------------------------------------------------------------

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].token
    }

    fn peek_span(&self) -> Span {
        self.tokens[self.pos.min(self.tokens.len() - 1)].span
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn check(&self, token: &Token) -> bool {
        std::mem::discriminant(self.peek()) == std::mem::discriminant(token)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<Token, ParseError> {
        if self.check(expected) {
            Ok(self.advance())
        } else {
            Err(self.error(format!("expected {}, found {}", expected, self.peek())))
        }
    }

    fn expect_ident(&mut self) -> Result<String, ParseError> {
        match self.peek() {
            Token::Ident(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            other => Err(self.error(format!("expected identifier, found {}", other))),
        }
    }

    fn expect_int(&mut self) -> Result<i64, ParseError> {
        match self.peek() {
            Token::Int(value) => {
                let value = *value;
                self.advance();
                Ok(value)
            }
            other => Err(self.error(format!("expected integer, found {}", other))),
        }
    }

    fn error(&self, message: String) -> ParseError {
        let (line, col) = offset_to_line_col(self.source, self.peek_span().start);
        ParseError { message, line, col }
    }

    // -------------------------------------------------------------------------
    // Top-level parsing
    // -------------------------------------------------------------------------

    /// Parse a complete workflow definition. Trailing input is rejected.
    pub fn parse_workflow(&mut self) -> Result<WorkflowAst, ParseError> {
        self.expect(&Token::Workflow)?;
        let name = self.expect_ident()?;
        self.expect(&Token::LBrace)?;

        let metadata = if self.check(&Token::Metadata) {
            self.advance();
            self.parse_literal_entries()?
        } else {
            Vec::new()
        };

        self.expect(&Token::Inputs)?;
        let inputs = self.parse_input_decls()?;

        self.expect(&Token::Outputs)?;
        let outputs = self.parse_output_decls()?;

        let mut blocks = Vec::new();
        loop {
            match self.peek() {
                Token::Node => blocks.push(BlockDecl::Node(self.parse_node()?)),
                Token::Cycle => blocks.push(BlockDecl::Cycle(self.parse_cycle()?)),
                _ => break,
            }
        }

        self.expect(&Token::RBrace)?;
        if !self.check(&Token::Eof) {
            return Err(self.error(format!(
                "expected end of file after workflow, found {}",
                self.peek()
            )));
        }

        Ok(WorkflowAst {
            name,
            metadata,
            inputs,
            outputs,
            blocks,
        })
    }

    fn parse_node(&mut self) -> Result<NodeDecl, ParseError> {
        self.expect(&Token::Node)?;
        let name = self.expect_ident()?;
        self.expect(&Token::LBrace)?;

        self.expect(&Token::Call)?;
        let call_target = self.expect_ident()?;
        self.expect(&Token::Semi)?;

        self.expect(&Token::Inputs)?;
        let inputs = self.parse_node_inputs()?;

        self.expect(&Token::Outputs)?;
        let outputs = self.parse_output_slots()?;

        let consts = if self.check(&Token::Const) {
            self.advance();
            self.parse_literal_entries()?
        } else {
            Vec::new()
        };

        let when = if self.check(&Token::When) {
            self.advance();
            Some(self.parse_bool_expr()?)
        } else {
            None
        };

        let hitl = if self.check(&Token::Hitl) {
            self.advance();
            Some(HitlDecl {
                fields: self.parse_literal_entries()?,
            })
        } else {
            None
        };

        self.expect(&Token::RBrace)?;

        Ok(NodeDecl {
            name,
            call_target,
            inputs,
            outputs,
            consts,
            when,
            hitl,
        })
    }

    fn parse_cycle(&mut self) -> Result<CycleDecl, ParseError> {
        self.expect(&Token::Cycle)?;
        let name = self.expect_ident()?;
        self.expect(&Token::LBrace)?;

        self.expect(&Token::Inputs)?;
        let inputs = self.parse_node_inputs()?;

        self.expect(&Token::Outputs)?;
        let outputs = self.parse_output_decls()?;

        self.expect(&Token::Nodes)?;
        self.expect(&Token::LBrace)?;
        let mut nodes = Vec::new();
        while self.check(&Token::Node) {
            nodes.push(self.parse_node()?);
        }
        self.expect(&Token::RBrace)?;

        self.expect(&Token::Guard)?;
        let guard = self.parse_bool_expr()?;

        self.expect(&Token::MaxIterations)?;
        let max_iterations = self.expect_int()?;

        self.expect(&Token::RBrace)?;

        Ok(CycleDecl {
            name,
            inputs,
            outputs,
            nodes,
            guard,
            max_iterations,
        })
    }

    // -------------------------------------------------------------------------
    // Declaration blocks
    // -------------------------------------------------------------------------

    /// `{ TYPE? NAME ; ... }` — workflow inputs and similar bare declarations.
    fn parse_input_decls(&mut self) -> Result<Vec<InputDecl>, ParseError> {
        self.expect(&Token::LBrace)?;
        let mut decls = Vec::new();
        while !self.check(&Token::RBrace) {
            let (ty, name) = self.parse_typed_name()?;
            self.expect(&Token::Semi)?;
            decls.push(InputDecl { ty, name });
        }
        self.expect(&Token::RBrace)?;
        Ok(decls)
    }

    /// `{ TYPE? NAME ; ... }` — declared node output slots.
    fn parse_output_slots(&mut self) -> Result<Vec<OutputSlot>, ParseError> {
        self.expect(&Token::LBrace)?;
        let mut slots = Vec::new();
        while !self.check(&Token::RBrace) {
            let (ty, name) = self.parse_typed_name()?;
            self.expect(&Token::Semi)?;
            slots.push(OutputSlot { ty, name });
        }
        self.expect(&Token::RBrace)?;
        Ok(slots)
    }

    /// `{ TYPE? NAME = VEXPR ; ... }` — workflow/cycle output bindings.
    fn parse_output_decls(&mut self) -> Result<Vec<OutputDecl>, ParseError> {
        self.expect(&Token::LBrace)?;
        let mut decls = Vec::new();
        while !self.check(&Token::RBrace) {
            let (ty, name) = self.parse_typed_name()?;
            self.expect(&Token::Eq)?;
            let source = self.parse_value_expr()?;
            self.expect(&Token::Semi)?;
            decls.push(OutputDecl { ty, name, source });
        }
        self.expect(&Token::RBrace)?;
        Ok(decls)
    }

    /// `{ TYPE? NAME = VEXPR ; ... }` — node/cycle input bindings.
    fn parse_node_inputs(&mut self) -> Result<Vec<NodeInput>, ParseError> {
        self.expect(&Token::LBrace)?;
        let mut inputs = Vec::new();
        while !self.check(&Token::RBrace) {
            let (ty, name) = self.parse_typed_name()?;
            self.expect(&Token::Eq)?;
            let value = self.parse_value_expr()?;
            self.expect(&Token::Semi)?;
            inputs.push(NodeInput { ty, name, value });
        }
        self.expect(&Token::RBrace)?;
        Ok(inputs)
    }

    /// `TYPE? NAME` with one token of lookahead: two consecutive identifiers
    /// mean the first is a type annotation.
    fn parse_typed_name(&mut self) -> Result<(Option<String>, String), ParseError> {
        let first = self.expect_ident()?;
        if matches!(self.peek(), Token::Lt) {
            // Generic type annotation like list<int>
            let ty = self.parse_generic_type(first)?;
            let name = self.expect_ident()?;
            return Ok((Some(ty), name));
        }
        if matches!(self.peek(), Token::Ident(_)) {
            let name = self.expect_ident()?;
            Ok((Some(first), name))
        } else {
            Ok((None, first))
        }
    }

    /// Continue a generic type annotation after its head identifier,
    /// collecting the raw text (types are documentary).
    fn parse_generic_type(&mut self, head: String) -> Result<String, ParseError> {
        let mut text = head;
        self.expect(&Token::Lt)?;
        text.push('<');
        loop {
            let inner = self.expect_ident()?;
            if matches!(self.peek(), Token::Lt) {
                text.push_str(&self.parse_generic_type(inner)?);
            } else {
                text.push_str(&inner);
            }
            if self.eat(&Token::Comma) {
                text.push_str(", ");
            } else {
                break;
            }
        }
        self.expect(&Token::Gt)?;
        text.push('>');
        Ok(text)
    }

    /// `{ KEY: LITERAL , ... }` — const, metadata, and hitl bodies.
    fn parse_literal_entries(&mut self) -> Result<Vec<(String, Literal)>, ParseError> {
        self.expect(&Token::LBrace)?;
        let mut entries = Vec::new();
        while !self.check(&Token::RBrace) {
            let key = self.parse_object_key()?;
            self.expect(&Token::Colon)?;
            let value = self.parse_literal()?;
            entries.push((key, value));
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RBrace)?;
        Ok(entries)
    }

    fn parse_object_key(&mut self) -> Result<String, ParseError> {
        match self.peek() {
            Token::Ident(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            Token::String(s) => {
                let s = s.clone();
                self.advance();
                Ok(s)
            }
            other => Err(self.error(format!("expected object key, found {}", other))),
        }
    }

    // -------------------------------------------------------------------------
    // Expressions
    // -------------------------------------------------------------------------

    /// Value expression: plain input identifier, dotted reference with an
    /// optional reducer tag, or a literal.
    fn parse_value_expr(&mut self) -> Result<ValueExpr, ParseError> {
        if let Token::Ident(_) = self.peek() {
            let head = self.expect_ident()?;
            if self.eat(&Token::Dot) {
                let output = self.expect_ident()?;
                let reducer = self.parse_reducer_tag()?;
                return Ok(ValueExpr::Ref {
                    scope: head,
                    output,
                    reducer,
                });
            }
            return Ok(ValueExpr::Input(head));
        }
        Ok(ValueExpr::Literal(self.parse_literal()?))
    }

    /// Optional `(append)` / `(merge)` / `(replace)` after a reference.
    fn parse_reducer_tag(&mut self) -> Result<Option<ReducerKind>, ParseError> {
        if !self.check(&Token::LParen) {
            return Ok(None);
        }
        self.advance();
        let name = self.expect_ident()?;
        let Some(kind) = ReducerKind::from_name(&name) else {
            return Err(self.error(format!(
                "unknown reducer '{}', expected replace, append, or merge",
                name
            )));
        };
        self.expect(&Token::RParen)?;
        Ok(Some(kind))
    }

    fn parse_literal(&mut self) -> Result<Literal, ParseError> {
        match self.peek().clone() {
            Token::Null => {
                self.advance();
                Ok(Literal::Null)
            }
            Token::True => {
                self.advance();
                Ok(Literal::Bool(true))
            }
            Token::False => {
                self.advance();
                Ok(Literal::Bool(false))
            }
            Token::Int(value) => {
                self.advance();
                Ok(Literal::Int(value))
            }
            Token::Float(value) => {
                self.advance();
                Ok(Literal::Float(value))
            }
            Token::String(value) => {
                self.advance();
                Ok(Literal::String(value))
            }
            Token::LBracket => {
                self.advance();
                let mut items = Vec::new();
                while !self.check(&Token::RBracket) {
                    items.push(self.parse_literal()?);
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.expect(&Token::RBracket)?;
                Ok(Literal::List(items))
            }
            Token::LBrace => {
                self.advance();
                let mut entries = Vec::new();
                while !self.check(&Token::RBrace) {
                    let key = self.parse_object_key()?;
                    self.expect(&Token::Colon)?;
                    let value = self.parse_literal()?;
                    entries.push((key, value));
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.expect(&Token::RBrace)?;
                Ok(Literal::Object(entries))
            }
            other => Err(self.error(format!("expected literal, found {}", other))),
        }
    }

    /// Boolean expression with `||` < `&&` < `!` < comparison precedence.
    pub fn parse_bool_expr(&mut self) -> Result<BoolExpr, ParseError> {
        self.parse_or_expr()
    }

    fn parse_or_expr(&mut self) -> Result<BoolExpr, ParseError> {
        let mut lhs = self.parse_and_expr()?;
        while self.eat(&Token::OrOr) {
            let rhs = self.parse_and_expr()?;
            lhs = BoolExpr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and_expr(&mut self) -> Result<BoolExpr, ParseError> {
        let mut lhs = self.parse_not_expr()?;
        while self.eat(&Token::AndAnd) {
            let rhs = self.parse_not_expr()?;
            lhs = BoolExpr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not_expr(&mut self) -> Result<BoolExpr, ParseError> {
        if self.eat(&Token::Bang) {
            let inner = self.parse_not_expr()?;
            return Ok(BoolExpr::Not(Box::new(inner)));
        }
        self.parse_cmp_expr()
    }

    fn parse_cmp_expr(&mut self) -> Result<BoolExpr, ParseError> {
        // A paren at comparison level always opens a grouped sub-expression.
        if self.check(&Token::LParen) {
            self.advance();
            let inner = self.parse_or_expr()?;
            self.expect(&Token::RParen)?;
            return Ok(inner);
        }

        let lhs = self.parse_operand()?;
        let op = match self.peek() {
            Token::EqEq => Some(CmpOp::Eq),
            Token::NotEq => Some(CmpOp::Ne),
            Token::Lt => Some(CmpOp::Lt),
            Token::Gt => Some(CmpOp::Gt),
            Token::Le => Some(CmpOp::Le),
            Token::Ge => Some(CmpOp::Ge),
            _ => None,
        };
        let Some(op) = op else {
            return Ok(BoolExpr::Operand(lhs));
        };
        self.advance();
        let rhs = self.parse_operand()?;
        Ok(BoolExpr::Cmp { op, lhs, rhs })
    }

    fn parse_operand(&mut self) -> Result<Operand, ParseError> {
        match self.peek() {
            Token::Ident(_) => {
                let head = self.expect_ident()?;
                if self.eat(&Token::Dot) {
                    let name = self.expect_ident()?;
                    Ok(Operand::Reference {
                        scope: Some(head),
                        name,
                    })
                } else {
                    Ok(Operand::Reference {
                        scope: None,
                        name: head,
                    })
                }
            }
            _ => Ok(Operand::Literal(self.parse_literal()?)),
        }
    }
}

fn lexer_error(source: &str, err: LexerError) -> ParseError {
    let (line, col) = offset_to_line_col(source, err.span.start);
    ParseError {
        message: err.message,
        line,
        col,
    }
}

fn offset_to_line_col(source: &str, offset: usize) -> (u32, u32) {
    let mut line = 1u32;
    let mut col = 1u32;
    for (i, ch) in source.char_indices() {
        if i >= offset {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}
