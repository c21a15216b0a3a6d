//! Lexer for the WIRL workflow language.
//!
//! Uses logos for tokenization. WIRL is brace-delimited, so newlines are
//! plain whitespace; `# …` comments run to end of line.

use std::fmt;

use logos::Logos;

/// Source span (byte offsets)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Merge two spans into one covering both
    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// A token with its span
#[derive(Debug, Clone, PartialEq)]
pub struct SpannedToken {
    pub token: Token,
    pub span: Span,
}

fn unescape_string(raw: &str) -> Option<String> {
    // raw includes the surrounding quotes
    let inner = &raw[1..raw.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next()? {
            '"' => out.push('"'),
            '\\' => out.push('\\'),
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'u' => {
                if chars.next()? != '{' {
                    return None;
                }
                let mut hex = String::new();
                loop {
                    match chars.next()? {
                        '}' => break,
                        c => hex.push(c),
                    }
                }
                let code = u32::from_str_radix(&hex, 16).ok()?;
                out.push(char::from_u32(code)?);
            }
            _ => return None,
        }
    }
    Some(out)
}

/// Token types for the WIRL language
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip r"#[^\n]*")]
pub enum Token {
    // Keywords
    #[token("workflow")]
    Workflow,
    #[token("node")]
    Node,
    #[token("cycle")]
    Cycle,
    #[token("nodes")]
    Nodes,
    #[token("inputs")]
    Inputs,
    #[token("outputs")]
    Outputs,
    #[token("metadata")]
    Metadata,
    #[token("call")]
    Call,
    #[token("const")]
    Const,
    #[token("when")]
    When,
    #[token("guard")]
    Guard,
    #[token("hitl")]
    Hitl,
    #[token("max_iterations")]
    MaxIterations,
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("null")]
    Null,

    // Identifiers
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    // Literals
    #[regex(r"-?[0-9]+\.[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),

    #[regex(r"-?[0-9]+", priority = 3, callback = |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),

    #[regex(r#""([^"\\]|\\.)*""#, |lex| unescape_string(lex.slice()))]
    String(String),

    // Operators
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<=")]
    Le,
    #[token(">=")]
    Ge,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
    #[token("!")]
    Bang,
    #[token("=")]
    Eq,

    // Delimiters
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,
    #[token(";")]
    Semi,
    #[token(":")]
    Colon,
    #[token(".")]
    Dot,

    // End of file (synthetic)
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Workflow => write!(f, "workflow"),
            Token::Node => write!(f, "node"),
            Token::Cycle => write!(f, "cycle"),
            Token::Nodes => write!(f, "nodes"),
            Token::Inputs => write!(f, "inputs"),
            Token::Outputs => write!(f, "outputs"),
            Token::Metadata => write!(f, "metadata"),
            Token::Call => write!(f, "call"),
            Token::Const => write!(f, "const"),
            Token::When => write!(f, "when"),
            Token::Guard => write!(f, "guard"),
            Token::Hitl => write!(f, "hitl"),
            Token::MaxIterations => write!(f, "max_iterations"),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::Null => write!(f, "null"),
            Token::Ident(s) => write!(f, "{}", s),
            Token::Float(n) => write!(f, "{}", n),
            Token::Int(n) => write!(f, "{}", n),
            Token::String(s) => write!(f, "\"{}\"", s),
            Token::EqEq => write!(f, "=="),
            Token::NotEq => write!(f, "!="),
            Token::Le => write!(f, "<="),
            Token::Ge => write!(f, ">="),
            Token::Lt => write!(f, "<"),
            Token::Gt => write!(f, ">"),
            Token::AndAnd => write!(f, "&&"),
            Token::OrOr => write!(f, "||"),
            Token::Bang => write!(f, "!"),
            Token::Eq => write!(f, "="),
            Token::LBrace => write!(f, "{{"),
            Token::RBrace => write!(f, "}}"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Comma => write!(f, ","),
            Token::Semi => write!(f, ";"),
            Token::Colon => write!(f, ":"),
            Token::Dot => write!(f, "."),
            Token::Eof => write!(f, "EOF"),
        }
    }
}

/// Lexer error
#[derive(Debug, Clone, PartialEq)]
pub struct LexerError {
    pub message: String,
    pub span: Span,
}

impl fmt::Display for LexerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {:?}", self.message, self.span)
    }
}

impl std::error::Error for LexerError {}

/// Lex a source string into a vector of tokens ending with Eof.
pub fn lex(source: &str) -> Result<Vec<SpannedToken>, LexerError> {
    let mut tokens = Vec::new();
    for (result, span) in Token::lexer(source).spanned() {
        match result {
            Ok(token) => tokens.push(SpannedToken {
                token,
                span: Span::new(span.start, span.end),
            }),
            Err(_) => {
                return Err(LexerError {
                    message: format!(
                        "unexpected character: '{}'",
                        &source[span.start..span.end]
                    ),
                    span: Span::new(span.start, span.end),
                });
            }
        }
    }
    let end = source.len();
    tokens.push(SpannedToken {
        token: Token::Eof,
        span: Span::new(end, end),
    });
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_types(source: &str) -> Vec<Token> {
        lex(source)
            .unwrap()
            .into_iter()
            .map(|st| st.token)
            .collect()
    }

    #[test]
    fn test_keywords() {
        let tokens = token_types("workflow node cycle inputs outputs call guard");
        assert_eq!(
            tokens,
            vec![
                Token::Workflow,
                Token::Node,
                Token::Cycle,
                Token::Inputs,
                Token::Outputs,
                Token::Call,
                Token::Guard,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_identifiers() {
        let tokens = token_types("foo bar_baz _private x123");
        assert_eq!(
            tokens,
            vec![
                Token::Ident("foo".to_string()),
                Token::Ident("bar_baz".to_string()),
                Token::Ident("_private".to_string()),
                Token::Ident("x123".to_string()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_literals() {
        let tokens = token_types("42 -7 3.25 \"hello\" true false null");
        assert_eq!(
            tokens,
            vec![
                Token::Int(42),
                Token::Int(-7),
                Token::Float(3.25),
                Token::String("hello".to_string()),
                Token::True,
                Token::False,
                Token::Null,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        let tokens = token_types(r#""line\nbreak \"quoted\" tab\t""#);
        assert_eq!(
            tokens,
            vec![
                Token::String("line\nbreak \"quoted\" tab\t".to_string()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_operators() {
        let tokens = token_types("== != < > <= >= && || ! =");
        assert_eq!(
            tokens,
            vec![
                Token::EqEq,
                Token::NotEq,
                Token::Lt,
                Token::Gt,
                Token::Le,
                Token::Ge,
                Token::AndAnd,
                Token::OrOr,
                Token::Bang,
                Token::Eq,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_dotted_reference() {
        let tokens = token_types("Pick.done");
        assert_eq!(
            tokens,
            vec![
                Token::Ident("Pick".to_string()),
                Token::Dot,
                Token::Ident("done".to_string()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_reducer_tag() {
        let tokens = token_types("Accumulate.items (append)");
        assert_eq!(
            tokens,
            vec![
                Token::Ident("Accumulate".to_string()),
                Token::Dot,
                Token::Ident("items".to_string()),
                Token::LParen,
                Token::Ident("append".to_string()),
                Token::RParen,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_comments_skipped() {
        let tokens = token_types("node A { # trailing comment\n}\n# full line\n");
        assert_eq!(
            tokens,
            vec![
                Token::Node,
                Token::Ident("A".to_string()),
                Token::LBrace,
                Token::RBrace,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_unterminated_string() {
        assert!(lex("\"oops").is_err());
    }
}
