//! Evaluation of `when` and `guard` boolean expressions.
//!
//! Expressions are evaluated against the run's channel map. References to
//! channels that have not been written resolve to null, which is falsy; a
//! skipped upstream node therefore disables every `when` that reads it.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::ast::{BoolExpr, CmpOp, Operand};
use crate::compiler::literal_to_value;
use crate::value::Value;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvaluationError {
    #[error("cannot order {lhs} and {rhs} with '{op}'")]
    IncomparableTypes {
        op: String,
        lhs: &'static str,
        rhs: &'static str,
    },
}

/// The channel map the expression reads from.
pub type Scope = BTreeMap<String, Value>;

pub struct ExpressionEvaluator;

impl ExpressionEvaluator {
    /// Evaluate a boolean expression to a truth value.
    pub fn evaluate(expr: &BoolExpr, scope: &Scope) -> Result<bool, EvaluationError> {
        match expr {
            BoolExpr::Or(lhs, rhs) => {
                Ok(Self::evaluate(lhs, scope)? || Self::evaluate(rhs, scope)?)
            }
            BoolExpr::And(lhs, rhs) => {
                Ok(Self::evaluate(lhs, scope)? && Self::evaluate(rhs, scope)?)
            }
            BoolExpr::Not(inner) => Ok(!Self::evaluate(inner, scope)?),
            BoolExpr::Cmp { op, lhs, rhs } => {
                let lhs = Self::resolve(lhs, scope);
                let rhs = Self::resolve(rhs, scope);
                Self::compare(*op, &lhs, &rhs)
            }
            BoolExpr::Operand(operand) => Ok(Self::resolve(operand, scope).is_truthy()),
        }
    }

    fn resolve(operand: &Operand, scope: &Scope) -> Value {
        match operand {
            Operand::Reference {
                scope: ref_scope,
                name,
            } => {
                let channel = match ref_scope {
                    Some(prefix) => format!("{}.{}", prefix, name),
                    None => name.clone(),
                };
                scope.get(&channel).cloned().unwrap_or(Value::Null)
            }
            Operand::Literal(literal) => literal_to_value(literal),
        }
    }

    fn compare(op: CmpOp, lhs: &Value, rhs: &Value) -> Result<bool, EvaluationError> {
        match op {
            CmpOp::Eq => Ok(lhs == rhs),
            CmpOp::Ne => Ok(lhs != rhs),
            CmpOp::Lt | CmpOp::Gt | CmpOp::Le | CmpOp::Ge => {
                let ordering = Self::order(op, lhs, rhs)?;
                Ok(match op {
                    CmpOp::Lt => ordering.is_lt(),
                    CmpOp::Gt => ordering.is_gt(),
                    CmpOp::Le => ordering.is_le(),
                    CmpOp::Ge => ordering.is_ge(),
                    _ => unreachable!(),
                })
            }
        }
    }

    fn order(
        op: CmpOp,
        lhs: &Value,
        rhs: &Value,
    ) -> Result<std::cmp::Ordering, EvaluationError> {
        if let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) {
            return Ok(a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal));
        }
        if let (Value::String(a), Value::String(b)) = (lhs, rhs) {
            return Ok(a.cmp(b));
        }
        Err(EvaluationError::IncomparableTypes {
            op: op.to_string(),
            lhs: lhs.type_name(),
            rhs: rhs.type_name(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn eval(source: &str, scope: &Scope) -> Result<bool, EvaluationError> {
        let expr = Parser::new(source).unwrap().parse_bool_expr().unwrap();
        ExpressionEvaluator::evaluate(&expr, scope)
    }

    fn scope(entries: &[(&str, Value)]) -> Scope {
        entries
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn test_truthiness_of_reference() {
        let s = scope(&[("A.flag", Value::Bool(true))]);
        assert!(eval("A.flag", &s).unwrap());
        assert!(!eval("!A.flag", &s).unwrap());
    }

    #[test]
    fn test_missing_channel_is_falsy() {
        let s = Scope::new();
        assert!(!eval("A.flag", &s).unwrap());
        assert!(eval("!A.flag", &s).unwrap());
        assert!(eval("A.flag == null", &s).unwrap());
    }

    #[test]
    fn test_numeric_comparisons() {
        let s = scope(&[("A.count", Value::Int(3))]);
        assert!(eval("A.count < 5", &s).unwrap());
        assert!(eval("A.count >= 3", &s).unwrap());
        assert!(eval("A.count == 3.0", &s).unwrap());
        assert!(!eval("A.count > 3", &s).unwrap());
    }

    #[test]
    fn test_string_comparison() {
        let s = scope(&[("A.name", Value::String("beta".into()))]);
        assert!(eval("A.name == \"beta\"", &s).unwrap());
        assert!(eval("A.name < \"gamma\"", &s).unwrap());
    }

    #[test]
    fn test_incomparable_types_error() {
        let s = scope(&[("A.x", Value::List(vec![]))]);
        assert!(matches!(
            eval("A.x < 3", &s),
            Err(EvaluationError::IncomparableTypes { .. })
        ));
    }

    #[test]
    fn test_boolean_connectives() {
        let s = scope(&[
            ("A.x", Value::Int(1)),
            ("A.y", Value::Int(0)),
        ]);
        assert!(eval("A.x && !A.y", &s).unwrap());
        assert!(eval("A.y || A.x", &s).unwrap());
        assert!(!eval("A.y && A.x", &s).unwrap());
    }
}
