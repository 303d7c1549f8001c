//! Branch expressions of `condition` nodes.
//!
//! Grammar: `operand [op operand]`, where an operand is a binding reference
//! (`$context.x`, `$node.y`) or a JSON literal, and `op` is one of
//! `== != > >= < <= contains`. A lone operand is tested for truthiness.

use std::cmp::Ordering;

use serde_json::Value;
use stepflow_core::error::BindingResolutionError;
use thiserror::Error;

use crate::binding::{resolve_ref, BindingParseError, BindingRef};
use crate::context::RunContext;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionParseError {
    #[error("empty expression")]
    Empty,

    #[error("unterminated string literal")]
    UnterminatedString,

    #[error("unknown operator '{0}'")]
    UnknownOperator(String),

    #[error("invalid operand '{0}': quote string literals")]
    InvalidOperand(String),

    #[error("expected 'operand [op operand]'")]
    Shape,

    #[error("bad reference: {0}")]
    Reference(#[from] BindingParseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
}

impl Operator {
    fn parse(token: &str) -> Option<Self> {
        Some(match token {
            "==" => Self::Eq,
            "!=" => Self::Ne,
            ">" => Self::Gt,
            ">=" => Self::Ge,
            "<" => Self::Lt,
            "<=" => Self::Le,
            "contains" => Self::Contains,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Ref(BindingRef),
    Literal(Value),
}

impl Operand {
    fn parse(token: &Token) -> Result<Self, ConditionParseError> {
        match token {
            Token::Quoted(s) => Ok(Self::Literal(Value::String(s.clone()))),
            Token::Word(w) if w.starts_with('$') => Ok(Self::Ref(BindingRef::parse(w)?)),
            Token::Word(w) => serde_json::from_str::<Value>(w)
                .ok()
                .filter(|v| !v.is_string() && !v.is_array() && !v.is_object())
                .map(Self::Literal)
                .ok_or_else(|| ConditionParseError::InvalidOperand(w.clone())),
            Token::Symbol(s) => Err(ConditionParseError::InvalidOperand(s.clone())),
        }
    }

    fn evaluate<'a>(&'a self, ctx: &'a RunContext) -> Result<&'a Value, BindingResolutionError> {
        match self {
            Self::Ref(r) => resolve_ref(r, ctx),
            Self::Literal(v) => Ok(v),
        }
    }
}

/// A parsed `when` expression.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionExpr {
    lhs: Operand,
    rhs: Option<(Operator, Operand)>,
}

impl ConditionExpr {
    pub fn parse(expr: &str) -> Result<Self, ConditionParseError> {
        let tokens = tokenize(expr)?;
        match tokens.as_slice() {
            [] => Err(ConditionParseError::Empty),
            [single] => Ok(Self {
                lhs: Operand::parse(single)?,
                rhs: None,
            }),
            [lhs, op, rhs] => {
                let op_str = match op {
                    Token::Symbol(s) | Token::Word(s) => s,
                    Token::Quoted(_) => return Err(ConditionParseError::Shape),
                };
                let op = Operator::parse(op_str)
                    .ok_or_else(|| ConditionParseError::UnknownOperator(op_str.clone()))?;
                Ok(Self {
                    lhs: Operand::parse(lhs)?,
                    rhs: Some((op, Operand::parse(rhs)?)),
                })
            }
            _ => Err(ConditionParseError::Shape),
        }
    }

    /// Every binding reference the expression reads.
    pub fn references(&self) -> impl Iterator<Item = &BindingRef> {
        std::iter::once(&self.lhs)
            .chain(self.rhs.as_ref().map(|(_, operand)| operand))
            .filter_map(|operand| match operand {
                Operand::Ref(r) => Some(r),
                Operand::Literal(_) => None,
            })
    }

    pub fn evaluate(&self, ctx: &RunContext) -> Result<bool, BindingResolutionError> {
        let lhs = self.lhs.evaluate(ctx)?;
        let Some((op, rhs)) = &self.rhs else {
            return Ok(truthy(lhs));
        };
        let rhs = rhs.evaluate(ctx)?;

        Ok(match op {
            Operator::Eq => json_eq(lhs, rhs),
            Operator::Ne => !json_eq(lhs, rhs),
            Operator::Gt => compare(lhs, rhs) == Some(Ordering::Greater),
            Operator::Ge => matches!(compare(lhs, rhs), Some(Ordering::Greater | Ordering::Equal)),
            Operator::Lt => compare(lhs, rhs) == Some(Ordering::Less),
            Operator::Le => matches!(compare(lhs, rhs), Some(Ordering::Less | Ordering::Equal)),
            Operator::Contains => contains(lhs, rhs),
        })
    }
}

/// A labeled branch of a condition node.
#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub label: String,
    pub when: ConditionExpr,
}

/// Ordered branches plus an optional fallback label.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchSet {
    pub branches: Vec<Branch>,
    pub default: Option<String>,
}

impl BranchSet {
    pub fn has_label(&self, label: &str) -> bool {
        self.branches.iter().any(|b| b.label == label)
    }

    /// First branch whose expression holds, else the default, else none.
    pub fn select(&self, ctx: &RunContext) -> Result<Option<String>, BindingResolutionError> {
        for branch in &self.branches {
            if branch.when.evaluate(ctx)? {
                return Ok(Some(branch.label.clone()));
            }
        }
        Ok(self.default.clone())
    }

    pub fn references(&self) -> impl Iterator<Item = (usize, &BindingRef)> {
        self.branches
            .iter()
            .enumerate()
            .flat_map(|(i, b)| b.when.references().map(move |r| (i, r)))
    }
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        // 1 and 1.0 are the same number.
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::String(s), Value::String(sub)) => s.contains(sub.as_str()),
        (Value::Array(items), needle) => items.iter().any(|item| json_eq(item, needle)),
        (Value::Object(map), Value::String(key)) => map.contains_key(key),
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
    Symbol(String),
}

fn is_symbol_char(c: char) -> bool {
    matches!(c, '=' | '!' | '<' | '>')
}

fn tokenize(expr: &str) -> Result<Vec<Token>, ConditionParseError> {
    let mut tokens = Vec::new();
    let mut chars = expr.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '"' {
            // Scan to the closing quote, then let serde_json handle escapes.
            chars.next();
            let mut escaped = false;
            let mut end = None;
            for (i, ch) in chars.by_ref() {
                match ch {
                    '\\' if !escaped => escaped = true,
                    '"' if !escaped => {
                        end = Some(i);
                        break;
                    }
                    _ => escaped = false,
                }
            }
            let end = end.ok_or(ConditionParseError::UnterminatedString)?;
            let literal: String = serde_json::from_str(&expr[start..=end])
                .map_err(|_| ConditionParseError::UnterminatedString)?;
            tokens.push(Token::Quoted(literal));
        } else if is_symbol_char(c) {
            let mut sym = String::new();
            while let Some(&(_, ch)) = chars.peek() {
                if !is_symbol_char(ch) {
                    break;
                }
                sym.push(ch);
                chars.next();
            }
            tokens.push(Token::Symbol(sym));
        } else {
            let mut word = String::new();
            while let Some(&(_, ch)) = chars.peek() {
                if ch.is_whitespace() || ch == '"' || is_symbol_char(ch) {
                    break;
                }
                word.push(ch);
                chars.next();
            }
            tokens.push(Token::Word(word));
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> RunContext {
        let mut ctx = RunContext::new(json!({ "mode": "fast", "limit": 10 }));
        ctx.record(
            "classify",
            json!({ "label": "urgent", "score": 0.92, "tags": ["billing", "vip"], "empty": "" }),
        );
        ctx
    }

    fn eval(expr: &str) -> bool {
        ConditionExpr::parse(expr).unwrap().evaluate(&ctx()).unwrap()
    }

    #[test]
    fn test_equality() {
        assert!(eval(r#"$classify.label == "urgent""#));
        assert!(!eval(r#"$classify.label != "urgent""#));
        assert!(eval(r#"$context.mode=="fast""#));
        assert!(eval("$context.limit == 10.0"));
    }

    #[test]
    fn test_ordering() {
        assert!(eval("$classify.score > 0.9"));
        assert!(eval("$classify.score >= 0.92"));
        assert!(!eval("$context.limit < 10"));
        assert!(eval("$context.limit <= 10"));
        assert!(eval(r#"$context.mode < "slow""#));
        // Mixed types never order.
        assert!(!eval(r#"$context.limit > "5""#));
    }

    #[test]
    fn test_contains() {
        assert!(eval(r#"$classify.tags contains "vip""#));
        assert!(!eval(r#"$classify.tags contains "free""#));
        assert!(eval(r#"$classify.label contains "gen""#));
    }

    #[test]
    fn test_truthiness() {
        assert!(eval("$classify.label"));
        assert!(!eval("$classify.empty"));
        assert!(eval("true"));
        assert!(!eval("null"));
    }

    #[test]
    fn test_quoted_string_with_operators_inside() {
        let expr = ConditionExpr::parse(r#"$context.mode != "a == b""#).unwrap();
        assert!(expr.evaluate(&ctx()).unwrap());
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(ConditionExpr::parse("  "), Err(ConditionParseError::Empty));
        assert_eq!(
            ConditionExpr::parse(r#"$a == "open"#),
            Err(ConditionParseError::UnterminatedString)
        );
        assert_eq!(
            ConditionExpr::parse("$a <> 3"),
            Err(ConditionParseError::UnknownOperator("<>".into()))
        );
        assert_eq!(
            ConditionExpr::parse("$a == urgent"),
            Err(ConditionParseError::InvalidOperand("urgent".into()))
        );
        assert_eq!(ConditionExpr::parse("$a == 1 2"), Err(ConditionParseError::Shape));
        assert!(matches!(
            ConditionExpr::parse("$a..b"),
            Err(ConditionParseError::Reference(_))
        ));
    }

    #[test]
    fn test_missing_reference_is_an_error() {
        let expr = ConditionExpr::parse("$missing.x == 1").unwrap();
        assert!(matches!(
            expr.evaluate(&ctx()),
            Err(BindingResolutionError::NodeOutputMissing { .. })
        ));
    }

    #[test]
    fn test_branch_selection() {
        let set = BranchSet {
            branches: vec![
                Branch {
                    label: "low".into(),
                    when: ConditionExpr::parse("$classify.score < 0.5").unwrap(),
                },
                Branch {
                    label: "high".into(),
                    when: ConditionExpr::parse("$classify.score >= 0.5").unwrap(),
                },
                Branch {
                    label: "also_high".into(),
                    when: ConditionExpr::parse("$classify.score > 0.1").unwrap(),
                },
            ],
            default: None,
        };
        // First match wins.
        assert_eq!(set.select(&ctx()).unwrap().as_deref(), Some("high"));
        assert!(set.has_label("also_high"));
        assert_eq!(set.references().count(), 3);

        let fallback = BranchSet {
            branches: vec![Branch {
                label: "never".into(),
                when: ConditionExpr::parse("false").unwrap(),
            }],
            default: Some("never".into()),
        };
        assert_eq!(fallback.select(&ctx()).unwrap().as_deref(), Some("never"));

        let none = BranchSet {
            default: None,
            ..fallback
        };
        assert_eq!(none.select(&ctx()).unwrap(), None);
    }
}
