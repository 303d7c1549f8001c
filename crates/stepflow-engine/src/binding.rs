//! Binding expressions: `$context[.path]` and `$<node>[.path]`.
//!
//! Bindings are parsed once at compile time into [`BindingSpec`]s and
//! resolved against a [`RunContext`] right before a node runs.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};
use stepflow_core::error::{BindingResolutionError, NodeError};
use thiserror::Error;

use crate::context::RunContext;

/// Reserved source name for the run's initial input.
pub const CONTEXT_SOURCE: &str = "context";

/// Pattern every node key must match: no dots, no `$`, no whitespace.
pub fn node_key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[^.$\s]+$").expect("static regex"))
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindingParseError {
    #[error("reference has no source")]
    EmptyReference,

    #[error("invalid source '{0}'")]
    InvalidSource(String),

    #[error("empty path segment")]
    EmptySegment,
}

/// Where a reference reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingSource {
    Context,
    Node(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(k) => f.write_str(k),
            Self::Index(i) => write!(f, "{i}"),
        }
    }
}

/// A parsed `$source.path` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingRef {
    pub source: BindingSource,
    pub path: Vec<PathSegment>,
    raw: String,
}

impl BindingRef {
    /// Parse a reference. `expr` includes the leading `$`.
    pub fn parse(expr: &str) -> Result<Self, BindingParseError> {
        let body = expr.strip_prefix('$').unwrap_or(expr);
        if body.is_empty() {
            return Err(BindingParseError::EmptyReference);
        }

        let mut parts = body.split('.');
        let head = parts.next().unwrap_or_default();
        if head.is_empty() {
            return Err(BindingParseError::EmptyReference);
        }
        if !node_key_pattern().is_match(head) {
            return Err(BindingParseError::InvalidSource(head.to_string()));
        }
        let source = if head == CONTEXT_SOURCE {
            BindingSource::Context
        } else {
            BindingSource::Node(head.to_string())
        };

        let path = parts
            .map(|seg| {
                if seg.is_empty() {
                    Err(BindingParseError::EmptySegment)
                } else if seg.bytes().all(|b| b.is_ascii_digit()) {
                    seg.parse::<usize>()
                        .map(PathSegment::Index)
                        .or_else(|_| Ok(PathSegment::Key(seg.to_string())))
                } else {
                    Ok(PathSegment::Key(seg.to_string()))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            source,
            path,
            raw: format!("${body}"),
        })
    }

    /// The referenced node, or `None` for `$context`.
    pub fn node_key(&self) -> Option<&str> {
        match &self.source {
            BindingSource::Node(key) => Some(key),
            BindingSource::Context => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for BindingRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// One input binding: either a literal or a reference into the run context.
#[derive(Debug, Clone, PartialEq)]
pub enum BindingSpec {
    Literal(Value),
    Ref(BindingRef),
}

impl BindingSpec {
    /// Non-string values and strings not starting with `$` are literals.
    /// A `$$` prefix escapes a literal string that starts with `$`.
    pub fn parse(value: &Value) -> Result<Self, BindingParseError> {
        let Some(s) = value.as_str() else {
            return Ok(Self::Literal(value.clone()));
        };
        if let Some(escaped) = s.strip_prefix("$$") {
            return Ok(Self::Literal(Value::String(format!("${escaped}"))));
        }
        if s.starts_with('$') {
            return BindingRef::parse(s).map(Self::Ref);
        }
        Ok(Self::Literal(value.clone()))
    }

    pub fn reference(&self) -> Option<&BindingRef> {
        match self {
            Self::Ref(r) => Some(r),
            Self::Literal(_) => None,
        }
    }
}

/// Resolve one binding against the run context.
pub fn resolve(spec: &BindingSpec, ctx: &RunContext) -> Result<Value, BindingResolutionError> {
    match spec {
        BindingSpec::Literal(v) => Ok(v.clone()),
        BindingSpec::Ref(r) => resolve_ref(r, ctx).cloned(),
    }
}

/// Look up a reference without cloning the result.
pub fn resolve_ref<'a>(r: &BindingRef, ctx: &'a RunContext) -> Result<&'a Value, BindingResolutionError> {
    let root = match &r.source {
        BindingSource::Context => ctx.input(),
        BindingSource::Node(key) => ctx
            .output(key)
            .ok_or_else(|| BindingResolutionError::NodeOutputMissing { node: key.clone() })?,
    };

    let mut current = root;
    for (depth, seg) in r.path.iter().enumerate() {
        let walked = || {
            r.path[..=depth]
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(".")
        };
        let not_found = || BindingResolutionError::PathNotFound {
            reference: r.raw.clone(),
            path: walked(),
        };

        current = match (current, seg) {
            (Value::Object(map), PathSegment::Key(k)) => map.get(k).ok_or_else(not_found)?,
            // Objects may legitimately use numeric keys.
            (Value::Object(map), PathSegment::Index(i)) => {
                map.get(&i.to_string()).ok_or_else(not_found)?
            }
            (Value::Array(items), PathSegment::Index(i)) => items.get(*i).ok_or_else(not_found)?,
            (other, seg) => {
                return Err(BindingResolutionError::TypeMismatch {
                    reference: r.raw.clone(),
                    segment: seg.to_string(),
                    found: type_name(other).to_string(),
                })
            }
        };
    }
    Ok(current)
}

/// Resolve every input binding of a node into the handler's input object.
pub fn resolve_inputs(
    bindings: &BTreeMap<String, BindingSpec>,
    ctx: &RunContext,
) -> Result<Value, NodeError> {
    let mut input = Map::with_capacity(bindings.len());
    for (param, spec) in bindings {
        let value = resolve(spec, ctx).map_err(|error| NodeError::BindingResolution {
            param: param.clone(),
            error,
        })?;
        input.insert(param.clone(), value);
    }
    Ok(Value::Object(input))
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> RunContext {
        let mut ctx = RunContext::new(json!({ "query": "rust", "tags": ["a", "b"] }));
        ctx.record(
            "fetch",
            json!({ "items": [{ "title": "first" }, { "title": "second" }], "count": 2 }),
        );
        ctx
    }

    #[test]
    fn test_parse_literals() {
        assert_eq!(BindingSpec::parse(&json!(5)).unwrap(), BindingSpec::Literal(json!(5)));
        assert_eq!(
            BindingSpec::parse(&json!("plain")).unwrap(),
            BindingSpec::Literal(json!("plain"))
        );
        assert_eq!(
            BindingSpec::parse(&json!({ "nested": "$fetch" })).unwrap(),
            BindingSpec::Literal(json!({ "nested": "$fetch" }))
        );
        assert_eq!(
            BindingSpec::parse(&json!("$$5.00")).unwrap(),
            BindingSpec::Literal(json!("$5.00"))
        );
    }

    #[test]
    fn test_parse_references() {
        let spec = BindingSpec::parse(&json!("$fetch.items.0.title")).unwrap();
        let r = spec.reference().unwrap();
        assert_eq!(r.node_key(), Some("fetch"));
        assert_eq!(
            r.path,
            vec![
                PathSegment::Key("items".into()),
                PathSegment::Index(0),
                PathSegment::Key("title".into()),
            ]
        );
        assert_eq!(r.to_string(), "$fetch.items.0.title");

        let r = BindingRef::parse("$context").unwrap();
        assert_eq!(r.source, BindingSource::Context);
        assert!(r.path.is_empty());
        assert_eq!(r.node_key(), None);
    }

    #[test]
    fn test_parse_malformed() {
        assert_eq!(BindingRef::parse("$"), Err(BindingParseError::EmptyReference));
        assert_eq!(BindingRef::parse("$.a"), Err(BindingParseError::EmptyReference));
        assert_eq!(BindingRef::parse("$a..b"), Err(BindingParseError::EmptySegment));
        assert_eq!(BindingRef::parse("$context."), Err(BindingParseError::EmptySegment));
        assert!(matches!(
            BindingRef::parse("$has space"),
            Err(BindingParseError::InvalidSource(_))
        ));
    }

    #[test]
    fn test_resolve_context_and_node_paths() {
        let ctx = ctx();
        let query = BindingSpec::parse(&json!("$context.query")).unwrap();
        assert_eq!(resolve(&query, &ctx).unwrap(), json!("rust"));

        let tag = BindingSpec::parse(&json!("$context.tags.1")).unwrap();
        assert_eq!(resolve(&tag, &ctx).unwrap(), json!("b"));

        let title = BindingSpec::parse(&json!("$fetch.items.1.title")).unwrap();
        assert_eq!(resolve(&title, &ctx).unwrap(), json!("second"));

        let whole = BindingSpec::parse(&json!("$fetch")).unwrap();
        assert_eq!(resolve(&whole, &ctx).unwrap()["count"], 2);
    }

    #[test]
    fn test_resolve_errors_are_not_coalesced() {
        let ctx = ctx();

        let missing_node = BindingSpec::parse(&json!("$summarize.text")).unwrap();
        assert_eq!(
            resolve(&missing_node, &ctx),
            Err(BindingResolutionError::NodeOutputMissing {
                node: "summarize".into()
            })
        );

        let missing_path = BindingSpec::parse(&json!("$fetch.items.5.title")).unwrap();
        assert_eq!(
            resolve(&missing_path, &ctx),
            Err(BindingResolutionError::PathNotFound {
                reference: "$fetch.items.5.title".into(),
                path: "items.5".into(),
            })
        );

        let into_scalar = BindingSpec::parse(&json!("$fetch.count.value")).unwrap();
        assert_eq!(
            resolve(&into_scalar, &ctx),
            Err(BindingResolutionError::TypeMismatch {
                reference: "$fetch.count.value".into(),
                segment: "value".into(),
                found: "number".into(),
            })
        );

        let key_on_array = BindingSpec::parse(&json!("$fetch.items.first")).unwrap();
        assert!(matches!(
            resolve(&key_on_array, &ctx),
            Err(BindingResolutionError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_resolve_inputs_names_failing_param() {
        let ctx = ctx();
        let mut bindings = BTreeMap::new();
        bindings.insert("q".to_string(), BindingSpec::parse(&json!("$context.query")).unwrap());
        bindings.insert("limit".to_string(), BindingSpec::parse(&json!(10)).unwrap());

        let input = resolve_inputs(&bindings, &ctx).unwrap();
        assert_eq!(input, json!({ "q": "rust", "limit": 10 }));

        bindings.insert("bad".to_string(), BindingSpec::parse(&json!("$context.nope")).unwrap());
        match resolve_inputs(&bindings, &ctx) {
            Err(NodeError::BindingResolution { param, .. }) => assert_eq!(param, "bad"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_node_key_pattern() {
        assert!(node_key_pattern().is_match("fetch_data-2"));
        assert!(!node_key_pattern().is_match("a.b"));
        assert!(!node_key_pattern().is_match("$a"));
        assert!(!node_key_pattern().is_match("a b"));
        assert!(!node_key_pattern().is_match(""));
    }
}
