// Typed predicates evaluated against a build context.
//
// Extensions and composition entries carry conditions that gate whether they
// participate in a build. A condition reads one value from the context
// (environment name, a parameter, or a dot-path into free-form context data)
// and compares it to a literal.

use log::warn;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use crate::template::BuildContext;

/// Where a condition reads its left-hand value from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionSource {
    Environment,
    Parameter,
    Context,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not_in")]
    NotIn,
    #[serde(rename = "regex")]
    Regex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub source: ConditionSource,
    /// Parameter name or dot path; ignored for `environment`
    #[serde(default)]
    pub field: String,
    pub operator: ComparisonOp,
    pub value: Value,
}

impl Condition {
    pub fn new(
        source: ConditionSource,
        field: impl Into<String>,
        operator: ComparisonOp,
        value: Value,
    ) -> Self {
        Self {
            source,
            field: field.into(),
            operator,
            value,
        }
    }

    pub fn environment(operator: ComparisonOp, value: Value) -> Self {
        Self::new(ConditionSource::Environment, "", operator, value)
    }

    pub fn parameter(name: impl Into<String>, operator: ComparisonOp, value: Value) -> Self {
        Self::new(ConditionSource::Parameter, name, operator, value)
    }

    pub fn context(path: impl Into<String>, operator: ComparisonOp, value: Value) -> Self {
        Self::new(ConditionSource::Context, path, operator, value)
    }

    /// Left-hand value; missing fields read as null
    fn resolve(&self, ctx: &BuildContext) -> Value {
        match self.source {
            ConditionSource::Environment => Value::String(ctx.environment.clone()),
            ConditionSource::Parameter => ctx
                .parameters
                .get(&self.field)
                .cloned()
                .unwrap_or(Value::Null),
            ConditionSource::Context => lookup_path(&ctx.context, &self.field)
                .cloned()
                .unwrap_or(Value::Null),
        }
    }

    pub fn evaluate(&self, ctx: &BuildContext) -> bool {
        let actual = self.resolve(ctx);
        let expected = &self.value;

        match self.operator {
            ComparisonOp::Eq => loose_equals(&actual, expected),
            ComparisonOp::Ne => !loose_equals(&actual, expected),
            ComparisonOp::Gt => order(&actual, expected) == Some(Ordering::Greater),
            ComparisonOp::Lt => order(&actual, expected) == Some(Ordering::Less),
            ComparisonOp::Ge => matches!(
                order(&actual, expected),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            ComparisonOp::Le => matches!(
                order(&actual, expected),
                Some(Ordering::Less | Ordering::Equal)
            ),
            ComparisonOp::In => contains(expected, &actual),
            ComparisonOp::NotIn => !contains(expected, &actual),
            ComparisonOp::Regex => self.regex_match(&actual),
        }
    }

    fn regex_match(&self, actual: &Value) -> bool {
        let Some(pattern) = self.value.as_str() else {
            warn!("Regex condition on '{}' has a non-string pattern", self.field);
            return false;
        };
        match Regex::new(pattern) {
            Ok(re) => re.is_match(&as_text(actual)),
            Err(e) => {
                warn!("Invalid regex in condition on '{}': {}", self.field, e);
                false
            }
        }
    }
}

/// True when every condition holds; an empty list always holds
pub fn evaluate_conditions(conditions: &[Condition], ctx: &BuildContext) -> bool {
    conditions.iter().all(|c| c.evaluate(ctx))
}

/// Walk `a.b.0.c` through objects and arrays
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }
    path.split('.').try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn loose_equals(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            match (as_number(a), as_number(b)) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            }
        }
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => false,
    }
}

/// Numeric order when both sides are numeric, otherwise lexical on strings
fn order(a: &Value, b: &Value) -> Option<Ordering> {
    if a.is_null() || b.is_null() {
        return None;
    }
    if let (Value::String(x), Value::String(y)) = (a, b) {
        return Some(x.cmp(y));
    }
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y),
        _ => None,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|item| loose_equals(item, needle)),
        Value::String(s) => needle.as_str().map(|n| s.contains(n)).unwrap_or(false),
        Value::Object(map) => needle.as_str().map(|k| map.contains_key(k)).unwrap_or(false),
        _ => false,
    }
}
