// Coercion and sizing helpers over JSON values.
//
// Script values are plain `serde_json::Value`s. `null` stands in for both
// null and undefined.

use std::cmp::Ordering;

use serde_json::{Number, Value};

/// Deepest value a script may build
pub const MAX_VALUE_DEPTH: usize = 64;

pub fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

pub fn to_number(v: &Value) -> f64 {
    match v {
        Value::Null => 0.0,
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => {
            let t = s.trim();
            if t.is_empty() {
                0.0
            } else {
                t.parse().unwrap_or(f64::NAN)
            }
        }
        _ => f64::NAN,
    }
}

pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

pub fn display(v: &Value) -> String {
    match v {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => (f as i64).to_string(),
            Some(f) => f.to_string(),
            None => n.to_string(),
        },
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(display).collect::<Vec<_>>().join(","),
        Value::Object(_) => "[object Object]".to_string(),
    }
}

pub fn type_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "undefined",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) | Value::Object(_) => "object",
    }
}

/// Equality with numbers compared by value (`1 == 1.0`)
pub fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| loose_eq(l, r))
        }
        _ => a == b,
    }
}

pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => to_number(a).partial_cmp(&to_number(b)),
    }
}

/// Approximate heap footprint and nesting depth, computed without recursion
pub fn measure(v: &Value) -> (u64, usize) {
    let mut size = 0u64;
    let mut max_depth = 0usize;
    let mut stack = vec![(v, 1usize)];

    while let Some((value, depth)) = stack.pop() {
        max_depth = max_depth.max(depth);
        size += match value {
            Value::Null | Value::Bool(_) => 8,
            Value::Number(_) => 16,
            Value::String(s) => 24 + s.len() as u64,
            Value::Array(items) => {
                stack.extend(items.iter().map(|item| (item, depth + 1)));
                24
            }
            Value::Object(map) => {
                stack.extend(map.values().map(|item| (item, depth + 1)));
                48 + map.keys().map(|k| 24 + k.len() as u64).sum::<u64>()
            }
        };
    }

    (size, max_depth)
}

/// Resolve a possibly negative relative index against a length
pub fn relative_index(raw: Option<&Value>, len: usize, default: usize) -> usize {
    match raw {
        None | Some(Value::Null) => default,
        Some(v) => {
            let n = to_number(v);
            if n.is_nan() {
                0
            } else if n < 0.0 {
                len.saturating_sub((-n) as usize)
            } else {
                (n as usize).min(len)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_number_normalization() {
        assert_eq!(number(3.0), json!(3));
        assert_eq!(number(2.5), json!(2.5));
        assert_eq!(number(f64::NAN), Value::Null);
    }

    #[test]
    fn test_coercions() {
        assert!(!truthy(&json!("")));
        assert!(truthy(&json!([])));
        assert_eq!(to_number(&json!(" 42 ")), 42.0);
        assert!(to_number(&json!("abc")).is_nan());
        assert_eq!(display(&json!([1, "a", null])), "1,a,null");
        assert!(loose_eq(&json!(1), &json!(1.0)));
    }

    #[test]
    fn test_measure_depth() {
        let (_, depth) = measure(&json!({"a": {"b": [1]}}));
        assert_eq!(depth, 4);
        let (small, _) = measure(&json!("ab"));
        let (large, _) = measure(&json!("abcdef"));
        assert_eq!(large - small, 4);
    }

    #[test]
    fn test_relative_index() {
        assert_eq!(relative_index(Some(&json!(-2)), 5, 0), 3);
        assert_eq!(relative_index(Some(&json!(10)), 5, 0), 5);
        assert_eq!(relative_index(None, 5, 5), 5);
    }
}
