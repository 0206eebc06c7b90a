//! Dynamically-typed attribute values.
//!
//! Principal and resource attributes arrive as JSON and flow through the
//! condition evaluator as `Value`s. Equality is type-strict across disjoint
//! sorts with one deliberate exception: `Int` and `Double` compare
//! numerically, so `1 == 1.0` holds. Ordering is only defined within
//! comparable sorts; comparing a string to a number is a type error at the
//! evaluation layer, surfaced as `None` here.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

/// A dynamically-typed value as seen by the condition evaluator.
///
/// Maps use `BTreeMap` so iteration order (and therefore trace and output
/// content) is deterministic across runs.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Timestamp(DateTime<Utc>),
    Duration(Duration),
}

impl Value {
    /// The sort name used in type-error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Timestamp(_) => "timestamp",
            Value::Duration(_) => "duration",
        }
    }

    /// Convert a JSON document into a `Value`.
    ///
    /// JSON numbers that are exactly representable as `i64` become `Int`;
    /// everything else becomes `Double`. Objects become sorted maps.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Double(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(fields) => Value::Map(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert back into JSON for responses and traces.
    ///
    /// Timestamps render as RFC 3339 strings; durations as `<seconds>s`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Double(d) => {
                serde_json::Number::from_f64(*d).map_or(serde_json::Value::Null, serde_json::Value::Number)
            }
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(fields) => serde_json::Value::Object(
                fields.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Timestamp(ts) => serde_json::Value::String(ts.to_rfc3339()),
            Value::Duration(d) => serde_json::Value::String(format!("{}s", d.num_seconds())),
        }
    }

    /// Numeric view shared by `Int` and `Double`, used for mixed comparison.
    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    /// Total-order comparison within a comparable sort.
    ///
    /// Returns `None` when the two values belong to sorts that have no
    /// defined ordering between them (e.g. string vs int). `Int` and
    /// `Double` compare numerically.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::Duration(a), Value::Duration(b)) => Some(a.cmp(b)),
            _ => {
                let (a, b) = (self.as_f64()?, other.as_f64()?);
                a.partial_cmp(&b)
            }
        }
    }
}

impl PartialEq for Value {
    /// Type-strict equality, except `Int` and `Double` compare numerically.
    ///
    /// Values of disjoint sorts are simply unequal (never an error), which
    /// keeps `a == b` total and side-effect free in conditions.
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::Int(a), Value::Double(b)) | (Value::Double(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            (Value::Duration(a), Value::Duration(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Value {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Value {
        Value::Double(d)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::String(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equality_is_type_strict_across_disjoint_sorts() {
        assert_ne!(Value::String("1".to_string()), Value::Int(1));
        assert_ne!(Value::Bool(true), Value::Int(1));
        assert_ne!(Value::Null, Value::Bool(false));
    }

    #[test]
    fn int_and_double_compare_numerically() {
        assert_eq!(Value::Int(1), Value::Double(1.0));
        assert_eq!(Value::Double(2.0), Value::Int(2));
        assert_ne!(Value::Int(1), Value::Double(1.5));

        assert_eq!(
            Value::Int(1).compare(&Value::Double(1.5)),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn cross_sort_comparison_is_undefined() {
        assert_eq!(Value::String("a".to_string()).compare(&Value::Int(1)), None);
        assert_eq!(Value::Bool(true).compare(&Value::Null), None);
    }

    #[test]
    fn json_numbers_map_to_int_or_double() {
        assert_eq!(Value::from_json(&json!(42)), Value::Int(42));
        assert_eq!(Value::from_json(&json!(1.25)), Value::Double(1.25));
    }

    #[test]
    fn json_objects_round_trip_through_value() {
        let source = json!({
            "owner": "john",
            "tags": ["hr", "gb"],
            "priority": 3
        });
        let value = Value::from_json(&source);
        assert_eq!(value.to_json(), source);
    }

    #[test]
    fn nan_is_not_equal_to_itself() {
        assert_ne!(Value::Double(f64::NAN), Value::Double(f64::NAN));
    }
}
