//! Caller-supplied request context
//!
//! Context rides along with a generation request and shapes the
//! instructions a generator receives. Only its normalized form is
//! fingerprinted: concrete `inputs` values collapse to a count and the set
//! of their kinds, so requests that differ only in the values a script will
//! be run with share one cached script.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};

/// Free-form context keyed by name
pub type GenerationContext = BTreeMap<String, Value>;

/// Context key holding sample input values
pub const INPUTS_KEY: &str = "inputs";

/// Coarse type of a sample input
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    /// `true` or `false`
    Boolean,
    /// A JSON number, or a string that parses as one
    Number,
    /// Anything else
    String,
}

impl InputKind {
    /// Classify one input value
    #[must_use]
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Bool(_) => Self::Boolean,
            Value::Number(_) => Self::Number,
            Value::String(s) if s.trim().parse::<f64>().is_ok() => Self::Number,
            _ => Self::String,
        }
    }

    /// Lowercase name
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Number => "number",
            Self::String => "string",
        }
    }
}

impl Display for InputKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shape of a list of sample inputs, without the values
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputsSummary {
    /// Number of inputs
    pub count: usize,
    /// Distinct kinds, in order
    pub types: BTreeSet<InputKind>,
}

impl InputsSummary {
    /// Summarize `inputs`; `None` when empty
    #[must_use]
    pub fn of(inputs: &[Value]) -> Option<Self> {
        if inputs.is_empty() {
            return None;
        }
        Some(Self {
            count: inputs.len(),
            types: inputs.iter().map(InputKind::of).collect(),
        })
    }

    /// Summary of the `inputs` entry of `context`, if it is a non-empty list
    #[must_use]
    pub fn from_context(context: &GenerationContext) -> Option<Self> {
        match context.get(INPUTS_KEY) {
            Some(Value::Array(inputs)) => Self::of(inputs),
            _ => None,
        }
    }
}

/// Canonical form of `context` for fingerprinting
///
/// Keys come out sorted. At every nesting level an `inputs` list becomes an
/// [`InputsSummary`] (and disappears when empty), and lists made only of
/// strings are sorted. Everything else is kept as is.
#[must_use]
pub fn normalize_context(context: &GenerationContext) -> Map<String, Value> {
    normalize_entries(context.iter())
}

fn normalize_entries<'a>(entries: impl Iterator<Item = (&'a String, &'a Value)>) -> Map<String, Value> {
    let mut sorted: Vec<_> = entries.collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));

    let mut out = Map::new();
    for (key, value) in sorted {
        let normalized = match value {
            Value::Array(inputs) if key == INPUTS_KEY => match InputsSummary::of(inputs) {
                Some(summary) => serde_json::json!(summary),
                None => continue,
            },
            Value::Object(nested) => Value::Object(normalize_entries(nested.iter())),
            Value::Array(items) if items.iter().all(Value::is_string) => {
                let mut items = items.clone();
                items.sort_by(|a, b| a.as_str().cmp(&b.as_str()));
                Value::Array(items)
            }
            other => other.clone(),
        };
        out.insert(key.clone(), normalized);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(value: Value) -> GenerationContext {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn input_kinds_follow_the_value() {
        assert_eq!(InputKind::of(&json!(3)), InputKind::Number);
        assert_eq!(InputKind::of(&json!("2.5")), InputKind::Number);
        assert_eq!(InputKind::of(&json!("abc")), InputKind::String);
        assert_eq!(InputKind::of(&json!(true)), InputKind::Boolean);
        assert_eq!(InputKind::of(&json!({"a": 1})), InputKind::String);
    }

    #[test]
    fn inputs_reduce_to_count_and_types() {
        let normalized = normalize_context(&context(json!({
            "inputs": [1, "2", "x", false],
        })));
        assert_eq!(
            Value::Object(normalized),
            json!({"inputs": {"count": 4, "types": ["boolean", "number", "string"]}})
        );
    }

    #[test]
    fn input_values_do_not_matter() {
        let a = normalize_context(&context(json!({"inputs": [1, 2], "data": "sales"})));
        let b = normalize_context(&context(json!({"inputs": ["7", 9.5], "data": "sales"})));
        assert_eq!(a, b);

        let three = normalize_context(&context(json!({"inputs": [1, 2, 3], "data": "sales"})));
        assert_ne!(a, three);
    }

    #[test]
    fn empty_inputs_are_dropped() {
        let normalized = normalize_context(&context(json!({"inputs": [], "environment": "ci"})));
        assert_eq!(Value::Object(normalized), json!({"environment": "ci"}));
    }

    #[test]
    fn string_lists_are_sorted_and_nesting_is_normalized() {
        let normalized = normalize_context(&context(json!({
            "files": ["b.csv", "a.csv"],
            "mixed": [2, "a", 1],
            "nested": {"inputs": ["x"], "tags": ["z", "y"]},
        })));
        assert_eq!(
            Value::Object(normalized),
            json!({
                "files": ["a.csv", "b.csv"],
                "mixed": [2, "a", 1],
                "nested": {"inputs": {"count": 1, "types": ["string"]}, "tags": ["y", "z"]},
            })
        );
    }

    #[test]
    fn summary_reads_inputs_from_context() {
        let summary = InputsSummary::from_context(&context(json!({"inputs": ["1", "a"]}))).unwrap();
        assert_eq!(summary.count, 2);
        assert_eq!(
            summary.types.iter().map(|k| k.name()).collect::<Vec<_>>(),
            vec!["number", "string"]
        );
        assert!(InputsSummary::from_context(&context(json!({"inputs": "1"}))).is_none());
    }
}
