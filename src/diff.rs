//! Structural diff between two JSON documents.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffOp {
    Add,
    Replace,
    Remove,
    /// Part of the wire vocabulary; `compute_diff` never emits it.
    Move,
}

/// One difference, addressed by a `/`-joined path with no leading slash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDiff {
    pub op: DiffOp,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl StateDiff {
    fn add(path: String, value: &Value) -> Self {
        Self { op: DiffOp::Add, path, value: Some(value.clone()) }
    }

    fn replace(path: String, value: &Value) -> Self {
        Self { op: DiffOp::Replace, path, value: Some(value.clone()) }
    }

    fn remove(path: String) -> Self {
        Self { op: DiffOp::Remove, path, value: None }
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}/{}", prefix, key)
    }
}

/// Differences turning `base` into `current`.
///
/// Objects are compared key by key; arrays and scalars are compared as a
/// whole, so a changed array yields a single `Replace` at its path.
pub fn compute_diff(base: &Value, current: &Value) -> Vec<StateDiff> {
    let mut out = Vec::new();
    diff_value("", base, current, &mut out);
    out
}

fn diff_value(path: &str, base: &Value, current: &Value, out: &mut Vec<StateDiff>) {
    match (base, current) {
        (Value::Object(a), Value::Object(b)) => diff_object(path, a, b, out),
        (a, b) if a != b => out.push(StateDiff::replace(path.to_string(), b)),
        _ => {}
    }
}

fn diff_object(path: &str, base: &Map<String, Value>, current: &Map<String, Value>, out: &mut Vec<StateDiff>) {
    for (key, value) in current {
        let child = join(path, key);
        match base.get(key) {
            Some(old) => diff_value(&child, old, value, out),
            None => out.push(StateDiff::add(child, value)),
        }
    }
    for key in base.keys().filter(|k| !current.contains_key(*k)) {
        out.push(StateDiff::remove(join(path, key)));
    }
}
