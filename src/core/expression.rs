//! Execution context, input-mapping resolution and guard evaluation.
//!
//! The context is a JSON object:
//!
//! ```text
//! { "trigger": <payload>, "steps": { "<alias>": <output> }, "execution": { ... } }
//! ```
//!
//! Input mappings are JSON templates. A string that is exactly one
//! `{{ path }}` placeholder is replaced by the value at `path` (type kept);
//! placeholders embedded in longer strings are interpolated as text.
//! Unresolvable paths become `null` (or the empty string when interpolated).

use std::cmp::Ordering;

use serde_json::{json, Map, Value};

use crate::domain::{ChainExecution, Condition, Operator};

const STEPS_KEY: &str = "steps";

/// Accumulating variable bag for one run
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    root: Value,
}

impl ExecutionContext {
    /// Fresh context seeded with the trigger payload
    pub fn for_execution(execution: &ChainExecution) -> Self {
        Self {
            root: json!({
                "trigger": execution.trigger_payload,
                "steps": {},
                "execution": {
                    "id": execution.id,
                    "family_id": execution.family_id,
                    "correlation_id": execution.correlation_id,
                },
            }),
        }
    }

    /// Restore a persisted context; `None` if it is not a context object
    pub fn from_value(value: &Value) -> Option<Self> {
        let steps = value.get(STEPS_KEY)?;
        if !steps.is_object() {
            return None;
        }
        Some(Self {
            root: value.clone(),
        })
    }

    /// Merge a succeeded step's output under its alias
    pub fn insert_step_output(&mut self, alias: &str, output: Value) {
        if let Some(steps) = self.root.get_mut(STEPS_KEY).and_then(Value::as_object_mut) {
            steps.insert(alias.to_string(), output);
        }
    }

    pub fn step_output(&self, alias: &str) -> Option<&Value> {
        self.root.get(STEPS_KEY).and_then(|steps| steps.get(alias))
    }

    /// Value at a dot-separated path; numeric segments index arrays
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut current = &self.root;
        for segment in path.split('.').map(str::trim) {
            if segment.is_empty() {
                return None;
            }
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn as_value(&self) -> &Value {
        &self.root
    }

    pub fn into_value(self) -> Value {
        self.root
    }
}

/// Build a step input from its mapping template
pub fn resolve_mappings(mappings: &Value, context: &ExecutionContext) -> Value {
    match mappings {
        Value::String(text) => resolve_string(text, context),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_mappings(item, context))
                .collect(),
        ),
        Value::Object(map) => {
            let resolved: Map<String, Value> = map
                .iter()
                .map(|(key, value)| (key.clone(), resolve_mappings(value, context)))
                .collect();
            Value::Object(resolved)
        }
        other => other.clone(),
    }
}

fn resolve_string(text: &str, context: &ExecutionContext) -> Value {
    let spans = placeholders(text);
    if spans.is_empty() {
        return Value::String(text.to_string());
    }

    // Whole-string placeholder keeps the referenced value's type
    if let [only] = spans.as_slice() {
        if only.start == 0 && only.end == text.len() {
            return context.lookup(only.path).cloned().unwrap_or(Value::Null);
        }
    }

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for span in &spans {
        out.push_str(&text[cursor..span.start]);
        match context.lookup(span.path) {
            Some(Value::String(s)) => out.push_str(s),
            Some(Value::Null) | None => {}
            Some(other) => out.push_str(&other.to_string()),
        }
        cursor = span.end;
    }
    out.push_str(&text[cursor..]);
    Value::String(out)
}

struct Placeholder<'a> {
    start: usize,
    end: usize,
    path: &'a str,
}

fn placeholders(text: &str) -> Vec<Placeholder<'_>> {
    let mut found = Vec::new();
    let mut offset = 0;
    while let Some(open) = text[offset..].find("{{") {
        let start = offset + open;
        let Some(close) = text[start + 2..].find("}}") else {
            break;
        };
        let end = start + 2 + close + 2;
        found.push(Placeholder {
            start,
            end,
            path: text[start + 2..end - 2].trim(),
        });
        offset = end;
    }
    found
}

/// Every context path a mapping template references
pub fn mapping_references(mappings: &Value) -> Vec<String> {
    let mut paths = Vec::new();
    collect_references(mappings, &mut paths);
    paths
}

fn collect_references(value: &Value, paths: &mut Vec<String>) {
    match value {
        Value::String(text) => {
            paths.extend(placeholders(text).into_iter().map(|p| p.path.to_string()));
        }
        Value::Array(items) => items.iter().for_each(|item| collect_references(item, paths)),
        Value::Object(map) => map.values().for_each(|item| collect_references(item, paths)),
        _ => {}
    }
}

/// Alias referenced by a `steps.<alias>...` path
pub fn referenced_step(path: &str) -> Option<&str> {
    let mut segments = path.split('.');
    match (segments.next(), segments.next()) {
        (Some(STEPS_KEY), Some(alias)) if !alias.is_empty() => Some(alias),
        _ => None,
    }
}

/// Top-level trigger field referenced by a `trigger.<field>...` path
pub fn referenced_trigger_field(path: &str) -> Option<&str> {
    let mut segments = path.split('.');
    match (segments.next(), segments.next()) {
        (Some("trigger"), Some(field)) if !field.is_empty() => Some(field),
        _ => None,
    }
}

/// Evaluate a guard against the context
pub fn evaluate(condition: &Condition, context: &ExecutionContext) -> bool {
    match condition {
        Condition::All { all } => all.iter().all(|c| evaluate(c, context)),
        Condition::Any { any } => any.iter().any(|c| evaluate(c, context)),
        Condition::Not { not } => !evaluate(not, context),
        Condition::Compare {
            field,
            operator,
            value,
        } => {
            let actual = context.lookup(field).unwrap_or(&Value::Null);
            let expected = value.as_ref().unwrap_or(&Value::Null);
            compare(actual, *operator, expected)
        }
    }
}

fn compare(actual: &Value, operator: Operator, expected: &Value) -> bool {
    match operator {
        Operator::Exists => !actual.is_null(),
        Operator::Eq => values_equal(actual, expected),
        Operator::Neq => !values_equal(actual, expected),
        Operator::Contains => match actual {
            Value::String(s) => expected.as_str().is_some_and(|needle| s.contains(needle)),
            Value::Array(items) => items.iter().any(|item| values_equal(item, expected)),
            _ => false,
        },
        Operator::Gt => ordering(actual, expected) == Some(Ordering::Greater),
        Operator::Lt => ordering(actual, expected) == Some(Ordering::Less),
        Operator::Gte => matches!(
            ordering(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Operator::Lte => matches!(
            ordering(actual, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn ordering(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
