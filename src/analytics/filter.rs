//! Bool filter evaluation against raw analytics events.
//!
//! Filters use the search-engine bool shape:
//! `{ "filter": [..], "must": [..], "should": [..], "must_not": [..] }`
//! with `term`, `terms`, `prefix`, `exists`, `range` and nested `bool`
//! clauses. Field paths are dotted (`attributes.url`); a trailing `.keyword`
//! is ignored since events are matched as stored.

use serde_json::{json, Value};

use crate::error::{AbTestError, Result};

const SECTIONS: [&str; 4] = ["filter", "must", "should", "must_not"];

/// Check that `filter` is a bool filter object with only known sections,
/// each holding a clause object or an array of clause objects.
pub fn validate_bool_filter(filter: &Value) -> Result<()> {
    let obj = filter
        .as_object()
        .ok_or_else(|| AbTestError::InvalidConfig("bool filter must be an object".to_string()))?;
    for (section, clauses) in obj {
        if !SECTIONS.contains(&section.as_str()) {
            return Err(AbTestError::InvalidConfig(format!(
                "unknown bool filter section '{}'",
                section
            )));
        }
        for clause in clause_list(clauses) {
            if !clause.is_object() {
                return Err(AbTestError::InvalidConfig(format!(
                    "clauses in '{}' must be objects",
                    section
                )));
            }
        }
    }
    Ok(())
}

/// Evaluate a bool filter against one event document.
pub fn matches(filter: &Value, doc: &Value) -> Result<bool> {
    validate_bool_filter(filter)?;
    let section = |name: &str| filter.get(name).map(clause_list).unwrap_or_default();

    let required: Vec<&Value> = section("filter").into_iter().chain(section("must")).collect();
    for clause in &required {
        if !clause_matches(clause, doc)? {
            return Ok(false);
        }
    }
    for clause in section("must_not") {
        if clause_matches(clause, doc)? {
            return Ok(false);
        }
    }
    let should = section("should");
    if !should.is_empty() && required.is_empty() {
        for clause in should {
            if clause_matches(clause, doc)? {
                return Ok(true);
            }
        }
        return Ok(false);
    }
    Ok(true)
}

fn clause_list(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

fn clause_matches(clause: &Value, doc: &Value) -> Result<bool> {
    let obj = clause
        .as_object()
        .ok_or_else(|| AbTestError::InvalidConfig("filter clause must be an object".to_string()))?;
    let (kind, body) = match obj.iter().next() {
        Some(entry) if obj.len() == 1 => entry,
        _ => {
            return Err(AbTestError::InvalidConfig(
                "filter clause must have exactly one key".to_string(),
            ))
        }
    };

    match kind.as_str() {
        "bool" => matches(body, doc),
        "exists" => {
            let field = body.get("field").and_then(Value::as_str).ok_or_else(|| {
                AbTestError::InvalidConfig("exists clause requires a field".to_string())
            })?;
            Ok(lookup(doc, field).is_some_and(|v| !v.is_null()))
        }
        "term" => {
            let (field, expected) = single_field(kind, body)?;
            let expected = expected.get("value").unwrap_or(expected);
            Ok(lookup(doc, field).is_some_and(|actual| same_term(actual, expected)))
        }
        "terms" => {
            let (field, expected) = single_field(kind, body)?;
            let options = expected.as_array().ok_or_else(|| {
                AbTestError::InvalidConfig("terms clause requires an array".to_string())
            })?;
            Ok(lookup(doc, field)
                .is_some_and(|actual| options.iter().any(|o| same_term(actual, o))))
        }
        "prefix" => {
            let (field, expected) = single_field(kind, body)?;
            let expected = expected.get("value").unwrap_or(expected);
            let prefix = expected.as_str().ok_or_else(|| {
                AbTestError::InvalidConfig("prefix clause requires a string".to_string())
            })?;
            Ok(lookup(doc, field)
                .and_then(term_string)
                .is_some_and(|actual| actual.starts_with(prefix)))
        }
        "range" => {
            let (field, bounds) = single_field(kind, body)?;
            let Some(actual) = lookup(doc, field).and_then(as_number) else {
                return Ok(false);
            };
            let bounds = bounds.as_object().ok_or_else(|| {
                AbTestError::InvalidConfig("range clause requires bounds".to_string())
            })?;
            for (op, bound) in bounds {
                let bound = as_number(bound).ok_or_else(|| {
                    AbTestError::InvalidConfig(format!("range bound '{}' is not a number", op))
                })?;
                let ok = match op.as_str() {
                    "gt" => actual > bound,
                    "gte" => actual >= bound,
                    "lt" => actual < bound,
                    "lte" => actual <= bound,
                    other => {
                        return Err(AbTestError::InvalidConfig(format!(
                            "unknown range operator '{}'",
                            other
                        )))
                    }
                };
                if !ok {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        other => Err(AbTestError::InvalidConfig(format!(
            "unsupported filter clause '{}'",
            other
        ))),
    }
}

fn single_field<'a>(kind: &str, body: &'a Value) -> Result<(&'a str, &'a Value)> {
    match body.as_object() {
        Some(obj) if obj.len() == 1 => {
            let (field, value) = obj.iter().next().ok_or_else(|| {
                AbTestError::InvalidConfig(format!("{} clause requires a field", kind))
            })?;
            Ok((field.as_str(), value))
        }
        _ => Err(AbTestError::InvalidConfig(format!(
            "{} clause must name exactly one field",
            kind
        ))),
    }
}

/// Resolve a dotted path, ignoring a trailing `.keyword` sub-field.
fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.strip_suffix(".keyword").unwrap_or(path);
    if let Some(direct) = doc.get(path) {
        return Some(direct);
    }
    // Attribute names may contain dots, so the whole path is tried before descending.
    let (head, rest) = path.split_once('.')?;
    lookup(doc.get(head)?, rest)
}

fn term_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn same_term(actual: &Value, expected: &Value) -> bool {
    match (as_number(actual), as_number(expected)) {
        (Some(a), Some(b)) => a == b,
        _ => term_string(actual).is_some() && term_string(actual) == term_string(expected),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Copy of a bool filter with extra clauses appended to its `filter` section.
pub fn with_clauses(base: &Value, clauses: Vec<Value>) -> Value {
    let mut merged = base.clone();
    if !merged.is_object() {
        merged = json!({});
    }
    let existing = match merged.get("filter") {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Null) | None => Vec::new(),
        Some(single) => vec![single.clone()],
    };
    let mut all = existing;
    all.extend(clauses);
    merged["filter"] = Value::Array(all);
    merged
}
