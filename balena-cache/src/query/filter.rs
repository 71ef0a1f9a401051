//! Filter expressions.
//!
//! Filters are written as JSON documents in the familiar document-database
//! style (`{"is_online": true, "cpu_temp": {"$gt": 60}}`) and parsed into a
//! closed [`Filter`] tree. Parsing is where every syntax problem surfaces;
//! evaluation never fails.

use crate::document::{resolve_path, same_class, values_equal};
use crate::error::{CacheError, Result};
use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Range and equality operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// A parsed filter.
#[derive(Debug, Clone)]
pub enum Filter {
    /// Matches every document (`{}`).
    All,
    Compare {
        field: String,
        op: CompareOp,
        value: Value,
    },
    In {
        field: String,
        values: Vec<Value>,
    },
    Nin {
        field: String,
        values: Vec<Value>,
    },
    Exists {
        field: String,
        exists: bool,
    },
    Regex {
        field: String,
        regex: Regex,
    },
    /// Field-level `$not`: the wrapped condition must not hold.
    Not(Box<Filter>),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Nor(Vec<Filter>),
}

impl Filter {
    /// Parse a filter from a JSON value. `null` and `{}` both match everything.
    pub fn parse(value: &Value) -> Result<Filter> {
        match value {
            Value::Null => Ok(Filter::All),
            Value::Object(map) => parse_document(map),
            other => Err(syntax(format!("filter must be an object, got {other}"))),
        }
    }

    /// Parse a filter from JSON text.
    pub fn parse_str(text: &str) -> Result<Filter> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| syntax(format!("filter is not valid JSON: {e}")))?;
        Filter::parse(&value)
    }

    /// Equality on a (possibly dotted) field.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Filter {
        Filter::Compare {
            field: field.into(),
            op: CompareOp::Eq,
            value: value.into(),
        }
    }

    /// Conjunction of `self` and `other`, flattening trivial cases.
    pub fn and(self, other: Filter) -> Filter {
        match (self, other) {
            (Filter::All, f) | (f, Filter::All) => f,
            (Filter::And(mut left), Filter::And(right)) => {
                left.extend(right);
                Filter::And(left)
            }
            (Filter::And(mut left), f) => {
                left.push(f);
                Filter::And(left)
            }
            (f, right) => Filter::And(vec![f, right]),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Filter::All)
    }

    /// Evaluate the filter against a document.
    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Filter::All => true,
            Filter::Compare { field, op, value } => {
                let found = resolve_path(doc, field);
                match op {
                    CompareOp::Eq => equals_any(&found, value),
                    CompareOp::Ne => !equals_any(&found, value),
                    CompareOp::Gt => range_any(&found, value, |o| o == Ordering::Greater),
                    CompareOp::Gte => range_any(&found, value, |o| o != Ordering::Less),
                    CompareOp::Lt => range_any(&found, value, |o| o == Ordering::Less),
                    CompareOp::Lte => range_any(&found, value, |o| o != Ordering::Greater),
                }
            }
            Filter::In { field, values } => {
                let found = resolve_path(doc, field);
                values.iter().any(|v| equals_any(&found, v))
            }
            Filter::Nin { field, values } => {
                let found = resolve_path(doc, field);
                !values.iter().any(|v| equals_any(&found, v))
            }
            Filter::Exists { field, exists } => !resolve_path(doc, field).is_empty() == *exists,
            Filter::Regex { field, regex } => expand(&resolve_path(doc, field))
                .into_iter()
                .any(|v| v.as_str().map(|s| regex.is_match(s)).unwrap_or(false)),
            Filter::Not(inner) => !inner.matches(doc),
            Filter::And(filters) => filters.iter().all(|f| f.matches(doc)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(doc)),
            Filter::Nor(filters) => !filters.iter().any(|f| f.matches(doc)),
        }
    }
}

impl Default for Filter {
    fn default() -> Self {
        Filter::All
    }
}

fn syntax(msg: impl Into<String>) -> CacheError {
    CacheError::QuerySyntax(msg.into())
}

fn parse_document(map: &Map<String, Value>) -> Result<Filter> {
    let mut terms = Vec::with_capacity(map.len());

    for (key, value) in map {
        let term = if let Some(op) = key.strip_prefix('$') {
            parse_logical(op, value)?
        } else {
            parse_field(key, value)?
        };
        terms.push(term);
    }

    Ok(match terms.len() {
        0 => Filter::All,
        1 => terms.remove(0),
        _ => Filter::And(terms),
    })
}

fn parse_logical(op: &str, value: &Value) -> Result<Filter> {
    let items = value
        .as_array()
        .ok_or_else(|| syntax(format!("${op} must be an array")))?;
    if items.is_empty() {
        return Err(syntax(format!("${op} must be a non-empty array")));
    }
    let filters = items.iter().map(Filter::parse).collect::<Result<Vec<_>>>()?;

    match op {
        "and" => Ok(Filter::And(filters)),
        "or" => Ok(Filter::Or(filters)),
        "nor" => Ok(Filter::Nor(filters)),
        _ => Err(syntax(format!("unsupported operator ${op}"))),
    }
}

fn parse_field(field: &str, value: &Value) -> Result<Filter> {
    if field.is_empty() {
        return Err(syntax("empty field name"));
    }

    let Value::Object(ops) = value else {
        return Ok(Filter::eq(field, value.clone()));
    };

    let dollar_keys = ops.keys().filter(|k| k.starts_with('$')).count();
    if dollar_keys == 0 {
        // Literal sub-document equality
        return Ok(Filter::eq(field, value.clone()));
    }
    if dollar_keys != ops.len() {
        return Err(syntax(format!(
            "field '{field}' mixes operators and plain keys"
        )));
    }

    parse_operators(field, ops)
}

fn parse_operators(field: &str, ops: &Map<String, Value>) -> Result<Filter> {
    let mut terms = Vec::with_capacity(ops.len());
    let options = match ops.get("$options") {
        Some(Value::String(s)) => Some(s.as_str()),
        Some(_) => return Err(syntax("$options must be a string")),
        None => None,
    };
    if options.is_some() && !ops.contains_key("$regex") {
        return Err(syntax("$options requires $regex"));
    }

    for (op, operand) in ops {
        let term = match op.as_str() {
            "$eq" => compare(field, CompareOp::Eq, operand),
            "$ne" => compare(field, CompareOp::Ne, operand),
            "$gt" => compare(field, CompareOp::Gt, operand),
            "$gte" => compare(field, CompareOp::Gte, operand),
            "$lt" => compare(field, CompareOp::Lt, operand),
            "$lte" => compare(field, CompareOp::Lte, operand),
            "$in" => Filter::In {
                field: field.to_string(),
                values: set_operand("$in", operand)?,
            },
            "$nin" => Filter::Nin {
                field: field.to_string(),
                values: set_operand("$nin", operand)?,
            },
            "$exists" => Filter::Exists {
                field: field.to_string(),
                exists: operand
                    .as_bool()
                    .ok_or_else(|| syntax("$exists must be a boolean"))?,
            },
            "$regex" => {
                let pattern = operand
                    .as_str()
                    .ok_or_else(|| syntax("$regex must be a string"))?;
                Filter::Regex {
                    field: field.to_string(),
                    regex: compile_regex(pattern, options)?,
                }
            }
            "$options" => continue,
            "$not" => match operand {
                Value::Object(inner) if !inner.is_empty() && inner.keys().all(|k| k.starts_with('$')) => {
                    Filter::Not(Box::new(parse_operators(field, inner)?))
                }
                Value::String(pattern) => Filter::Not(Box::new(Filter::Regex {
                    field: field.to_string(),
                    regex: compile_regex(pattern, None)?,
                })),
                _ => return Err(syntax("$not must be an operator document or a regex")),
            },
            other => return Err(syntax(format!("unsupported operator {other}"))),
        };
        terms.push(term);
    }

    Ok(match terms.len() {
        1 => terms.remove(0),
        _ => Filter::And(terms),
    })
}

fn compare(field: &str, op: CompareOp, operand: &Value) -> Filter {
    Filter::Compare {
        field: field.to_string(),
        op,
        value: operand.clone(),
    }
}

fn set_operand(op: &str, operand: &Value) -> Result<Vec<Value>> {
    operand
        .as_array()
        .cloned()
        .ok_or_else(|| syntax(format!("{op} must be an array")))
}

/// Compile a pattern in the `regex` crate dialect. Matching is an
/// unanchored search and case-sensitive unless `i` is given.
pub fn compile_regex(pattern: &str, options: Option<&str>) -> Result<Regex> {
    let mut builder = RegexBuilder::new(pattern);
    for flag in options.unwrap_or("").chars() {
        match flag {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            other => return Err(syntax(format!("unsupported regex option '{other}'"))),
        };
    }
    builder
        .build()
        .map_err(|e| syntax(format!("invalid regex '{pattern}': {e}")))
}

/// Resolved values plus the elements of any resolved arrays.
fn expand<'a>(found: &[&'a Value]) -> Vec<&'a Value> {
    let mut out = Vec::with_capacity(found.len());
    for value in found {
        out.push(*value);
        if let Value::Array(items) = value {
            out.extend(items.iter());
        }
    }
    out
}

fn equals_any(found: &[&Value], target: &Value) -> bool {
    if found.is_empty() {
        // A missing field equals null
        return target.is_null();
    }
    expand(found).into_iter().any(|v| values_equal(v, target))
}

fn range_any(found: &[&Value], target: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    expand(found)
        .into_iter()
        .filter(|v| same_class(v, target))
        .any(|v| accept(crate::document::compare_values(v, target)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn device(name: &str, online: bool, temp: i64, customer: &str) -> Value {
        json!({
            "id": temp,
            "device_name": name,
            "is_online": online,
            "cpu_temp": temp,
            "device_tags": { "Customer": customer },
            "ip_address": ["10.0.0.1", "192.168.1.4"],
        })
    }

    fn matches(filter: Value, doc: &Value) -> bool {
        Filter::parse(&filter).unwrap().matches(doc)
    }

    #[test]
    fn test_empty_filter_matches_all() {
        let doc = device("a", true, 40, "Mart");
        assert!(matches(json!({}), &doc));
        assert!(Filter::parse(&Value::Null).unwrap().is_all());
    }

    #[test]
    fn test_equality_and_nested_field() {
        let doc = device("Wilcox Lane 8", true, 49, "Wada");
        assert!(matches(json!({"is_online": true}), &doc));
        assert!(!matches(json!({"is_online": false}), &doc));
        assert!(matches(json!({"device_tags.Customer": "Wada"}), &doc));
        assert!(!matches(json!({"device_tags.Customer": "Mart"}), &doc));
    }

    #[test]
    fn test_equality_against_array_elements() {
        let doc = device("a", true, 40, "Mart");
        assert!(matches(json!({"ip_address": "192.168.1.4"}), &doc));
        assert!(matches(json!({"ip_address": ["10.0.0.1", "192.168.1.4"]}), &doc));
        assert!(!matches(json!({"ip_address": "127.0.0.1"}), &doc));
    }

    #[test]
    fn test_missing_field_equals_null() {
        let doc = device("a", true, 40, "Mart");
        assert!(matches(json!({"note": null}), &doc));
        assert!(!matches(json!({"note": {"$ne": null}}), &doc));
        assert!(matches(json!({"device_name": {"$ne": null}}), &doc));
    }

    #[test]
    fn test_range_operators_are_type_aware() {
        let doc = device("a", true, 49, "Mart");
        assert!(matches(json!({"cpu_temp": {"$gt": 40}}), &doc));
        assert!(matches(json!({"cpu_temp": {"$gte": 49.0}}), &doc));
        assert!(!matches(json!({"cpu_temp": {"$lt": 49}}), &doc));
        assert!(matches(json!({"cpu_temp": {"$gt": 40, "$lte": 50}}), &doc));
        // A string never compares against a number
        assert!(!matches(json!({"cpu_temp": {"$gt": "10"}}), &doc));
        assert!(!matches(json!({"cpu_temp": {"$lt": "10"}}), &doc));
        assert!(matches(json!({"device_name": {"$lt": "b"}}), &doc));
    }

    #[test]
    fn test_in_and_nin() {
        let doc = device("a", true, 49, "Mart");
        assert!(matches(json!({"device_tags.Customer": {"$in": ["Mart", "Wada"]}}), &doc));
        assert!(!matches(json!({"device_tags.Customer": {"$nin": ["Mart"]}}), &doc));
        assert!(matches(json!({"device_tags.Plant": {"$in": [null]}}), &doc));
    }

    #[test]
    fn test_exists() {
        let doc = device("a", true, 49, "Mart");
        assert!(matches(json!({"device_tags.Customer": {"$exists": true}}), &doc));
        assert!(matches(json!({"device_tags.Plant": {"$exists": false}}), &doc));
    }

    #[test]
    fn test_regex_dialect() {
        let doc = device("SVW-CB-12", true, 49, "Mart");
        assert!(matches(json!({"device_name": {"$regex": "SVW-CB.*"}}), &doc));
        // Unanchored search
        assert!(matches(json!({"device_name": {"$regex": "CB"}}), &doc));
        assert!(!matches(json!({"device_name": {"$regex": "^CB"}}), &doc));
        // Case-sensitive unless `i`
        assert!(!matches(json!({"device_name": {"$regex": "svw"}}), &doc));
        assert!(matches(json!({"device_name": {"$regex": "svw", "$options": "i"}}), &doc));
        // Matches string elements of arrays, never numbers
        assert!(matches(json!({"ip_address": {"$regex": "^192\\."}}), &doc));
        assert!(!matches(json!({"cpu_temp": {"$regex": "49"}}), &doc));
    }

    #[test]
    fn test_logical_operators() {
        let doc = device("a", true, 49, "Mart");
        assert!(matches(
            json!({"$or": [{"is_online": false}, {"device_tags.Customer": "Mart"}]}),
            &doc
        ));
        assert!(!matches(
            json!({"$and": [{"is_online": true}, {"device_tags.Customer": "Wada"}]}),
            &doc
        ));
        assert!(matches(json!({"$nor": [{"is_online": false}]}), &doc));
        assert!(matches(json!({"cpu_temp": {"$not": {"$gt": 60}}}), &doc));
        assert!(!matches(json!({"device_name": {"$not": "^a$"}}), &doc));
    }

    #[test]
    fn test_unknown_operators_are_syntax_errors() {
        for bad in [
            json!({"$where": "1"}),
            json!({"cpu_temp": {"$near": 3}}),
            json!({"cpu_temp": {"$gt": 3, "plain": 1}}),
            json!({"$or": []}),
            json!({"$and": {"a": 1}}),
            json!({"tags": {"$in": "Mart"}}),
            json!({"tags": {"$exists": 1}}),
            json!({"name": {"$regex": "("}}),
            json!({"name": {"$regex": "a", "$options": "q"}}),
            json!({"name": {"$options": "i"}}),
            json!([1, 2]),
        ] {
            let err = Filter::parse(&bad).unwrap_err();
            assert!(err.is_query_syntax(), "expected syntax error for {bad}");
        }
    }

    #[test]
    fn test_and_combinator_flattens() {
        let combined = Filter::All.and(Filter::eq("a", 1));
        assert!(matches!(combined, Filter::Compare { .. }));

        let combined = Filter::eq("a", 1).and(Filter::eq("b", 2)).and(Filter::eq("c", 3));
        match combined {
            Filter::And(terms) => assert_eq!(terms.len(), 3),
            other => panic!("expected And, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_str() {
        let filter = Filter::parse_str(r#"{"is_online": true}"#).unwrap();
        assert!(filter.matches(&json!({"is_online": true})));
        assert!(Filter::parse_str("{not json").unwrap_err().is_query_syntax());
    }
}
