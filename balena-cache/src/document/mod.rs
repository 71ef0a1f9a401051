// Document values - path lookup, primary keys, canonical ordering

use serde_json::Value;
use std::cmp::Ordering;

/// A cached document. Always a JSON object at the top level; field order is
/// preserved as received from the remote source.
pub type Document = Value;

/// Name of the primary key field shared by every cached collection.
pub const PRIMARY_KEY: &str = "id";

/// Extract the primary key of a document as its canonical text form.
/// Numbers and strings are accepted; anything else has no key.
pub fn primary_key(doc: &Value) -> Option<String> {
    doc.get(PRIMARY_KEY).and_then(key_text)
}

/// Canonical text form of a key value: `42` and `"42"` are distinct documents
/// in the remote API, but never coexist in one collection, so both map to "42".
pub fn key_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Resolve a dotted path against a document, traversing arrays the way a
/// document database does: `tags.key` on `{"tags": [{"key": 1}, {"key": 2}]}`
/// yields both `1` and `2`. Numeric segments also index into arrays.
pub fn resolve_path<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
    let parts: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    resolve_parts(doc, &parts, &mut out);
    out
}

fn resolve_parts<'a>(value: &'a Value, parts: &[&str], out: &mut Vec<&'a Value>) {
    let Some((head, rest)) = parts.split_first() else {
        out.push(value);
        return;
    };

    match value {
        Value::Object(map) => {
            if let Some(child) = map.get(*head) {
                resolve_parts(child, rest, out);
            }
        }
        Value::Array(items) => {
            if let Ok(index) = head.parse::<usize>() {
                if let Some(item) = items.get(index) {
                    resolve_parts(item, rest, out);
                }
            }
            for item in items {
                if item.is_object() {
                    resolve_parts(item, parts, out);
                }
            }
        }
        _ => {}
    }
}

/// Follow a dotted path through nested objects only. Used for sort keys,
/// where a single value per document is required.
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |current, part| match current {
        Value::Object(map) => map.get(part),
        Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Rank of a value's type class in the canonical ordering:
/// null < numbers < strings < objects < arrays < booleans.
pub fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// True when both values belong to the same type class, i.e. range
/// operators may compare them.
pub fn same_class(a: &Value, b: &Value) -> bool {
    type_rank(a) == type_rank(b)
}

/// Total order over document values. Numbers compare by numeric value
/// regardless of integer or float representation; strings by code point;
/// objects field by field in stored order; arrays element-wise.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }

    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => compare_numbers(x, y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare_values(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y.iter()) {
                let ord = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

fn compare_numbers(x: &serde_json::Number, y: &serde_json::Number) -> Ordering {
    if let (Some(a), Some(b)) = (x.as_i64(), y.as_i64()) {
        return a.cmp(&b);
    }
    if let (Some(a), Some(b)) = (x.as_u64(), y.as_u64()) {
        return a.cmp(&b);
    }
    let a = x.as_f64().unwrap_or(f64::NAN);
    let b = y.as_f64().unwrap_or(f64::NAN);
    a.total_cmp(&b)
}

/// Structural equality with numeric normalisation (`1 == 1.0`).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    compare_values(a, b) == Ordering::Equal
}
