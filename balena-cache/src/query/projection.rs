//! Field projections.

use crate::error::{CacheError, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Include,
    Exclude,
}

/// A set of dotted paths to keep or drop.
#[derive(Debug, Clone, Default)]
pub struct Projection {
    mode: Option<Mode>,
    tree: PathTree,
}

#[derive(Debug, Clone, Default)]
struct PathTree {
    children: BTreeMap<String, PathNode>,
}

#[derive(Debug, Clone)]
enum PathNode {
    Leaf,
    Branch(PathTree),
}

impl PathTree {
    fn insert(&mut self, path: &str) {
        let mut node = self;
        let mut parts = path.split('.').peekable();
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                node.children.insert(part.to_string(), PathNode::Leaf);
                return;
            }
            let entry = node
                .children
                .entry(part.to_string())
                .or_insert_with(|| PathNode::Branch(PathTree::default()));
            match entry {
                // A shorter path already covers this one
                PathNode::Leaf => return,
                PathNode::Branch(tree) => node = tree,
            }
        }
    }
}

impl Projection {
    /// The identity projection.
    pub fn all() -> Self {
        Projection::default()
    }

    /// Keep only the given paths.
    pub fn include<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::build(Mode::Include, paths)
    }

    /// Drop the given paths.
    pub fn exclude<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::build(Mode::Exclude, paths)
    }

    fn build<I, S>(mode: Mode, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut tree = PathTree::default();
        for path in paths {
            tree.insert(path.as_ref());
        }
        let mode = if tree.children.is_empty() { None } else { Some(mode) };
        Projection { mode, tree }
    }

    /// Parse `{"field": 1, "nested.field": 1}` or `{"field": 0}`.
    /// `_id` is ignored: cached documents never carry one.
    pub fn parse(value: &Value) -> Result<Self> {
        let map = match value {
            Value::Null => return Ok(Projection::all()),
            Value::Object(map) => map,
            other => {
                return Err(CacheError::QuerySyntax(format!(
                    "projection must be an object, got {other}"
                )))
            }
        };

        let mut include = Vec::new();
        let mut exclude = Vec::new();
        for (path, flag) in map {
            if path == "_id" {
                continue;
            }
            if path.is_empty() || path.starts_with('$') {
                return Err(CacheError::QuerySyntax(format!(
                    "invalid projection path '{path}'"
                )));
            }
            let keep = match flag {
                Value::Bool(b) => *b,
                Value::Number(n) if n.as_i64() == Some(1) => true,
                Value::Number(n) if n.as_i64() == Some(0) => false,
                other => {
                    return Err(CacheError::QuerySyntax(format!(
                        "projection value for '{path}' must be 0, 1, true or false, got {other}"
                    )))
                }
            };
            if keep {
                include.push(path.as_str());
            } else {
                exclude.push(path.as_str());
            }
        }

        match (include.is_empty(), exclude.is_empty()) {
            (true, true) => Ok(Projection::all()),
            (false, true) => Ok(Projection::include(include)),
            (true, false) => Ok(Projection::exclude(exclude)),
            (false, false) => Err(CacheError::QuerySyntax(
                "projection cannot mix inclusion and exclusion".to_string(),
            )),
        }
    }

    /// Parse a projection from JSON text.
    pub fn parse_str(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text).map_err(|e| {
            CacheError::QuerySyntax(format!("projection is not valid JSON: {e}"))
        })?;
        Projection::parse(&value)
    }

    pub fn is_all(&self) -> bool {
        self.mode.is_none()
    }

    /// Apply the projection to one document.
    pub fn apply(&self, doc: Value) -> Value {
        match self.mode {
            None => doc,
            Some(Mode::Include) => match doc {
                Value::Object(map) => Value::Object(include_object(&map, &self.tree)),
                other => other,
            },
            Some(Mode::Exclude) => {
                let mut doc = doc;
                exclude_in(&mut doc, &self.tree);
                doc
            }
        }
    }
}

fn include_object(map: &Map<String, Value>, tree: &PathTree) -> Map<String, Value> {
    let mut out = Map::new();
    // Iterate the document, not the tree, so field order is preserved
    for (key, value) in map {
        match tree.children.get(key) {
            Some(PathNode::Leaf) => {
                out.insert(key.clone(), value.clone());
            }
            Some(PathNode::Branch(sub)) => {
                if let Some(projected) = include_nested(value, sub) {
                    out.insert(key.clone(), projected);
                }
            }
            None => {}
        }
    }
    out
}

fn include_nested(value: &Value, tree: &PathTree) -> Option<Value> {
    match value {
        Value::Object(map) => Some(Value::Object(include_object(map, tree))),
        Value::Array(items) => Some(Value::Array(
            items.iter().filter_map(|item| include_nested(item, tree)).collect(),
        )),
        _ => None,
    }
}

fn exclude_in(value: &mut Value, tree: &PathTree) {
    match value {
        Value::Object(map) => {
            for (key, node) in &tree.children {
                match node {
                    PathNode::Leaf => {
                        map.shift_remove(key);
                    }
                    PathNode::Branch(sub) => {
                        if let Some(child) = map.get_mut(key) {
                            exclude_in(child, sub);
                        }
                    }
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                exclude_in(item, tree);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn device() -> Value {
        json!({
            "id": 6984936,
            "uuid": "107d9719651cdc7c53040eda1ba3f352",
            "device_name": "Wilcox Lane 8",
            "belongs_to__application": { "__id": 1803989 },
            "is_online": true,
            "device_tags": { "Customer": "Mart", "Plant": "Rupert" },
            "services": [ { "name": "api", "status": "Running" }, "raw" ],
        })
    }

    #[test]
    fn test_inclusion_keeps_only_listed_fields() {
        let projection = Projection::parse(&json!({"uuid": 1})).unwrap();
        assert_eq!(
            projection.apply(device()),
            json!({"uuid": "107d9719651cdc7c53040eda1ba3f352"})
        );
    }

    #[test]
    fn test_inclusion_of_nested_path() {
        let projection =
            Projection::parse(&json!({"belongs_to__application.__id": 1, "device_name": true}))
                .unwrap();
        assert_eq!(
            projection.apply(device()),
            json!({
                "device_name": "Wilcox Lane 8",
                "belongs_to__application": { "__id": 1803989 },
            })
        );
    }

    #[test]
    fn test_inclusion_through_arrays_drops_scalars() {
        let projection = Projection::include(["services.name"]);
        assert_eq!(
            projection.apply(device()),
            json!({"services": [{"name": "api"}]})
        );
    }

    #[test]
    fn test_exclusion_removes_paths() {
        let projection = Projection::parse(&json!({"device_tags.Plant": 0, "services": 0})).unwrap();
        let projected = projection.apply(device());
        assert_eq!(projected["device_tags"], json!({"Customer": "Mart"}));
        assert!(projected.get("services").is_none());
        assert_eq!(projected["uuid"], json!("107d9719651cdc7c53040eda1ba3f352"));
    }

    #[test]
    fn test_field_order_is_preserved() {
        let projection = Projection::include(["is_online", "uuid", "id"]);
        let projected = projection.apply(device());
        let keys: Vec<&String> = projected.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["id", "uuid", "is_online"]);
    }

    #[test]
    fn test_empty_and_id_only_projection_is_identity() {
        assert!(Projection::parse(&json!({})).unwrap().is_all());
        assert!(Projection::parse(&json!({"_id": 0})).unwrap().is_all());
        assert_eq!(Projection::all().apply(device()), device());
    }

    #[test]
    fn test_invalid_projections() {
        for bad in [
            json!({"uuid": 1, "device_name": 0}),
            json!({"uuid": 2}),
            json!({"uuid": "yes"}),
            json!({"$slice": 1}),
            json!(["uuid"]),
        ] {
            assert!(Projection::parse(&bad).unwrap_err().is_query_syntax());
        }
    }
}
