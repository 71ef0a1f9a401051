use crate::document::{compare_values, get_path};
use crate::error::{CacheError, Result};
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Sort specification: fields are compared in the order given.
#[derive(Debug, Clone, Default)]
pub struct Sort {
    pub fields: Vec<(String, SortOrder)>,
}

impl Sort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn asc(mut self, field: impl Into<String>) -> Self {
        self.fields.push((field.into(), SortOrder::Ascending));
        self
    }

    pub fn desc(mut self, field: impl Into<String>) -> Self {
        self.fields.push((field.into(), SortOrder::Descending));
        self
    }

    /// Parse `{"field": 1, "other": -1}`; `"asc"`/`"desc"` are accepted too.
    pub fn parse(value: &Value) -> Result<Self> {
        let map = value.as_object().ok_or_else(|| {
            CacheError::QuerySyntax(format!("sort must be an object, got {value}"))
        })?;

        let mut sort = Sort::new();
        for (field, order) in map {
            let order = match order {
                Value::Number(n) if n.as_i64() == Some(1) => SortOrder::Ascending,
                Value::Number(n) if n.as_i64() == Some(-1) => SortOrder::Descending,
                Value::String(s) if s == "asc" || s == "ascending" => SortOrder::Ascending,
                Value::String(s) if s == "desc" || s == "descending" => SortOrder::Descending,
                other => {
                    return Err(CacheError::QuerySyntax(format!(
                        "sort value for '{field}' must be 1, -1, 'asc' or 'desc', got {other}"
                    )))
                }
            };
            sort.fields.push((field.clone(), order));
        }
        Ok(sort)
    }

    pub fn parse_str(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| CacheError::QuerySyntax(format!("sort is not valid JSON: {e}")))?;
        Sort::parse(&value)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Compare two documents. Missing fields sort as null.
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        for (field, order) in &self.fields {
            let left = get_path(a, field).unwrap_or(&Value::Null);
            let right = get_path(b, field).unwrap_or(&Value::Null);
            let ord = match order {
                SortOrder::Ascending => compare_values(left, right),
                SortOrder::Descending => compare_values(right, left),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Stable in-place sort.
    pub fn apply(&self, docs: &mut [Value]) {
        if !self.is_empty() {
            docs.sort_by(|a, b| self.compare(a, b));
        }
    }
}
