//! Query language over cached documents.
//!
//! A query is a [`Filter`] plus an optional [`Projection`], [`Sort`], skip
//! and limit, bundled as [`FindOptions`]. The same executor runs against
//! rows read from the on-disk store and against documents fetched straight
//! from the remote source when the cache is bypassed, so both paths return
//! identical shapes.
//!
//! # Dialect
//!
//! - Equality: `{"field": value}`; dotted paths reach into nested objects
//!   and across arrays of objects.
//! - Operators: `$eq $ne $gt $gte $lt $lte $in $nin $exists $regex $options
//!   $not`, combinators `$and $or $nor`. Anything else is a
//!   [`QuerySyntax`](crate::CacheError::QuerySyntax) error.
//! - Range operators only compare values of the same type class.
//! - `$regex` uses the `regex` crate syntax as an unanchored search,
//!   case-sensitive unless `$options` contains `i` (`m`, `s`, `x` are also
//!   accepted).

pub mod filter;
pub mod projection;
pub mod sort;

pub use filter::{CompareOp, Filter};
pub use projection::Projection;
pub use sort::{Sort, SortOrder};

use serde_json::Value;

/// Everything a find needs besides the collection name.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub filter: Filter,
    pub projection: Projection,
    pub sort: Option<Sort>,
    pub skip: usize,
    pub limit: Option<usize>,
}

impl FindOptions {
    pub fn new(filter: Filter) -> Self {
        FindOptions {
            filter,
            ..Default::default()
        }
    }

    /// Parse filter and projection from JSON values in one step.
    pub fn parse(filter: &Value, projection: &Value) -> crate::Result<Self> {
        Ok(FindOptions {
            filter: Filter::parse(filter)?,
            projection: Projection::parse(projection)?,
            ..Default::default()
        })
    }

    pub fn projection(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    pub fn sort(mut self, sort: Sort) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// AND an extra condition into the filter.
    pub fn and_filter(mut self, extra: Filter) -> Self {
        self.filter = std::mem::take(&mut self.filter).and(extra);
        self
    }
}

/// Run a find over documents already in memory. Input order is kept unless
/// a sort is given.
pub fn execute<I>(docs: I, options: &FindOptions) -> Vec<Value>
where
    I: IntoIterator<Item = Value>,
{
    let mut matched: Vec<Value> = docs
        .into_iter()
        .filter(|doc| options.filter.matches(doc))
        .collect();

    if let Some(sort) = &options.sort {
        sort.apply(&mut matched);
    }

    let take = options.limit.unwrap_or(usize::MAX);
    matched
        .into_iter()
        .skip(options.skip)
        .take(take)
        .map(|doc| options.projection.apply(doc))
        .collect()
}

/// Count matching documents without projecting them.
pub fn count<'a, I>(docs: I, filter: &Filter) -> usize
where
    I: IntoIterator<Item = &'a Value>,
{
    docs.into_iter().filter(|doc| filter.matches(doc)).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn devices() -> Vec<Value> {
        vec![
            json!({"id": 1, "uuid": "aaa", "is_online": true, "device_tags": {"Customer": "Mart"}, "cpu_temp": 49}),
            json!({"id": 2, "uuid": "bbb", "is_online": false, "device_tags": {"Customer": "Wada"}, "cpu_temp": 61}),
            json!({"id": 3, "uuid": "ccc", "is_online": true, "device_tags": {"Customer": "Wada"}, "cpu_temp": 55}),
        ]
    }

    #[test]
    fn test_filter_and_project_in_insertion_order() {
        let options = FindOptions::parse(&json!({"is_online": true}), &json!({"uuid": 1})).unwrap();
        let results = execute(devices(), &options);
        assert_eq!(results, vec![json!({"uuid": "aaa"}), json!({"uuid": "ccc"})]);
    }

    #[test]
    fn test_sort_skip_limit() {
        let options = FindOptions::default()
            .sort(Sort::new().desc("cpu_temp"))
            .skip(1)
            .limit(1)
            .projection(Projection::include(["id"]));
        assert_eq!(execute(devices(), &options), vec![json!({"id": 3})]);
    }

    #[test]
    fn test_sort_uses_fields_removed_by_projection() {
        let options = FindOptions::default()
            .sort(Sort::new().asc("cpu_temp"))
            .projection(Projection::include(["uuid"]));
        let uuids: Vec<Value> = execute(devices(), &options)
            .into_iter()
            .map(|d| d["uuid"].clone())
            .collect();
        assert_eq!(uuids, vec![json!("aaa"), json!("ccc"), json!("bbb")]);
    }

    #[test]
    fn test_and_filter_narrows() {
        let options = FindOptions::new(Filter::parse(&json!({"device_tags.Customer": "Wada"})).unwrap())
            .and_filter(Filter::eq("is_online", true));
        let results = execute(devices(), &options);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["uuid"], json!("ccc"));
    }

    #[test]
    fn test_no_match_is_empty_not_error() {
        let options = FindOptions::new(Filter::eq("uuid", "zzz"));
        assert!(execute(devices(), &options).is_empty());
        assert_eq!(count(&devices(), &Filter::eq("is_online", true)), 2);
    }
}
