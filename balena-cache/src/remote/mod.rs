//! Loading collections from the fleet-management API.

pub mod balena;

use std::collections::HashMap;
use std::fmt;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::cache::key::{CollectionKind, FleetScope};
use crate::document::{key_text, primary_key};

pub use balena::BalenaApi;

/// Where a remote failure came from. The cache never branches on this;
/// it is for callers and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    Network,
    Auth,
    RateLimited,
    Status,
    Decode,
    Scope,
    /// The source itself failed, e.g. panicked.
    Internal,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RemoteErrorKind::Network => "network",
            RemoteErrorKind::Auth => "auth",
            RemoteErrorKind::RateLimited => "rate limited",
            RemoteErrorKind::Status => "status",
            RemoteErrorKind::Decode => "decode",
            RemoteErrorKind::Scope => "scope",
            RemoteErrorKind::Internal => "internal",
        };
        f.write_str(text)
    }
}

/// Failure reported by a [`RemoteSource`]. Cloneable so one failed refresh
/// can be handed to every caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        RemoteError {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Network, message)
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Decode, message)
    }

    pub fn scope(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Scope, message)
    }
}

/// Source of full collection contents.
///
/// `scope` is `Some` only for partitioned collections (releases); a source
/// must return every document of the requested collection or partition.
pub trait RemoteSource: Send + Sync {
    fn load(
        &self,
        collection: CollectionKind,
        scope: Option<&FleetScope>,
    ) -> Result<Vec<Value>, RemoteError>;
}

impl<T: RemoteSource + ?Sized> RemoteSource for std::sync::Arc<T> {
    fn load(
        &self,
        collection: CollectionKind,
        scope: Option<&FleetScope>,
    ) -> Result<Vec<Value>, RemoteError> {
        (**self).load(collection, scope)
    }
}

impl<T: RemoteSource + ?Sized> RemoteSource for Box<T> {
    fn load(
        &self,
        collection: CollectionKind,
        scope: Option<&FleetScope>,
    ) -> Result<Vec<Value>, RemoteError> {
        (**self).load(collection, scope)
    }
}

/// Id referenced by a navigation field, either `{"__id": n}` or a bare id.
fn owner_id(link: &Value) -> Option<String> {
    match link {
        Value::Object(map) => map.get("__id").and_then(key_text),
        other => key_text(other),
    }
}

/// Merge tag records into their owning documents.
///
/// Each tag looks like `{"<owner_field>": {"__id": 7}, "tag_key": "k",
/// "value": "v"}` and ends up as `doc[target_field]["k"] = "v"` on the
/// document whose `id` is 7. Tags whose owner is not in `docs` are dropped.
pub fn attach_tags(docs: &mut [Value], tags: &[Value], owner_field: &str, target_field: &str) {
    let index: HashMap<String, usize> = docs
        .iter()
        .enumerate()
        .filter_map(|(i, doc)| primary_key(doc).map(|id| (id, i)))
        .collect();

    for tag in tags {
        let Some(owner) = tag.get(owner_field).and_then(owner_id) else {
            continue;
        };
        let Some(&slot) = index.get(&owner) else {
            continue;
        };
        let Some(tag_key) = tag.get("tag_key").and_then(Value::as_str) else {
            continue;
        };
        let value = tag.get("value").cloned().unwrap_or(Value::Null);

        let Value::Object(doc) = &mut docs[slot] else {
            continue;
        };
        let entry = doc
            .entry(target_field.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(target) = entry {
            target.insert(tag_key.to_string(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_attach_device_tags() {
        let mut devices = vec![
            json!({"id": 10, "uuid": "aaa"}),
            json!({"id": 11, "uuid": "bbb"}),
        ];
        let tags = vec![
            json!({"device": {"__id": 10}, "tag_key": "Customer", "value": "Mart"}),
            json!({"device": {"__id": 10}, "tag_key": "Plant", "value": "Rupert"}),
            json!({"device": {"__id": 99}, "tag_key": "Customer", "value": "Ghost"}),
            json!({"device": 11, "tag_key": "Customer", "value": "Wada"}),
        ];
        attach_tags(&mut devices, &tags, "device", "device_tags");

        assert_eq!(
            devices,
            vec![
                json!({"id": 10, "uuid": "aaa", "device_tags": {"Customer": "Mart", "Plant": "Rupert"}}),
                json!({"id": 11, "uuid": "bbb", "device_tags": {"Customer": "Wada"}}),
            ]
        );
    }

    #[test]
    fn test_untagged_documents_are_untouched() {
        let mut releases = vec![json!({"id": 1, "commit": "abc"})];
        attach_tags(&mut releases, &[], "release", "release_tags");
        assert_eq!(releases, vec![json!({"id": 1, "commit": "abc"})]);
    }

    #[test]
    fn test_remote_error_display() {
        let err = RemoteError::new(RemoteErrorKind::Auth, "token rejected");
        assert_eq!(err.to_string(), "auth: token rejected");
    }
}
