use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::error::CacheError;

/// The remote collections mirrored by the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKind {
    Devices,
    Applications,
    Releases,
}

impl CollectionKind {
    pub const ALL: [CollectionKind; 3] = [
        CollectionKind::Devices,
        CollectionKind::Applications,
        CollectionKind::Releases,
    ];

    /// Name of the collection in the document store.
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionKind::Devices => "devices",
            CollectionKind::Applications => "applications",
            CollectionKind::Releases => "releases",
        }
    }

    /// Releases are only ever fetched one fleet at a time.
    pub fn requires_scope(&self) -> bool {
        matches!(self, CollectionKind::Releases)
    }

    /// Whether a fleet scope may narrow queries on this collection.
    pub fn accepts_scope(&self) -> bool {
        !matches!(self, CollectionKind::Applications)
    }

    /// Whether the scope selects what is fetched (a partition of its own)
    /// rather than only filtering an already complete collection.
    pub fn partitioned(&self) -> bool {
        self.requires_scope()
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollectionKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "devices" | "device" => Ok(CollectionKind::Devices),
            "applications" | "application" | "fleets" | "fleet" => Ok(CollectionKind::Applications),
            "releases" | "release" => Ok(CollectionKind::Releases),
            other => Err(CacheError::Config(format!("unknown collection '{other}'"))),
        }
    }
}

/// A fleet (Balena application) that narrows a query or a fetch.
/// Identity is the application id; the name is carried for logs.
#[derive(Debug, Clone)]
pub struct FleetScope {
    pub application_id: i64,
    pub name: String,
}

impl FleetScope {
    pub fn new(application_id: i64, name: impl Into<String>) -> Self {
        FleetScope {
            application_id,
            name: name.into(),
        }
    }

    /// Store partition holding this fleet's documents.
    pub fn partition(&self) -> String {
        self.application_id.to_string()
    }
}

impl PartialEq for FleetScope {
    fn eq(&self, other: &Self) -> bool {
        self.application_id == other.application_id
    }
}

impl Eq for FleetScope {}

impl Hash for FleetScope {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.application_id.hash(state);
    }
}

/// Unit of freshness tracking: a collection, or one fleet's slice of a
/// partitioned collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub collection: CollectionKind,
    pub scope: Option<FleetScope>,
}

/// Partition used by collections that are fetched whole.
pub const WHOLE_COLLECTION: &str = "";

impl CacheKey {
    pub fn new(collection: CollectionKind) -> Self {
        CacheKey {
            collection,
            scope: None,
        }
    }

    pub fn scoped(collection: CollectionKind, scope: FleetScope) -> Self {
        CacheKey {
            collection,
            scope: Some(scope),
        }
    }

    /// Key under which the content for this request is fetched and stored.
    /// Scopes on unpartitioned collections only filter, so they share the
    /// whole-collection key.
    pub fn storage_key(collection: CollectionKind, scope: Option<&FleetScope>) -> Self {
        match scope {
            Some(scope) if collection.partitioned() => CacheKey::scoped(collection, scope.clone()),
            _ => CacheKey::new(collection),
        }
    }

    pub fn partition(&self) -> String {
        self.scope
            .as_ref()
            .map(FleetScope::partition)
            .unwrap_or_else(|| WHOLE_COLLECTION.to_string())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}[{}]", self.collection, scope.name),
            None => write!(f, "{}", self.collection),
        }
    }
}
