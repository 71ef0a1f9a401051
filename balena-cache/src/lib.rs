pub mod cache;
pub mod client;
pub mod config;
pub mod document;
pub mod error;
pub mod query;
pub mod remote;
pub mod store;
pub mod system_db;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{CacheKey, CacheManager, CollectionKind, FleetScope, Snapshot};
pub use client::{FleetClient, ReleaseIdentifier};
pub use config::CacheConfig;
pub use document::Document;
pub use error::{CacheError, ErrorKind, Result};
pub use query::{Filter, FindOptions, Projection, Sort};
pub use remote::{BalenaApi, RemoteError, RemoteErrorKind, RemoteSource};
pub use store::DocumentStore;
pub use system_db::PartitionMeta;
pub use tunnel::{with_tunnel, Tunnel, TunnelBuilder};
