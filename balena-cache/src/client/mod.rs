//! Fleet-level queries over the cache.

use crate::cache::key::{CacheKey, CollectionKind, FleetScope};
use crate::cache::CacheManager;
use crate::config::CacheConfig;
use crate::document::get_path;
use crate::error::{CacheError, Result};
use crate::query::{self, Filter, FindOptions, Projection};
use crate::remote::RemoteSource;
use crate::store::DocumentStore;
use crate::system_db::PartitionMeta;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Field linking devices and releases to their fleet.
pub const FLEET_LINK: &str = "belongs_to__application.__id";

/// How a release was named by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseIdentifier {
    Commit(String),
    Id(i64),
    Version(String),
}

impl ReleaseIdentifier {
    /// A 32-character lowercase hex string is a commit, digits are an id and
    /// anything else is a `release_tags.version` value.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if text.len() == 32 && text.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return ReleaseIdentifier::Commit(text.to_string());
        }
        if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(id) = text.parse() {
                return ReleaseIdentifier::Id(id);
            }
        }
        ReleaseIdentifier::Version(text.to_string())
    }
}

/// Query façade over a [`CacheManager`] and the remote source behind it.
pub struct FleetClient<R: RemoteSource + 'static> {
    cache: CacheManager,
    source: Arc<R>,
    /// Applications snapshot produced by the last refresh an unknown fleet
    /// forced. Another miss against it does not refresh again.
    miss_refreshed: Mutex<Option<DateTime<Utc>>>,
}

impl<R: RemoteSource + 'static> FleetClient<R> {
    pub fn new(config: CacheConfig, source: R) -> Result<Self> {
        Self::with_shared_source(config, Arc::new(source))
    }

    pub fn with_shared_source(config: CacheConfig, source: Arc<R>) -> Result<Self> {
        let cache = CacheManager::open(config, Arc::clone(&source) as Arc<dyn RemoteSource>)?;
        Ok(FleetClient {
            cache,
            source,
            miss_refreshed: Mutex::new(None),
        })
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn source(&self) -> &R {
        &self.source
    }

    /// Devices, optionally restricted to one fleet.
    pub fn get_devices(
        &self,
        fleet: Option<&str>,
        filter: &Value,
        projection: &Value,
        bypass_cache: bool,
    ) -> Result<Vec<Value>> {
        let options = FindOptions::parse(filter, projection)?;
        self.find(CollectionKind::Devices, fleet, &options, bypass_cache)
    }

    pub fn get_applications(
        &self,
        filter: &Value,
        projection: &Value,
        bypass_cache: bool,
    ) -> Result<Vec<Value>> {
        let options = FindOptions::parse(filter, projection)?;
        self.find(CollectionKind::Applications, None, &options, bypass_cache)
    }

    /// Releases of one fleet. Fetching every release of an account is slow,
    /// so a fleet is mandatory.
    pub fn get_releases(
        &self,
        fleet: &str,
        filter: &Value,
        projection: &Value,
        bypass_cache: bool,
    ) -> Result<Vec<Value>> {
        let options = FindOptions::parse(filter, projection)?;
        self.find(CollectionKind::Releases, Some(fleet), &options, bypass_cache)
    }

    /// Run a find against a collection, refreshing it first if needed.
    pub fn find(
        &self,
        collection: CollectionKind,
        fleet: Option<&str>,
        options: &FindOptions,
        bypass_cache: bool,
    ) -> Result<Vec<Value>> {
        check_scope(collection, fleet)?;
        let bypass = bypass_cache || !self.cache.is_enabled();

        let scope = fleet
            .map(|fleet| self.resolve_fleet(fleet, bypass))
            .transpose()?;
        let scoped;
        let options = match &scope {
            Some(scope) => {
                scoped = options
                    .clone()
                    .and_filter(Filter::eq(FLEET_LINK, scope.application_id));
                &scoped
            }
            None => options,
        };

        if bypass {
            let fetch_scope = scope.as_ref().filter(|_| collection.partitioned());
            let docs = self.source.load(collection, fetch_scope)?;
            return Ok(query::execute(docs, options));
        }

        let key = CacheKey::storage_key(collection, scope.as_ref());
        let store = self.cached(&key)?;
        store.query(collection.as_str(), options)
    }

    /// Refresh collections now without reading them. A fleet is needed when
    /// `collections` includes releases.
    pub fn preload(&self, collections: &[CollectionKind], fleet: Option<&str>) -> Result<()> {
        if !self.cache.is_enabled() {
            return Ok(());
        }
        for &collection in collections {
            let fleet = if collection.accepts_scope() { fleet } else { None };
            check_scope(collection, fleet)?;
            let scope = fleet.map(|f| self.resolve_fleet(f, false)).transpose()?;
            let key = CacheKey::storage_key(collection, scope.as_ref());
            self.cache.get(&key, None, true)?;
        }
        Ok(())
    }

    /// [`preload`](Self::preload) on a background thread.
    pub fn preload_in_background(
        self: &Arc<Self>,
        collections: Vec<CollectionKind>,
        fleet: Option<String>,
    ) -> std::io::Result<JoinHandle<Result<()>>> {
        let client = Arc::clone(self);
        std::thread::Builder::new()
            .name("preload".to_string())
            .spawn(move || {
                let result = client.preload(&collections, fleet.as_deref());
                if let Err(e) = &result {
                    log::warn!("Background preload failed: {e}");
                }
                result
            })
    }

    /// Look a fleet up by id, name (case-insensitive) or slug.
    pub fn resolve_fleet(&self, fleet: &str, bypass_cache: bool) -> Result<FleetScope> {
        if bypass_cache || !self.cache.is_enabled() {
            let apps = self.source.load(CollectionKind::Applications, None)?;
            return match_fleet(&apps, fleet);
        }

        let key = CacheKey::new(CollectionKind::Applications);
        let snapshot = self.cache.get(&key, None, false)?;
        let apps = self.applications_in_store()?;
        match match_fleet(&apps, fleet) {
            // The fleet may be newer than the cached list
            Err(e @ CacheError::InvalidScope(_)) if snapshot.cache_hit && !snapshot.stale => {
                let mut miss_refreshed = self.miss_refreshed.lock();
                if *miss_refreshed == Some(snapshot.refreshed_at) {
                    return Err(e);
                }
                log::debug!("Fleet '{fleet}' not cached, refreshing applications");
                let refreshed = self.cache.get(&key, None, true)?;
                *miss_refreshed = Some(refreshed.refreshed_at);
                drop(miss_refreshed);
                match_fleet(&self.applications_in_store()?, fleet)
            }
            other => other,
        }
    }

    /// Turn a commit, id or version tag into a release id within a fleet.
    pub fn resolve_release_id(&self, fleet: &str, identifier: &str) -> Result<i64> {
        let filter = match ReleaseIdentifier::parse(identifier) {
            ReleaseIdentifier::Id(id) => return Ok(id),
            ReleaseIdentifier::Commit(commit) => json!({"commit": commit}),
            ReleaseIdentifier::Version(version) => json!({"release_tags.version": version}),
        };

        let releases = self.get_releases(fleet, &filter, &json!({"id": 1}), false)?;
        match releases.as_slice() {
            [release] => release.get("id").and_then(Value::as_i64).ok_or_else(|| {
                CacheError::Storage(format!("release matching '{identifier}' has no numeric id"))
            }),
            [] => Err(CacheError::NotFound(format!(
                "no release '{identifier}' in fleet '{fleet}'"
            ))),
            many => Err(CacheError::Ambiguous(format!(
                "{} releases match '{identifier}' in fleet '{fleet}'",
                many.len()
            ))),
        }
    }

    /// The application document of the fleet a device belongs to.
    pub fn fleet_of_device(&self, uuid: &str) -> Result<Value> {
        let device = self.device(uuid, false)?;
        let app_id = get_path(&device, FLEET_LINK)
            .and_then(Value::as_i64)
            .ok_or_else(|| CacheError::NotFound(format!("device {uuid} has no fleet")))?;

        let apps = self.find(
            CollectionKind::Applications,
            None,
            &FindOptions::new(Filter::eq("id", app_id)),
            false,
        )?;
        apps.into_iter()
            .next()
            .ok_or_else(|| CacheError::NotFound(format!("fleet {app_id} of device {uuid}")))
    }

    /// Whether a device currently runs the given release. The device is read
    /// from the remote source, not the cache.
    pub fn is_device_running_release(&self, uuid: &str, identifier: &str) -> Result<bool> {
        let fleet = self.fleet_of_device(uuid)?;
        let fleet_id = fleet
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| CacheError::NotFound(format!("fleet of device {uuid} has no id")))?;
        let release_id = self.resolve_release_id(&fleet_id.to_string(), identifier)?;

        let device = self.device(uuid, true)?;
        Ok(get_path(&device, "is_running__release.__id").and_then(Value::as_i64) == Some(release_id))
    }

    /// Forget the freshness of a collection, or of one fleet's releases.
    pub fn invalidate(&self, collection: CollectionKind, fleet: Option<&str>) -> Result<()> {
        match fleet {
            Some(fleet) if collection.partitioned() => {
                let scope = self.resolve_fleet(fleet, false)?;
                self.cache.invalidate(&CacheKey::scoped(collection, scope))
            }
            _ => self.cache.invalidate_collection(collection),
        }
    }

    pub fn status(&self) -> Result<Vec<PartitionMeta>> {
        self.cache.status()
    }

    pub fn close(self) -> Result<()> {
        self.cache.close()
    }

    fn device(&self, uuid: &str, bypass_cache: bool) -> Result<Value> {
        let devices = self.find(
            CollectionKind::Devices,
            None,
            &FindOptions::new(Filter::eq("uuid", uuid)),
            bypass_cache,
        )?;
        devices
            .into_iter()
            .next()
            .ok_or_else(|| CacheError::NotFound(format!("device {uuid}")))
    }

    fn cached(&self, key: &CacheKey) -> Result<&DocumentStore> {
        self.cache.get(key, None, false)?;
        self.cache
            .store()
            .ok_or_else(|| CacheError::Config("cache is disabled".into()))
    }

    fn applications_in_store(&self) -> Result<Vec<Value>> {
        let store = self
            .cache
            .store()
            .ok_or_else(|| CacheError::Config("cache is disabled".into()))?;
        let options = FindOptions::default().projection(Projection::include(["id", "app_name", "slug"]));
        store.query(CollectionKind::Applications.as_str(), &options)
    }
}

fn check_scope(collection: CollectionKind, fleet: Option<&str>) -> Result<()> {
    match fleet {
        None if collection.requires_scope() => Err(CacheError::InvalidScope(format!(
            "{collection} can only be queried for one fleet"
        ))),
        Some(fleet) if !collection.accepts_scope() => Err(CacheError::InvalidScope(format!(
            "{collection} cannot be scoped to fleet '{fleet}'"
        ))),
        _ => Ok(()),
    }
}

fn match_fleet(apps: &[Value], fleet: &str) -> Result<FleetScope> {
    let wanted = fleet.trim();
    let by_id = wanted.parse::<i64>().ok();

    let found = apps.iter().find(|app| {
        let id = app.get("id").and_then(Value::as_i64);
        let name = app.get("app_name").and_then(Value::as_str);
        let slug = app.get("slug").and_then(Value::as_str);
        (by_id.is_some() && id == by_id)
            || name.is_some_and(|n| n.eq_ignore_ascii_case(wanted))
            || slug == Some(wanted)
    });

    let app = found.ok_or_else(|| CacheError::InvalidScope(format!("unknown fleet '{fleet}'")))?;
    let id = app
        .get("id")
        .and_then(Value::as_i64)
        .ok_or_else(|| CacheError::InvalidScope(format!("fleet '{fleet}' has no numeric id")))?;
    let name = app
        .get("app_name")
        .and_then(Value::as_str)
        .unwrap_or(wanted);
    Ok(FleetScope::new(id, name))
}
