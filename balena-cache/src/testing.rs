//! Test doubles shared by the cache and client tests.

use crate::cache::key::{CollectionKind, FleetScope};
use crate::document::get_path;
use crate::remote::{RemoteError, RemoteSource};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// In-memory remote source that counts loads and can be told to stall,
/// fail or panic.
#[derive(Default)]
pub(crate) struct MockSource {
    data: Mutex<HashMap<CollectionKind, Vec<Value>>>,
    loads: Mutex<HashMap<CollectionKind, usize>>,
    total: AtomicUsize,
    delays: Mutex<HashMap<CollectionKind, Duration>>,
    failing: AtomicBool,
    panicking: AtomicBool,
}

impl MockSource {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with(self, collection: CollectionKind, docs: Vec<Value>) -> Self {
        self.set(collection, docs);
        self
    }

    pub(crate) fn set(&self, collection: CollectionKind, docs: Vec<Value>) {
        self.data.lock().insert(collection, docs);
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        for kind in CollectionKind::ALL {
            self.set_delay_for(kind, delay);
        }
    }

    pub(crate) fn set_delay_for(&self, collection: CollectionKind, delay: Duration) {
        self.delays.lock().insert(collection, delay);
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn set_panicking(&self, panicking: bool) {
        self.panicking.store(panicking, Ordering::SeqCst);
    }

    pub(crate) fn loads(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub(crate) fn loads_of(&self, collection: CollectionKind) -> usize {
        self.loads.lock().get(&collection).copied().unwrap_or(0)
    }
}

impl RemoteSource for MockSource {
    fn load(
        &self,
        collection: CollectionKind,
        scope: Option<&FleetScope>,
    ) -> Result<Vec<Value>, RemoteError> {
        self.total.fetch_add(1, Ordering::SeqCst);
        *self.loads.lock().entry(collection).or_insert(0) += 1;

        let delay = self.delays.lock().get(&collection).copied().unwrap_or_default();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if self.panicking.load(Ordering::SeqCst) {
            panic!("mock loader exploded");
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(RemoteError::network("mock outage"));
        }

        let docs = self.data.lock().get(&collection).cloned().unwrap_or_default();
        Ok(match scope {
            Some(scope) => docs
                .into_iter()
                .filter(|doc| {
                    get_path(doc, "belongs_to__application.__id").and_then(Value::as_i64)
                        == Some(scope.application_id)
                })
                .collect(),
            None => docs,
        })
    }
}

pub(crate) const TATER_ID: i64 = 1590199;
pub(crate) const MART_ID: i64 = 1803989;

pub(crate) fn applications() -> Vec<Value> {
    vec![
        json!({"id": TATER_ID, "app_name": "Tater_SAI", "slug": "acme/tater_sai", "is_host": false}),
        json!({"id": MART_ID, "app_name": "Mart_Fleet", "slug": "acme/mart_fleet", "is_host": false}),
    ]
}

pub(crate) fn devices() -> Vec<Value> {
    vec![
        json!({
            "id": 6984936,
            "uuid": "107d9719651cdc7c53040eda1ba3f352",
            "device_name": "Wilcox Lane 8",
            "is_online": true,
            "belongs_to__application": {"__id": MART_ID},
            "device_tags": {"Customer": "Mart"},
        }),
        json!({
            "id": 6984937,
            "uuid": "2b8c3a61e0a94f0c9a2d4e5f60718293",
            "device_name": "Wilcox Lane 9",
            "is_online": false,
            "belongs_to__application": {"__id": MART_ID},
            "device_tags": {"Customer": "Mart"},
        }),
        json!({
            "id": 7001234,
            "uuid": "c0ffee00c0ffee00c0ffee00c0ffee00",
            "device_name": "Tater Rig 1",
            "is_online": true,
            "belongs_to__application": {"__id": TATER_ID},
            "device_tags": {"Customer": "Tater"},
        }),
    ]
}

pub(crate) fn releases() -> Vec<Value> {
    vec![
        json!({
            "id": 2711401,
            "commit": "4bfd6e0e25ffb5e6bd2e4ed95f0e04b0",
            "status": "success",
            "revision": 58,
            "belongs_to__application": {"__id": TATER_ID},
            "release_tags": {"version": "v1.2.0"},
        }),
        json!({
            "id": 2711502,
            "commit": "9f3a1c2b7d8e4f6a0b1c2d3e4f5a6b7c",
            "status": "success",
            "revision": 59,
            "belongs_to__application": {"__id": TATER_ID},
            "release_tags": {"version": "v1.3.0"},
        }),
        json!({
            "id": 2711603,
            "commit": "aaaabbbbccccddddeeeeffff00001111",
            "status": "failed",
            "revision": 60,
            "belongs_to__application": {"__id": TATER_ID},
            "release_tags": {"version": "v1.3.0"},
        }),
        json!({
            "id": 2800001,
            "commit": "0123456789abcdef0123456789abcdef",
            "status": "success",
            "revision": 3,
            "belongs_to__application": {"__id": MART_ID},
            "release_tags": {"version": "v0.9.0"},
        }),
    ]
}

/// A source serving the fixtures above.
pub(crate) fn fleet_source() -> MockSource {
    MockSource::new()
        .with(CollectionKind::Applications, applications())
        .with(CollectionKind::Devices, devices())
        .with(CollectionKind::Releases, releases())
}
