//! Balena cloud API source over HTTPS.

use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use serde_json::Value;

use super::{attach_tags, RemoteError, RemoteErrorKind, RemoteSource};
use crate::cache::key::{CollectionKind, FleetScope};

pub const DEFAULT_API_URL: &str = "https://api.balena-cloud.com";

/// Fields requested for releases. The full release resource carries large
/// composition blobs the cache has no use for.
pub const RELEASE_FIELDS: &[&str] = &[
    "id",
    "commit",
    "created_at",
    "belongs_to__application",
    "is_invalidated",
    "known_issue_list",
    "note",
    "release_version",
    "revision",
    "semver_build",
    "semver_major",
    "semver_minor",
    "semver_patch",
    "status",
];

/// Device config variable the supervisor reads to enter local mode.
pub const LOCAL_MODE_VAR: &str = "RESIN_SUPERVISOR_LOCAL_MODE";

/// Longest pause honoured between rate-limited attempts.
const MAX_RETRY_WAIT: Duration = Duration::from_secs(60);

const DEVICE_TAG_FIELDS: &str = "tag_key,value,device";
const RELEASE_TAG_FIELDS: &str = "tag_key,value,release";

/// Blocking client for the Balena v7 resource API.
pub struct BalenaApi {
    client: Client,
    token: String,
    base_url: String,
    max_retries: u32,
}

impl BalenaApi {
    pub fn new(token: impl Into<String>) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .user_agent(concat!("balena-cache/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RemoteError::network(format!("failed to build HTTP client: {e}")))?;

        Ok(BalenaApi {
            client,
            token: token.into(),
            base_url: DEFAULT_API_URL.to_string(),
            max_retries: 3,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch every row of a resource, following the `{"d": [...]}` envelope.
    fn get_all(&self, resource: &str, query: &[(&str, String)]) -> Result<Vec<Value>, RemoteError> {
        let url = format!("{}/v7/{}", self.base_url, resource);
        let mut attempt = 0;

        loop {
            log::debug!("GET {url} {query:?}");
            let response = self
                .client
                .get(&url)
                .bearer_auth(&self.token)
                .query(query)
                .send()
                .map_err(|e| RemoteError::network(format!("request to {resource} failed: {e}")))?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS && attempt < self.max_retries {
                let wait = retry_after(&response).unwrap_or(Duration::from_secs(1));
                attempt += 1;
                log::warn!(
                    "Rate limited on {resource}, retrying in {:.1}s ({attempt}/{})",
                    wait.as_secs_f64(),
                    self.max_retries
                );
                std::thread::sleep(wait);
                continue;
            }

            if !status.is_success() {
                let body = response.text().unwrap_or_default();
                return Err(status_error(resource, status, body));
            }

            let body: Value = response
                .json()
                .map_err(|e| RemoteError::decode(format!("invalid JSON from {resource}: {e}")))?;
            return unwrap_envelope(resource, body);
        }
    }

    fn load_devices(&self) -> Result<Vec<Value>, RemoteError> {
        let mut devices = self.get_all("device", &[])?;
        let tags = self.get_all("device_tag", &[("$select", DEVICE_TAG_FIELDS.to_string())])?;
        attach_tags(&mut devices, &tags, "device", "device_tags");
        Ok(devices)
    }

    fn load_releases(&self, scope: &FleetScope) -> Result<Vec<Value>, RemoteError> {
        let app_id = scope.application_id;
        let mut releases = self.get_all(
            "release",
            &[
                ("$filter", format!("belongs_to__application eq {app_id}")),
                ("$select", RELEASE_FIELDS.join(",")),
            ],
        )?;
        let tags = self.get_all(
            "release_tag",
            &[
                ("$filter", format!("release/belongs_to__application eq {app_id}")),
                ("$select", RELEASE_TAG_FIELDS.to_string()),
            ],
        )?;
        attach_tags(&mut releases, &tags, "release", "release_tags");
        Ok(releases)
    }

    /// Whether the supervisor on a device is in local mode. Always read
    /// live; config variables are not cached.
    pub fn is_device_in_local_mode(&self, uuid: &str) -> Result<bool, RemoteError> {
        let devices = self.get_all(
            "device",
            &[
                ("$filter", format!("uuid eq '{}'", uuid.replace('\'', "''"))),
                ("$select", "id".to_string()),
            ],
        )?;
        let device_id = devices
            .first()
            .ok_or_else(|| RemoteError::new(RemoteErrorKind::Status, format!("device {uuid} not found")))?
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| RemoteError::decode(format!("device {uuid} has no id")))?;

        let vars = self.get_all(
            "device_config_variable",
            &[
                ("$filter", format!("device eq {device_id} and name eq '{LOCAL_MODE_VAR}'")),
                ("$select", "value".to_string()),
            ],
        )?;
        Ok(local_mode_enabled(&vars))
    }
}

impl RemoteSource for BalenaApi {
    fn load(
        &self,
        collection: CollectionKind,
        scope: Option<&FleetScope>,
    ) -> Result<Vec<Value>, RemoteError> {
        match collection {
            CollectionKind::Applications => self.get_all("application", &[]),
            CollectionKind::Devices => self.load_devices(),
            CollectionKind::Releases => {
                let scope = scope.ok_or_else(|| {
                    RemoteError::scope("releases can only be fetched for one fleet")
                })?;
                self.load_releases(scope)
            }
        }
    }
}

impl std::fmt::Debug for BalenaApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BalenaApi")
            .field("base_url", &self.base_url)
            .field("token", &"[REDACTED]")
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

fn local_mode_enabled(vars: &[Value]) -> bool {
    vars.first()
        .and_then(|var| var.get("value"))
        .and_then(Value::as_str)
        .is_some_and(|value| value.trim() == "1")
}

fn retry_after(response: &Response) -> Option<Duration> {
    let header = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())?;
    parse_retry_after(header)
}

/// Seconds from a `Retry-After` header, capped at [`MAX_RETRY_WAIT`].
fn parse_retry_after(header: &str) -> Option<Duration> {
    let seconds = header.trim().parse::<f64>().ok()?;
    if seconds.is_nan() || seconds < 0.0 {
        return None;
    }
    if seconds >= MAX_RETRY_WAIT.as_secs_f64() {
        return Some(MAX_RETRY_WAIT);
    }
    Duration::try_from_secs_f64(seconds).ok()
}

fn status_error(resource: &str, status: StatusCode, body: String) -> RemoteError {
    let kind = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteErrorKind::Auth,
        StatusCode::TOO_MANY_REQUESTS => RemoteErrorKind::RateLimited,
        _ => RemoteErrorKind::Status,
    };
    let body = body.trim();
    let message = if body.is_empty() {
        format!("{resource} returned {status}")
    } else {
        format!("{resource} returned {status}: {body}")
    };
    RemoteError::new(kind, message)
}

fn unwrap_envelope(resource: &str, body: Value) -> Result<Vec<Value>, RemoteError> {
    match body {
        Value::Object(mut map) => match map.remove("d") {
            Some(Value::Array(rows)) => Ok(rows),
            _ => Err(RemoteError::decode(format!(
                "{resource} response has no 'd' array"
            ))),
        },
        Value::Array(rows) => Ok(rows),
        _ => Err(RemoteError::decode(format!(
            "{resource} response is not an object"
        ))),
    }
}
