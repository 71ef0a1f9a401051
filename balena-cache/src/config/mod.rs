//! Cache configuration: defaults, builder and YAML file loading.

pub mod parser;
pub mod types;

pub use parser::{parse_config, parse_config_str};
pub use types::{CollectionSettings, ConfigFile};

use crate::cache::key::CollectionKind;
use crate::error::{CacheError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Max-age applied when neither the caller nor the collection overrides it.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(3600);

/// Directory name used under the per-user cache directory.
pub const APP_DIR_NAME: &str = "balena_client";

pub const TOKEN_ENV_VAR: &str = "BALENA_AUTH_TOKEN";

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Where the database lives; `None` means the per-user cache directory.
    pub cache_dir: Option<PathBuf>,
    pub default_max_age: Duration,
    pub max_age: HashMap<CollectionKind, Duration>,
    /// When false nothing is stored and every read goes to the remote source.
    pub enabled: bool,
    /// Upper bound on how long a caller waits for someone else's refresh.
    pub wait_timeout: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            default_max_age: DEFAULT_MAX_AGE,
            max_age: HashMap::new(),
            enabled: true,
            wait_timeout: None,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn with_default_max_age(mut self, max_age: Duration) -> Self {
        self.default_max_age = max_age;
        self
    }

    pub fn with_collection_max_age(mut self, collection: CollectionKind, max_age: Duration) -> Self {
        self.max_age.insert(collection, max_age);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }

    /// Configured max-age of a collection.
    pub fn max_age_for(&self, collection: CollectionKind) -> Duration {
        self.max_age
            .get(&collection)
            .copied()
            .unwrap_or(self.default_max_age)
    }

    /// The cache directory to use, falling back to the per-user default.
    pub fn resolve_cache_dir(&self) -> Result<PathBuf> {
        match &self.cache_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_cache_dir(),
        }
    }

    /// Load a YAML config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_config_file(parse_config(path)?)
    }

    pub fn from_config_file(file: ConfigFile) -> Result<Self> {
        let mut config = CacheConfig::default();
        if let Some(dir) = file.cache_dir {
            config.cache_dir = Some(dir);
        }
        if let Some(secs) = file.default_max_age_secs {
            config.default_max_age = Duration::from_secs(secs);
        }
        if let Some(enabled) = file.enabled {
            config.enabled = enabled;
        }
        if let Some(secs) = file.wait_timeout_secs {
            config.wait_timeout = Some(Duration::from_secs(secs));
        }
        for (name, settings) in file.collections {
            let kind: CollectionKind = name.parse()?;
            if let Some(secs) = settings.max_age_secs {
                config.max_age.insert(kind, Duration::from_secs(secs));
            }
        }
        Ok(config)
    }
}

/// Per-user cache directory, e.g. `~/.cache/balena_client` on Linux.
pub fn default_cache_dir() -> Result<PathBuf> {
    directories::ProjectDirs::from("", "", APP_DIR_NAME)
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .ok_or_else(|| CacheError::Config("cannot determine a cache directory for this user".into()))
}

/// Balena API token from `BALENA_AUTH_TOKEN`, else from `~/.balena/token`
/// as written by `balena login`.
pub fn auth_token() -> Result<String> {
    let home = directories::BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf());
    auth_token_from(std::env::var(TOKEN_ENV_VAR).ok(), home.as_deref())
}

fn auth_token_from(env_value: Option<String>, home: Option<&Path>) -> Result<String> {
    if let Some(token) = env_value.map(|t| t.trim().to_string()) {
        if !token.is_empty() {
            return Ok(token);
        }
    }

    if let Some(home) = home {
        let path = home.join(".balena").join("token");
        if path.is_file() {
            let token = std::fs::read_to_string(&path)?.trim().to_string();
            if !token.is_empty() {
                return Ok(token);
            }
            log::warn!("Token file {} is empty", path.display());
        }
    }

    Err(CacheError::Config(format!(
        "no Balena API token: set {TOKEN_ENV_VAR} or run `balena login`"
    )))
}
