use super::types::ConfigFile;
use crate::error::{CacheError, Result};
use std::path::Path;

/// Parse a YAML config file.
pub fn parse_config(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        CacheError::Config(format!("cannot read {}: {e}", path.display()))
    })?;
    parse_config_str(&content)
}

/// Parse config YAML from a string. An empty document is the default config.
pub fn parse_config_str(content: &str) -> Result<ConfigFile> {
    if content.trim().is_empty() {
        return Ok(ConfigFile::default());
    }
    let config: ConfigFile = serde_yaml::from_str(content)?;
    Ok(config)
}
