//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::ServerConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Config key not found: {0}")]
    MissingKey(String),
    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate the table at `key` (dotted path, e.g. `server.http`)
/// from a TOML file. An empty key reads the document root.
pub fn load_config(path: &Path, key: &str) -> Result<ServerConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content, key)
}

/// Parse and validate a TOML document already in memory.
pub fn parse_config(content: &str, key: &str) -> Result<ServerConfig, ConfigError> {
    let mut table: toml::Value = toml::from_str(content)?;

    for segment in key.split('.').filter(|s| !s.is_empty()) {
        table = match table {
            toml::Value::Table(mut t) => t
                .remove(segment)
                .ok_or_else(|| ConfigError::MissingKey(key.to_string()))?,
            _ => return Err(ConfigError::MissingKey(key.to_string())),
        };
    }

    let config: ServerConfig = table.try_into()?;
    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}
