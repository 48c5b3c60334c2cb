// src/config.rs
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// File name searched for in the working directory and `config/`.
pub const CONFIG_FILE_NAME: &str = "broker-service.json";

// Configuration structures. Every field is optional so a file can override just a subset of
// the defaults; environment variables still win over anything set here.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FileConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub topology: TopologyConfig,
    #[serde(default)]
    pub codec: CodecConfig,
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    pub uri: Option<String>,
    pub connection_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct TopologyConfig {
    pub queue: Option<String>,
    pub exchange: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct CodecConfig {
    pub program: Option<String>,
}

/// Locate the config file: working directory, then `config/`, then the home directory.
pub fn find_config_file() -> Option<PathBuf> {
    let locations = [
        ("Current directory", PathBuf::from(CONFIG_FILE_NAME)),
        (
            "Config directory",
            Path::new("config").join(CONFIG_FILE_NAME),
        ),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Some(path.clone());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(format!(".{}", CONFIG_FILE_NAME));
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Some(home_config);
        }
    }

    None
}

pub fn load_config_from(path: &Path) -> Result<FileConfig> {
    let config_content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;

    let config: FileConfig = serde_json::from_str(&config_content).with_context(|| {
        format!(
            "Configuration file {} contains invalid JSON or malformed fields",
            path.display()
        )
    })?;

    if config.connection.uri.as_deref().is_some_and(str::is_empty) {
        return Err(anyhow!("Configuration error: connection.uri cannot be empty"));
    }

    Ok(config)
}

/// Load the config file if one exists in any of the searched locations.
pub fn load_config_if_present() -> Result<Option<FileConfig>> {
    find_config_file()
        .map(|path| load_config_from(&path))
        .transpose()
}
