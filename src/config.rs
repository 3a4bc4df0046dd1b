// Configuration loading and parsing (towersync.toml).

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },
}

// ---------------------------------------------------------------------------
// Config structs
// ---------------------------------------------------------------------------

/// Which remote store the session engine talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store, useful for local play and tests.
    Memory,
    /// WebSocket store server; requires `store.url`.
    Websocket,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    pub backend: StoreBackend,
    /// Server URL, e.g. `ws://localhost:9001`. Only used (and required) for
    /// the websocket backend.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for StoreSection {
    fn default() -> Self {
        StoreSection {
            backend: StoreBackend::Memory,
            url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSection {
    /// Log file path. Logs go to a file so they never interleave with the
    /// interactive prompt on stdout.
    pub file: String,
}

impl Default for LogSection {
    fn default() -> Self {
        LogSection {
            file: "towersync.log".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub log: LogSection,
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate configuration from `path`. A missing file is not an
/// error; every section has defaults (memory backend, `towersync.log`).
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let config = if path.exists() {
        let text = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.to_path_buf(),
        })?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?
    } else {
        Config::default()
    };

    validate(&config)?;
    Ok(config)
}

/// Convenience wrapper: loads `towersync.toml` from the current working
/// directory (or the path in `TOWERSYNC_CONFIG` when set).
pub fn load_config() -> Result<Config, ConfigError> {
    let path = std::env::var("TOWERSYNC_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("towersync.toml"));
    load_config_from(&path)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &Config) -> Result<(), ConfigError> {
    match config.store.backend {
        StoreBackend::Websocket => {
            let Some(url) = config.store.url.as_deref() else {
                return Err(ConfigError::ValidationError {
                    field: "store.url".into(),
                    message: "required for the websocket backend".into(),
                });
            };
            if !url.starts_with("ws://") && !url.starts_with("wss://") {
                return Err(ConfigError::ValidationError {
                    field: "store.url".into(),
                    message: format!("must start with ws:// or wss://, got `{url}`"),
                });
            }
        }
        StoreBackend::Memory => {}
    }

    if config.log.file.is_empty() {
        return Err(ConfigError::ValidationError {
            field: "log.file".into(),
            message: "must not be empty".into(),
        });
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
