//! Config loading: TOML file, environment overrides, CLI overrides on top.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "cowrite.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub limits: Limits,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Worker pool size; `None` means available parallelism, floor 2.
    pub threads: Option<u32>,
    pub cleanup_interval_secs: u64,
    pub max_idle_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            threads: None,
            cleanup_interval_secs: 300,
            max_idle_secs: 3600,
        }
    }
}

impl ServerConfig {
    pub fn worker_threads(&self) -> usize {
        match self.threads {
            Some(n) => (n as usize).max(2),
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
                .max(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_frame_bytes: usize,
    pub max_history: usize,
    pub max_undo: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame_bytes: 1 << 20,
            max_history: 1000,
            max_undo: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    /// Tracing filter directive, e.g. `"cowrite=debug"`. Overrides the
    /// verbosity flag when set.
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            filter: None,
        }
    }
}

/// Load config from `path`, or `cowrite.toml` in the working directory if
/// it exists, then apply environment overrides.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(path) => read_file(path)?,
        None => {
            let default = Path::new(DEFAULT_CONFIG_FILE);
            if default.exists() {
                read_file(default)?
            } else {
                tracing::debug!("no config file found, using defaults");
                Config::default()
            }
        }
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!(path = %path.display(), "loaded config");
    Ok(config)
}

pub fn apply_env_overrides(config: &mut Config) {
    if let Some(port) = env_parse::<u16>("COWRITE_PORT") {
        config.server.port = port;
    }
    if let Some(threads) = env_parse::<u32>("COWRITE_THREADS") {
        config.server.threads = Some(threads);
    }
    if let Some(secs) = env_parse::<u64>("COWRITE_CLEANUP_INTERVAL") {
        config.server.cleanup_interval_secs = secs;
    }
    if let Some(secs) = env_parse::<u64>("COWRITE_MAX_IDLE") {
        config.server.max_idle_secs = secs;
    }
    if let Ok(filter) = std::env::var("COWRITE_LOG")
        && !filter.is_empty()
    {
        config.logging.filter = Some(filter);
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("ignoring unparsable {name}={raw:?}");
            None
        }
    }
}
