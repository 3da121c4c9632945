// Configuration loading and parsing (config/estimator.toml).

use std::path::{Path, PathBuf};
use std::time::Duration;

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

    #[error("failed to initialize config from defaults: {message}")]
    DefaultsCopyError { message: String },
}

// ---------------------------------------------------------------------------
// Config structs
// ---------------------------------------------------------------------------

pub const CONFIG_FILE: &str = "estimator.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// WebSocket port.
    pub port: u16,
    /// Port of the HTTP request API.
    pub api_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8080,
            api_port: 8081,
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn api_listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.api_port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    File,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Data directory (file backend) or database file (sqlite backend).
    /// When omitted, the platform data directory is used.
    pub path: Option<String>,
    /// Total attempts for a snapshot read or write.
    pub write_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            path: None,
            write_retries: 3,
            retry_backoff_ms: 50,
        }
    }
}

impl StorageConfig {
    /// Configured path, or a location under the platform data directory.
    pub fn resolved_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.path {
            return Ok(PathBuf::from(path));
        }
        let dirs = directories::ProjectDirs::from("", "", "estimator").ok_or_else(|| {
            ConfigError::ValidationError {
                field: "storage.path".into(),
                message: "not set and no platform data directory is available".into(),
            }
        })?;
        let base = dirs.data_dir();
        Ok(match self.backend {
            StorageBackend::File => base.join("rooms"),
            StorageBackend::Sqlite => base.join("estimator.db"),
        })
    }
}

/// Liveness timing for realtime connections.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// How often the server probes every connection.
    pub interval_secs: u64,
    /// How often clients are told to ping. Advertised, not enforced.
    pub client_ping_secs: u64,
    /// How long a probe may go unanswered before the connection is closed.
    pub timeout_secs: u64,
    /// Close connections with no inbound traffic for this long.
    pub max_idle_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            client_ping_secs: 25,
            timeout_secs: 10,
            max_idle_secs: 300,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// Log file path. Logs go to stdout when unset.
    #[serde(default)]
    pub file: Option<String>,
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate `config/estimator.toml` relative to `base_dir`.
///
/// This is the lower-level loading primitive that does not auto-copy defaults.
/// Prefer `load_config()` which handles default initialization automatically.
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let path = base_dir.join("config").join(CONFIG_FILE);
    let text = std::fs::read_to_string(&path)
        .map_err(|_| ConfigError::FileNotFound { path: path.clone() })?;
    let config = parse_config(&text).map_err(|e| match e {
        ParseFailure::Toml(source) => ConfigError::ParseError { path, source },
        ParseFailure::Invalid(err) => err,
    })?;
    Ok(config)
}

#[derive(Debug)]
enum ParseFailure {
    Toml(toml::de::Error),
    Invalid(ConfigError),
}

fn parse_config(text: &str) -> Result<Config, ParseFailure> {
    let config: Config = toml::from_str(text).map_err(ParseFailure::Toml)?;
    validate(&config).map_err(ParseFailure::Invalid)?;
    Ok(config)
}

/// Ensure the config file exists by copying it from `defaults/`.
/// Returns the list of files that were copied.
pub fn ensure_config_files(base_dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let defaults_dir = base_dir.join("defaults");
    let config_dir = base_dir.join("config");

    if !defaults_dir.exists() {
        if !config_dir.exists() {
            return Err(ConfigError::DefaultsCopyError {
                message: format!(
                    "neither defaults/ nor config/ directory found in {}; \
                     run from the project root or ensure defaults/ is present",
                    base_dir.display()
                ),
            });
        }
        return Ok(vec![]);
    }

    std::fs::create_dir_all(&config_dir).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to create config directory: {e}"),
    })?;

    let source = defaults_dir.join(CONFIG_FILE);
    let target = config_dir.join(CONFIG_FILE);
    if target.exists() || !source.is_file() {
        return Ok(vec![]);
    }

    std::fs::copy(&source, &target).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to copy {}: {e}", source.display()),
    })?;
    Ok(vec![target])
}

/// Convenience wrapper: loads config relative to the current working directory.
/// Ensures default config files are copied before loading.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|_| ConfigError::FileNotFound {
        path: PathBuf::from("."),
    })?;
    ensure_config_files(&cwd)?;
    load_config_from(&cwd)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.server.port == 0 {
        return Err(ConfigError::ValidationError {
            field: "server.port".into(),
            message: "must be greater than 0".into(),
        });
    }

    if config.server.api_port == 0 || config.server.api_port == config.server.port {
        return Err(ConfigError::ValidationError {
            field: "server.api_port".into(),
            message: format!(
                "must be greater than 0 and differ from server.port ({})",
                config.server.port
            ),
        });
    }

    if config.storage.write_retries == 0 {
        return Err(ConfigError::ValidationError {
            field: "storage.write_retries".into(),
            message: "must be at least 1".into(),
        });
    }

    if config.storage.path.as_deref().is_some_and(|p| p.trim().is_empty()) {
        return Err(ConfigError::ValidationError {
            field: "storage.path".into(),
            message: "must not be empty when set".into(),
        });
    }

    let hb = &config.heartbeat;
    let positive: &[(&str, u64)] = &[
        ("heartbeat.interval_secs", hb.interval_secs),
        ("heartbeat.client_ping_secs", hb.client_ping_secs),
        ("heartbeat.timeout_secs", hb.timeout_secs),
        ("heartbeat.max_idle_secs", hb.max_idle_secs),
    ];
    for (name, val) in positive {
        if *val == 0 {
            return Err(ConfigError::ValidationError {
                field: name.to_string(),
                message: "must be > 0".into(),
            });
        }
    }

    if hb.max_idle_secs < hb.interval_secs {
        return Err(ConfigError::ValidationError {
            field: "heartbeat.max_idle_secs".into(),
            message: format!(
                "must be at least heartbeat.interval_secs ({}), got {}",
                hb.interval_secs, hb.max_idle_secs
            ),
        });
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
