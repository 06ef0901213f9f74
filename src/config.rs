//! Configuration file support for blackbox
//!
//! Reads from .blackbox/config.toml (found by walking up from the current
//! directory), then applies environment overrides:
//! `API_HOST`, `API_PORT`, `DATABASE_URL`, `BLACKBOX_API_URL`, `LOG_LEVEL`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration structure
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct Config {
    /// API server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Storage settings
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Settings for the CLI talking to the API
    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ServerConfig {
    /// Default: "0.0.0.0"
    #[serde(default = "default_host")]
    pub host: String,

    /// Default: 8000
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request worker threads. Default: 4
    #[serde(default = "default_workers")]
    pub workers: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct DatabaseConfig {
    /// SQLite file. Default: .blackbox/blackbox.db
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    /// Pooled connections. Default: 5
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// How long a writer waits for the lock before failing. Default: 5000
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ClientConfig {
    /// Base URL of the API. Default: http://127.0.0.1:8000
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Request timeout in seconds. Default: 10
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    /// tracing filter directive. Default: "info"
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_workers() -> usize {
    4
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".blackbox").join("blackbox.db")
}

fn default_pool_size() -> u32 {
    5
}

fn default_busy_timeout_ms() -> u32 {
    5000
}

fn default_api_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: default_workers(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            pool_size: default_pool_size(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// An environment override that was present but could not be applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoredOverride {
    pub var: &'static str,
    pub value: String,
}

impl Config {
    /// Load config from .blackbox/config.toml plus environment overrides
    ///
    /// A missing or unreadable file falls back to defaults. Overrides that
    /// fail to parse are returned so the caller can report them once logging
    /// is up.
    pub fn load() -> (Self, Vec<IgnoredOverride>) {
        let mut config = Self::find_config_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default();
        let ignored = config.apply_env(|key| std::env::var(key).ok());
        (config, ignored)
    }

    /// Parse a specific config file (no environment overrides)
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Find config.toml by walking up directory tree
    fn find_config_path() -> Option<PathBuf> {
        let current_dir = std::env::current_dir().ok()?;
        let mut dir = current_dir.as_path();

        loop {
            let config_path = dir.join(".blackbox").join("config.toml");
            if config_path.exists() {
                return Some(config_path);
            }

            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
        None
    }

    /// Apply overrides from a variable lookup (the process environment in `load`)
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Vec<IgnoredOverride> {
        let mut ignored = Vec::new();
        if let Some(host) = lookup("API_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("API_PORT") {
            match port.trim().parse() {
                Ok(port) => self.server.port = port,
                Err(_) => ignored.push(IgnoredOverride {
                    var: "API_PORT",
                    value: port,
                }),
            }
        }
        if let Some(url) = lookup("DATABASE_URL") {
            self.database.path = database_path_from_url(&url);
        }
        if let Some(url) = lookup("BLACKBOX_API_URL") {
            self.client.api_url = url;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level.to_ascii_lowercase();
        }
        ignored
    }

    /// Address the server binds to
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Accept either a bare path or a `sqlite://` URL
///
/// `sqlite:///./dev.db` and `sqlite://./dev.db` both map to `./dev.db`.
pub fn database_path_from_url(url: &str) -> PathBuf {
    let url = url.trim();
    let path = url
        .strip_prefix("sqlite:///")
        .or_else(|| url.strip_prefix("sqlite://"))
        .unwrap_or(url);
    PathBuf::from(path)
}
