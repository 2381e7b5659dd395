//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/keen/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/keen/` (~/.config/keen/)
//! - Data: `$XDG_DATA_HOME/keen/` (~/.local/share/keen/)
//! - State/Logs: `$XDG_STATE_HOME/keen/` (~/.local/state/keen/)
//! - Cache: `$XDG_CACHE_HOME/keen/` (~/.cache/keen/), home of the legacy file store

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Scheme used for API requests unless overridden
pub const DEFAULT_API_URL_SCHEME: &str = "https";

/// Authority of the public ingestion API
pub const DEFAULT_API_URL_AUTHORITY: &str = "api.keen.io";

/// API version segment of every request path
pub const API_VERSION: &str = "3.0";

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Returns XDG_CACHE_HOME or ~/.cache
fn xdg_cache_home() -> PathBuf {
    std::env::var("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".cache"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Project identity and API endpoint
    #[serde(default)]
    pub project: ProjectConfig,

    /// Event upload limits
    #[serde(default)]
    pub upload: UploadConfig,

    /// Query retry bookkeeping
    #[serde(default)]
    pub query: QueryConfig,

    /// Local store limits and paths
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Project identity: which project events belong to and how to reach the API
#[derive(Debug, Deserialize, Clone)]
pub struct ProjectConfig {
    /// Project ID
    pub project_id: Option<String>,

    /// Key used to upload events
    pub write_key: Option<String>,

    /// Key used to run queries
    pub read_key: Option<String>,

    /// URL scheme for API requests
    #[serde(default = "default_api_url_scheme")]
    pub api_url_scheme: String,

    /// URL authority for the API, e.g. "api.keen.io:443"
    #[serde(default = "default_api_url_authority")]
    pub api_url_authority: String,

    /// Optional HTTP proxy for all requests
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            project_id: None,
            write_key: None,
            read_key: None,
            api_url_scheme: default_api_url_scheme(),
            api_url_authority: default_api_url_authority(),
            proxy: None,
        }
    }
}

fn default_api_url_scheme() -> String {
    DEFAULT_API_URL_SCHEME.to_string()
}

fn default_api_url_authority() -> String {
    DEFAULT_API_URL_AUTHORITY.to_string()
}

impl ProjectConfig {
    /// Create a project config pointing at the default API
    pub fn new(project_id: &str, write_key: Option<&str>, read_key: Option<&str>) -> Self {
        Self {
            project_id: Some(project_id.to_string()),
            write_key: write_key.map(str::to_string),
            read_key: read_key.map(str::to_string),
            ..Default::default()
        }
    }

    /// Point the config at a different API host (scheme + authority)
    pub fn with_api_url(mut self, scheme: &str, authority: &str) -> Self {
        self.api_url_scheme = scheme.to_string();
        self.api_url_authority = authority.to_string();
        self
    }

    /// Project ID, or a configuration error if missing or empty
    pub fn project_id(&self) -> Result<&str> {
        non_empty(self.project_id.as_deref(), "project.project_id")
    }

    /// Write key, or a configuration error if missing or empty
    pub fn write_key(&self) -> Result<&str> {
        non_empty(self.write_key.as_deref(), "project.write_key")
    }

    /// Read key, or a configuration error if missing or empty
    pub fn read_key(&self) -> Result<&str> {
        non_empty(self.read_key.as_deref(), "project.read_key")
    }

    /// Base URL of the project, e.g. `https://api.keen.io/3.0/projects/<id>`
    pub fn project_url(&self) -> Result<String> {
        Ok(format!(
            "{}://{}/{}/projects/{}",
            self.api_url_scheme,
            self.api_url_authority.trim_end_matches('/'),
            API_VERSION,
            urlencoding::encode(self.project_id()?)
        ))
    }

    /// Check if the project can upload events
    pub fn is_ready(&self) -> bool {
        self.project_id().is_ok() && self.write_key().is_ok()
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        self.project_id()?;
        if self.api_url_authority.trim().is_empty() {
            return Err(Error::Config(
                "project.api_url_authority must not be empty".to_string(),
            ));
        }
        if self.api_url_scheme != "https" && self.api_url_scheme != "http" {
            return Err(Error::Config(format!(
                "project.api_url_scheme must be http or https, got {:?}",
                self.api_url_scheme
            )));
        }
        if let Some(proxy) = &self.proxy {
            proxy.validate()?;
        }
        Ok(())
    }
}

fn non_empty<'a>(value: Option<&'a str>, field: &str) -> Result<&'a str> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(Error::Config(format!("{} is required", field))),
    }
}

/// HTTP proxy settings
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Proxy host name
    pub host: String,
    /// Proxy port
    pub port: u16,
}

impl ProxyConfig {
    /// Proxy URL understood by the HTTP client
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("project.proxy.host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(Error::Config("project.proxy.port must not be 0".to_string()));
        }
        Ok(())
    }
}

/// Event upload configuration
#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    /// Times an event is offered to the API before it is dropped
    #[serde(default = "default_max_event_upload_attempts")]
    pub max_event_upload_attempts: u32,

    /// Upper bound on the encoded size of a single batch request
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,

    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_event_upload_attempts: default_max_event_upload_attempts(),
            max_request_bytes: default_max_request_bytes(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl UploadConfig {
    /// Request timeout as a Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_max_event_upload_attempts() -> u32 {
    3
}

fn default_max_request_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_timeout_secs() -> u64 {
    30
}

/// Query retry configuration
#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    /// Failed attempts after which a query is abandoned
    #[serde(default = "default_max_query_attempts")]
    pub max_query_attempts: u32,

    /// Seconds a failed query is kept for retry
    #[serde(default = "default_query_ttl_secs")]
    pub query_ttl_secs: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_query_attempts: default_max_query_attempts(),
            query_ttl_secs: default_query_ttl_secs(),
        }
    }
}

impl QueryConfig {
    /// Query TTL as a Duration
    pub fn query_ttl(&self) -> Duration {
        Duration::from_secs(self.query_ttl_secs)
    }
}

fn default_max_query_attempts() -> u32 {
    10
}

fn default_query_ttl_secs() -> u64 {
    3600
}

/// Local store configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// How many events can be stored for a single collection before aging them out
    #[serde(default = "default_max_events_per_collection")]
    pub max_events_per_collection: usize,

    /// How many events to drop when aging out
    #[serde(default = "default_events_to_forget")]
    pub events_to_forget: usize,

    /// Override for the database file
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Override for the legacy file-per-event store root
    #[serde(default)]
    pub legacy_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_events_per_collection: default_max_events_per_collection(),
            events_to_forget: default_events_to_forget(),
            database_path: None,
            legacy_dir: None,
        }
    }
}

fn default_max_events_per_collection() -> usize {
    10_000
}

fn default_events_to_forget() -> usize {
    100
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Validate every section that has hard requirements
    pub fn validate(&self) -> Result<()> {
        self.project.validate()?;
        if self.upload.max_event_upload_attempts == 0 {
            return Err(Error::Config(
                "upload.max_event_upload_attempts must be at least 1".to_string(),
            ));
        }
        if self.upload.max_request_bytes == 0 {
            return Err(Error::Config(
                "upload.max_request_bytes must be at least 1".to_string(),
            ));
        }
        if self.query.max_query_attempts == 0 {
            return Err(Error::Config(
                "query.max_query_attempts must be at least 1".to_string(),
            ));
        }
        if self.storage.max_events_per_collection == 0 {
            return Err(Error::Config(
                "storage.max_events_per_collection must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Database file for the configured project
    ///
    /// Uses `storage.database_path` when set, otherwise
    /// `$XDG_DATA_HOME/keen/<project_id>.db`.
    pub fn project_database_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.storage.database_path {
            return Ok(path.clone());
        }
        Ok(Self::database_path(self.project.project_id()?))
    }

    /// Root of the legacy file-per-event store
    pub fn legacy_store_dir(&self) -> PathBuf {
        self.storage
            .legacy_dir
            .clone()
            .unwrap_or_else(|| xdg_cache_home().join("keen"))
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/keen/config.toml` (~/.config/keen/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("keen").join("config.toml")
    }

    /// Returns the data directory path (for SQLite databases)
    ///
    /// `$XDG_DATA_HOME/keen/` (~/.local/share/keen/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("keen")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/keen/` (~/.local/state/keen/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("keen")
    }

    /// Returns the database file path for a project
    ///
    /// `$XDG_DATA_HOME/keen/<project_id>.db`
    pub fn database_path(project_id: &str) -> PathBuf {
        let file_name: String = project_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        Self::data_dir().join(format!("{}.db", file_name))
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/keen/keen.log` (~/.local/state/keen/keen.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("keen.log")
    }
}
