use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub metastore: MetastoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetastoreConfig {
    /// Backend name: "memory", "file" or "postgres"
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Records fetched per iterator batch (0 selects the built-in default)
    #[serde(default = "default_iterator_batch_size")]
    pub iterator_batch_size: usize,
    /// Per-operation timeout in milliseconds (0 disables the deadline)
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(default)]
    pub file: FileBackendConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileBackendConfig {
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    /// Sync each record to disk before it is renamed into place
    #[serde(default = "default_fsync")]
    pub fsync: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
    #[serde(default = "default_tenant_id")]
    pub tenant_id: String,
    /// Create the metadata table on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
    /// Fallback filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_backend() -> String {
    "memory".to_string()
}

fn default_iterator_batch_size() -> usize {
    100
}

fn default_operation_timeout_ms() -> u64 {
    5_000 // 5 seconds
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("data/metastore")
}

fn default_fsync() -> bool {
    true
}

fn default_pool_size() -> u32 {
    10
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    600 // 10 minutes
}

fn default_tenant_id() -> String {
    "default".to_string()
}

fn default_run_migrations() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            // Start with default values
            .set_default("metastore.backend", default_backend())?
            .set_default("metastore.iterator_batch_size", default_iterator_batch_size() as u64)?
            .set_default("metastore.operation_timeout_ms", default_operation_timeout_ms())?
            .set_default("logging.level", default_log_level())?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables
            // METASTORE__BACKEND, METASTORE__DATABASE__URL, LOGGING__JSON, etc.
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }
}

impl MetastoreConfig {
    /// Operation timeout, or `None` when disabled.
    pub fn operation_timeout(&self) -> Option<Duration> {
        (self.operation_timeout_ms > 0).then(|| Duration::from_millis(self.operation_timeout_ms))
    }
}

impl Default for MetastoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            iterator_batch_size: default_iterator_batch_size(),
            operation_timeout_ms: default_operation_timeout_ms(),
            file: FileBackendConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl Default for FileBackendConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            fsync: default_fsync(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            pool_size: default_pool_size(),
            connect_timeout_seconds: default_connect_timeout(),
            idle_timeout_seconds: default_idle_timeout(),
            tenant_id: default_tenant_id(),
            run_migrations: default_run_migrations(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: false,
            level: default_log_level(),
        }
    }
}
