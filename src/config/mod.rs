mod settings;

pub use settings::{DatabaseConfig, FileBackendConfig, LoggingConfig, MetastoreConfig, Settings};
