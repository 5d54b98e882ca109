//! Metadata backend factory

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{DatabaseConfig, FileBackendConfig, MetastoreConfig};
use crate::postgres::{PostgresPool, PostgresPoolError};

use super::backend::{MetaStoreError, MetadataBackend, Result};
use super::file_backend::{FileBackendOptions, FileMetaBackend};
use super::iterator::DEFAULT_ITERATOR_BATCH_SIZE;
use super::memory_backend::MemoryMetaBackend;
use super::postgres_backend::PostgresMetaBackend;

/// Builds one kind of metadata backend.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    /// Backend name this factory produces, as used in configuration.
    fn name(&self) -> &'static str;

    /// Create a new, ready-to-use backend instance.
    async fn create(&self) -> Result<Arc<dyn MetadataBackend>>;
}

#[derive(Debug, Clone)]
pub struct MemoryBackendFactory {
    iterator_batch_size: usize,
}

impl MemoryBackendFactory {
    pub fn new(iterator_batch_size: usize) -> Self {
        Self {
            iterator_batch_size,
        }
    }
}

impl Default for MemoryBackendFactory {
    fn default() -> Self {
        Self::new(DEFAULT_ITERATOR_BATCH_SIZE)
    }
}

#[async_trait]
impl BackendFactory for MemoryBackendFactory {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create(&self) -> Result<Arc<dyn MetadataBackend>> {
        tracing::info!(backend = "memory", "Creating memory metadata backend");
        Ok(Arc::new(
            MemoryMetaBackend::new().with_iterator_batch_size(self.iterator_batch_size),
        ))
    }
}

#[derive(Debug, Clone)]
pub struct FileBackendFactory {
    options: FileBackendOptions,
}

impl FileBackendFactory {
    pub fn new(options: FileBackendOptions) -> Self {
        Self { options }
    }

    pub fn from_config(config: &FileBackendConfig, iterator_batch_size: usize) -> Self {
        Self::new(
            FileBackendOptions::new(config.root_dir.clone())
                .with_fsync(config.fsync)
                .with_iterator_batch_size(iterator_batch_size),
        )
    }
}

#[async_trait]
impl BackendFactory for FileBackendFactory {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn create(&self) -> Result<Arc<dyn MetadataBackend>> {
        tracing::info!(
            backend = "file",
            root = %self.options.root_dir.display(),
            "Creating file metadata backend"
        );
        let backend = FileMetaBackend::open(self.options.clone()).await?;
        Ok(Arc::new(backend))
    }
}

/// Connects a pool and wraps it in a `PostgresMetaBackend`.
#[derive(Debug, Clone)]
pub struct PostgresBackendFactory {
    config: DatabaseConfig,
    iterator_batch_size: usize,
}

impl PostgresBackendFactory {
    pub fn new(config: DatabaseConfig, iterator_batch_size: usize) -> Self {
        Self {
            config,
            iterator_batch_size,
        }
    }
}

fn pool_error(e: PostgresPoolError) -> MetaStoreError {
    match e {
        PostgresPoolError::Sqlx(e) => MetaStoreError::Postgres(e),
        PostgresPoolError::ConnectionUnavailable(msg) => MetaStoreError::Config(msg),
    }
}

#[async_trait]
impl BackendFactory for PostgresBackendFactory {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn create(&self) -> Result<Arc<dyn MetadataBackend>> {
        let pool = PostgresPool::new(&self.config).await.map_err(pool_error)?;
        pool.health_check().await.map_err(pool_error)?;

        tracing::info!(
            backend = "postgres",
            tenant_id = %self.config.tenant_id,
            url = %pool.database_url_masked(),
            "Creating PostgreSQL metadata backend"
        );
        Ok(Arc::new(
            PostgresMetaBackend::with_tenant(pool.pool().clone(), self.config.tenant_id.clone())
                .with_iterator_batch_size(self.iterator_batch_size),
        ))
    }
}

/// Select the factory for the configured backend name.
///
/// Unknown names are a configuration error rather than a silent fallback.
pub fn factory_for(config: &MetastoreConfig) -> Result<Box<dyn BackendFactory>> {
    match config.backend.trim().to_ascii_lowercase().as_str() {
        "memory" => Ok(Box::new(MemoryBackendFactory::new(config.iterator_batch_size))),
        "file" => Ok(Box::new(FileBackendFactory::from_config(
            &config.file,
            config.iterator_batch_size,
        ))),
        "postgres" => Ok(Box::new(PostgresBackendFactory::new(
            config.database.clone(),
            config.iterator_batch_size,
        ))),
        other => Err(MetaStoreError::Config(format!(
            "unknown metadata backend '{}'",
            other
        ))),
    }
}

/// Create a metadata backend based on configuration.
///
/// # Example
///
/// ```rust,ignore
/// let backend = create_metadata_backend(&settings.metastore).await?;
/// ```
pub async fn create_metadata_backend(
    config: &MetastoreConfig,
) -> Result<Arc<dyn MetadataBackend>> {
    factory_for(config)?.create().await
}
