//! PostgreSQL persistence module.
//!
//! Provides connection pooling and schema bootstrap for the PostgreSQL backend.

pub mod pool;

pub use pool::{mask_database_url, PostgresPool, PostgresPoolError};
