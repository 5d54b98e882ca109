//! Metadata store for the message retry queue.
//!
//! Each queued message has one metadata record holding its lifecycle state,
//! retry bookkeeping and indexing fields. Workers claim messages by moving them
//! between states with `move_to_state`, a compare-and-swap that exactly one
//! concurrent caller wins.
//!
//! # Architecture
//!
//! The store uses a backend abstraction to support different storage
//! implementations:
//!
//! - `MemoryMetaBackend`: In-memory storage (default)
//! - `FileMetaBackend`: One JSON file per record, grouped by state directory
//! - `PostgresMetaBackend`: Persistent storage using PostgreSQL
//!
//! Use `create_metadata_backend()` to create the appropriate backend based on
//! configuration. Memory and file backends also implement
//! `StateCounterBackend`; use `count_in_state()` to get a count from any
//! backend.

pub mod backend;
mod context;
mod factory;
pub mod file_backend;
mod index;
mod iterator;
pub mod memory_backend;
mod models;
pub mod postgres_backend;
mod state;

pub use backend::{
    count_in_state, MessageIterator, MetaStoreError, MetadataBackend, Result, StateCounterBackend,
};
pub use context::OpContext;
pub use factory::{
    create_metadata_backend, factory_for, BackendFactory, FileBackendFactory,
    MemoryBackendFactory, PostgresBackendFactory,
};
pub use file_backend::{FileBackendOptions, FileMetaBackend};
pub use iterator::DEFAULT_ITERATOR_BATCH_SIZE;
pub use memory_backend::MemoryMetaBackend;
pub use models::{MessageListOptions, MessageListResult, MessageMetadata, SortField, SortOrder};
pub use postgres_backend::PostgresMetaBackend;
pub use state::QueueState;
