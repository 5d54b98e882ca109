//! In-memory metadata backend.
//!
//! This module provides a memory-based implementation of the `MetadataBackend`
//! trait. Records are lost on restart; intended for tests and single-process
//! deployments where the queue itself is transient.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::metrics::{MetaStoreMetrics, OperationTimer};

use super::backend::{
    MessageIterator, MetaStoreError, MetadataBackend, Result, StateCounterBackend,
};
use super::context::OpContext;
use super::index::{SortKeys, StateCounters, StateIndex};
use super::iterator::{BatchSource, CursorIterator, DEFAULT_ITERATOR_BATCH_SIZE};
use super::models::{mutation_timestamp, MessageListOptions, MessageListResult, MessageMetadata};
use super::state::QueueState;

const BACKEND_NAME: &str = "memory";

#[derive(Default)]
struct MemoryStore {
    records: HashMap<String, MessageMetadata>,
    index: StateIndex,
}

struct MemoryInner {
    store: RwLock<MemoryStore>,
    counters: StateCounters,
    closed: AtomicBool,
}

impl MemoryInner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MetaStoreError::BackendClosed);
        }
        Ok(())
    }
}

/// In-memory metadata backend.
///
/// A single `RwLock` guards the records together with the state index, so
/// every mutation and its index change form one critical section. Critical
/// sections never await, which makes them immune to cancellation once the
/// lock is held.
pub struct MemoryMetaBackend {
    inner: Arc<MemoryInner>,
    iterator_batch_size: usize,
}

impl MemoryMetaBackend {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                store: RwLock::new(MemoryStore::default()),
                counters: StateCounters::new(BACKEND_NAME),
                closed: AtomicBool::new(false),
            }),
            iterator_batch_size: DEFAULT_ITERATOR_BATCH_SIZE,
        }
    }

    /// Batch size used when an iterator is opened with `batch_size == 0`.
    pub fn with_iterator_batch_size(mut self, batch_size: usize) -> Self {
        if batch_size > 0 {
            self.iterator_batch_size = batch_size;
        }
        self
    }

    /// Number of records across all states.
    pub async fn len(&self) -> usize {
        self.inner.store.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemoryMetaBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BatchSource for MemoryInner {
    async fn fetch_batch(
        &self,
        ctx: &OpContext,
        state: QueueState,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MessageMetadata>> {
        let store = ctx.run(self.store.read()).await?;
        self.ensure_open()?;

        Ok(store
            .index
            .ids_after(state, after, limit)
            .iter()
            .filter_map(|id| store.records.get(id).cloned())
            .collect())
    }
}

#[async_trait]
impl MetadataBackend for MemoryMetaBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn store_meta(
        &self,
        ctx: &OpContext,
        message_id: &str,
        metadata: MessageMetadata,
    ) -> Result<()> {
        let timer = OperationTimer::start(BACKEND_NAME, "store_meta");
        let result: Result<()> = async {
            let mut store = ctx.run(self.inner.store.write()).await?;
            self.inner.ensure_open()?;

            if store.records.contains_key(message_id) {
                return Err(MetaStoreError::AlreadyExists(message_id.to_string()));
            }

            let now = chrono::Utc::now();
            let mut record = metadata;
            record.id = message_id.to_string();
            record.created = now;
            record.updated = now;

            let state = record.state;
            store.index.insert(message_id, state, SortKeys::of(&record));
            store.records.insert(message_id.to_string(), record);
            self.inner.counters.increment(state);

            tracing::debug!(
                message_id = %message_id,
                state = %state,
                backend = BACKEND_NAME,
                "Stored message metadata"
            );
            Ok(())
        }
        .await;
        timer.finish(result)
    }

    async fn get_meta(&self, ctx: &OpContext, message_id: &str) -> Result<MessageMetadata> {
        let timer = OperationTimer::start(BACKEND_NAME, "get_meta");
        let result: Result<MessageMetadata> = async {
            let store = ctx.run(self.inner.store.read()).await?;
            self.inner.ensure_open()?;

            store
                .records
                .get(message_id)
                .cloned()
                .ok_or_else(|| MetaStoreError::NotFound(message_id.to_string()))
        }
        .await;
        timer.finish(result)
    }

    async fn update_meta(
        &self,
        ctx: &OpContext,
        message_id: &str,
        metadata: MessageMetadata,
    ) -> Result<()> {
        let timer = OperationTimer::start(BACKEND_NAME, "update_meta");
        let result: Result<()> = async {
            let mut store = ctx.run(self.inner.store.write()).await?;
            self.inner.ensure_open()?;

            let current = store
                .records
                .get(message_id)
                .ok_or_else(|| MetaStoreError::NotFound(message_id.to_string()))?;

            let mut record = metadata;
            record.id = message_id.to_string();
            record.state = current.state;
            record.created = current.created;
            record.updated = mutation_timestamp(current.created);

            store.index.set_keys(message_id, SortKeys::of(&record));
            store.records.insert(message_id.to_string(), record);

            tracing::trace!(message_id = %message_id, "Updated message metadata");
            Ok(())
        }
        .await;
        timer.finish(result)
    }

    async fn delete_meta(&self, ctx: &OpContext, message_id: &str) -> Result<()> {
        let timer = OperationTimer::start(BACKEND_NAME, "delete_meta");
        let result: Result<()> = async {
            let mut store = ctx.run(self.inner.store.write()).await?;
            self.inner.ensure_open()?;

            if store.records.remove(message_id).is_none() {
                return Err(MetaStoreError::NotFound(message_id.to_string()));
            }
            if let Some(state) = store.index.remove(message_id) {
                self.inner.counters.decrement(state);
            }

            tracing::debug!(message_id = %message_id, "Deleted message metadata");
            Ok(())
        }
        .await;
        timer.finish(result)
    }

    async fn list_messages(
        &self,
        ctx: &OpContext,
        state: QueueState,
        options: MessageListOptions,
    ) -> Result<MessageListResult> {
        let timer = OperationTimer::start(BACKEND_NAME, "list_messages");
        let result: Result<MessageListResult> = async {
            let store = ctx.run(self.inner.store.read()).await?;
            self.inner.ensure_open()?;
            Ok(store.index.list(state, &options))
        }
        .await;
        timer.finish(result)
    }

    async fn new_message_iterator(
        &self,
        ctx: &OpContext,
        state: QueueState,
        batch_size: usize,
    ) -> Result<Box<dyn MessageIterator>> {
        ctx.check()?;
        self.inner.ensure_open()?;
        let batch_size = if batch_size == 0 {
            self.iterator_batch_size
        } else {
            batch_size
        };
        Ok(Box::new(CursorIterator::new(
            self.inner.clone(),
            state,
            batch_size,
        )))
    }

    async fn move_to_state(
        &self,
        ctx: &OpContext,
        message_id: &str,
        from_state: QueueState,
        to_state: QueueState,
    ) -> Result<()> {
        let timer = OperationTimer::start(BACKEND_NAME, "move_to_state");
        let result: Result<()> = async {
            let mut store = ctx.run(self.inner.store.write()).await?;
            self.inner.ensure_open()?;

            let record = store
                .records
                .get_mut(message_id)
                .ok_or_else(|| MetaStoreError::NotFound(message_id.to_string()))?;

            if record.state != from_state {
                tracing::debug!(
                    message_id = %message_id,
                    from_state = %from_state,
                    actual_state = %record.state,
                    "State transition lost race"
                );
                return Err(MetaStoreError::StateConflict {
                    id: message_id.to_string(),
                    expected: from_state,
                    actual: record.state,
                });
            }

            record.state = to_state;
            record.updated = mutation_timestamp(record.created);
            let keys = SortKeys::of(record);

            store.index.relocate(message_id, to_state, keys);
            self.inner.counters.transfer(from_state, to_state);

            tracing::debug!(
                message_id = %message_id,
                from_state = %from_state,
                to_state = %to_state,
                "Moved message"
            );
            Ok(())
        }
        .await;

        if result.is_ok() {
            MetaStoreMetrics::record_transition(BACKEND_NAME, from_state, to_state);
        }
        timer.finish(result)
    }

    async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut store = self.inner.store.write().await;
        store.records.clear();
        store.index.clear();
        self.inner.counters.sync_from(&store.index);

        tracing::info!(backend = BACKEND_NAME, "Metadata backend closed");
        Ok(())
    }

    fn as_state_counter(&self) -> Option<&dyn StateCounterBackend> {
        Some(self)
    }
}

impl StateCounterBackend for MemoryMetaBackend {
    fn get_state_count(&self, state: QueueState) -> Result<i64> {
        self.inner.ensure_open()?;
        Ok(self.inner.counters.get(state))
    }
}
