//! Batched cursor iteration over one queue state.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;

use super::backend::{MessageIterator, Result};
use super::context::OpContext;
use super::models::MessageMetadata;
use super::state::QueueState;

/// Batch size used when the caller passes zero.
pub const DEFAULT_ITERATOR_BATCH_SIZE: usize = 100;

/// Something that can hand out records of one state in identifier order.
#[async_trait]
pub(crate) trait BatchSource: Send + Sync {
    /// Up to `limit` records in `state` whose id sorts strictly after `after`,
    /// ordered by id.
    async fn fetch_batch(
        &self,
        ctx: &OpContext,
        state: QueueState,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MessageMetadata>>;
}

/// Keyset cursor: remembers the last id handed out and asks the source for
/// the ids after it. The cursor only moves forward, so no id is yielded twice
/// even when records move in and out of the state mid-scan.
pub(crate) struct CursorIterator<S: BatchSource> {
    source: Arc<S>,
    state: QueueState,
    batch_size: usize,
    cursor: Option<String>,
    buffer: VecDeque<MessageMetadata>,
    exhausted: bool,
    closed: bool,
}

impl<S: BatchSource> CursorIterator<S> {
    pub fn new(source: Arc<S>, state: QueueState, batch_size: usize) -> Self {
        let batch_size = if batch_size == 0 {
            DEFAULT_ITERATOR_BATCH_SIZE
        } else {
            batch_size
        };
        Self {
            source,
            state,
            batch_size,
            cursor: None,
            buffer: VecDeque::with_capacity(batch_size),
            exhausted: false,
            closed: false,
        }
    }

    async fn refill(&mut self, ctx: &OpContext) -> Result<()> {
        let batch = self
            .source
            .fetch_batch(ctx, self.state, self.cursor.as_deref(), self.batch_size)
            .await?;

        if batch.len() < self.batch_size {
            self.exhausted = true;
        }
        if let Some(last) = batch.last() {
            self.cursor = Some(last.id.clone());
        }

        tracing::trace!(
            state = %self.state,
            fetched = batch.len(),
            exhausted = self.exhausted,
            "Fetched iterator batch"
        );

        self.buffer.extend(batch);
        Ok(())
    }
}

#[async_trait]
impl<S: BatchSource + 'static> MessageIterator for CursorIterator<S> {
    async fn next(&mut self, ctx: &OpContext) -> Result<Option<MessageMetadata>> {
        if self.closed {
            return Ok(None);
        }
        ctx.check()?;

        if self.buffer.is_empty() && !self.exhausted {
            self.refill(ctx).await?;
        }

        Ok(self.buffer.pop_front())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.buffer = VecDeque::new();
        Ok(())
    }
}
