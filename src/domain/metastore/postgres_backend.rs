//! PostgreSQL-based metadata backend.
//!
//! This module provides a persistent implementation of the `MetadataBackend`
//! trait using one `message_metadata` table with tenant isolation. State
//! transitions are a single conditional `UPDATE`, so the database row lock is
//! the compare-and-swap.
//!
//! Cancellation is checked before each statement is sent. A statement that is
//! already in flight when the caller cancels is either fully applied or not at
//! all; the caller receives `Canceled` in both cases.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use sqlx::types::Json;
use sqlx::PgPool;

use crate::metrics::{MetaStoreMetrics, OperationTimer};

use super::backend::{MessageIterator, MetaStoreError, MetadataBackend, Result};
use super::context::OpContext;
use super::iterator::{BatchSource, CursorIterator, DEFAULT_ITERATOR_BATCH_SIZE};
use super::models::{MessageListOptions, MessageListResult, MessageMetadata, SortField, SortOrder};
use super::state::QueueState;

const BACKEND_NAME: &str = "postgres";

const SELECT_COLUMNS: &str = "id, state, attempts, max_attempts, next_retry, created_at, \
     updated_at, last_error, size_bytes, priority, headers";

/// One row of `message_metadata`.
#[derive(Debug, sqlx::FromRow)]
struct MetadataRow {
    id: String,
    state: String,
    attempts: i64,
    max_attempts: i64,
    next_retry: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_error: String,
    size_bytes: i64,
    priority: i32,
    headers: Json<HashMap<String, String>>,
}

impl TryFrom<MetadataRow> for MessageMetadata {
    type Error = MetaStoreError;

    fn try_from(row: MetadataRow) -> Result<Self> {
        Ok(MessageMetadata {
            state: row.state.parse()?,
            id: row.id,
            attempts: clamp_u32(row.attempts),
            max_attempts: clamp_u32(row.max_attempts),
            next_retry: row.next_retry,
            created: row.created_at,
            updated: row.updated_at,
            last_error: row.last_error,
            size: row.size_bytes.max(0) as u64,
            priority: row.priority,
            headers: row.headers.0,
        })
    }
}

fn clamp_u32(value: i64) -> u32 {
    value.clamp(0, u32::MAX as i64) as u32
}

/// Unsigned value as a BIGINT parameter, saturating at `i64::MAX`.
fn to_bigint<T: TryInto<i64>>(value: T) -> i64 {
    value.try_into().unwrap_or(i64::MAX)
}

/// Current time at the database's microsecond precision.
fn db_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn sort_column(field: SortField) -> &'static str {
    match field {
        SortField::Created => "created_at",
        SortField::Updated => "updated_at",
        SortField::Priority => "priority",
        SortField::Attempts => "attempts",
    }
}

/// `WHERE` clause shared by the count and page queries.
///
/// Binds: `$1` tenant, `$2` state, `$3` optional since.
fn list_filter(options: &MessageListOptions) -> String {
    format!(
        "WHERE tenant_id = $1 AND state = $2 AND ($3::timestamptz IS NULL OR {} >= $3)",
        sort_column(options.sort_by.since_field())
    )
}

fn count_query(options: &MessageListOptions) -> String {
    format!("SELECT COUNT(*) FROM message_metadata {}", list_filter(options))
}

/// Page query. Binds `$4` limit and `$5` offset after the filter binds.
fn page_query(options: &MessageListOptions) -> String {
    let direction = match options.sort_order {
        SortOrder::Asc => "ASC",
        SortOrder::Desc => "DESC",
    };
    format!(
        "SELECT id FROM message_metadata {} ORDER BY {} {}, id ASC LIMIT $4 OFFSET $5",
        list_filter(options),
        sort_column(options.sort_by),
        direction
    )
}

struct PostgresInner {
    pool: PgPool,
    tenant_id: String,
    closed: AtomicBool,
}

impl PostgresInner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MetaStoreError::BackendClosed);
        }
        Ok(())
    }

    async fn current_state(&self, ctx: &OpContext, id: &str) -> Result<Option<QueueState>> {
        let row: Option<(String,)> = ctx
            .run(
                sqlx::query_as("SELECT state FROM message_metadata WHERE tenant_id = $1 AND id = $2")
                    .bind(&self.tenant_id)
                    .bind(id)
                    .fetch_optional(&self.pool),
            )
            .await??;

        row.map(|(state,)| state.parse()).transpose()
    }

    /// Total and page read from one repeatable-read snapshot.
    async fn list_page(
        &self,
        state: QueueState,
        options: &MessageListOptions,
    ) -> std::result::Result<(i64, Vec<String>), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;

        let total: i64 = sqlx::query_scalar(&count_query(options))
            .bind(&self.tenant_id)
            .bind(state.as_str())
            .bind(options.since)
            .fetch_one(&mut *tx)
            .await?;

        let ids: Vec<String> = sqlx::query_scalar(&page_query(options))
            .bind(&self.tenant_id)
            .bind(state.as_str())
            .bind(options.since)
            .bind(to_bigint(options.limit))
            .bind(to_bigint(options.offset))
            .fetch_all(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok((total, ids))
    }
}

#[async_trait]
impl BatchSource for PostgresInner {
    async fn fetch_batch(
        &self,
        ctx: &OpContext,
        state: QueueState,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MessageMetadata>> {
        self.ensure_open()?;

        let sql = format!(
            "SELECT {} FROM message_metadata \
             WHERE tenant_id = $1 AND state = $2 AND ($3::text IS NULL OR id > $3) \
             ORDER BY id ASC LIMIT $4",
            SELECT_COLUMNS
        );
        let rows: Vec<MetadataRow> = ctx
            .run(
                sqlx::query_as(&sql)
                    .bind(&self.tenant_id)
                    .bind(state.as_str())
                    .bind(after)
                    .bind(to_bigint(limit))
                    .fetch_all(&self.pool),
            )
            .await??;

        rows.into_iter().map(MessageMetadata::try_from).collect()
    }
}

/// PostgreSQL-based metadata backend.
///
/// Does not implement `StateCounterBackend`: an exact count shared between
/// processes would need a separately maintained counter table. Use
/// `count_in_state`, which falls back to a count-only listing.
pub struct PostgresMetaBackend {
    inner: Arc<PostgresInner>,
    iterator_batch_size: usize,
}

impl PostgresMetaBackend {
    /// Create a new PostgreSQL metadata backend.
    pub fn new(pool: PgPool) -> Self {
        Self::with_tenant(pool, "default".to_string())
    }

    /// Create a new PostgreSQL metadata backend with a specific tenant ID.
    pub fn with_tenant(pool: PgPool, tenant_id: String) -> Self {
        Self {
            inner: Arc::new(PostgresInner {
                pool,
                tenant_id,
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

    pub fn tenant_id(&self) -> &str {
        &self.inner.tenant_id
    }
}

#[async_trait]
impl MetadataBackend for PostgresMetaBackend {
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
            self.inner.ensure_open()?;
            let now = db_now();

            let inserted = ctx
                .run(
                    sqlx::query(
                        r#"
                        INSERT INTO message_metadata (
                            tenant_id, id, state, attempts, max_attempts, next_retry,
                            created_at, updated_at, last_error, size_bytes, priority, headers
                        )
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $7, $8, $9, $10, $11)
                        ON CONFLICT (tenant_id, id) DO NOTHING
                        "#,
                    )
                    .bind(&self.inner.tenant_id)
                    .bind(message_id)
                    .bind(metadata.state.as_str())
                    .bind(i64::from(metadata.attempts))
                    .bind(i64::from(metadata.max_attempts))
                    .bind(metadata.next_retry)
                    .bind(now)
                    .bind(&metadata.last_error)
                    .bind(to_bigint(metadata.size))
                    .bind(metadata.priority)
                    .bind(Json(&metadata.headers))
                    .execute(&self.inner.pool),
                )
                .await??;

            if inserted.rows_affected() == 0 {
                return Err(MetaStoreError::AlreadyExists(message_id.to_string()));
            }

            tracing::debug!(
                message_id = %message_id,
                state = %metadata.state,
                tenant_id = %self.inner.tenant_id,
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
            self.inner.ensure_open()?;

            let sql = format!(
                "SELECT {} FROM message_metadata WHERE tenant_id = $1 AND id = $2",
                SELECT_COLUMNS
            );
            let row: Option<MetadataRow> = ctx
                .run(
                    sqlx::query_as(&sql)
                        .bind(&self.inner.tenant_id)
                        .bind(message_id)
                        .fetch_optional(&self.inner.pool),
                )
                .await??;

            row.ok_or_else(|| MetaStoreError::NotFound(message_id.to_string()))?
                .try_into()
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
            self.inner.ensure_open()?;

            let updated = ctx
                .run(
                    sqlx::query(
                        r#"
                        UPDATE message_metadata
                        SET attempts = $3,
                            max_attempts = $4,
                            next_retry = $5,
                            updated_at = GREATEST($6, created_at),
                            last_error = $7,
                            size_bytes = $8,
                            priority = $9,
                            headers = $10
                        WHERE tenant_id = $1 AND id = $2
                        "#,
                    )
                    .bind(&self.inner.tenant_id)
                    .bind(message_id)
                    .bind(i64::from(metadata.attempts))
                    .bind(i64::from(metadata.max_attempts))
                    .bind(metadata.next_retry)
                    .bind(db_now())
                    .bind(&metadata.last_error)
                    .bind(to_bigint(metadata.size))
                    .bind(metadata.priority)
                    .bind(Json(&metadata.headers))
                    .execute(&self.inner.pool),
                )
                .await??;

            if updated.rows_affected() == 0 {
                return Err(MetaStoreError::NotFound(message_id.to_string()));
            }

            tracing::trace!(message_id = %message_id, "Updated message metadata");
            Ok(())
        }
        .await;
        timer.finish(result)
    }

    async fn delete_meta(&self, ctx: &OpContext, message_id: &str) -> Result<()> {
        let timer = OperationTimer::start(BACKEND_NAME, "delete_meta");
        let result: Result<()> = async {
            self.inner.ensure_open()?;

            let deleted = ctx
                .run(
                    sqlx::query("DELETE FROM message_metadata WHERE tenant_id = $1 AND id = $2")
                        .bind(&self.inner.tenant_id)
                        .bind(message_id)
                        .execute(&self.inner.pool),
                )
                .await??;

            if deleted.rows_affected() == 0 {
                return Err(MetaStoreError::NotFound(message_id.to_string()));
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
            self.inner.ensure_open()?;

            if options.is_count_only() {
                let total: i64 = ctx
                    .run(
                        sqlx::query_scalar(&count_query(&options))
                            .bind(&self.inner.tenant_id)
                            .bind(state.as_str())
                            .bind(options.since)
                            .fetch_one(&self.inner.pool),
                    )
                    .await??;
                return Ok(MessageListResult::new(Vec::new(), total as usize, options.offset));
            }

            // An abandoned transaction is rolled back when dropped
            let (total, ids) = ctx.run(self.inner.list_page(state, &options)).await??;
            Ok(MessageListResult::new(ids, total as usize, options.offset))
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
            self.inner.ensure_open()?;

            let moved = ctx
                .run(
                    sqlx::query(
                        r#"
                        UPDATE message_metadata
                        SET state = $4, updated_at = GREATEST($5, created_at)
                        WHERE tenant_id = $1 AND id = $2 AND state = $3
                        "#,
                    )
                    .bind(&self.inner.tenant_id)
                    .bind(message_id)
                    .bind(from_state.as_str())
                    .bind(to_state.as_str())
                    .bind(db_now())
                    .execute(&self.inner.pool),
                )
                .await??;

            if moved.rows_affected() == 1 {
                tracing::debug!(
                    message_id = %message_id,
                    from_state = %from_state,
                    to_state = %to_state,
                    "Moved message"
                );
                return Ok(());
            }

            // Nothing matched: tell a missing record apart from a lost race
            match self.inner.current_state(ctx, message_id).await? {
                None => Err(MetaStoreError::NotFound(message_id.to_string())),
                Some(actual) => {
                    tracing::debug!(
                        message_id = %message_id,
                        from_state = %from_state,
                        actual_state = %actual,
                        "State transition lost race"
                    );
                    Err(MetaStoreError::StateConflict {
                        id: message_id.to_string(),
                        expected: from_state,
                        actual,
                    })
                }
            }
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

        self.inner.pool.close().await;
        tracing::info!(
            backend = BACKEND_NAME,
            tenant_id = %self.inner.tenant_id,
            "Metadata backend closed"
        );
        Ok(())
    }
}
