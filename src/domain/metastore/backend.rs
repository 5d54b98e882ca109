//! Backend trait for message metadata storage.
//!
//! This module defines the contract every metadata backend (memory, file,
//! PostgreSQL) implements, the optional fast-counting extension, and the
//! streaming iterator abstraction.

use async_trait::async_trait;
use thiserror::Error;

use super::context::OpContext;
use super::models::{MessageListOptions, MessageListResult, MessageMetadata};
use super::state::QueueState;

/// Errors that can occur during metadata backend operations.
#[derive(Debug, Error)]
pub enum MetaStoreError {
    /// No record exists for the identifier
    #[error("message not found: {0}")]
    NotFound(String),

    /// A record already exists for the identifier
    #[error("message already exists: {0}")]
    AlreadyExists(String),

    /// Compare-and-swap precondition failed; another caller moved the message first
    #[error("state conflict for message {id}: expected {expected}, found {actual}")]
    StateConflict {
        id: String,
        expected: QueueState,
        actual: QueueState,
    },

    /// Unknown or unsupported queue state value
    #[error("invalid queue state: {0}")]
    InvalidState(String),

    /// Unknown listing option value
    #[error("invalid option: {0}")]
    InvalidOption(String),

    /// Operation attempted after `close`
    #[error("backend is closed")]
    BackendClosed,

    /// Operation aborted by the caller's context
    #[error("operation canceled")]
    Canceled,

    /// Operation aborted because the caller's deadline passed
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Filesystem operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// PostgreSQL operation failed
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// Backend could not be constructed from its configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl MetaStoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, MetaStoreError::NotFound(_))
    }

    /// Another worker already claimed or moved the message.
    pub fn is_state_conflict(&self) -> bool {
        matches!(self, MetaStoreError::StateConflict { .. })
    }

    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MetaStoreError::Canceled
                | MetaStoreError::DeadlineExceeded
                | MetaStoreError::Io(_)
                | MetaStoreError::Postgres(_)
        )
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            MetaStoreError::NotFound(_) => "not_found",
            MetaStoreError::AlreadyExists(_) => "already_exists",
            MetaStoreError::StateConflict { .. } => "state_conflict",
            MetaStoreError::InvalidState(_) => "invalid_state",
            MetaStoreError::InvalidOption(_) => "invalid_option",
            MetaStoreError::BackendClosed => "closed",
            MetaStoreError::Canceled => "canceled",
            MetaStoreError::DeadlineExceeded => "deadline_exceeded",
            MetaStoreError::Io(_) => "io",
            MetaStoreError::Serialization(_) => "serialization",
            MetaStoreError::Postgres(_) => "postgres",
            MetaStoreError::Config(_) => "config",
        }
    }
}

pub type Result<T> = std::result::Result<T, MetaStoreError>;

/// Backend trait for message metadata storage.
///
/// # Thread Safety
///
/// Implementations must be thread-safe (`Send + Sync`); a single instance is
/// shared by every worker as `Arc<dyn MetadataBackend>` and all methods may be
/// called concurrently without external locking.
///
/// # Consistency
///
/// Operations on one identifier are linearizable. The per-state index used by
/// `list_messages` (and by counters, when present) always agrees with each
/// record's own `state`; it is changed inside the same atomic step as the
/// record.
///
/// # Error Handling
///
/// `NotFound` and `StateConflict` are ordinary outcomes that callers branch
/// on. `BackendClosed` and `InvalidState` indicate misuse.
#[async_trait]
pub trait MetadataBackend: Send + Sync {
    /// Backend kind, e.g. `"memory"`.
    fn name(&self) -> &'static str;

    /// Create a record.
    ///
    /// `created` and `updated` are set by the store. Fails with
    /// `AlreadyExists` if `message_id` is present; nothing changes in that case.
    async fn store_meta(
        &self,
        ctx: &OpContext,
        message_id: &str,
        metadata: MessageMetadata,
    ) -> Result<()>;

    /// Fetch the current record.
    async fn get_meta(&self, ctx: &OpContext, message_id: &str) -> Result<MessageMetadata>;

    /// Replace the mutable fields of a record and refresh `updated`.
    ///
    /// `state` and `created` are kept from the stored record. State changes
    /// go through `move_to_state`.
    async fn update_meta(
        &self,
        ctx: &OpContext,
        message_id: &str,
        metadata: MessageMetadata,
    ) -> Result<()>;

    /// Remove a record and its index membership.
    ///
    /// Deleting an absent identifier fails with `NotFound`.
    async fn delete_meta(&self, ctx: &OpContext, message_id: &str) -> Result<()>;

    /// List identifiers currently in `state`.
    ///
    /// With `options.limit == 0` only `total` is computed.
    async fn list_messages(
        &self,
        ctx: &OpContext,
        state: QueueState,
        options: MessageListOptions,
    ) -> Result<MessageListResult>;

    /// Open a forward-only cursor over the messages in `state`.
    ///
    /// `batch_size` bounds how many records are fetched per round trip; zero
    /// selects the backend default.
    async fn new_message_iterator(
        &self,
        ctx: &OpContext,
        state: QueueState,
        batch_size: usize,
    ) -> Result<Box<dyn MessageIterator>>;

    /// Atomically move a message from `from_state` to `to_state`.
    ///
    /// Fails with `StateConflict` if the message is not in `from_state` and
    /// with `NotFound` if it does not exist.
    async fn move_to_state(
        &self,
        ctx: &OpContext,
        message_id: &str,
        from_state: QueueState,
        to_state: QueueState,
    ) -> Result<()>;

    /// Release resources. Idempotent; later calls fail with `BackendClosed`.
    async fn close(&self) -> Result<()>;

    /// Fast counting capability, if this backend has one.
    fn as_state_counter(&self) -> Option<&dyn StateCounterBackend> {
        None
    }
}

/// Optional extension for backends that maintain per-state counters.
///
/// Counters change in the same atomic step as index membership, so they never
/// drift from what `list_messages` would report.
pub trait StateCounterBackend: MetadataBackend {
    /// Number of messages currently in `state`.
    fn get_state_count(&self, state: QueueState) -> Result<i64>;
}

/// Streaming access to the messages in one state.
///
/// Iterators are single-owner and weakly consistent: records changed after
/// the iterator was opened may or may not be seen, but none is returned twice
/// and none is returned half-written.
#[async_trait]
pub trait MessageIterator: Send {
    /// Next record, `Ok(None)` once exhausted.
    async fn next(&mut self, ctx: &OpContext) -> Result<Option<MessageMetadata>>;

    /// Release buffered records. Idempotent.
    async fn close(&mut self) -> Result<()>;
}

/// Count messages in `state`, using the fast counter when the backend has one
/// and a count-only listing otherwise.
pub async fn count_in_state(
    backend: &dyn MetadataBackend,
    ctx: &OpContext,
    state: QueueState,
) -> Result<i64> {
    if let Some(counter) = backend.as_state_counter() {
        ctx.check()?;
        return counter.get_state_count(state);
    }

    let result = backend
        .list_messages(ctx, state, MessageListOptions::count_only())
        .await?;
    Ok(result.total as i64)
}
