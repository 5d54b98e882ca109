//! Metadata records and listing options.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::backend::MetaStoreError;
use super::state::QueueState;

/// Bookkeeping stored for one message.
///
/// `created` and `updated` are assigned by the backend; whatever the caller
/// puts there is overwritten on `store_meta`/`update_meta`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Caller-chosen unique identifier
    pub id: String,

    /// Current lifecycle state
    pub state: QueueState,

    /// Delivery attempts made so far
    pub attempts: u32,

    /// Attempt ceiling chosen by the retry policy (never enforced by the store)
    pub max_attempts: u32,

    /// When the next attempt is due; meaningful while `Deferred`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry: Option<DateTime<Utc>>,

    /// When the record was created
    pub created: DateTime<Utc>,

    /// When the record was last mutated
    pub updated: DateTime<Utc>,

    /// Error text from the most recent failed attempt
    #[serde(default)]
    pub last_error: String,

    /// Payload size in bytes
    pub size: u64,

    /// Larger is more urgent
    pub priority: i32,

    /// Caller-defined headers
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl MessageMetadata {
    /// Create a fresh `Incoming` record with zeroed counters.
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            state: QueueState::Incoming,
            attempts: 0,
            max_attempts: 0,
            next_retry: None,
            created: now,
            updated: now,
            last_error: String::new(),
            size: 0,
            priority: 0,
            headers: HashMap::new(),
        }
    }

    pub fn with_state(mut self, state: QueueState) -> Self {
        self.state = state;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Whether a deferred message is due for another attempt at `now`.
    pub fn is_retry_due(&self, now: DateTime<Utc>) -> bool {
        self.state == QueueState::Deferred && self.next_retry.map_or(true, |at| at <= now)
    }

    /// Whether the retry budget is used up.
    pub fn attempts_exhausted(&self) -> bool {
        self.max_attempts > 0 && self.attempts >= self.max_attempts
    }
}

/// Timestamp for a mutation of a record created at `created`.
///
/// Clamped so that `updated >= created` holds even if the wall clock steps back.
pub(crate) fn mutation_timestamp(created: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(created)
}

/// Field used to order `list_messages` results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortField {
    #[default]
    Created,
    Updated,
    Priority,
    Attempts,
}

impl SortField {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortField::Created => "created",
            SortField::Updated => "updated",
            SortField::Priority => "priority",
            SortField::Attempts => "attempts",
        }
    }

    /// Timestamp the `since` filter applies to.
    ///
    /// Non-time sort fields filter on the creation time.
    pub fn since_field(&self) -> SortField {
        match self {
            SortField::Updated => SortField::Updated,
            _ => SortField::Created,
        }
    }
}

impl fmt::Display for SortField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortField {
    type Err = MetaStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "created" => Ok(SortField::Created),
            "updated" => Ok(SortField::Updated),
            "priority" => Ok(SortField::Priority),
            "attempts" => Ok(SortField::Attempts),
            other => Err(MetaStoreError::InvalidOption(format!("unknown sort field: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl FromStr for SortOrder {
    type Err = MetaStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(MetaStoreError::InvalidOption(format!("unknown sort order: {}", other))),
        }
    }
}

/// Options for `list_messages`.
///
/// `limit == 0` requests only the total count.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageListOptions {
    /// Maximum number of ids to return (0 = count only)
    pub limit: usize,
    /// Number of matching ids to skip
    pub offset: usize,
    pub sort_by: SortField,
    pub sort_order: SortOrder,
    /// Inclusive lower bound on the filtered timestamp (see `SortField::since_field`)
    pub since: Option<DateTime<Utc>>,
}

impl MessageListOptions {
    /// Count-only query.
    pub fn count_only() -> Self {
        Self::default()
    }

    /// First page of `limit` ids in creation order.
    pub fn page(limit: usize, offset: usize) -> Self {
        Self {
            limit,
            offset,
            ..Default::default()
        }
    }

    pub fn sorted_by(mut self, field: SortField, order: SortOrder) -> Self {
        self.sort_by = field;
        self.sort_order = order;
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn is_count_only(&self) -> bool {
        self.limit == 0
    }
}

/// Result of `list_messages`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MessageListResult {
    /// Ids of the requested page
    pub message_ids: Vec<String>,

    /// Number of messages matching the state and `since` filter, ignoring paging
    pub total: usize,

    /// Whether messages remain after this page
    pub has_more: bool,
}

impl MessageListResult {
    pub fn new(message_ids: Vec<String>, total: usize, offset: usize) -> Self {
        let has_more = offset.saturating_add(message_ids.len()) < total;
        Self {
            message_ids,
            total,
            has_more,
        }
    }
}
