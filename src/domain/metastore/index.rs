//! Per-state index shared by the in-process backends.
//!
//! The index maps every identifier to its state and sort keys, and keeps one
//! ordered id set per state. Listing and counting are answered from the index
//! alone, so record bodies are only touched when a caller asks for them.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};

use chrono::{DateTime, Utc};

use crate::metrics::MetaStoreMetrics;

use super::models::{MessageListOptions, MessageListResult, MessageMetadata, SortField, SortOrder};
use super::state::QueueState;

/// The subset of a record that listing needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct SortKeys {
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub priority: i32,
    pub attempts: u32,
}

impl SortKeys {
    pub fn of(meta: &MessageMetadata) -> Self {
        Self {
            created: meta.created,
            updated: meta.updated,
            priority: meta.priority,
            attempts: meta.attempts,
        }
    }

    fn timestamp(&self, field: SortField) -> DateTime<Utc> {
        match field {
            SortField::Updated => self.updated,
            _ => self.created,
        }
    }

    fn compare(&self, other: &SortKeys, field: SortField) -> Ordering {
        match field {
            SortField::Created => self.created.cmp(&other.created),
            SortField::Updated => self.updated.cmp(&other.updated),
            SortField::Priority => self.priority.cmp(&other.priority),
            SortField::Attempts => self.attempts.cmp(&other.attempts),
        }
    }
}

#[derive(Debug, Clone)]
struct IndexEntry {
    state: QueueState,
    keys: SortKeys,
}

/// Identifier -> state mapping plus per-state membership sets.
///
/// Callers hold the owning backend's lock across a record change and the
/// matching index change, which keeps both in agreement.
#[derive(Debug, Default)]
pub(crate) struct StateIndex {
    entries: HashMap<String, IndexEntry>,
    members: [BTreeSet<String>; 5],
}

impl StateIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn state_of(&self, id: &str) -> Option<QueueState> {
        self.entries.get(id).map(|e| e.state)
    }

    /// Add a new identifier. Returns `false` if it was already indexed.
    pub fn insert(&mut self, id: &str, state: QueueState, keys: SortKeys) -> bool {
        if self.entries.contains_key(id) {
            return false;
        }
        self.entries.insert(id.to_string(), IndexEntry { state, keys });
        self.members[state.index()].insert(id.to_string());
        true
    }

    /// Remove an identifier, returning the state it was in.
    pub fn remove(&mut self, id: &str) -> Option<QueueState> {
        let entry = self.entries.remove(id)?;
        self.members[entry.state.index()].remove(id);
        Some(entry.state)
    }

    /// Move an indexed identifier to `to` and refresh its keys.
    pub fn relocate(&mut self, id: &str, to: QueueState, keys: SortKeys) -> Option<QueueState> {
        let entry = self.entries.get_mut(id)?;
        let from = entry.state;
        entry.state = to;
        entry.keys = keys;
        if from != to {
            self.members[from.index()].remove(id);
            self.members[to.index()].insert(id.to_string());
        }
        Some(from)
    }

    /// Refresh sort keys without touching membership.
    pub fn set_keys(&mut self, id: &str, keys: SortKeys) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) => {
                entry.keys = keys;
                true
            }
            None => false,
        }
    }

    pub fn count(&self, state: QueueState) -> usize {
        self.members[state.index()].len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        for set in self.members.iter_mut() {
            set.clear();
        }
    }

    /// Up to `limit` ids in `state` strictly after `after`, in id order.
    pub fn ids_after(&self, state: QueueState, after: Option<&str>, limit: usize) -> Vec<String> {
        let set = &self.members[state.index()];
        let lower = match after {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        set.range::<str, _>((lower, Bound::Unbounded))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Answer a `list_messages` query from the index.
    pub fn list(&self, state: QueueState, options: &MessageListOptions) -> MessageListResult {
        let set = &self.members[state.index()];

        if options.is_count_only() && options.since.is_none() {
            return MessageListResult::new(Vec::new(), set.len(), options.offset);
        }

        let since_field = options.sort_by.since_field();
        let mut matching: Vec<(&String, &SortKeys)> = set
            .iter()
            .filter_map(|id| self.entries.get(id).map(|e| (id, &e.keys)))
            .filter(|(_, keys)| match options.since {
                Some(since) => keys.timestamp(since_field) >= since,
                None => true,
            })
            .collect();
        let total = matching.len();

        if options.is_count_only() {
            return MessageListResult::new(Vec::new(), total, options.offset);
        }

        matching.sort_by(|(a_id, a), (b_id, b)| {
            let primary = a.compare(b, options.sort_by);
            let primary = match options.sort_order {
                SortOrder::Asc => primary,
                SortOrder::Desc => primary.reverse(),
            };
            primary.then_with(|| a_id.cmp(b_id))
        });

        let ids = matching
            .into_iter()
            .skip(options.offset)
            .take(options.limit)
            .map(|(id, _)| id.clone())
            .collect();

        MessageListResult::new(ids, total, options.offset)
    }
}

/// Per-state counters exposed through `StateCounterBackend`.
///
/// Updated under the owning backend's write lock, read without locking.
/// Every change is mirrored into the `state_messages` gauge for `backend`.
#[derive(Debug)]
pub(crate) struct StateCounters {
    backend: &'static str,
    counts: [AtomicI64; 5],
}

impl StateCounters {
    pub fn new(backend: &'static str) -> Self {
        Self {
            backend,
            counts: Default::default(),
        }
    }

    pub fn get(&self, state: QueueState) -> i64 {
        self.counts[state.index()].load(AtomicOrdering::Acquire)
    }

    pub fn increment(&self, state: QueueState) {
        let count = self.counts[state.index()].fetch_add(1, AtomicOrdering::AcqRel) + 1;
        MetaStoreMetrics::set_state_count(self.backend, state, count);
    }

    pub fn decrement(&self, state: QueueState) {
        let count = self.counts[state.index()].fetch_sub(1, AtomicOrdering::AcqRel) - 1;
        MetaStoreMetrics::set_state_count(self.backend, state, count);
    }

    pub fn transfer(&self, from: QueueState, to: QueueState) {
        if from != to {
            self.decrement(from);
            self.increment(to);
        }
    }

    /// Reset every counter to the index's membership counts.
    pub fn sync_from(&self, index: &StateIndex) {
        for state in QueueState::ALL {
            let count = index.count(state) as i64;
            self.counts[state.index()].store(count, AtomicOrdering::Release);
            MetaStoreMetrics::set_state_count(self.backend, state, count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn keys_at(offset_secs: i64, priority: i32, attempts: u32) -> SortKeys {
        let base = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let at = base + Duration::seconds(offset_secs);
        SortKeys {
            created: at,
            updated: base + Duration::seconds(200 - offset_secs),
            priority,
            attempts,
        }
    }

    fn sample_index() -> StateIndex {
        let mut index = StateIndex::new();
        index.insert("c", QueueState::Active, keys_at(1, 5, 0));
        index.insert("a", QueueState::Active, keys_at(2, 1, 3));
        index.insert("b", QueueState::Active, keys_at(3, 5, 1));
        index.insert("z", QueueState::Hold, keys_at(4, 0, 0));
        index
    }

    #[test]
    fn test_insert_rejects_duplicates() {
        let mut index = sample_index();
        assert!(!index.insert("a", QueueState::Hold, keys_at(0, 0, 0)));
        assert_eq!(index.state_of("a"), Some(QueueState::Active));
        assert_eq!(index.len(), 4);
    }

    #[test]
    fn test_relocate_moves_membership() {
        let mut index = sample_index();
        let from = index.relocate("a", QueueState::Deferred, keys_at(2, 1, 3));

        assert_eq!(from, Some(QueueState::Active));
        assert_eq!(index.count(QueueState::Active), 2);
        assert_eq!(index.count(QueueState::Deferred), 1);
        assert_eq!(index.state_of("a"), Some(QueueState::Deferred));
        assert!(index.relocate("missing", QueueState::Hold, keys_at(0, 0, 0)).is_none());
    }

    #[test]
    fn test_remove() {
        let mut index = sample_index();
        assert_eq!(index.remove("z"), Some(QueueState::Hold));
        assert_eq!(index.remove("z"), None);
        assert_eq!(index.count(QueueState::Hold), 0);
    }

    #[test]
    fn test_list_default_sort_is_created_ascending() {
        let index = sample_index();
        let result = index.list(QueueState::Active, &MessageListOptions::page(10, 0));

        assert_eq!(result.message_ids, vec!["c", "a", "b"]);
        assert_eq!(result.total, 3);
        assert!(!result.has_more);
    }

    #[test]
    fn test_list_priority_desc_ties_by_id() {
        let index = sample_index();
        let options =
            MessageListOptions::page(10, 0).sorted_by(SortField::Priority, SortOrder::Desc);
        let result = index.list(QueueState::Active, &options);

        // b and c share priority 5; ties are broken by id ascending
        assert_eq!(result.message_ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_list_pagination() {
        let index = sample_index();
        let first = index.list(QueueState::Active, &MessageListOptions::page(2, 0));
        assert_eq!(first.message_ids, vec!["c", "a"]);
        assert!(first.has_more);

        let second = index.list(QueueState::Active, &MessageListOptions::page(2, 2));
        assert_eq!(second.message_ids, vec!["b"]);
        assert!(!second.has_more);
        assert_eq!(second.total, 3);

        let beyond = index.list(QueueState::Active, &MessageListOptions::page(2, 10));
        assert!(beyond.message_ids.is_empty());
        assert_eq!(beyond.total, 3);
    }

    #[test]
    fn test_list_since_filters_sort_field() {
        let index = sample_index();
        let since = keys_at(2, 0, 0).created;

        let by_created = index.list(QueueState::Active, &MessageListOptions::page(10, 0).since(since));
        assert_eq!(by_created.message_ids, vec!["a", "b"]);
        assert_eq!(by_created.total, 2);

        // updated runs the other way: c was updated last
        let by_updated = index.list(
            QueueState::Active,
            &MessageListOptions::page(10, 0)
                .sorted_by(SortField::Updated, SortOrder::Asc)
                .since(keys_at(2, 0, 0).updated),
        );
        assert_eq!(by_updated.message_ids, vec!["a", "c"]);
    }

    #[test]
    fn test_count_only() {
        let index = sample_index();
        let result = index.list(QueueState::Active, &MessageListOptions::count_only());
        assert!(result.message_ids.is_empty());
        assert_eq!(result.total, 3);

        let since = keys_at(3, 0, 0).created;
        let filtered = index.list(QueueState::Active, &MessageListOptions::count_only().since(since));
        assert_eq!(filtered.total, 1);
        assert!(filtered.message_ids.is_empty());
    }

    #[test]
    fn test_ids_after() {
        let index = sample_index();
        assert_eq!(index.ids_after(QueueState::Active, None, 2), vec!["a", "b"]);
        assert_eq!(index.ids_after(QueueState::Active, Some("a"), 10), vec!["b", "c"]);
        assert!(index.ids_after(QueueState::Active, Some("c"), 10).is_empty());
        // The cursor need not be a member any more
        assert_eq!(index.ids_after(QueueState::Active, Some("aa"), 10), vec!["b", "c"]);
    }

    #[test]
    fn test_counters() {
        let index = sample_index();
        let counters = StateCounters::new("index-test");
        counters.sync_from(&index);

        assert_eq!(counters.get(QueueState::Active), 3);
        assert_eq!(counters.get(QueueState::Hold), 1);

        counters.transfer(QueueState::Active, QueueState::Bounce);
        assert_eq!(counters.get(QueueState::Active), 2);
        assert_eq!(counters.get(QueueState::Bounce), 1);

        counters.transfer(QueueState::Bounce, QueueState::Bounce);
        assert_eq!(counters.get(QueueState::Bounce), 1);
    }

    #[test]
    fn test_counters_publish_gauge() {
        let gauge = |state: QueueState| {
            crate::metrics::STATE_MESSAGES
                .with_label_values(&["gauge-test", state.as_str()])
                .get()
        };

        let counters = StateCounters::new("gauge-test");
        counters.sync_from(&sample_index());
        assert_eq!(gauge(QueueState::Active), 3);

        counters.increment(QueueState::Incoming);
        counters.increment(QueueState::Incoming);
        counters.transfer(QueueState::Incoming, QueueState::Deferred);
        counters.decrement(QueueState::Active);

        for state in QueueState::ALL {
            assert_eq!(gauge(state), counters.get(state), "state {}", state);
        }
        assert_eq!(gauge(QueueState::Incoming), 1);
        assert_eq!(gauge(QueueState::Active), 2);
    }
}
