//! Filesystem metadata backend.
//!
//! Records are JSON files laid out by state:
//!
//! ```text
//! <root>/incoming/m<hex(id)>.json
//! <root>/active/h<hex(id prefix)>-<sha256(id)>.json
//! ...
//! <root>/tmp/            scratch space for atomic writes
//! ```
//!
//! Short ids are hex-encoded whole. Ids whose encoding would not fit in a
//! file name keep a hex prefix plus a SHA-256 digest. The id stored inside
//! the record is authoritative; the file name only has to be derivable from it.
//!
//! Every write goes to `tmp/` first and is renamed into place, so a reader
//! never sees a half-written file. The state index and counters live in
//! memory and are rebuilt by scanning the state directories on open.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::metrics::{MetaStoreMetrics, OperationTimer};

use super::backend::{
    MessageIterator, MetaStoreError, MetadataBackend, Result, StateCounterBackend,
};
use super::context::OpContext;
use super::index::{SortKeys, StateCounters, StateIndex};
use super::iterator::{BatchSource, CursorIterator, DEFAULT_ITERATOR_BATCH_SIZE};
use super::models::{mutation_timestamp, MessageListOptions, MessageListResult, MessageMetadata};
use super::state::QueueState;

const BACKEND_NAME: &str = "file";
const TMP_DIR: &str = "tmp";
const RECORD_EXT: &str = "json";
/// Longest hex encoding used verbatim in a file name
const MAX_HEX_NAME: usize = 200;
/// Hex characters of the id kept in front of the digest for long ids
const HEX_PREFIX_LEN: usize = 64;

/// File name for the record of `id`, always within `NAME_MAX`.
fn record_file_name(id: &str) -> String {
    let encoded = hex::encode(id.as_bytes());
    if encoded.len() <= MAX_HEX_NAME {
        return format!("m{}.{}", encoded, RECORD_EXT);
    }
    let digest = Sha256::digest(id.as_bytes());
    format!(
        "h{}-{}.{}",
        &encoded[..HEX_PREFIX_LEN],
        hex::encode(digest),
        RECORD_EXT
    )
}

/// Options for opening a `FileMetaBackend`.
#[derive(Debug, Clone)]
pub struct FileBackendOptions {
    /// Directory holding the state subdirectories
    pub root_dir: PathBuf,
    /// Flush every record file to disk before renaming it into place
    pub fsync: bool,
    /// Batch size used when an iterator is opened with `batch_size == 0`
    pub iterator_batch_size: usize,
}

impl FileBackendOptions {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            fsync: false,
            iterator_batch_size: DEFAULT_ITERATOR_BATCH_SIZE,
        }
    }

    pub fn with_fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }

    pub fn with_iterator_batch_size(mut self, batch_size: usize) -> Self {
        if batch_size > 0 {
            self.iterator_batch_size = batch_size;
        }
        self
    }
}

struct FileInner {
    root: PathBuf,
    fsync: bool,
    iterator_batch_size: usize,
    index: Arc<RwLock<StateIndex>>,
    counters: StateCounters,
    closed: AtomicBool,
}

impl FileInner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MetaStoreError::BackendClosed);
        }
        Ok(())
    }

    fn state_dir(&self, state: QueueState) -> PathBuf {
        self.root.join(state.as_str())
    }

    fn record_path(&self, state: QueueState, id: &str) -> PathBuf {
        self.state_dir(state).join(record_file_name(id))
    }

    fn read_record(&self, state: QueueState, id: &str) -> Result<MessageMetadata> {
        let record = read_record_file(&self.record_path(state, id), state)?;
        if record.id != id {
            return Err(MetaStoreError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("record file for '{}' holds '{}'", id, record.id),
            )));
        }
        Ok(record)
    }

    /// Write `record` into its state directory via a temp file and rename.
    fn write_record(&self, record: &MessageMetadata) -> Result<PathBuf> {
        let bytes = serde_json::to_vec(record)?;
        let tmp_path = self
            .root
            .join(TMP_DIR)
            .join(format!("{}.tmp", Uuid::new_v4()));

        let written = (|| -> io::Result<()> {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&bytes)?;
            if self.fsync {
                file.sync_all()?;
            }
            Ok(())
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        let target = self.record_path(record.state, &record.id);
        if let Err(e) = fs::rename(&tmp_path, &target) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        Ok(target)
    }

    /// Run `f` on a blocking thread while holding the index write lock.
    ///
    /// Cancellation is only observed while waiting for the lock; once the
    /// closure is scheduled it runs to completion even if the caller goes away.
    async fn with_write<T, F>(self: &Arc<Self>, ctx: &OpContext, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&FileInner, &mut StateIndex) -> Result<T> + Send + 'static,
    {
        let mut guard = ctx.run(self.index.clone().write_owned()).await?;
        self.ensure_open()?;

        let inner = self.clone();
        tokio::task::spawn_blocking(move || f(&inner, &mut guard))
            .await
            .map_err(|e| MetaStoreError::Io(io::Error::other(e)))?
    }

    /// Run `f` on a blocking thread while holding the index read lock.
    async fn with_read<T, F>(self: &Arc<Self>, ctx: &OpContext, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&FileInner, &StateIndex) -> Result<T> + Send + 'static,
    {
        let guard = ctx.run(self.index.clone().read_owned()).await?;
        self.ensure_open()?;

        let inner = self.clone();
        let handle = tokio::task::spawn_blocking(move || f(&inner, &guard));
        ctx.run(handle)
            .await?
            .map_err(|e| MetaStoreError::Io(io::Error::other(e)))?
    }

    /// Scan the state directories and rebuild the index.
    fn load(&self, index: &mut StateIndex) -> Result<()> {
        let tmp = self.root.join(TMP_DIR);
        fs::create_dir_all(&tmp)?;
        for entry in fs::read_dir(&tmp)? {
            let entry = entry?;
            if let Err(e) = fs::remove_file(entry.path()) {
                tracing::warn!(path = %entry.path().display(), error = %e, "Failed to remove stale temp file");
            }
        }

        for state in QueueState::ALL {
            let dir = self.state_dir(state);
            fs::create_dir_all(&dir)?;

            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXT) {
                    tracing::warn!(path = %path.display(), "Skipping unrecognised file in state directory");
                    continue;
                }

                let record = match read_record_file(&path, state) {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable metadata record");
                        continue;
                    }
                };

                let expected = record_file_name(&record.id);
                if path.file_name().and_then(|name| name.to_str()) != Some(expected.as_str()) {
                    tracing::warn!(
                        path = %path.display(),
                        message_id = %record.id,
                        "Skipping record stored under a foreign file name"
                    );
                    continue;
                }

                let id = record.id.clone();
                self.index_loaded(index, state, &id, &record)?;
            }
        }

        Ok(())
    }

    /// Add a record found on disk, resolving copies left in two state
    /// directories by a move interrupted between rename and unlink.
    fn index_loaded(
        &self,
        index: &mut StateIndex,
        state: QueueState,
        id: &str,
        record: &MessageMetadata,
    ) -> Result<()> {
        let keys = SortKeys::of(record);
        let Some(existing) = index.state_of(id) else {
            index.insert(id, state, keys);
            return Ok(());
        };

        let other = self.read_record(existing, id)?;
        let (keep, stale) = if record.updated > other.updated {
            index.relocate(id, state, keys);
            (state, existing)
        } else {
            (existing, state)
        };

        tracing::warn!(
            message_id = %id,
            kept_state = %keep,
            stale_state = %stale,
            "Record found in two state directories, removing stale copy"
        );
        fs::remove_file(self.record_path(stale, id))?;
        Ok(())
    }
}

fn read_record_file(path: &Path, state: QueueState) -> Result<MessageMetadata> {
    let bytes = fs::read(path)?;
    let mut record: MessageMetadata = serde_json::from_slice(&bytes)?;
    // The directory is authoritative for state
    record.state = state;
    Ok(record)
}

/// Iterator source holding the shared backend state.
struct FileBatchSource {
    inner: Arc<FileInner>,
}

#[async_trait]
impl BatchSource for FileBatchSource {
    async fn fetch_batch(
        &self,
        ctx: &OpContext,
        state: QueueState,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MessageMetadata>> {
        let after = after.map(str::to_string);
        self.inner
            .with_read(ctx, move |inner, index| {
                let ids = index.ids_after(state, after.as_deref(), limit);
                let mut batch = Vec::with_capacity(ids.len());
                for id in ids {
                    batch.push(inner.read_record(state, &id)?);
                }
                Ok(batch)
            })
            .await
    }
}

/// Durable metadata backend storing one JSON file per message.
///
/// # Concurrency
///
/// All mutations are serialized through the index write lock, and the lock is
/// held across both the filesystem change and the index/counter update. A
/// move is therefore a single step for every caller of this instance. The
/// directory must not be shared by two open instances.
pub struct FileMetaBackend {
    inner: Arc<FileInner>,
}

impl FileMetaBackend {
    /// Open (or create) a store rooted at `options.root_dir`.
    pub async fn open(options: FileBackendOptions) -> Result<Self> {
        let inner = Arc::new(FileInner {
            root: options.root_dir,
            fsync: options.fsync,
            iterator_batch_size: options.iterator_batch_size,
            index: Arc::new(RwLock::new(StateIndex::new())),
            counters: StateCounters::new(BACKEND_NAME),
            closed: AtomicBool::new(false),
        });

        let loaded = inner
            .with_write(&OpContext::background(), |inner, index| {
                inner.load(index)?;
                inner.counters.sync_from(index);
                Ok(index.len())
            })
            .await?;

        tracing::info!(
            root = %inner.root.display(),
            records = loaded,
            fsync = inner.fsync,
            "File metadata backend opened"
        );

        Ok(Self { inner })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }
}

#[async_trait]
impl MetadataBackend for FileMetaBackend {
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
        let id = message_id.to_string();
        let result = self
            .inner
            .with_write(ctx, move |inner, index| {
                if index.state_of(&id).is_some() {
                    return Err(MetaStoreError::AlreadyExists(id));
                }

                let now = chrono::Utc::now();
                let mut record = metadata;
                record.id = id.clone();
                record.created = now;
                record.updated = now;

                inner.write_record(&record)?;
                index.insert(&id, record.state, SortKeys::of(&record));
                inner.counters.increment(record.state);

                tracing::debug!(
                    message_id = %id,
                    state = %record.state,
                    backend = BACKEND_NAME,
                    "Stored message metadata"
                );
                Ok(())
            })
            .await;
        timer.finish(result)
    }

    async fn get_meta(&self, ctx: &OpContext, message_id: &str) -> Result<MessageMetadata> {
        let timer = OperationTimer::start(BACKEND_NAME, "get_meta");
        let id = message_id.to_string();
        let result = self
            .inner
            .with_read(ctx, move |inner, index| {
                let state = index
                    .state_of(&id)
                    .ok_or_else(|| MetaStoreError::NotFound(id.clone()))?;
                inner.read_record(state, &id)
            })
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
        let id = message_id.to_string();
        let result = self
            .inner
            .with_write(ctx, move |inner, index| {
                let state = index
                    .state_of(&id)
                    .ok_or_else(|| MetaStoreError::NotFound(id.clone()))?;
                let current = inner.read_record(state, &id)?;

                let mut record = metadata;
                record.id = id.clone();
                record.state = state;
                record.created = current.created;
                record.updated = mutation_timestamp(current.created);

                inner.write_record(&record)?;
                index.set_keys(&id, SortKeys::of(&record));

                tracing::trace!(message_id = %id, "Updated message metadata");
                Ok(())
            })
            .await;
        timer.finish(result)
    }

    async fn delete_meta(&self, ctx: &OpContext, message_id: &str) -> Result<()> {
        let timer = OperationTimer::start(BACKEND_NAME, "delete_meta");
        let id = message_id.to_string();
        let result = self
            .inner
            .with_write(ctx, move |inner, index| {
                let state = index
                    .state_of(&id)
                    .ok_or_else(|| MetaStoreError::NotFound(id.clone()))?;

                match fs::remove_file(inner.record_path(state, &id)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        tracing::warn!(message_id = %id, "Record file already missing on delete");
                    }
                    Err(e) => return Err(e.into()),
                }

                index.remove(&id);
                inner.counters.decrement(state);

                tracing::debug!(message_id = %id, "Deleted message metadata");
                Ok(())
            })
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
            let index = ctx.run(self.inner.index.read()).await?;
            self.inner.ensure_open()?;
            Ok(index.list(state, &options))
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
            self.inner.iterator_batch_size
        } else {
            batch_size
        };
        let source = Arc::new(FileBatchSource {
            inner: self.inner.clone(),
        });
        Ok(Box::new(CursorIterator::new(source, state, batch_size)))
    }

    async fn move_to_state(
        &self,
        ctx: &OpContext,
        message_id: &str,
        from_state: QueueState,
        to_state: QueueState,
    ) -> Result<()> {
        let timer = OperationTimer::start(BACKEND_NAME, "move_to_state");
        let id = message_id.to_string();
        let result = self
            .inner
            .with_write(ctx, move |inner, index| {
                let actual = index
                    .state_of(&id)
                    .ok_or_else(|| MetaStoreError::NotFound(id.clone()))?;

                if actual != from_state {
                    tracing::debug!(
                        message_id = %id,
                        from_state = %from_state,
                        actual_state = %actual,
                        "State transition lost race"
                    );
                    return Err(MetaStoreError::StateConflict {
                        id,
                        expected: from_state,
                        actual,
                    });
                }

                let mut record = inner.read_record(from_state, &id)?;
                record.state = to_state;
                record.updated = mutation_timestamp(record.created);

                let written = inner.write_record(&record)?;
                if from_state != to_state {
                    if let Err(e) = fs::remove_file(inner.record_path(from_state, &id)) {
                        // Undo so the record stays in exactly one directory
                        if let Err(undo) = fs::remove_file(&written) {
                            tracing::error!(
                                message_id = %id,
                                error = %undo,
                                "Failed to roll back moved record; reopen will reconcile"
                            );
                        }
                        return Err(e.into());
                    }
                }

                index.relocate(&id, to_state, SortKeys::of(&record));
                inner.counters.transfer(from_state, to_state);

                tracing::debug!(
                    message_id = %id,
                    from_state = %from_state,
                    to_state = %to_state,
                    "Moved message"
                );
                Ok(())
            })
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

        let mut index = self.inner.index.write().await;
        index.clear();
        self.inner.counters.sync_from(&index);

        tracing::info!(
            backend = BACKEND_NAME,
            root = %self.inner.root.display(),
            "Metadata backend closed"
        );
        Ok(())
    }

    fn as_state_counter(&self) -> Option<&dyn StateCounterBackend> {
        Some(self)
    }
}

impl StateCounterBackend for FileMetaBackend {
    fn get_state_count(&self, state: QueueState) -> Result<i64> {
        self.inner.ensure_open()?;
        Ok(self.inner.counters.get(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ctx() -> OpContext {
        OpContext::background()
    }

    async fn open(dir: &TempDir) -> FileMetaBackend {
        FileMetaBackend::open(FileBackendOptions::new(dir.path()))
            .await
            .unwrap()
    }

    #[test]
    fn test_record_file_names() {
        // Ids may contain path separators; the hex name keeps them inside the dir
        let name = record_file_name("../queue/1@host");
        assert_eq!(name, format!("m{}.json", hex::encode("../queue/1@host")));
        assert!(!name.contains('/'));

        // The empty id still gets a visible name with the record extension
        assert_eq!(record_file_name(""), "m.json");
        assert_eq!(
            Path::new(&record_file_name("")).extension().and_then(|e| e.to_str()),
            Some("json")
        );

        let long = "x".repeat(300);
        let name = record_file_name(&long);
        assert!(name.len() <= 255, "{} bytes", name.len());
        assert!(name.starts_with('h'));
        assert_ne!(name, record_file_name(&"x".repeat(301)));
    }

    #[tokio::test]
    async fn test_open_creates_layout() {
        let dir = TempDir::new().unwrap();
        let backend = open(&dir).await;

        for state in QueueState::ALL {
            assert!(dir.path().join(state.as_str()).is_dir());
        }
        assert!(dir.path().join(TMP_DIR).is_dir());
        assert_eq!(backend.root(), dir.path());
    }

    #[tokio::test]
    async fn test_move_relocates_file() {
        let dir = TempDir::new().unwrap();
        let backend = open(&dir).await;

        backend
            .store_meta(&ctx(), "msg-1", MessageMetadata::new("msg-1"))
            .await
            .unwrap();
        backend
            .move_to_state(&ctx(), "msg-1", QueueState::Incoming, QueueState::Deferred)
            .await
            .unwrap();

        let name = record_file_name("msg-1");
        assert!(!dir.path().join("incoming").join(&name).exists());
        assert!(dir.path().join("deferred").join(&name).exists());
        assert_eq!(
            fs::read_dir(dir.path().join(TMP_DIR)).unwrap().count(),
            0,
            "temp files are renamed away"
        );
    }

    #[tokio::test]
    async fn test_reopen_restores_records_and_counts() {
        let dir = TempDir::new().unwrap();
        {
            let backend = open(&dir).await;
            for i in 0..5 {
                let id = format!("msg-{}", i);
                backend
                    .store_meta(&ctx(), &id, MessageMetadata::new(&id).with_header("n", i.to_string()))
                    .await
                    .unwrap();
            }
            backend
                .move_to_state(&ctx(), "msg-0", QueueState::Incoming, QueueState::Hold)
                .await
                .unwrap();
            backend.close().await.unwrap();
        }

        let backend = open(&dir).await;
        assert_eq!(backend.get_state_count(QueueState::Incoming).unwrap(), 4);
        assert_eq!(backend.get_state_count(QueueState::Hold).unwrap(), 1);

        let meta = backend.get_meta(&ctx(), "msg-0").await.unwrap();
        assert_eq!(meta.state, QueueState::Hold);
        assert_eq!(meta.headers.get("n").map(String::as_str), Some("0"));
    }

    #[tokio::test]
    async fn test_reopen_resolves_duplicate_copies() {
        let dir = TempDir::new().unwrap();
        let backend = open(&dir).await;
        backend
            .store_meta(&ctx(), "msg-1", MessageMetadata::new("msg-1"))
            .await
            .unwrap();
        backend
            .move_to_state(&ctx(), "msg-1", QueueState::Incoming, QueueState::Active)
            .await
            .unwrap();
        backend.close().await.unwrap();

        // Simulate a crash between rename and unlink: an older copy in incoming
        let name = record_file_name("msg-1");
        let active = dir.path().join("active").join(&name);
        let mut stale: MessageMetadata =
            serde_json::from_slice(&fs::read(&active).unwrap()).unwrap();
        stale.state = QueueState::Incoming;
        stale.updated = stale.created - chrono::Duration::seconds(1);
        fs::write(
            dir.path().join("incoming").join(&name),
            serde_json::to_vec(&stale).unwrap(),
        )
        .unwrap();

        let backend = open(&dir).await;
        assert_eq!(backend.get_state_count(QueueState::Incoming).unwrap(), 0);
        assert_eq!(backend.get_state_count(QueueState::Active).unwrap(), 1);
        assert!(!dir.path().join("incoming").join(&name).exists());
        assert_eq!(
            backend.get_meta(&ctx(), "msg-1").await.unwrap().state,
            QueueState::Active
        );
    }

    #[tokio::test]
    async fn test_long_and_empty_ids_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let long = "x".repeat(300);
        {
            let backend = open(&dir).await;
            backend
                .store_meta(&ctx(), &long, MessageMetadata::new(long.as_str()))
                .await
                .unwrap();
            backend
                .store_meta(&ctx(), "", MessageMetadata::new("").with_priority(3))
                .await
                .unwrap();
            backend
                .move_to_state(&ctx(), &long, QueueState::Incoming, QueueState::Deferred)
                .await
                .unwrap();
            backend.close().await.unwrap();
        }

        let backend = open(&dir).await;
        assert_eq!(backend.get_state_count(QueueState::Incoming).unwrap(), 1);
        assert_eq!(backend.get_state_count(QueueState::Deferred).unwrap(), 1);
        assert_eq!(backend.get_meta(&ctx(), "").await.unwrap().priority, 3);
        assert_eq!(
            backend.get_meta(&ctx(), &long).await.unwrap().state,
            QueueState::Deferred
        );
    }

    #[tokio::test]
    async fn test_open_skips_record_under_foreign_name() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("hold")).unwrap();
        let record = MessageMetadata::new("real-id").with_state(QueueState::Hold);
        fs::write(
            dir.path().join("hold").join(record_file_name("other-id")),
            serde_json::to_vec(&record).unwrap(),
        )
        .unwrap();

        let backend = open(&dir).await;
        assert_eq!(backend.get_state_count(QueueState::Hold).unwrap(), 0);
        assert!(backend.get_meta(&ctx(), "real-id").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_configured_iterator_batch_size() {
        let dir = TempDir::new().unwrap();
        let backend = FileMetaBackend::open(
            FileBackendOptions::new(dir.path()).with_iterator_batch_size(2),
        )
        .await
        .unwrap();
        for id in ["b0", "b1", "b2", "b3"] {
            backend
                .store_meta(&ctx(), id, MessageMetadata::new(id))
                .await
                .unwrap();
        }

        let mut iter = backend
            .new_message_iterator(&ctx(), QueueState::Incoming, 0)
            .await
            .unwrap();
        assert_eq!(iter.next(&ctx()).await.unwrap().unwrap().id, "b0");

        // b1 is already buffered, b2 is not
        backend.delete_meta(&ctx(), "b1").await.unwrap();
        backend.delete_meta(&ctx(), "b2").await.unwrap();

        let mut rest = Vec::new();
        while let Some(meta) = iter.next(&ctx()).await.unwrap() {
            rest.push(meta.id);
        }
        assert_eq!(rest, vec!["b1", "b3"]);
    }

    #[tokio::test]
    async fn test_open_skips_garbage() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("active")).unwrap();
        fs::write(dir.path().join("active").join("notes.txt"), b"hello").unwrap();
        fs::write(
            dir.path().join("active").join(record_file_name("bad")),
            b"{not json",
        )
        .unwrap();
        fs::create_dir_all(dir.path().join(TMP_DIR)).unwrap();
        fs::write(dir.path().join(TMP_DIR).join("left.tmp"), b"partial").unwrap();

        let backend = open(&dir).await;
        assert_eq!(backend.get_state_count(QueueState::Active).unwrap(), 0);
        assert!(!dir.path().join(TMP_DIR).join("left.tmp").exists());
    }

    #[tokio::test]
    async fn test_fsync_option() {
        let dir = TempDir::new().unwrap();
        let backend = FileMetaBackend::open(FileBackendOptions::new(dir.path()).with_fsync(true))
            .await
            .unwrap();

        backend
            .store_meta(&ctx(), "msg-1", MessageMetadata::new("msg-1").with_size(42))
            .await
            .unwrap();
        assert_eq!(backend.get_meta(&ctx(), "msg-1").await.unwrap().size, 42);
    }

    #[tokio::test]
    async fn test_delete_missing() {
        let dir = TempDir::new().unwrap();
        let backend = open(&dir).await;
        assert!(matches!(
            backend.delete_meta(&ctx(), "nope").await,
            Err(MetaStoreError::NotFound(_))
        ));
    }
}
