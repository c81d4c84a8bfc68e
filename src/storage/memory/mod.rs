//! In-memory stream store.
//!
//! Emulates the subset of Redis streams, consumer groups and hashes the
//! event bus relies on. Useful for local development and for testing
//! without an external store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use deadpool::managed::{Manager, Metrics, RecycleError, RecycleResult};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::{GroupInit, ReadCursor, Result, StoreError, StreamConnection, StreamEntry};

#[derive(Default)]
struct MemoryGroup {
    /// Index of the next entry never delivered to this group.
    cursor: usize,
    /// Delivered, unacknowledged entries: entry index -> consumer.
    pending: BTreeMap<usize, String>,
}

#[derive(Default)]
struct MemoryStream {
    entries: Vec<StreamEntry>,
    groups: HashMap<String, MemoryGroup>,
}

#[derive(Default)]
struct StoreState {
    streams: HashMap<String, MemoryStream>,
    hashes: HashMap<String, HashMap<String, String>>,
    last_id: (u64, u64),
}

impl StoreState {
    fn next_id(&mut self) -> String {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        self.last_id = if now > self.last_id.0 {
            (now, 0)
        } else {
            (self.last_id.0, self.last_id.1 + 1)
        };
        format!("{}-{}", self.last_id.0, self.last_id.1)
    }
}

#[derive(Default)]
struct StoreInner {
    state: Mutex<StoreState>,
    appended: Notify,
    offline: AtomicBool,
    failing_reads: AtomicUsize,
    failing_hash_writes: AtomicUsize,
    failing_acks: AtomicUsize,
    connects: AtomicUsize,
}

/// Shared in-memory store. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_online(&self) -> Result<()> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Connect("memory store offline".to_string()));
        }
        Ok(())
    }

    /// Refuse new connections and fail commands while offline.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `count` group reads.
    pub fn fail_next_reads(&self, count: usize) {
        self.inner.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` hash writes.
    pub fn fail_next_hash_writes(&self, count: usize) {
        self.inner.failing_hash_writes.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` acknowledgements.
    pub fn fail_next_acks(&self, count: usize) {
        self.inner.failing_acks.store(count, Ordering::SeqCst);
    }

    /// Number of sessions opened against this store.
    pub fn connections_opened(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Open an unpooled session.
    pub fn connect(&self) -> Result<MemoryConnection> {
        self.check_online()?;
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryConnection {
            store: self.clone(),
        })
    }

    pub fn stream_len(&self, stream: &str) -> usize {
        self.state()
            .streams
            .get(stream)
            .map(|s| s.entries.len())
            .unwrap_or(0)
    }

    pub fn group_exists(&self, stream: &str, group: &str) -> bool {
        self.state()
            .streams
            .get(stream)
            .map(|s| s.groups.contains_key(group))
            .unwrap_or(false)
    }

    /// Number of entries delivered to `group` but not yet acknowledged.
    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.state()
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    /// Read a hash field without opening a session.
    pub fn hash_field(&self, key: &str, field: &str) -> Option<String> {
        self.state()
            .hashes
            .get(key)
            .and_then(|h| h.get(field))
            .cloned()
    }

    fn take_injected_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut state = self.state();
        let no_group = || {
            StoreError::Command(format!(
                "NOGROUP No such key '{}' or consumer group '{}'",
                stream, group
            ))
        };
        let stream_state = state.streams.get_mut(stream).ok_or_else(no_group)?;
        let group_state = stream_state.groups.get_mut(group).ok_or_else(no_group)?;

        let mut batch = Vec::new();
        match cursor {
            ReadCursor::Pending => {
                for (index, owner) in group_state.pending.iter() {
                    if batch.len() == count {
                        break;
                    }
                    if owner == consumer {
                        batch.push(stream_state.entries[*index].clone());
                    }
                }
            }
            ReadCursor::New => {
                let end = (group_state.cursor + count).min(stream_state.entries.len());
                for index in group_state.cursor..end {
                    group_state.pending.insert(index, consumer.to_string());
                    batch.push(stream_state.entries[index].clone());
                }
                group_state.cursor = end;
            }
        }
        Ok(batch)
    }
}

/// One session against a `MemoryStore`.
pub struct MemoryConnection {
    store: MemoryStore,
}

#[async_trait]
impl StreamConnection for MemoryConnection {
    async fn create_group(&mut self, stream: &str, group: &str) -> Result<GroupInit> {
        self.store.check_online()?;
        let mut state = self.store.state();
        let stream_state = state.streams.entry(stream.to_string()).or_default();

        if stream_state.groups.contains_key(group) {
            return Ok(GroupInit::Existing);
        }

        let tail = stream_state.entries.len();
        stream_state.groups.insert(
            group.to_string(),
            MemoryGroup {
                cursor: tail,
                pending: BTreeMap::new(),
            },
        );
        Ok(GroupInit::Created)
    }

    async fn append(&mut self, stream: &str, fields: &[(&str, &str)]) -> Result<String> {
        self.store.check_online()?;
        let id = {
            let mut state = self.store.state();
            let id = state.next_id();
            let entry = StreamEntry {
                id: id.clone(),
                fields: fields
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            };
            state
                .streams
                .entry(stream.to_string())
                .or_default()
                .entries
                .push(entry);
            id
        };
        self.store.inner.appended.notify_waiters();
        Ok(id)
    }

    async fn read_group(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        self.store.check_online()?;
        if MemoryStore::take_injected_failure(&self.store.inner.failing_reads) {
            return Err(StoreError::Command("injected read failure".to_string()));
        }

        if cursor == ReadCursor::Pending {
            return self.store.claim(stream, group, consumer, cursor, count);
        }

        let deadline = Instant::now() + block;
        loop {
            let appended = self.store.inner.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            let batch = self.store.claim(stream, group, consumer, cursor, count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(batch);
            }
            if tokio::time::timeout(deadline - now, appended).await.is_err() {
                debug!(stream = %stream, group = %group, "Group read timed out");
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&mut self, stream: &str, group: &str, id: &str) -> Result<()> {
        self.store.check_online()?;
        if MemoryStore::take_injected_failure(&self.store.inner.failing_acks) {
            return Err(StoreError::Command("injected ack failure".to_string()));
        }
        let mut state = self.store.state();
        if let Some(stream_state) = state.streams.get_mut(stream) {
            let index = stream_state.entries.iter().position(|e| e.id == id);
            if let (Some(index), Some(group_state)) = (index, stream_state.groups.get_mut(group)) {
                group_state.pending.remove(&index);
            }
        }
        Ok(())
    }

    async fn hash_set(&mut self, key: &str, field: &str, value: &str) -> Result<()> {
        self.store.check_online()?;
        if MemoryStore::take_injected_failure(&self.store.inner.failing_hash_writes) {
            return Err(StoreError::Command("injected hash write failure".to_string()));
        }
        self.store
            .state()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_get(&mut self, key: &str, field: &str) -> Result<Option<String>> {
        self.store.check_online()?;
        Ok(self.store.hash_field(key, field))
    }
}

/// Pool manager handing out `MemoryConnection`s.
pub struct MemoryManager {
    store: MemoryStore,
}

impl MemoryManager {
    pub fn new(store: MemoryStore) -> Self {
        Self { store }
    }
}

impl Manager for MemoryManager {
    type Type = MemoryConnection;
    type Error = StoreError;

    async fn create(&self) -> std::result::Result<MemoryConnection, StoreError> {
        self.store.connect()
    }

    async fn recycle(
        &self,
        _conn: &mut MemoryConnection,
        _metrics: &Metrics,
    ) -> RecycleResult<StoreError> {
        self.store.check_online().map_err(RecycleError::Backend)
    }
}
