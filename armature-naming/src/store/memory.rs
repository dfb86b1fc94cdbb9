//! In-memory coordination store (for testing)

use super::{
    CoordinationStore, KeepAliveStream, KeyValue, LeaseId, RangeResponse, WatchEvent,
    WatchEventKind, WatchResponse, WatchStream,
};
use crate::error::{NamingError, NamingResult};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::CancellationToken;

/// One mutation inside a batch committed by [`InMemoryStore::apply`].
#[derive(Debug, Clone)]
pub enum StoreOp {
    Put {
        key: String,
        value: String,
        lease: Option<LeaseId>,
    },
    Delete {
        key: String,
    },
}

impl StoreOp {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        StoreOp::Put {
            key: key.into(),
            value: value.into(),
            lease: None,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        StoreOp::Delete { key: key.into() }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    create_revision: i64,
    mod_revision: i64,
    lease: LeaseId,
}

impl Entry {
    fn to_kv(&self, key: &str) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: self.value.clone(),
            create_revision: self.create_revision,
            mod_revision: self.mod_revision,
            lease: self.lease,
        }
    }
}

struct LeaseState {
    ttl: i64,
    revoked: CancellationToken,
}

#[derive(Default)]
struct State {
    revision: i64,
    next_lease: LeaseId,
    kvs: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, LeaseState>,
}

#[derive(Default)]
struct Faults {
    puts: bool,
    gets: bool,
    grants: bool,
    keep_alives: bool,
    keep_alive_once: bool,
    get_delay: Duration,
    put_delay: Duration,
}

#[derive(Default)]
struct Counters {
    puts: AtomicUsize,
    deletes: AtomicUsize,
    gets: AtomicUsize,
    grants: AtomicUsize,
    probes: AtomicUsize,
}

struct Inner {
    state: Mutex<State>,
    faults: Mutex<Faults>,
    counters: Counters,
    events: broadcast::Sender<WatchResponse>,
    /// Cancelled by `close_watches` and then replaced
    watches_open: Mutex<CancellationToken>,
}

/// In-process store with revisions, prefix watches and leases.
///
/// Leases never lapse on their own; they end through
/// [`CoordinationStore::lease_revoke`]. Faults can be switched on to make
/// individual primitives fail, and counters record how often each
/// primitive was called.
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl InMemoryStore {
    /// Create new in-memory store
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                faults: Mutex::new(Faults::default()),
                counters: Counters::default(),
                events,
                watches_open: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Commit `ops` atomically at one new revision.
    ///
    /// Watchers receive every resulting change in a single response.
    /// Returns the store revision after the batch.
    pub fn apply(&self, ops: Vec<StoreOp>) -> NamingResult<i64> {
        let mut state = self.inner.state.lock();
        let revision = state.revision + 1;
        let mut events = Vec::new();

        for op in &ops {
            if let StoreOp::Put { lease: Some(id), .. } = op {
                if !state.leases.contains_key(id) {
                    return Err(NamingError::LeaseNotFound(*id));
                }
            }
        }

        for op in ops {
            match op {
                StoreOp::Put { key, value, lease } => {
                    let prev = state.kvs.get(&key).cloned();
                    let entry = Entry {
                        value: value.into_bytes(),
                        create_revision: prev.as_ref().map_or(revision, |p| p.create_revision),
                        mod_revision: revision,
                        lease: lease.unwrap_or_default(),
                    };
                    events.push(WatchEvent {
                        kind: WatchEventKind::Put,
                        kv: entry.to_kv(&key),
                        prev_kv: prev.map(|p| p.to_kv(&key)),
                    });
                    state.kvs.insert(key, entry);
                }
                StoreOp::Delete { key } => {
                    if let Some(prev) = state.kvs.remove(&key) {
                        events.push(delete_event(&key, &prev, revision));
                    }
                }
            }
        }

        if events.is_empty() {
            return Ok(state.revision);
        }
        state.revision = revision;
        // No receivers is fine; nobody is watching yet.
        let _ = self.inner.events.send(WatchResponse { revision, events });
        Ok(revision)
    }

    /// Current store revision.
    pub fn revision(&self) -> i64 {
        self.inner.state.lock().revision
    }

    /// Read one key.
    pub fn get(&self, key: &str) -> Option<KeyValue> {
        self.inner.state.lock().kvs.get(key).map(|e| e.to_kv(key))
    }

    /// Number of live leases.
    pub fn lease_count(&self) -> usize {
        self.inner.state.lock().leases.len()
    }

    pub fn fail_puts(&self, fail: bool) {
        self.inner.faults.lock().puts = fail;
    }

    pub fn fail_gets(&self, fail: bool) {
        self.inner.faults.lock().gets = fail;
    }

    pub fn fail_grants(&self, fail: bool) {
        self.inner.faults.lock().grants = fail;
    }

    /// Make new keepalive streams fail to open.
    pub fn fail_keep_alives(&self, fail: bool) {
        self.inner.faults.lock().keep_alives = fail;
    }

    pub fn fail_keep_alive_once(&self, fail: bool) {
        self.inner.faults.lock().keep_alive_once = fail;
    }

    /// Hold every prefix read for `delay` after its snapshot is taken.
    pub fn set_get_delay(&self, delay: Duration) {
        self.inner.faults.lock().get_delay = delay;
    }

    /// Hold every put for `delay` before it is applied.
    pub fn set_put_delay(&self, delay: Duration) {
        self.inner.faults.lock().put_delay = delay;
    }

    /// End every open watch stream. Later watches are unaffected.
    pub fn close_watches(&self) {
        let mut open = self.inner.watches_open.lock();
        open.cancel();
        *open = CancellationToken::new();
    }

    /// Number of live watch subscriptions.
    pub fn watch_count(&self) -> usize {
        self.inner.events.receiver_count()
    }

    /// Put attempts, failed ones included.
    pub fn put_count(&self) -> usize {
        self.inner.counters.puts.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.inner.counters.deletes.load(Ordering::SeqCst)
    }

    pub fn get_count(&self) -> usize {
        self.inner.counters.gets.load(Ordering::SeqCst)
    }

    pub fn grant_count(&self) -> usize {
        self.inner.counters.grants.load(Ordering::SeqCst)
    }

    /// Keepalive-once probes received.
    pub fn probe_count(&self) -> usize {
        self.inner.counters.probes.load(Ordering::SeqCst)
    }

    fn injected(what: &str) -> NamingError {
        NamingError::Store(format!("injected {} failure", what))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn delete_event(key: &str, prev: &Entry, revision: i64) -> WatchEvent {
    WatchEvent {
        kind: WatchEventKind::Delete,
        kv: KeyValue {
            key: key.to_string(),
            value: Vec::new(),
            create_revision: 0,
            mod_revision: revision,
            lease: 0,
        },
        prev_kv: Some(prev.to_kv(key)),
    }
}

#[async_trait]
impl CoordinationStore for InMemoryStore {
    async fn get_prefix(&self, prefix: &str) -> NamingResult<RangeResponse> {
        self.inner.counters.gets.fetch_add(1, Ordering::SeqCst);
        let (fail, delay) = {
            let faults = self.inner.faults.lock();
            (faults.gets, faults.get_delay)
        };
        if fail {
            return Err(Self::injected("get"));
        }

        let snapshot = {
            let state = self.inner.state.lock();
            RangeResponse {
                revision: state.revision,
                kvs: state
                    .kvs
                    .range(prefix.to_string()..)
                    .take_while(|(key, _)| key.starts_with(prefix))
                    .map(|(key, entry)| entry.to_kv(key))
                    .collect(),
            }
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(snapshot)
    }

    async fn put(&self, key: &str, value: String, lease: Option<LeaseId>) -> NamingResult<()> {
        self.inner.counters.puts.fetch_add(1, Ordering::SeqCst);
        let (fail, delay) = {
            let faults = self.inner.faults.lock();
            (faults.puts, faults.put_delay)
        };
        if fail {
            return Err(Self::injected("put"));
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.apply(vec![StoreOp::Put {
            key: key.to_string(),
            value,
            lease,
        }])?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> NamingResult<i64> {
        self.inner.counters.deletes.fetch_add(1, Ordering::SeqCst);
        let existed = self.inner.state.lock().kvs.contains_key(key);
        self.apply(vec![StoreOp::delete(key)])?;
        Ok(i64::from(existed))
    }

    async fn watch_prefix(&self, prefix: &str) -> NamingResult<WatchStream> {
        let prefix = prefix.to_string();
        let closed = self.inner.watches_open.lock().clone();
        let stream = BroadcastStream::new(self.inner.events.subscribe()).filter_map(move |item| {
            let prefix = prefix.clone();
            async move {
                match item {
                    Ok(resp) => {
                        let events: Vec<WatchEvent> = resp
                            .events
                            .into_iter()
                            .filter(|event| event.kv.key.starts_with(&prefix))
                            .collect();
                        if events.is_empty() {
                            None
                        } else {
                            Some(Ok(WatchResponse {
                                revision: resp.revision,
                                events,
                            }))
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(missed)) => Some(Err(NamingError::Store(
                        format!("watch lagged behind by {} responses", missed),
                    ))),
                }
            }
        });
        let stream = stream.take_until(async move { closed.cancelled().await });
        Ok(stream.boxed())
    }

    async fn lease_grant(&self, ttl: i64) -> NamingResult<LeaseId> {
        self.inner.counters.grants.fetch_add(1, Ordering::SeqCst);
        if self.inner.faults.lock().grants {
            return Err(Self::injected("lease grant"));
        }
        let mut state = self.inner.state.lock();
        state.next_lease += 1;
        let id = state.next_lease;
        state.leases.insert(
            id,
            LeaseState {
                ttl: ttl.max(1),
                revoked: CancellationToken::new(),
            },
        );
        Ok(id)
    }

    async fn lease_keep_alive(&self, lease: LeaseId) -> NamingResult<KeepAliveStream> {
        if self.inner.faults.lock().keep_alives {
            return Err(Self::injected("keep-alive"));
        }
        let (ttl, revoked) = {
            let state = self.inner.state.lock();
            let lease_state = state
                .leases
                .get(&lease)
                .ok_or(NamingError::LeaseNotFound(lease))?;
            (lease_state.ttl, lease_state.revoked.clone())
        };

        let interval = Duration::from_secs((ttl / 3).max(1) as u64);
        let stream = futures::stream::unfold(Some(Duration::ZERO), move |delay| {
            let revoked = revoked.clone();
            async move {
                let delay = delay?;
                tokio::select! {
                    _ = revoked.cancelled() => None,
                    _ = tokio::time::sleep(delay) => Some((Ok(ttl), Some(interval))),
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn lease_keep_alive_once(&self, lease: LeaseId) -> NamingResult<i64> {
        self.inner.counters.probes.fetch_add(1, Ordering::SeqCst);
        if self.inner.faults.lock().keep_alive_once {
            return Err(Self::injected("keep-alive probe"));
        }
        self.inner
            .state
            .lock()
            .leases
            .get(&lease)
            .map(|l| l.ttl)
            .ok_or(NamingError::LeaseNotFound(lease))
    }

    async fn lease_revoke(&self, lease: LeaseId) -> NamingResult<()> {
        let removed = self.inner.state.lock().leases.remove(&lease);
        let lease_state = removed.ok_or(NamingError::LeaseNotFound(lease))?;
        lease_state.revoked.cancel();

        let bound: Vec<StoreOp> = self
            .inner
            .state
            .lock()
            .kvs
            .iter()
            .filter(|(_, entry)| entry.lease == lease)
            .map(|(key, _)| StoreOp::delete(key.clone()))
            .collect();
        self.apply(bound)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = InMemoryStore::new();

        store.put("/svc/api/1", "one".to_string(), None).await.unwrap();
        store.put("/svc/api/2", "two".to_string(), None).await.unwrap();
        store.put("/svc/api-admin/1", "x".to_string(), None).await.unwrap();

        let range = store.get_prefix("/svc/api/").await.unwrap();
        assert_eq!(range.revision, 3);
        assert_eq!(range.kvs.len(), 2);
        assert_eq!(range.kvs[0].value, b"one");

        assert_eq!(store.delete("/svc/api/1").await.unwrap(), 1);
        assert_eq!(store.delete("/svc/api/1").await.unwrap(), 0);
        assert_eq!(store.revision(), 4);
        assert_eq!(store.delete_count(), 2);
    }

    #[tokio::test]
    async fn test_revisions_track_create_and_modify() {
        let store = InMemoryStore::new();
        store.put("/k", "a".to_string(), None).await.unwrap();
        store.put("/k", "b".to_string(), None).await.unwrap();

        let kv = store.get("/k").unwrap();
        assert_eq!(kv.create_revision, 1);
        assert_eq!(kv.mod_revision, 2);
    }

    #[tokio::test]
    async fn test_watch_filters_by_prefix_and_batches() {
        let store = InMemoryStore::new();
        let mut watch = store.watch_prefix("/svc/api/").await.unwrap();

        store.put("/svc/other/1", "x".to_string(), None).await.unwrap();
        store
            .apply(vec![
                StoreOp::put("/svc/api/1", "a"),
                StoreOp::put("/svc/api/2", "b"),
                StoreOp::put("/svc/other/2", "y"),
            ])
            .unwrap();

        let resp = watch.next().await.unwrap().unwrap();
        assert_eq!(resp.revision, 2);
        assert_eq!(resp.events.len(), 2);
        assert!(resp.events.iter().all(|e| e.is_create()));
    }

    #[tokio::test]
    async fn test_revoke_deletes_bound_keys_and_ends_keep_alive() {
        let store = InMemoryStore::new();
        let lease = store.lease_grant(5).await.unwrap();
        store.put("/svc/api/1", "a".to_string(), Some(lease)).await.unwrap();
        store.put("/svc/api/2", "b".to_string(), None).await.unwrap();

        let mut watch = store.watch_prefix("/svc/").await.unwrap();
        let mut keep_alive = store.lease_keep_alive(lease).await.unwrap();
        assert_eq!(keep_alive.next().await.unwrap().unwrap(), 5);

        store.lease_revoke(lease).await.unwrap();
        assert!(keep_alive.next().await.is_none());
        assert!(store.get("/svc/api/1").is_none());
        assert!(store.get("/svc/api/2").is_some());

        let resp = watch.next().await.unwrap().unwrap();
        assert_eq!(resp.events[0].kind, WatchEventKind::Delete);
        assert_eq!(resp.events[0].prev_kv.as_ref().unwrap().value, b"a");

        assert!(matches!(
            store.lease_keep_alive_once(lease).await,
            Err(NamingError::LeaseNotFound(_))
        ));
    }

    #[test]
    fn test_batch_commits_at_one_revision() {
        let store = InMemoryStore::new();
        let revision = store
            .apply(vec![StoreOp::put("/a", "1"), StoreOp::put("/b", "2"), StoreOp::delete("/a")])
            .unwrap();

        assert_eq!(revision, 1);
        assert!(store.get("/a").is_none());
        assert_eq!(store.get("/b").unwrap().mod_revision, 1);

        let range = tokio_test::block_on(store.get_prefix("/")).unwrap();
        assert_eq!(range.revision, 1);
        assert_eq!(range.kvs.len(), 1);
    }

    #[tokio::test]
    async fn test_close_watches_ends_open_streams_only() {
        let store = InMemoryStore::new();
        let mut old = store.watch_prefix("/svc/").await.unwrap();
        assert_eq!(store.watch_count(), 1);

        store.close_watches();
        assert!(old.next().await.is_none());
        drop(old);
        assert_eq!(store.watch_count(), 0);

        let mut new = store.watch_prefix("/svc/").await.unwrap();
        store.put("/svc/api/1", "a".to_string(), None).await.unwrap();
        assert_eq!(new.next().await.unwrap().unwrap().revision, 1);
    }

    #[tokio::test]
    async fn test_put_with_unknown_lease_fails() {
        let store = InMemoryStore::new();
        let result = store.put("/k", "v".to_string(), Some(42)).await;
        assert!(matches!(result, Err(NamingError::LeaseNotFound(42))));
        assert_eq!(store.revision(), 0);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = InMemoryStore::new();
        store.fail_puts(true);
        assert!(store.put("/k", "v".to_string(), None).await.is_err());
        assert_eq!(store.put_count(), 1);
        store.fail_puts(false);
        assert!(store.put("/k", "v".to_string(), None).await.is_ok());

        store.fail_grants(true);
        assert!(store.lease_grant(5).await.is_err());
        store.fail_gets(true);
        assert!(store.get_prefix("/").await.is_err());
    }
}
