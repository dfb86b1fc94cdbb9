//! Watch-driven node list cache.
//!
//! Services enter the cache lazily: the first lookup of a name marks it as
//! of interest and reports a miss, the caller fetches the full list from
//! the store and hands it back through [`Cache::cache`]. From then on watch
//! events keep the list current. Every mutation is ordered by the store
//! revision; anything older than what the cache has already seen is
//! rejected.

use crate::backoff::ExponentialBackoff;
use crate::error::{NamingError, NamingResult};
use crate::node::Node;
use crate::watcher::{ChangeEvent, EventType, Watcher};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

#[derive(Debug, Default)]
struct CacheEntry {
    /// `Some(empty)` is a known-empty service, `None` is no snapshot
    nodes: Option<Arc<Vec<Node>>>,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct CacheState {
    /// Only services in this map are of interest
    entries: HashMap<String, CacheEntry>,
    /// Highest store revision incorporated
    version: i64,
}

/// Per-service node lists kept current by a [`Watcher`].
pub struct Cache {
    state: RwLock<CacheState>,
    cache_ttl: Duration,
    watcher: Watcher,
    exit: CancellationToken,
}

/// Whether a cached list may be served.
pub fn is_valid(nodes: Option<&Arc<Vec<Node>>>, expires_at: Option<Instant>) -> bool {
    match (nodes, expires_at) {
        (Some(_), Some(expires_at)) => Instant::now() <= expires_at,
        _ => false,
    }
}

impl Cache {
    /// Create a cache over `watcher` without starting the watch loop.
    pub fn new(watcher: Watcher, cache_ttl: Duration) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            cache_ttl,
            watcher,
            exit: CancellationToken::new(),
        }
    }

    /// Subscribe the watcher and start applying its events.
    pub async fn start(self: &Arc<Self>) -> NamingResult<()> {
        let events = self.watcher.watch().await?;
        tokio::spawn(Arc::clone(self).run(events));
        Ok(())
    }

    /// Look up `service`.
    ///
    /// Returns the cached list when fresh and non-empty,
    /// [`NamingError::ServiceUnavailable`] when fresh and known-empty, or
    /// `Ok(None)` on a miss. A miss marks the service as of interest so a
    /// following [`Cache::cache`] is accepted.
    pub fn list(&self, service: &str) -> NamingResult<Option<Arc<Vec<Node>>>> {
        {
            let state = self.state.read();
            if let Some(entry) = state.entries.get(service) {
                if is_valid(entry.nodes.as_ref(), entry.expires_at) {
                    return match &entry.nodes {
                        Some(nodes) if nodes.is_empty() => {
                            Err(NamingError::ServiceUnavailable(service.to_string()))
                        }
                        nodes => Ok(nodes.clone()),
                    };
                }
                return Ok(None);
            }
        }

        self.state
            .write()
            .entries
            .entry(service.to_string())
            .or_default();
        Ok(None)
    }

    /// Fill `service` with a full snapshot read at `version`.
    ///
    /// Fails with [`NamingError::StaleData`] if the cache already holds a
    /// newer revision. A service nobody asked for is accepted but not
    /// stored.
    pub fn cache(&self, service: &str, version: i64, nodes: Vec<Node>) -> NamingResult<()> {
        let mut state = self.state.write();
        if version < state.version {
            debug!(service = %service, version, current = state.version, "Rejected stale snapshot");
            return Err(NamingError::StaleData);
        }
        state.version = version;

        let cache_ttl = self.cache_ttl;
        if let Some(entry) = state.entries.get_mut(service) {
            set_entry(entry, nodes, cache_ttl);
        }
        Ok(())
    }

    /// Apply one watch event.
    ///
    /// Dropped when older than the cache, for services not of interest, or
    /// before a base snapshot exists. An accepted event always advances the
    /// cache version.
    pub fn update(&self, event: &ChangeEvent) {
        let mut state = self.state.write();
        if event.version < state.version {
            trace!(version = event.version, current = state.version, "Dropped stale event");
            return;
        }

        let service = event.node.name.as_str();
        let Some(nodes) = state
            .entries
            .get(service)
            .and_then(|entry| entry.nodes.clone())
        else {
            return;
        };
        state.version = event.version;

        let position = nodes.iter().position(|n| n.address == event.node.address);
        let cache_ttl = self.cache_ttl;
        let Some(entry) = state.entries.get_mut(service) else {
            return;
        };

        match event.event_type {
            EventType::Create | EventType::Update => match position {
                Some(index) => {
                    if let Some(list) = entry.nodes.as_mut() {
                        Arc::make_mut(list)[index] = event.node.clone();
                    }
                }
                None => {
                    let mut list = nodes.as_ref().clone();
                    list.push(event.node.clone());
                    set_entry(entry, list, cache_ttl);
                }
            },
            EventType::Delete => {
                if position.is_some() {
                    let list = nodes
                        .iter()
                        .filter(|n| n.address != event.node.address)
                        .cloned()
                        .collect();
                    set_entry(entry, list, cache_ttl);
                }
            }
            EventType::Unknown => {}
        }
    }

    /// Drop the cached list of `service`, keeping its interest.
    pub fn invalidate(&self, service: &str) {
        if let Some(entry) = self.state.write().entries.get_mut(service) {
            debug!(service = %service, "Invalidated cached nodes");
            entry.nodes = None;
            entry.expires_at = None;
        }
    }

    fn invalidate_all(&self) {
        for entry in self.state.write().entries.values_mut() {
            entry.nodes = None;
            entry.expires_at = None;
        }
    }

    /// Highest store revision incorporated so far.
    pub fn version(&self) -> i64 {
        self.state.read().version
    }

    /// Whether `service` has been looked up at least once.
    pub fn is_watched(&self, service: &str) -> bool {
        self.state.read().entries.contains_key(service)
    }

    /// Stop the watch loop and the watcher. Idempotent.
    pub fn stop(&self) {
        self.exit.cancel();
        self.watcher.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.exit.is_cancelled()
    }

    async fn run(self: Arc<Self>, mut events: tokio::sync::mpsc::Receiver<ChangeEvent>) {
        let backoff = ExponentialBackoff::default();
        let mut attempt = 0;

        loop {
            tokio::select! {
                _ = self.exit.cancelled() => return,
                event = events.recv() => match event {
                    Some(event) => {
                        attempt = 0;
                        self.update(&event);
                        continue;
                    }
                    None if self.exit.is_cancelled() => return,
                    None => {}
                },
            }

            // The stream ended underneath us: changes may have been missed.
            self.invalidate_all();
            loop {
                let delay = backoff.delay_for_attempt(attempt);
                attempt += 1;
                warn!(prefix = %self.watcher.watch_path(), delay = ?delay, "Watch ended, resubscribing");
                tokio::select! {
                    _ = self.exit.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                match self.watcher.watch().await {
                    Ok(rx) => {
                        events = rx;
                        break;
                    }
                    Err(e) => warn!(error = %e, "Resubscribe failed"),
                }
            }
        }
    }
}

fn set_entry(entry: &mut CacheEntry, nodes: Vec<Node>, cache_ttl: Duration) {
    entry.nodes = Some(Arc::new(nodes));
    entry.expires_at = Some(Instant::now() + cache_ttl);
}
