//! Cached service discovery.

use crate::cache::Cache;
use crate::config::DiscoveryConfig;
use crate::error::{NamingError, NamingResult};
use crate::node::{Node, service_path};
use crate::service::{DiscoveryOptions, ServiceDiscovery};
use crate::store::CoordinationStore;
use crate::watcher::Watcher;
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

type Fetch = Shared<BoxFuture<'static, NamingResult<Arc<Vec<Node>>>>>;

/// Resolves service names to node lists.
///
/// Lookups are served from the [`Cache`]; a miss triggers one
/// authoritative read from the store per service name, shared by every
/// caller that misses while it is in flight.
pub struct Discovery {
    store: Arc<dyn CoordinationStore>,
    cache: Arc<Cache>,
    config: DiscoveryConfig,
    inflight: Mutex<HashMap<String, Fetch>>,
}

impl Discovery {
    /// Create discovery over `store` and start watching the prefix.
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// use armature_naming::*;
    /// use std::sync::Arc;
    ///
    /// let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryStore::new());
    /// let discovery = Discovery::new(store, DiscoveryConfig::default()).await?;
    /// let nodes = discovery.list("api").await?;
    /// ```
    pub async fn new(store: Arc<dyn CoordinationStore>, config: DiscoveryConfig) -> NamingResult<Self> {
        let watcher = Watcher::new(Arc::clone(&store), &config.prefix);
        let cache = Arc::new(Cache::new(watcher, config.cache_ttl));
        cache.start().await?;

        Ok(Self {
            store,
            cache,
            config,
            inflight: Mutex::new(HashMap::new()),
        })
    }

    /// Nodes of `service` using the configured fetch timeout.
    pub async fn list(&self, service: &str) -> NamingResult<Arc<Vec<Node>>> {
        self.list_with_timeout(service, self.config.timeout).await
    }

    async fn list_with_timeout(&self, service: &str, timeout: Duration) -> NamingResult<Arc<Vec<Node>>> {
        if let Some(nodes) = self.cache.list(service)? {
            return Ok(nodes);
        }

        let nodes = self.fetch(service, timeout).await.inspect_err(|e| {
            error!(service = %service, error = %e, "Failed to fetch nodes from store");
        })?;

        if nodes.is_empty() {
            return Err(NamingError::ServiceUnavailable(service.to_string()));
        }
        Ok(nodes)
    }

    /// Join the in-flight fetch for `service`, or start one.
    async fn fetch(&self, service: &str, timeout: Duration) -> NamingResult<Arc<Vec<Node>>> {
        let fetch = {
            let mut inflight = self.inflight.lock();
            match inflight.get(service) {
                Some(fetch) => fetch.clone(),
                None => {
                    let fetch = fetch_and_fill(
                        Arc::clone(&self.store),
                        Arc::clone(&self.cache),
                        self.config.prefix.clone(),
                        service.to_string(),
                        timeout,
                    )
                    .boxed()
                    .shared();
                    inflight.insert(service.to_string(), fetch.clone());
                    fetch
                }
            }
        };

        let result = fetch.clone().await;

        let mut inflight = self.inflight.lock();
        if inflight
            .get(service)
            .is_some_and(|current| Shared::ptr_eq(current, &fetch))
        {
            inflight.remove(service);
        }
        result
    }

    /// The cache behind this discovery.
    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// Stop the watch loop. Lookups keep working from the store.
    pub fn stop(&self) {
        self.cache.stop();
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.cache.stop();
    }
}

/// Read every node of `service`, then offer the snapshot to the cache.
///
/// A snapshot older than what the cache already applied is not stored;
/// the entry is invalidated so the next lookup reads again.
async fn fetch_and_fill(
    store: Arc<dyn CoordinationStore>,
    cache: Arc<Cache>,
    prefix: String,
    service: String,
    timeout: Duration,
) -> NamingResult<Arc<Vec<Node>>> {
    let path = service_path(&prefix, &service);
    let range = tokio::time::timeout(timeout, store.get_prefix(&path)).await??;

    let nodes: Vec<Node> = range
        .kvs
        .iter()
        .filter_map(|kv| match Node::decode(&kv.value) {
            Ok(node) => node,
            Err(e) => {
                warn!(key = %kv.key, error = %e, "Skipping undecodable node");
                None
            }
        })
        .collect();
    debug!(service = %service, revision = range.revision, count = nodes.len(), "Fetched nodes");

    match cache.cache(&service, range.revision, nodes.clone()) {
        Err(NamingError::StaleData) => cache.invalidate(&service),
        Err(e) => return Err(e),
        Ok(()) => {}
    }

    Ok(Arc::new(nodes))
}

#[async_trait]
impl ServiceDiscovery for Discovery {
    async fn list(&self, service: &str, options: &DiscoveryOptions) -> NamingResult<Arc<Vec<Node>>> {
        let timeout = options.timeout.unwrap_or(self.config.timeout);
        self.list_with_timeout(service, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::node_path;
    use crate::store::InMemoryStore;

    const PREFIX: &str = "/test/services";

    fn config() -> DiscoveryConfig {
        DiscoveryConfig::new(PREFIX).with_timeout(Duration::from_secs(1))
    }

    async fn publish(store: &InMemoryStore, service: &str, address: &str) -> Node {
        let node = Node::new(service, format!("{}-1", address), address);
        store
            .put(&node_path(PREFIX, service, &node.id), node.encode().unwrap(), None)
            .await
            .unwrap();
        node
    }

    async fn eventually<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_list_fetches_then_serves_from_cache() {
        let store = InMemoryStore::new();
        publish(&store, "api", "10.0.0.1:80").await;
        publish(&store, "api-admin", "10.0.0.9:80").await;
        let discovery = Discovery::new(Arc::new(store.clone()), config()).await.unwrap();

        let nodes = discovery.list("api").await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].address, "10.0.0.1:80");

        discovery.list("api").await.unwrap();
        assert_eq!(store.get_count(), 1);
    }

    #[tokio::test]
    async fn test_watch_keeps_cache_converging() {
        let store = InMemoryStore::new();
        publish(&store, "api", "10.0.0.1:80").await;
        let discovery = Discovery::new(Arc::new(store.clone()), config()).await.unwrap();
        discovery.list("api").await.unwrap();

        publish(&store, "api", "10.0.0.2:80").await;
        let cache = Arc::clone(discovery.cache());
        assert!(eventually(|| matches!(cache.list("api"), Ok(Some(n)) if n.len() == 2)).await);

        assert_eq!(discovery.list("api").await.unwrap().len(), 2);
        assert_eq!(store.get_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_and_empty_services_are_unavailable() {
        let store = InMemoryStore::new();
        let discovery = Discovery::new(Arc::new(store.clone()), config()).await.unwrap();

        let first = discovery.list("ghost").await;
        assert_eq!(first, Err(NamingError::ServiceUnavailable("ghost".to_string())));

        let second = discovery.list("ghost").await;
        assert_eq!(second, Err(NamingError::ServiceUnavailable("ghost".to_string())));
        assert_eq!(store.get_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_fetch() {
        let store = InMemoryStore::new();
        publish(&store, "api", "10.0.0.1:80").await;
        store.set_get_delay(Duration::from_millis(50));
        let discovery = Arc::new(Discovery::new(Arc::new(store.clone()), config()).await.unwrap());

        let lookups = (0..10).map(|_| {
            let discovery = Arc::clone(&discovery);
            async move { discovery.list("api").await }
        });
        let results = futures::future::join_all(lookups).await;

        assert!(results.iter().all(|r| matches!(r, Ok(n) if n.len() == 1)));
        assert_eq!(store.get_count(), 1);
    }

    #[tokio::test]
    async fn test_fetch_errors_are_returned_and_not_cached() {
        let store = InMemoryStore::new();
        publish(&store, "api", "10.0.0.1:80").await;
        let discovery = Discovery::new(Arc::new(store.clone()), config()).await.unwrap();

        store.fail_gets(true);
        assert!(matches!(discovery.list("api").await, Err(NamingError::Store(_))));

        store.fail_gets(false);
        assert_eq!(discovery.list("api").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_timeout() {
        let store = InMemoryStore::new();
        store.set_get_delay(Duration::from_millis(200));
        let discovery = Discovery::new(Arc::new(store.clone()), config()).await.unwrap();

        let options = DiscoveryOptions::default().with_timeout(Duration::from_millis(20));
        let result = ServiceDiscovery::list(&discovery, "api", &options).await;
        assert_eq!(result, Err(NamingError::Timeout));
    }

    #[tokio::test]
    async fn test_undecodable_values_are_skipped() {
        let store = InMemoryStore::new();
        publish(&store, "api", "10.0.0.1:80").await;
        store
            .put(&node_path(PREFIX, "api", "broken"), "{oops".to_string(), None)
            .await
            .unwrap();
        let discovery = Discovery::new(Arc::new(store.clone()), config()).await.unwrap();

        assert_eq!(discovery.list("api").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_fetch_invalidates_entry() {
        let store = InMemoryStore::new();
        publish(&store, "a", "10.0.0.1:80").await;
        publish(&store, "b", "10.0.0.2:80").await;
        let discovery = Arc::new(Discovery::new(Arc::new(store.clone()), config()).await.unwrap());
        discovery.list("a").await.unwrap();

        // The read of "b" is snapshotted now and returned after an update to
        // "a" has already advanced the cache.
        store.set_get_delay(Duration::from_millis(100));
        let slow = {
            let discovery = Arc::clone(&discovery);
            tokio::spawn(async move { discovery.list("b").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        publish(&store, "a", "10.0.0.3:80").await;
        let cache = Arc::clone(discovery.cache());
        assert!(eventually(|| matches!(cache.list("a"), Ok(Some(n)) if n.len() == 2)).await);

        let nodes = slow.await.unwrap().unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(cache.list("b").unwrap(), None);

        store.set_get_delay(Duration::ZERO);
        assert_eq!(discovery.list("b").await.unwrap().len(), 1);
        assert_eq!(store.get_count(), 3);
    }
}
