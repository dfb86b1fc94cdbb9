//! Service registration kept alive on shared leases.

use crate::config::RegistryConfig;
use crate::error::{NamingError, NamingResult};
use crate::lease::{Lease, LeaseManager};
use crate::node::{Node, instance_id, join_host_port, node_path, split_host_port};
use crate::service::{RegisterOptions, ServiceRegistry};
use crate::store::CoordinationStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Registration {
    key: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Publishes nodes of this process and keeps them present.
///
/// Each registered service name gets one maintenance task that writes the
/// node under a shared lease from the [`LeaseManager`] and writes it again
/// whenever that lease expires. Failures are retried with backoff until the
/// service is deregistered.
pub struct Registry {
    store: Arc<dyn CoordinationStore>,
    leases: Arc<LeaseManager>,
    config: RegistryConfig,
    pid: String,
    registrations: Mutex<HashMap<String, Registration>>,
}

impl Registry {
    pub fn new(store: Arc<dyn CoordinationStore>, leases: Arc<LeaseManager>, config: RegistryConfig) -> Self {
        Self {
            store,
            leases,
            config,
            pid: std::process::id().to_string(),
            registrations: Mutex::new(HashMap::new()),
        }
    }

    /// Register this process as `address` under `service`.
    ///
    /// Only the address is validated here; the first write happens in the
    /// background. Registering a name again replaces its previous node, and
    /// deletes it when the address changed.
    pub async fn register(&self, service: &str, address: &str) -> NamingResult<()> {
        let (host, port) = split_host_port(address)?;
        let id = instance_id(&host, &port.to_string(), &self.pid);
        let address = join_host_port(&host, port);

        let mut node = Node::new(service, id, address.as_str()).with_weight(self.config.weight);
        node.metadata = self.config.metadata.clone();

        let key = node_path(&self.config.prefix, service, &node.id);
        let value = node.encode()?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(maintain(
            Arc::clone(&self.store),
            Arc::clone(&self.leases),
            self.config.clone(),
            key.clone(),
            value,
            cancel.clone(),
        ));

        let previous = self
            .registrations
            .lock()
            .insert(service.to_string(), Registration { key: key.clone(), cancel, task });

        if let Some(previous) = previous {
            debug!(service = %service, "Replacing previous registration");
            previous.cancel.cancel();
            let _ = previous.task.await;

            if previous.key != key {
                let deleted = tokio::time::timeout(
                    self.config.deregister_timeout,
                    self.store.delete(&previous.key),
                )
                .await;
                match deleted {
                    Ok(Ok(_)) => debug!(key = %previous.key, "Deleted replaced node"),
                    Ok(Err(e)) => warn!(key = %previous.key, error = %e, "Failed to delete replaced node"),
                    Err(_) => warn!(key = %previous.key, "Timed out deleting replaced node"),
                }
            }
        }

        info!(service = %service, address = %address, "Registered service");
        Ok(())
    }

    /// Stop maintaining `service` and delete its node.
    ///
    /// The maintenance task has exited before the delete is sent, so no
    /// write follows it.
    pub async fn deregister(&self, service: &str) -> NamingResult<()> {
        let registration = self
            .registrations
            .lock()
            .remove(service)
            .ok_or_else(|| NamingError::NotRegistered(service.to_string()))?;

        registration.cancel.cancel();
        if let Err(e) = registration.task.await {
            warn!(service = %service, error = %e, "Registration task ended abnormally");
        }

        tokio::time::timeout(self.config.deregister_timeout, self.store.delete(&registration.key)).await??;
        info!(service = %service, key = %registration.key, "Deregistered service");
        Ok(())
    }

    pub fn is_registered(&self, service: &str) -> bool {
        self.registrations.lock().contains_key(service)
    }

    /// Names currently maintained by this registry.
    pub fn services(&self) -> Vec<String> {
        self.registrations.lock().keys().cloned().collect()
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        for registration in self.registrations.get_mut().values() {
            registration.cancel.cancel();
        }
    }
}

async fn maintain(
    store: Arc<dyn CoordinationStore>,
    leases: Arc<LeaseManager>,
    config: RegistryConfig,
    key: String,
    value: String,
    cancel: CancellationToken,
) {
    let mut attempt = 0u32;

    while !cancel.is_cancelled() {
        let written = tokio::select! {
            _ = cancel.cancelled() => break,
            written = write_once(store.as_ref(), &leases, &config, &key, &value) => written,
        };

        match written {
            Ok(lease) => {
                attempt = 0;
                debug!(key = %key, lease_id = lease.id, "Node written");

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = lease.expiry.expired() => {
                        debug!(key = %key, lease_id = lease.id, "Lease expired, writing node again");
                    }
                }
            }
            Err(e) => {
                let delay = config.backoff.delay_for_attempt(attempt);
                attempt = attempt.saturating_add(1);
                warn!(key = %key, error = %e, delay = ?delay, attempt, "Registration failed, retrying");

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    debug!(key = %key, "Registration maintenance stopped");
}

async fn write_once(
    store: &dyn CoordinationStore,
    leases: &LeaseManager,
    config: &RegistryConfig,
    key: &str,
    value: &str,
) -> NamingResult<Lease> {
    let lease = leases.get_lease(config.ttl).await?;
    store.put(key, value.to_string(), Some(lease.id)).await?;
    Ok(lease)
}

#[async_trait]
impl ServiceRegistry for Registry {
    async fn register(&self, service: &str, options: &RegisterOptions) -> NamingResult<()> {
        Registry::register(self, service, &options.address).await
    }

    async fn deregister(&self, service: &str) -> NamingResult<()> {
        Registry::deregister(self, service).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ExponentialBackoff;
    use crate::node::service_path;
    use crate::store::InMemoryStore;
    use std::time::Duration;

    const PREFIX: &str = "/test/services";

    fn registry(store: &InMemoryStore) -> Registry {
        let store: Arc<dyn CoordinationStore> = Arc::new(store.clone());
        let leases = Arc::new(LeaseManager::new(Arc::clone(&store)));
        let config = RegistryConfig::new(PREFIX)
            .with_weight(3)
            .with_metadata(HashMap::from([("zone".to_string(), "a".to_string())]))
            .with_backoff(ExponentialBackoff::new(
                Duration::from_millis(5),
                Duration::from_millis(20),
                2.0,
            ));
        Registry::new(store, leases, config)
    }

    fn key_for(service: &str, host: &str, port: u16) -> String {
        let id = instance_id(host, &port.to_string(), &std::process::id().to_string());
        node_path(PREFIX, service, &id)
    }

    async fn eventually<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_register_writes_node_under_lease() {
        let store = InMemoryStore::new();
        let registry = registry(&store);
        registry.register("api", "10.0.0.1:8080").await.unwrap();

        let key = key_for("api", "10.0.0.1", 8080);
        assert!(eventually(|| store.get(&key).is_some()).await);

        let kv = store.get(&key).unwrap();
        assert_ne!(kv.lease, 0);
        let node = Node::decode(&kv.value).unwrap().unwrap();
        assert_eq!(node.name, "api");
        assert_eq!(node.address, "10.0.0.1:8080");
        assert_eq!(node.weight, 3);
        assert_eq!(node.metadata.get("zone").map(String::as_str), Some("a"));
        assert!(registry.is_registered("api"));
    }

    #[tokio::test]
    async fn test_invalid_address_is_rejected() {
        let store = InMemoryStore::new();
        let registry = registry(&store);

        let result = registry.register("api", "no-port").await;
        assert!(matches!(result, Err(NamingError::InvalidAddress { .. })));
        assert!(!registry.is_registered("api"));
        assert_eq!(store.put_count(), 0);
    }

    #[tokio::test]
    async fn test_register_survives_sustained_put_failures() {
        let store = InMemoryStore::new();
        store.fail_puts(true);
        let registry = registry(&store);
        registry.register("api", "10.0.0.1:8080").await.unwrap();

        assert!(eventually(|| store.put_count() >= 5).await);
        let key = key_for("api", "10.0.0.1", 8080);
        assert!(store.get(&key).is_none());

        store.fail_puts(false);
        assert!(eventually(|| store.get(&key).is_some()).await);
    }

    #[tokio::test]
    async fn test_deregister_stops_writes_and_deletes_once() {
        let store = InMemoryStore::new();
        let registry = registry(&store);
        registry.register("api", "10.0.0.1:8080").await.unwrap();
        let key = key_for("api", "10.0.0.1", 8080);
        assert!(eventually(|| store.get(&key).is_some()).await);

        registry.deregister("api").await.unwrap();
        let puts = store.put_count();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.put_count(), puts);
        assert_eq!(store.delete_count(), 1);
        assert!(store.get(&key).is_none());
        assert!(!registry.is_registered("api"));
    }

    #[tokio::test]
    async fn test_reregister_with_new_address_removes_old_node() {
        let store = InMemoryStore::new();
        let registry = registry(&store);
        registry.register("api", "10.0.0.1:80").await.unwrap();
        let old = key_for("api", "10.0.0.1", 80);
        assert!(eventually(|| store.get(&old).is_some()).await);

        registry.register("api", "10.0.0.2:80").await.unwrap();
        assert!(store.get(&old).is_none());
        let new = key_for("api", "10.0.0.2", 80);
        assert!(eventually(|| store.get(&new).is_some()).await);

        registry.deregister("api").await.unwrap();
        let range = store.get_prefix(&service_path(PREFIX, "api")).await.unwrap();
        assert!(range.kvs.is_empty());
    }

    #[tokio::test]
    async fn test_registered_address_is_normalized() {
        let store = InMemoryStore::new();
        let registry = registry(&store);
        registry.register("api", "[::1]:08080").await.unwrap();

        let key = key_for("api", "::1", 8080);
        assert!(eventually(|| store.get(&key).is_some()).await);
        let node = Node::decode(&store.get(&key).unwrap().value).unwrap().unwrap();
        assert_eq!(node.address, "[::1]:8080");
    }

    #[tokio::test]
    async fn test_deregister_interrupts_pending_write() {
        let store = InMemoryStore::new();
        store.set_put_delay(Duration::from_secs(30));
        let registry = registry(&store);
        registry.register("api", "10.0.0.1:8080").await.unwrap();
        assert!(eventually(|| store.put_count() == 1).await);

        let deregistered = tokio::time::timeout(Duration::from_secs(1), registry.deregister("api")).await;
        assert!(matches!(deregistered, Ok(Ok(()))));
        assert!(store.get(&key_for("api", "10.0.0.1", 8080)).is_none());
        assert_eq!(store.put_count(), 1);
    }

    #[tokio::test]
    async fn test_deregister_unknown_service() {
        let store = InMemoryStore::new();
        let registry = registry(&store);

        let result = registry.deregister("api").await;
        assert_eq!(result, Err(NamingError::NotRegistered("api".to_string())));
        assert_eq!(store.delete_count(), 0);
    }

    #[tokio::test]
    async fn test_node_is_written_again_after_lease_loss() {
        let store = InMemoryStore::new();
        let registry = registry(&store);
        registry.register("api", "10.0.0.1:8080").await.unwrap();
        let key = key_for("api", "10.0.0.1", 8080);
        assert!(eventually(|| store.get(&key).is_some()).await);

        let first_lease = store.get(&key).unwrap().lease;
        store.lease_revoke(first_lease).await.unwrap();

        assert!(eventually(|| store.get(&key).is_some_and(|kv| kv.lease != first_lease)).await);
    }

    #[tokio::test]
    async fn test_services_share_one_lease_per_ttl() {
        let store = InMemoryStore::new();
        let registry = registry(&store);
        registry.register("api", "10.0.0.1:8080").await.unwrap();
        registry.register("web", "10.0.0.1:9090").await.unwrap();

        let api = key_for("api", "10.0.0.1", 8080);
        let web = key_for("web", "10.0.0.1", 9090);
        assert!(eventually(|| store.get(&api).is_some() && store.get(&web).is_some()).await);

        assert_eq!(store.get(&api).unwrap().lease, store.get(&web).unwrap().lease);
        assert_eq!(store.grant_count(), 1);

        let mut services = registry.services();
        services.sort();
        assert_eq!(services, vec!["api".to_string(), "web".to_string()]);
    }
}
