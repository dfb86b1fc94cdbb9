//! Assembly of the naming components over one store.

use crate::config::NamingConfig;
use crate::discovery::Discovery;
use crate::error::{NamingError, NamingResult};
use crate::lease::LeaseManager;
use crate::registry::Registry;
use crate::selector::{Balancers, Selector};
use crate::store::CoordinationStore;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Discovery, selection and registration wired over one store handle.
///
/// One [`LeaseManager`] is shared by every registry, so all configured
/// services with the same TTL ride on a single lease.
///
/// # Examples
///
/// ```rust,ignore
/// use armature_naming::*;
///
/// let config = NamingConfig::from_file("naming.toml")?;
/// let naming = Naming::connect(config, Arc::new(Balancers::new())).await?;
///
/// naming.register("api", "10.0.0.1:8080").await?;
/// let nodes = naming.discovery().list("users").await?;
/// ```
pub struct Naming {
    store: Arc<dyn CoordinationStore>,
    leases: Arc<LeaseManager>,
    discovery: Arc<Discovery>,
    selector: Arc<Selector>,
    registries: HashMap<String, Arc<Registry>>,
    config: NamingConfig,
}

impl Naming {
    /// Dial etcd with `config` and assemble every component.
    #[cfg(feature = "etcd")]
    pub async fn connect(config: NamingConfig, balancers: Arc<Balancers>) -> NamingResult<Self> {
        config.validate()?;
        let store = crate::store::EtcdStore::connect(&config).await?;
        Self::with_store(Arc::new(store), config, balancers).await
    }

    /// Assemble every component over an existing store.
    pub async fn with_store(
        store: Arc<dyn CoordinationStore>,
        config: NamingConfig,
        balancers: Arc<Balancers>,
    ) -> NamingResult<Self> {
        let leases = Arc::new(LeaseManager::new(Arc::clone(&store)));
        let discovery = Arc::new(Discovery::new(Arc::clone(&store), config.discovery()).await?);
        let selector = Arc::new(Selector::new(Arc::clone(&discovery), balancers, config.selector()));

        let registries = config
            .services
            .iter()
            .map(|service| {
                let registry = Registry::new(Arc::clone(&store), Arc::clone(&leases), config.registry(service));
                (service.name.clone(), Arc::new(registry))
            })
            .collect::<HashMap<_, _>>();

        info!(
            prefix = %config.prefix,
            services = registries.len(),
            load_balancer = %config.load_balance.name,
            "Naming initialized"
        );

        Ok(Self {
            store,
            leases,
            discovery,
            selector,
            registries,
            config,
        })
    }

    pub fn discovery(&self) -> &Arc<Discovery> {
        &self.discovery
    }

    pub fn selector(&self) -> &Arc<Selector> {
        &self.selector
    }

    /// Registry for a configured service.
    pub fn registry(&self, service: &str) -> Option<&Arc<Registry>> {
        self.registries.get(service)
    }

    pub fn lease_manager(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    pub fn config(&self) -> &NamingConfig {
        &self.config
    }

    /// Register `address` under a configured service.
    pub async fn register(&self, service: &str, address: &str) -> NamingResult<()> {
        self.configured(service)?.register(service, address).await
    }

    pub async fn deregister(&self, service: &str) -> NamingResult<()> {
        self.configured(service)?.deregister(service).await
    }

    /// Deregister every registered service, then stop watching and renewing.
    ///
    /// Every deregistration is attempted; the first failure is returned.
    pub async fn shutdown(&self) -> NamingResult<()> {
        let mut first_error = None;
        for (name, registry) in &self.registries {
            if !registry.is_registered(name) {
                continue;
            }
            if let Err(e) = registry.deregister(name).await {
                first_error.get_or_insert(e);
            }
        }

        self.discovery.stop();
        self.leases.shutdown().await;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn configured(&self, service: &str) -> NamingResult<&Arc<Registry>> {
        self.registries
            .get(service)
            .ok_or_else(|| NamingError::NotRegistered(service.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::store::InMemoryStore;

    fn config() -> NamingConfig {
        NamingConfig {
            address: "memory".to_string(),
            prefix: "/test/services".to_string(),
            services: vec![
                ServiceConfig {
                    name: "api".to_string(),
                    ..ServiceConfig::default()
                },
                ServiceConfig {
                    name: "web".to_string(),
                    weight: 4,
                    ..ServiceConfig::default()
                },
            ],
            ..NamingConfig::default()
        }
    }

    #[tokio::test]
    async fn test_builds_one_registry_per_service() {
        let store = InMemoryStore::new();
        let naming = Naming::with_store(Arc::new(store), config(), Arc::new(Balancers::new()))
            .await
            .unwrap();

        assert!(naming.registry("api").is_some());
        assert_eq!(naming.registry("web").unwrap().config().weight, 4);
        assert!(naming.registry("db").is_none());
        assert_eq!(naming.selector().config().load_balancer, "random");
    }

    #[tokio::test]
    async fn test_unconfigured_service_cannot_register() {
        let store = InMemoryStore::new();
        let naming = Naming::with_store(Arc::new(store.clone()), config(), Arc::new(Balancers::new()))
            .await
            .unwrap();

        let result = naming.register("db", "10.0.0.1:5432").await;
        assert_eq!(result, Err(NamingError::NotRegistered("db".to_string())));
        assert_eq!(store.put_count(), 0);
    }
}
