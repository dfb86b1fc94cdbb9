//! Node selection through pluggable load balancers.

use crate::config::SelectorConfig;
use crate::discovery::Discovery;
use crate::error::{NamingError, NamingResult};
use crate::node::Node;
use crate::service::{DiscoveryOptions, SelectOptions, ServiceDiscovery, ServiceSelector};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Strategy choosing one node out of a non-empty list.
pub trait LoadBalancer: Send + Sync {
    fn select(&self, service: &str, nodes: &[Node], options: &SelectOptions) -> NamingResult<Node>;
}

/// Load balancers available to selectors, by name.
#[derive(Default)]
pub struct Balancers {
    balancers: RwLock<HashMap<String, Arc<dyn LoadBalancer>>>,
}

impl Balancers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `balancer` as `name`, replacing any previous one.
    pub fn register(&self, name: impl Into<String>, balancer: Arc<dyn LoadBalancer>) {
        self.balancers.write().insert(name.into(), balancer);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn LoadBalancer>> {
        self.balancers.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.balancers.read().contains_key(name)
    }
}

/// Picks a node of a service using the configured load balancer.
pub struct Selector {
    discovery: Arc<Discovery>,
    balancers: Arc<Balancers>,
    config: SelectorConfig,
}

impl Selector {
    pub fn new(discovery: Arc<Discovery>, balancers: Arc<Balancers>, config: SelectorConfig) -> Self {
        Self {
            discovery,
            balancers,
            config,
        }
    }

    /// Select one node of `service`.
    ///
    /// Lookup errors are returned as-is. A missing balancer is reported as
    /// [`NamingError::BalancerNotFound`], never as an unavailable service.
    pub async fn select(&self, service: &str, options: &SelectOptions) -> NamingResult<Node> {
        let discovery_options = DiscoveryOptions {
            timeout: options.timeout,
        };
        let nodes = ServiceDiscovery::list(self.discovery.as_ref(), service, &discovery_options).await?;

        let balancer = self
            .balancers
            .get(&self.config.load_balancer)
            .ok_or_else(|| NamingError::BalancerNotFound(self.config.load_balancer.clone()))?;

        let node = balancer.select(service, &nodes, options)?;
        trace!(service = %service, address = %node.address, "Selected node");
        Ok(node)
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }
}

#[async_trait]
impl ServiceSelector for Selector {
    async fn select(&self, service: &str, options: &SelectOptions) -> NamingResult<Node> {
        Selector::select(self, service, options).await
    }

    async fn report(&self, _node: &Node, _latency: Duration, _error: Option<&NamingError>) -> NamingResult<()> {
        Ok(())
    }
}
