//! Host-facing naming capabilities

use crate::error::{NamingError, NamingResult};
use crate::node::Node;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Per-call discovery options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryOptions {
    /// Bound on the store read made on a cache miss
    pub timeout: Option<Duration>,
}

impl DiscoveryOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Registration options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterOptions {
    /// Dialable `host:port` of this instance
    pub address: String,
}

impl RegisterOptions {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

/// Per-call selection options, handed through to the load balancer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectOptions {
    /// Affinity key for hashing balancers
    pub key: Option<String>,
    pub namespace: Option<String>,
    /// Virtual replicas per node for consistent hashing
    pub replicas: Option<usize>,
    pub timeout: Option<Duration>,
}

impl SelectOptions {
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = Some(replicas);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Resolve a service name to its nodes
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    async fn list(&self, service: &str, options: &DiscoveryOptions) -> NamingResult<Arc<Vec<Node>>>;
}

/// Publish this process under a service name
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Validate the address and start keeping the node registered.
    ///
    /// Failures after this returns are retried in the background.
    async fn register(&self, service: &str, options: &RegisterOptions) -> NamingResult<()>;

    /// Stop maintenance and delete the node.
    async fn deregister(&self, service: &str) -> NamingResult<()>;
}

/// Pick one node of a service
#[async_trait]
pub trait ServiceSelector: Send + Sync {
    async fn select(&self, service: &str, options: &SelectOptions) -> NamingResult<Node>;

    /// Report the outcome of a call made to `node`.
    async fn report(&self, node: &Node, latency: Duration, error: Option<&NamingError>) -> NamingResult<()>;
}
