//! Service Naming for Armature
//!
//! Client-side service registration and cached discovery over an etcd-like
//! coordination store.
//!
//! ## Features
//!
//! - **Registration** - Nodes written under shared TTL leases and rewritten
//!   whenever a lease is lost
//! - **Discovery** - Per-service node lists cached and kept current by a
//!   prefix watch, ordered by store revision
//! - **Single-flight fetches** - Concurrent cache misses share one store read
//! - **Selection** - Pluggable load balancers looked up by name
//! - **Backends** - etcd (feature `etcd`, default) or in-memory
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use armature_naming::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> NamingResult<()> {
//!     let config = NamingConfig::from_toml_str(r#"
//!         address = "127.0.0.1:2379"
//!         prefix = "/myapp/services"
//!
//!         [load_balance]
//!         name = "first"
//!
//!         [[services]]
//!         name = "api"
//!         ttl = 10
//!     "#)?;
//!
//!     let balancers = Arc::new(Balancers::new());
//!     balancers.register("first", Arc::new(MyBalancer));
//!
//!     let naming = Naming::connect(config, balancers).await?;
//!     naming.register("api", "10.0.0.1:8080").await?;
//!
//!     let node = naming.selector().select("users", &SelectOptions::default()).await?;
//!     println!("calling {}", node.address);
//!
//!     naming.shutdown().await
//! }
//! ```

pub mod backoff;
pub mod cache;
pub mod config;
pub mod discovery;
pub mod error;
pub mod lease;
pub mod naming;
pub mod node;
pub mod registry;
pub mod selector;
pub mod service;
pub mod store;
pub mod watcher;

pub use backoff::ExponentialBackoff;
pub use cache::Cache;
pub use config::{
    DiscoveryConfig, LoadBalanceConfig, NamingConfig, RegistryConfig, SelectorConfig, ServiceConfig,
    TlsConfig,
};
pub use discovery::Discovery;
pub use error::{NamingError, NamingResult};
pub use lease::{Lease, LeaseExpiry, LeaseManager};
pub use naming::Naming;
pub use node::{Node, instance_id, node_path, service_path};
pub use registry::Registry;
pub use selector::{Balancers, LoadBalancer, Selector};
pub use service::{
    DiscoveryOptions, RegisterOptions, SelectOptions, ServiceDiscovery, ServiceRegistry, ServiceSelector,
};
#[cfg(feature = "etcd")]
pub use store::EtcdStore;
pub use store::{CoordinationStore, InMemoryStore, LeaseId};
pub use watcher::{ChangeEvent, EventType, Watcher};
