//! Coordination store boundary.
//!
//! The naming layer only needs a handful of primitives from an etcd-like
//! store: prefix reads with a revision, lease-bound puts, deletes, prefix
//! watches that carry the previous value, and leases. [`CoordinationStore`]
//! names exactly those so the rest of the crate can run against
//! [`EtcdStore`] in production and [`InMemoryStore`] in tests.

use crate::error::NamingResult;
use async_trait::async_trait;
use futures::stream::BoxStream;

#[cfg(feature = "etcd")]
pub mod etcd;
pub mod memory;

#[cfg(feature = "etcd")]
pub use etcd::EtcdStore;
pub use memory::{InMemoryStore, StoreOp};

/// Store-assigned lease identifier.
pub type LeaseId = i64;

/// One stored key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision at which the key was created
    pub create_revision: i64,
    /// Revision of the last modification
    pub mod_revision: i64,
    /// Lease the key is bound to, 0 for none
    pub lease: LeaseId,
}

/// Result of a prefix read.
#[derive(Debug, Clone, Default)]
pub struct RangeResponse {
    /// Store revision the read was served at
    pub revision: i64,
    pub kvs: Vec<KeyValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

/// A single change inside a watch response.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    /// New value for puts; key only (empty value) for deletes
    pub kv: KeyValue,
    /// Value before the change, when the watch asked for it
    pub prev_kv: Option<KeyValue>,
}

impl WatchEvent {
    /// A put that created the key.
    pub fn is_create(&self) -> bool {
        self.kind == WatchEventKind::Put && self.kv.create_revision == self.kv.mod_revision
    }

    /// A put that overwrote an existing key.
    pub fn is_modify(&self) -> bool {
        self.kind == WatchEventKind::Put && self.kv.create_revision != self.kv.mod_revision
    }
}

/// One batch of changes delivered by a watch.
#[derive(Debug, Clone, Default)]
pub struct WatchResponse {
    /// Store revision from the response header
    pub revision: i64,
    pub events: Vec<WatchEvent>,
}

/// Change batches for a watched prefix; ends when the watch is cancelled.
pub type WatchStream = BoxStream<'static, NamingResult<WatchResponse>>;

/// Remaining TTL (seconds) reported by each keepalive round; ends when
/// the lease can no longer be renewed.
pub type KeepAliveStream = BoxStream<'static, NamingResult<i64>>;

/// Primitives consumed from the coordination store.
///
/// Every method is safe to call concurrently.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Read every key under `prefix`.
    async fn get_prefix(&self, prefix: &str) -> NamingResult<RangeResponse>;

    /// Write `value` at `key`, bound to `lease` when given.
    async fn put(&self, key: &str, value: String, lease: Option<LeaseId>) -> NamingResult<()>;

    /// Delete `key`, returning how many keys were removed.
    async fn delete(&self, key: &str) -> NamingResult<i64>;

    /// Watch every key under `prefix`, including previous values.
    async fn watch_prefix(&self, prefix: &str) -> NamingResult<WatchStream>;

    /// Grant a lease of `ttl` seconds.
    async fn lease_grant(&self, ttl: i64) -> NamingResult<LeaseId>;

    /// Keep `lease` alive until the returned stream is dropped or ends.
    async fn lease_keep_alive(&self, lease: LeaseId) -> NamingResult<KeepAliveStream>;

    /// Renew `lease` once, returning its remaining TTL.
    async fn lease_keep_alive_once(&self, lease: LeaseId) -> NamingResult<i64>;

    /// Revoke `lease`, deleting every key bound to it.
    async fn lease_revoke(&self, lease: LeaseId) -> NamingResult<()>;
}
