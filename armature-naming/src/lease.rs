//! Shared leases keyed by TTL.
//!
//! Granting a lease and holding a keepalive stream open are the expensive
//! parts of registering with the store, so [`LeaseManager`] keeps exactly
//! one lease per TTL class and hands it to every registration asking for
//! that TTL. Each lease has one background renewal task; when renewal
//! stops for any reason the lease is dropped from the table and its
//! [`LeaseExpiry`] fires for every holder.

use crate::error::NamingResult;
use crate::store::{CoordinationStore, LeaseId};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// How long a lease is reused before a keepalive probe is required.
pub const DEFAULT_FORCE_RENEW_INTERVAL: Duration = Duration::from_secs(1);

/// Fires once when a shared lease stops being renewed.
#[derive(Debug, Clone)]
pub struct LeaseExpiry {
    token: CancellationToken,
}

impl LeaseExpiry {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Wait until the lease expires.
    pub async fn expired(&self) {
        self.token.cancelled().await
    }

    pub fn is_expired(&self) -> bool {
        self.token.is_cancelled()
    }

    fn fire(&self) {
        self.token.cancel();
    }
}

/// A lease handed out by [`LeaseManager::get_lease`].
#[derive(Debug, Clone)]
pub struct Lease {
    pub id: LeaseId,
    pub expiry: LeaseExpiry,
}

struct LeaseHolder {
    id: LeaseId,
    force_renew_deadline: Instant,
    expiry: LeaseExpiry,
}

type LeaseTable = Arc<Mutex<HashMap<Duration, LeaseHolder>>>;

/// One lease per TTL class, renewed in the background.
pub struct LeaseManager {
    store: Arc<dyn CoordinationStore>,
    leases: LeaseTable,
    force_renew_interval: Duration,
    shutdown: CancellationToken,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self::with_force_renew_interval(store, DEFAULT_FORCE_RENEW_INTERVAL)
    }

    /// Create a manager that reuses a lease for `interval` before probing it.
    pub fn with_force_renew_interval(store: Arc<dyn CoordinationStore>, interval: Duration) -> Self {
        Self {
            store,
            leases: Arc::new(Mutex::new(HashMap::new())),
            force_renew_interval: interval,
            shutdown: CancellationToken::new(),
        }
    }

    /// Get the shared lease for `ttl`, granting one if none is usable.
    ///
    /// Within the force-renew window the cached lease is returned without
    /// touching the store. Past it, a keepalive probe must succeed before
    /// reuse; a failed probe drops the lease (firing its expiry) and a new
    /// one is granted.
    pub async fn get_lease(&self, ttl: Duration) -> NamingResult<Lease> {
        let now = Instant::now();
        let mut leases = self.leases.lock().await;

        if let Some(holder) = leases.get_mut(&ttl) {
            if now < holder.force_renew_deadline {
                return Ok(Lease {
                    id: holder.id,
                    expiry: holder.expiry.clone(),
                });
            }

            match self.store.lease_keep_alive_once(holder.id).await {
                Ok(remaining) => {
                    trace!(lease_id = holder.id, ttl = remaining, "Lease probe OK");
                    holder.force_renew_deadline = now + self.force_renew_interval;
                    return Ok(Lease {
                        id: holder.id,
                        expiry: holder.expiry.clone(),
                    });
                }
                Err(e) => {
                    warn!(lease_id = holder.id, error = %e, "Lease probe failed, discarding lease");
                    let id = holder.id;
                    remove_locked(&mut leases, ttl, id);
                }
            }
        }

        let id = self.store.lease_grant(ttl_secs(ttl)).await?;
        let holder = LeaseHolder {
            id,
            force_renew_deadline: now + self.force_renew_interval,
            expiry: LeaseExpiry::new(),
        };
        let lease = Lease {
            id,
            expiry: holder.expiry.clone(),
        };
        leases.insert(ttl, holder);
        debug!(lease_id = id, ttl = ?ttl, "Granted shared lease");

        tokio::spawn(keep_alive(
            Arc::clone(&self.store),
            Arc::clone(&self.leases),
            ttl,
            lease.clone(),
            self.shutdown.clone(),
        ));

        Ok(lease)
    }

    /// Number of live TTL classes.
    pub async fn len(&self) -> usize {
        self.leases.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.leases.lock().await.is_empty()
    }

    /// Stop every renewal task and fire every live lease's expiry.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut leases = self.leases.lock().await;
        for (_, holder) in leases.drain() {
            holder.expiry.fire();
        }
    }
}

impl Drop for LeaseManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn ttl_secs(ttl: Duration) -> i64 {
    (ttl.as_secs() as i64).max(1)
}

/// Remove the entry for `ttl` only if it still holds lease `id`.
///
/// Both the renewal task and a failed probe end up here; whichever comes
/// first removes the entry and fires the expiry, the other is a no-op.
fn remove_locked(leases: &mut HashMap<Duration, LeaseHolder>, ttl: Duration, id: LeaseId) {
    if leases.get(&ttl).is_some_and(|holder| holder.id == id) {
        if let Some(holder) = leases.remove(&ttl) {
            debug!(lease_id = id, ttl = ?ttl, "Removed shared lease");
            holder.expiry.fire();
        }
    }
}

async fn keep_alive(
    store: Arc<dyn CoordinationStore>,
    leases: LeaseTable,
    ttl: Duration,
    lease: Lease,
    shutdown: CancellationToken,
) {
    match store.lease_keep_alive(lease.id).await {
        Ok(mut stream) => loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = lease.expiry.expired() => break,
                item = stream.next() => match item {
                    Some(Ok(remaining)) => {
                        trace!(lease_id = lease.id, ttl = remaining, "Keep-alive OK");
                    }
                    Some(Err(e)) => {
                        warn!(lease_id = lease.id, error = %e, "Keep-alive failed");
                        break;
                    }
                    None => {
                        warn!(lease_id = lease.id, "Keep-alive stream closed");
                        break;
                    }
                },
            }
        },
        Err(e) => {
            warn!(lease_id = lease.id, error = %e, "Failed to open keep-alive stream");
        }
    }

    let mut leases = leases.lock().await;
    remove_locked(&mut leases, ttl, lease.id);
}
