//! etcd v3 coordination store

use super::{
    CoordinationStore, KeepAliveStream, KeyValue, LeaseId, RangeResponse, WatchEvent,
    WatchEventKind, WatchResponse, WatchStream,
};
use crate::config::NamingConfig;
use crate::error::{NamingError, NamingResult};
use async_trait::async_trait;
use etcd_client::{
    Certificate, Client, ConnectOptions, EventType, GetOptions, Identity, PutOptions, TlsOptions,
    WatchOptions,
};
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// etcd-backed store over the gRPC client.
///
/// The client is cheap to clone; every call works on its own clone so the
/// store can be shared behind `&self`.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connect using endpoints, credentials, timeout and TLS from `config`.
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// use armature_naming::{EtcdStore, NamingConfig};
    ///
    /// let config = NamingConfig { address: "127.0.0.1:2379".into(), ..Default::default() };
    /// let store = EtcdStore::connect(&config).await?;
    /// ```
    pub async fn connect(config: &NamingConfig) -> NamingResult<Self> {
        config.validate()?;

        let mut options = ConnectOptions::new()
            .with_connect_timeout(config.timeout())
            .with_timeout(config.timeout());

        if let (Some(user), Some(password)) = (&config.username, &config.password) {
            options = options.with_user(user.clone(), password.clone());
        }

        if let Some(tls) = config.tls() {
            let ca = tokio::fs::read(&tls.ca_file).await?;
            let cert = tokio::fs::read(&tls.cert_file).await?;
            let key = tokio::fs::read(&tls.key_file).await?;
            options = options.with_tls(
                TlsOptions::new()
                    .ca_certificate(Certificate::from_pem(ca))
                    .identity(Identity::from_pem(cert, key)),
            );
        }

        let endpoints = config.endpoints();
        let client = Client::connect(&endpoints, Some(options)).await?;
        info!(endpoints = ?endpoints, "Connected to etcd");

        Ok(Self { client })
    }

    /// Wrap an already connected client.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn convert_kv(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: kv.value().to_vec(),
        create_revision: kv.create_revision(),
        mod_revision: kv.mod_revision(),
        lease: kv.lease(),
    }
}

fn convert_watch_response(resp: &etcd_client::WatchResponse) -> WatchResponse {
    let events = resp
        .events()
        .iter()
        .filter_map(|event| {
            let kv = event.kv()?;
            let kind = match event.event_type() {
                EventType::Put => WatchEventKind::Put,
                EventType::Delete => WatchEventKind::Delete,
            };
            Some(WatchEvent {
                kind,
                kv: convert_kv(kv),
                prev_kv: event.prev_kv().map(convert_kv),
            })
        })
        .collect();

    WatchResponse {
        revision: resp.header().map(|h| h.revision()).unwrap_or_default(),
        events,
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn get_prefix(&self, prefix: &str) -> NamingResult<RangeResponse> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;

        Ok(RangeResponse {
            revision: resp.header().map(|h| h.revision()).unwrap_or_default(),
            kvs: resp.kvs().iter().map(convert_kv).collect(),
        })
    }

    async fn put(&self, key: &str, value: String, lease: Option<LeaseId>) -> NamingResult<()> {
        let mut client = self.client.clone();
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        client.put(key, value, options).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> NamingResult<i64> {
        let mut client = self.client.clone();
        let resp = client.delete(key, None).await?;
        Ok(resp.deleted())
    }

    async fn watch_prefix(&self, prefix: &str) -> NamingResult<WatchStream> {
        let mut client = self.client.clone();
        let (watcher, stream) = client
            .watch(prefix, Some(WatchOptions::new().with_prefix().with_prev_key()))
            .await?;
        debug!(prefix = %prefix, watch_id = watcher.watch_id(), "Watch stream established");

        // The watcher is carried in the state: dropping it closes the watch.
        let stream = futures::stream::unfold(Some((watcher, stream)), |state| async move {
            let (watcher, mut stream) = state?;
            match stream.message().await {
                Ok(Some(resp)) if resp.canceled() => {
                    warn!(reason = %resp.cancel_reason(), "Watch stream canceled");
                    None
                }
                Ok(Some(resp)) => Some((Ok(convert_watch_response(&resp)), Some((watcher, stream)))),
                Ok(None) => None,
                Err(e) => Some((Err(NamingError::from(e)), None)),
            }
        });

        Ok(stream.boxed())
    }

    async fn lease_grant(&self, ttl: i64) -> NamingResult<LeaseId> {
        let mut client = self.client.clone();
        let resp = client.lease_grant(ttl, None).await?;
        debug!(lease_id = resp.id(), ttl = resp.ttl(), "Lease granted");
        Ok(resp.id())
    }

    async fn lease_keep_alive(&self, lease: LeaseId) -> NamingResult<KeepAliveStream> {
        let mut client = self.client.clone();
        let (keeper, stream) = client.lease_keep_alive(lease).await?;

        // First round goes out immediately, then every third of the TTL.
        let stream = futures::stream::unfold(
            Some((keeper, stream, Duration::ZERO)),
            move |state| async move {
                let (mut keeper, mut stream, delay) = state?;
                tokio::time::sleep(delay).await;

                if let Err(e) = keeper.keep_alive().await {
                    return Some((Err(NamingError::from(e)), None));
                }
                match stream.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => {
                        trace!(lease_id = lease, ttl = resp.ttl(), "Keep-alive OK");
                        let next = Duration::from_secs((resp.ttl() / 3).max(1) as u64);
                        Some((Ok(resp.ttl()), Some((keeper, stream, next))))
                    }
                    Ok(Some(_)) => Some((Err(NamingError::LeaseExpired(lease)), None)),
                    Ok(None) => None,
                    Err(e) => Some((Err(NamingError::from(e)), None)),
                }
            },
        );

        Ok(stream.boxed())
    }

    async fn lease_keep_alive_once(&self, lease: LeaseId) -> NamingResult<i64> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client.lease_keep_alive(lease).await?;
        keeper.keep_alive().await?;

        match stream.message().await? {
            Some(resp) if resp.ttl() > 0 => Ok(resp.ttl()),
            Some(_) => Err(NamingError::LeaseNotFound(lease)),
            None => Err(NamingError::Store(format!(
                "keep-alive stream for lease {} closed",
                lease
            ))),
        }
    }

    async fn lease_revoke(&self, lease: LeaseId) -> NamingResult<()> {
        let mut client = self.client.clone();
        client.lease_revoke(lease).await?;
        Ok(())
    }
}
