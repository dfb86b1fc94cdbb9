//! Prefix watch translated into typed node change events.

use crate::error::NamingResult;
use crate::node::{Node, service_path};
use crate::store::{CoordinationStore, WatchEventKind, WatchResponse};
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Kind of change applied to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Unknown,
    Create,
    Update,
    Delete,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventType::Unknown => "unknown",
            EventType::Create => "create",
            EventType::Update => "update",
            EventType::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// A node change observed at store revision `version`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub version: i64,
    pub event_type: EventType,
    pub node: Node,
}

impl ChangeEvent {
    pub fn new(version: i64, event_type: EventType, node: Node) -> Self {
        Self {
            version,
            event_type,
            node,
        }
    }
}

/// Turn one watch batch into at most one change event.
///
/// Entries are classified in order and the last decodable one wins, so
/// intermediate transitions inside a single batch are not reported.
/// Deletes are decoded from the previous value since the key is gone.
pub fn translate(resp: &WatchResponse) -> Option<ChangeEvent> {
    let mut result = None;

    for event in &resp.events {
        let (event_type, value) = match event.kind {
            WatchEventKind::Put if event.is_create() => (EventType::Create, &event.kv.value),
            WatchEventKind::Put => (EventType::Update, &event.kv.value),
            WatchEventKind::Delete => match &event.prev_kv {
                Some(prev) => (EventType::Delete, &prev.value),
                None => {
                    warn!(key = %event.kv.key, "Delete event without previous value, skipping");
                    continue;
                }
            },
        };

        match Node::decode(value) {
            Ok(Some(node)) => result = Some(ChangeEvent::new(resp.revision, event_type, node)),
            Ok(None) => continue,
            Err(e) => {
                error!(key = %event.kv.key, error = %e, "Failed to decode node");
                continue;
            }
        }
    }

    result
}

/// Watches every service under one key prefix.
///
/// Each call to [`Watcher::watch`] opens a fresh store watch; a stream that
/// ends is not resumed. [`Watcher::stop`] ends every stream opened by this
/// watcher.
pub struct Watcher {
    store: Arc<dyn CoordinationStore>,
    watch_path: String,
    exit: CancellationToken,
}

impl Watcher {
    pub fn new(store: Arc<dyn CoordinationStore>, prefix: &str) -> Self {
        Self {
            store,
            watch_path: service_path(prefix, ""),
            exit: CancellationToken::new(),
        }
    }

    pub fn watch_path(&self) -> &str {
        &self.watch_path
    }

    /// Subscribe and return the change event sequence.
    ///
    /// The subscription is established before this returns. The receiver
    /// yields `None` once the store stream fails, closes, or `stop` is
    /// called.
    pub async fn watch(&self) -> NamingResult<mpsc::Receiver<ChangeEvent>> {
        let mut stream = self.store.watch_prefix(&self.watch_path).await?;
        info!(prefix = %self.watch_path, "Watching service changes");

        let (tx, rx) = mpsc::channel(1);
        let exit = self.exit.clone();
        let watch_path = self.watch_path.clone();

        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    _ = exit.cancelled() => break,
                    item = stream.next() => item,
                };

                let resp = match item {
                    Some(Ok(resp)) => resp,
                    Some(Err(e)) => {
                        warn!(prefix = %watch_path, error = %e, "Watch stream failed");
                        break;
                    }
                    None => {
                        debug!(prefix = %watch_path, "Watch stream closed");
                        break;
                    }
                };

                let Some(event) = translate(&resp) else {
                    continue;
                };

                // Racing exit against delivery keeps stop() from waiting on a reader.
                tokio::select! {
                    _ = exit.cancelled() => break,
                    sent = tx.send(event) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    pub fn stop(&self) {
        self.exit.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.exit.is_cancelled()
    }
}
