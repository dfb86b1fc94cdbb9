//! Service node record and its key layout in the store.

use crate::error::{NamingError, NamingResult};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// A registered service instance.
///
/// Serialized verbatim as the value under
/// `<prefix>/<service>/<instance id>`. Identity inside a cached list is the
/// `address`; `id` is only used as the key suffix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Service name
    pub name: String,

    /// Instance ID (`host-port-pid`)
    pub id: String,

    /// `host:port`
    pub address: String,

    /// Metadata
    #[serde(default, deserialize_with = "null_as_empty")]
    pub metadata: HashMap<String, String>,

    /// Load-balancing weight
    #[serde(default)]
    pub weight: i32,
}

impl Node {
    /// Create a new node with weight 1 and no metadata.
    pub fn new(
        name: impl Into<String>,
        id: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            address: address.into(),
            metadata: HashMap::new(),
            weight: 1,
        }
    }

    /// Add metadata
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Set weight
    pub fn with_weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    /// Serialize to the wire value.
    pub fn encode(&self) -> NamingResult<String> {
        serde_json::to_string(self).map_err(|e| NamingError::Encode(e.to_string()))
    }

    /// Deserialize a wire value.
    ///
    /// A literal `null` decodes to `None`; callers skip such records.
    pub fn decode(bytes: &[u8]) -> NamingResult<Option<Node>> {
        Ok(serde_json::from_slice::<Option<Node>>(bytes)?)
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<HashMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Key of one node: `<prefix>/<service>/<id>`.
///
/// Slashes inside the service name and id are replaced with hyphens.
pub fn node_path(prefix: &str, service: &str, id: &str) -> String {
    join_path(&[prefix, &service.replace('/', "-"), &id.replace('/', "-")])
}

/// Watch/list root of one service: `<prefix>/<service>/`.
///
/// The trailing slash scopes prefix matching so `api` does not match
/// `api-admin`. An empty service name yields the root of every service.
pub fn service_path(prefix: &str, service: &str) -> String {
    let mut path = if service.is_empty() {
        join_path(&[prefix])
    } else {
        join_path(&[prefix, &service.replace('/', "-")])
    };
    if !path.ends_with('/') {
        path.push('/');
    }
    path
}

/// Instance ID unique per running registration.
pub fn instance_id(host: &str, port: &str, pid: &str) -> String {
    format!("{}-{}-{}", host, port, pid)
}

/// Split `host:port` (or `[v6]:port`) into its parts.
pub fn split_host_port(address: &str) -> NamingResult<(String, u16)> {
    let invalid = |reason: &str| NamingError::InvalidAddress {
        address: address.to_string(),
        reason: reason.to_string(),
    };

    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let (host, rest) = rest.split_once(']').ok_or_else(|| invalid("missing ']'"))?;
        let port = rest.strip_prefix(':').ok_or_else(|| invalid("missing port"))?;
        (host, port)
    } else {
        let (host, port) = address.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
        if host.contains(':') {
            return Err(invalid("too many colons"));
        }
        (host, port)
    };

    let port = port.parse::<u16>().map_err(|_| invalid("invalid port"))?;
    Ok((host.to_string(), port))
}

/// Join `host` and `port` back into a dialable address.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn join_path(parts: &[&str]) -> String {
    let absolute = parts.first().is_some_and(|p| p.starts_with('/'));
    let joined = parts
        .iter()
        .flat_map(|p| p.split('/'))
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    if absolute {
        format!("/{}", joined)
    } else {
        joined
    }
}
