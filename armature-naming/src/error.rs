//! Error types for naming operations.

use thiserror::Error;

/// Result type for naming operations.
pub type NamingResult<T> = Result<T, NamingError>;

/// Naming errors.
///
/// Errors are `Clone` so one fetch outcome can be handed to every caller
/// waiting on it. Source errors from the store client and the codecs are
/// carried as strings.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NamingError {
    /// The service is known but currently has no nodes
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// No load balancer is registered under the configured name
    #[error("Load balancer not found: {0}")]
    BalancerNotFound(String),

    /// A write carried a revision older than the cache's
    #[error("Store data is stale")]
    StaleData,

    /// Address could not be split into host and port
    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// Node could not be serialized
    #[error("Encode error: {0}")]
    Encode(String),

    /// Stored value could not be deserialized
    #[error("Decode error: {0}")]
    Decode(String),

    /// Coordination store failure (transport, rpc, injected)
    #[error("Store error: {0}")]
    Store(String),

    #[error("Lease {0} not found")]
    LeaseNotFound(i64),

    #[error("Lease {0} expired")]
    LeaseExpired(i64),

    /// Deregister called for a service this registry never registered
    #[error("Service not registered: {0}")]
    NotRegistered(String),

    /// Operation timeout
    #[error("Operation timeout")]
    Timeout,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<serde_json::Error> for NamingError {
    fn from(err: serde_json::Error) -> Self {
        NamingError::Decode(err.to_string())
    }
}

impl From<toml::de::Error> for NamingError {
    fn from(err: toml::de::Error) -> Self {
        NamingError::InvalidConfiguration(err.to_string())
    }
}

impl From<std::io::Error> for NamingError {
    fn from(err: std::io::Error) -> Self {
        NamingError::Io(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for NamingError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        NamingError::Timeout
    }
}

#[cfg(feature = "etcd")]
impl From<etcd_client::Error> for NamingError {
    fn from(err: etcd_client::Error) -> Self {
        NamingError::Store(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NamingError::ServiceUnavailable("api".to_string());
        assert_eq!(err.to_string(), "Service unavailable: api");

        let err = NamingError::InvalidAddress {
            address: "nope".to_string(),
            reason: "missing port".to_string(),
        };
        assert!(err.to_string().contains("missing port"));
    }

    #[test]
    fn test_json_error_converts_to_decode() {
        let err: NamingError = serde_json::from_str::<u32>("{").unwrap_err().into();
        assert!(matches!(err, NamingError::Decode(_)));
    }
}
