//! Naming configuration types.
//!
//! [`NamingConfig`] is the host-facing record (usually a section of the
//! application's TOML or JSON config). The per-component configs are
//! derived from it by [`crate::Naming`], or built directly in code.

use crate::backoff::ExponentialBackoff;
use crate::error::{NamingError, NamingResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Default store call timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Default key prefix for registrations.
pub const DEFAULT_PREFIX: &str = "/armature/naming/services";

/// Default lease TTL in seconds.
pub const DEFAULT_TTL_SECS: u64 = 5;

/// Default node weight.
pub const DEFAULT_WEIGHT: i32 = 1;

/// Default load balancer name.
pub const DEFAULT_LOAD_BALANCER: &str = "random";

/// How long a cached node list is served without a refetch.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

/// Store connection and naming configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    /// Comma-separated store endpoints
    pub address: String,

    /// Dial and per-call timeout in seconds
    pub timeout: u64,

    pub username: Option<String>,

    pub password: Option<String>,

    /// Key prefix under which services are registered
    pub prefix: String,

    /// TLS material, enabled only when every file is set
    pub tls: Option<TlsConfig>,

    pub load_balance: LoadBalanceConfig,

    /// Services this process registers
    #[serde(alias = "service")]
    pub services: Vec<ServiceConfig>,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:2379".to_string(),
            timeout: DEFAULT_TIMEOUT_SECS,
            username: None,
            password: None,
            prefix: DEFAULT_PREFIX.to_string(),
            tls: None,
            load_balance: LoadBalanceConfig::default(),
            services: Vec::new(),
        }
    }
}

/// TLS files for the store connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    #[serde(alias = "certfile")]
    pub cert_file: String,
    #[serde(alias = "keyfile")]
    pub key_file: String,
    #[serde(alias = "cafile")]
    pub ca_file: String,
}

impl TlsConfig {
    /// Whether every TLS file is configured.
    pub fn is_complete(&self) -> bool {
        !self.cert_file.is_empty() && !self.key_file.is_empty() && !self.ca_file.is_empty()
    }

    fn is_empty(&self) -> bool {
        self.cert_file.is_empty() && self.key_file.is_empty() && self.ca_file.is_empty()
    }
}

/// Load balancer selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalanceConfig {
    pub name: String,
}

impl Default for LoadBalanceConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_LOAD_BALANCER.to_string(),
        }
    }
}

/// One service registered by this process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub weight: i32,
    /// Lease TTL in seconds
    pub ttl: u64,
    pub metadata: HashMap<String, String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            weight: DEFAULT_WEIGHT,
            ttl: DEFAULT_TTL_SECS,
            metadata: HashMap::new(),
        }
    }
}

impl NamingConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> NamingResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Parse a JSON document.
    pub fn from_json_str(content: &str) -> NamingResult<Self> {
        serde_json::from_str(content).map_err(|e| NamingError::InvalidConfiguration(e.to_string()))
    }

    /// Load from a `.toml` or `.json` file, picked by extension.
    pub fn from_file(path: impl AsRef<Path>) -> NamingResult<Self> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| NamingError::InvalidConfiguration("No file extension found".to_string()))?;

        let content = std::fs::read_to_string(path)?;
        match ext.to_lowercase().as_str() {
            "toml" => Self::from_toml_str(&content),
            "json" => Self::from_json_str(&content),
            other => Err(NamingError::InvalidConfiguration(format!(
                "Unsupported format: {}",
                other
            ))),
        }
    }

    /// Store endpoints parsed from `address`.
    pub fn endpoints(&self) -> Vec<String> {
        self.address
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }

    /// Dial and per-call timeout.
    pub fn timeout(&self) -> Duration {
        if self.timeout == 0 {
            Duration::from_secs(DEFAULT_TIMEOUT_SECS)
        } else {
            Duration::from_secs(self.timeout)
        }
    }

    /// TLS material when fully configured.
    pub fn tls(&self) -> Option<&TlsConfig> {
        self.tls.as_ref().filter(|tls| tls.is_complete())
    }

    pub fn validate(&self) -> NamingResult<()> {
        if self.endpoints().is_empty() {
            return Err(NamingError::InvalidConfiguration(
                "at least one store endpoint is required".to_string(),
            ));
        }
        if let Some(tls) = &self.tls {
            if !tls.is_complete() && !tls.is_empty() {
                return Err(NamingError::InvalidConfiguration(
                    "tls requires cert_file, key_file and ca_file".to_string(),
                ));
            }
        }
        for service in &self.services {
            if service.name.is_empty() {
                return Err(NamingError::InvalidConfiguration(
                    "service name must not be empty".to_string(),
                ));
            }
            if service.ttl == 0 {
                return Err(NamingError::InvalidConfiguration(format!(
                    "service {} has a zero ttl",
                    service.name
                )));
            }
        }
        Ok(())
    }

    pub fn discovery(&self) -> DiscoveryConfig {
        DiscoveryConfig::new(self.prefix.clone()).with_timeout(self.timeout())
    }

    pub fn selector(&self) -> SelectorConfig {
        SelectorConfig::new(self.load_balance.name.clone())
    }

    /// Registry config for one configured service.
    pub fn registry(&self, service: &ServiceConfig) -> RegistryConfig {
        RegistryConfig::new(self.prefix.clone())
            .with_ttl(Duration::from_secs(service.ttl.max(1)))
            .with_weight(service.weight)
            .with_metadata(service.metadata.clone())
            .with_deregister_timeout(self.timeout())
    }
}

fn or_default_prefix(prefix: String) -> String {
    if prefix.trim().is_empty() {
        DEFAULT_PREFIX.to_string()
    } else {
        prefix
    }
}

/// Read-path configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryConfig {
    pub prefix: String,
    /// Freshness window of a cached node list
    pub cache_ttl: Duration,
    /// Bound on one authoritative fetch
    pub timeout: Duration,
}

impl DiscoveryConfig {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: or_default_prefix(prefix.into()),
            cache_ttl: DEFAULT_CACHE_TTL,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

/// Write-path configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryConfig {
    pub prefix: String,
    /// Lease TTL class
    pub ttl: Duration,
    pub weight: i32,
    pub metadata: HashMap<String, String>,
    /// Retry schedule for failed lease/put attempts
    pub backoff: ExponentialBackoff,
    /// Bound on the delete issued by deregister
    pub deregister_timeout: Duration,
}

impl RegistryConfig {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: or_default_prefix(prefix.into()),
            ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            weight: DEFAULT_WEIGHT,
            metadata: HashMap::new(),
            backoff: ExponentialBackoff::default(),
            deregister_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set weight; zero falls back to the default.
    pub fn with_weight(mut self, weight: i32) -> Self {
        self.weight = if weight == 0 { DEFAULT_WEIGHT } else { weight };
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_deregister_timeout(mut self, timeout: Duration) -> Self {
        self.deregister_timeout = timeout;
        self
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

/// Selector configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorConfig {
    /// Name of the load balancer to delegate to
    pub load_balancer: String,
}

impl SelectorConfig {
    pub fn new(load_balancer: impl Into<String>) -> Self {
        let load_balancer = load_balancer.into();
        Self {
            load_balancer: if load_balancer.is_empty() {
                DEFAULT_LOAD_BALANCER.to_string()
            } else {
                load_balancer
            },
        }
    }
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self::new(DEFAULT_LOAD_BALANCER)
    }
}
