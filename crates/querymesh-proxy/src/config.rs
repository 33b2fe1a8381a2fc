//! Proxy configuration

use crate::client::StoreSpec;
use crate::respset::RetrievalStrategy;
use querymesh_core::{Error, LabelSet, Result, TimeRange};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// gRPC server listen address
    pub listen_addr: SocketAddr,

    /// External labels this proxy announces; every emitted series is
    /// implicitly in their scope
    pub selector_labels: BTreeMap<String, String>,

    /// Per-stream silence timeout for backend responses
    pub response_timeout: Option<Duration>,

    /// How backend streams are pulled
    pub retrieval_strategy: RetrievalStrategy,

    /// Log per-store filter decisions
    pub debug_logging: bool,

    /// Statically configured backends
    pub stores: Vec<StoreEndpointConfig>,
}

/// One statically configured backend endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreEndpointConfig {
    /// Dial address, e.g. "db-0.stores:10901"
    pub address: String,

    /// Replica group; defaults to the address
    #[serde(default)]
    pub group_key: Option<String>,

    /// Replica endpoint identifier; defaults to the address
    #[serde(default)]
    pub replica_key: Option<String>,

    /// External label sets the backend announces
    #[serde(default)]
    pub label_sets: Vec<BTreeMap<String, String>>,

    /// Advertised minimum time, milliseconds since epoch
    #[serde(default)]
    pub min_time: Option<i64>,

    /// Advertised maximum time, milliseconds since epoch
    #[serde(default)]
    pub max_time: Option<i64>,

    #[serde(default)]
    pub supports_sharding: bool,

    #[serde(default)]
    pub supports_without_replica_labels: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:10901".parse().expect("static default address"),
            selector_labels: BTreeMap::new(),
            response_timeout: Some(Duration::from_secs(30)),
            retrieval_strategy: RetrievalStrategy::Lazy,
            debug_logging: false,
            stores: Vec::new(),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: ProxyConfig = serde_yaml::from_str(&raw)?;
        validate_config(&config)?;
        Ok(config)
    }

    /// The selector labels as a sorted label set.
    pub fn selector_label_set(&self) -> LabelSet {
        LabelSet::from_pairs(self.selector_labels.clone())
    }
}

impl StoreEndpointConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            group_key: None,
            replica_key: None,
            label_sets: Vec::new(),
            min_time: None,
            max_time: None,
            supports_sharding: false,
            supports_without_replica_labels: false,
        }
    }

    /// Build the store spec for this endpoint.
    pub fn to_spec(&self) -> StoreSpec {
        let mut spec = StoreSpec::new(&self.address)
            .with_label_sets(
                self.label_sets
                    .iter()
                    .map(|labels| LabelSet::from_pairs(labels.clone()))
                    .collect(),
            )
            .with_time_range(TimeRange::new(
                self.min_time.unwrap_or(i64::MIN),
                self.max_time.unwrap_or(i64::MAX),
            ));
        spec.supports_sharding = self.supports_sharding;
        spec.supports_without_replica_labels = self.supports_without_replica_labels;
        if let Some(group) = &self.group_key {
            spec = spec.with_group_key(group);
        }
        if let Some(replica) = &self.replica_key {
            spec = spec.with_replica_key(replica);
        }
        spec
    }
}

/// Builder for ProxyConfig
#[derive(Debug, Default)]
pub struct ProxyConfigBuilder {
    config: ProxyConfig,
}

impl ProxyConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration, e.g. one loaded from a file.
    pub fn from_config(config: ProxyConfig) -> Self {
        Self { config }
    }

    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.config.listen_addr = addr;
        self
    }

    pub fn selector_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.selector_labels.insert(name.into(), value.into());
        self
    }

    pub fn response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.response_timeout = timeout;
        self
    }

    pub fn retrieval_strategy(mut self, strategy: RetrievalStrategy) -> Self {
        self.config.retrieval_strategy = strategy;
        self
    }

    pub fn debug_logging(mut self, enable: bool) -> Self {
        self.config.debug_logging = enable;
        self
    }

    pub fn store(mut self, store: StoreEndpointConfig) -> Self {
        self.config.stores.push(store);
        self
    }

    pub fn build(self) -> ProxyConfig {
        self.config
    }
}

/// Validate proxy configuration
pub fn validate_config(config: &ProxyConfig) -> Result<()> {
    if let Some(timeout) = config.response_timeout {
        if timeout.is_zero() {
            return Err(Error::config("response timeout must be greater than 0"));
        }
    }

    for store in &config.stores {
        if store.address.is_empty() {
            return Err(Error::config("store address must not be empty"));
        }
        if let (Some(min_time), Some(max_time)) = (store.min_time, store.max_time) {
            if min_time > max_time {
                return Err(Error::config(format!(
                    "store {}: min_time is after max_time",
                    store.address
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.listen_addr.port(), 10901);
        assert_eq!(config.retrieval_strategy, RetrievalStrategy::Lazy);
        assert!(config.stores.is_empty());
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ProxyConfigBuilder::new()
            .listen_addr("127.0.0.1:4000".parse().unwrap())
            .selector_label("region", "eu")
            .retrieval_strategy(RetrievalStrategy::Eager)
            .store(StoreEndpointConfig::new("db-0:10901"))
            .build();

        assert_eq!(config.listen_addr.port(), 4000);
        assert_eq!(config.stores.len(), 1);
        assert_eq!(
            config.selector_label_set().get("region"),
            Some("eu")
        );
    }

    #[test]
    fn test_config_validation() {
        let mut config = ProxyConfig::default();
        config.response_timeout = Some(Duration::ZERO);
        assert!(validate_config(&config).is_err());

        let mut config = ProxyConfig::default();
        let mut store = StoreEndpointConfig::new("db-0:10901");
        store.min_time = Some(100);
        store.max_time = Some(50);
        config.stores.push(store);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_endpoint_to_spec() {
        let mut endpoint = StoreEndpointConfig::new("db-0:10901");
        endpoint.group_key = Some("db".to_string());
        endpoint.replica_key = Some("db-rep0".to_string());
        endpoint.min_time = Some(0);
        endpoint.max_time = Some(1000);
        endpoint
            .label_sets
            .push(BTreeMap::from([("region".to_string(), "eu".to_string())]));

        let spec = endpoint.to_spec();
        assert_eq!(spec.group_key(), "db");
        assert_eq!(spec.replica_key(), "db-rep0");
        assert_eq!(spec.time_range, TimeRange::new(0, 1000));
        assert_eq!(spec.label_sets.len(), 1);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let yaml = r#"
listen_addr: "127.0.0.1:10901"
selector_labels:
  region: eu
retrieval_strategy: eager
stores:
  - address: "db-0:10901"
    group_key: db
    replica_key: db-rep0
"#;
        let config: ProxyConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.retrieval_strategy, RetrievalStrategy::Eager);
        assert_eq!(config.stores[0].group_key.as_deref(), Some("db"));
        assert!(validate_config(&config).is_ok());
    }
}
