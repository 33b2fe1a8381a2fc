//! Backend store clients
//!
//! [`StoreClient`] is the proxy's view of one backend: the four read
//! operations plus the metadata used to decide whether the backend is
//! worth querying at all. The remote implementation wraps a tonic channel;
//! in-process implementations are used by tests and by embedding stores
//! into the proxy process.

use async_trait::async_trait;
use futures::stream::BoxStream;
use querymesh_core::{Error, LabelSet, Result, TimeRange};
use querymesh_proto::conversions::label_set_to_wire;
use querymesh_proto::{
    InfoRequest, InfoResponse, LabelNamesRequest, LabelNamesResponse, LabelValuesRequest,
    LabelValuesResponse, LabelSet as WireLabelSet, SeriesRequest, SeriesResponse, StoreType,
    TsdbInfo,
};
use std::time::Duration;
use tonic::metadata::MetadataValue;
use tonic::transport::Channel;
use tonic::{Request, Status};
use tracing::debug;

/// Metadata header carrying the tenant on inbound and outbound requests.
pub const DEFAULT_TENANT_HEADER: &str = "tenant";

/// Unified stream type over remote and in-process backend responses.
pub type SeriesStream = BoxStream<'static, std::result::Result<SeriesResponse, Status>>;

/// Metadata attached to every sub-request: the tenant and the remaining
/// deadline of the inbound request.
#[derive(Debug, Clone, Default)]
pub struct OutboundMeta {
    pub tenant: String,
    pub timeout: Option<Duration>,
}

impl OutboundMeta {
    pub fn new(tenant: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            tenant: tenant.into(),
            timeout,
        }
    }

    /// Wrap a message into a request carrying the tenant header and the
    /// propagated deadline.
    pub fn request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        if !self.tenant.is_empty() {
            match MetadataValue::try_from(self.tenant.as_str()) {
                Ok(value) => {
                    request.metadata_mut().insert(DEFAULT_TENANT_HEADER, value);
                }
                Err(_) => debug!(tenant = %self.tenant, "tenant is not valid metadata, dropping"),
            }
        }
        if let Some(timeout) = self.timeout {
            request.set_timeout(timeout);
        }
        request
    }
}

/// One backend store, as seen by the proxy.
///
/// The metadata accessors must be stable for the lifetime of one request's
/// reference, and the `series` stream must be ordered by label set and then
/// by the minimum time of the first chunk.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Open the streaming series call.
    async fn series(
        &self,
        request: SeriesRequest,
        meta: &OutboundMeta,
    ) -> std::result::Result<SeriesStream, Status>;

    /// Fetch all label names known to the backend.
    async fn label_names(
        &self,
        request: LabelNamesRequest,
        meta: &OutboundMeta,
    ) -> std::result::Result<LabelNamesResponse, Status>;

    /// Fetch all values of one label name.
    async fn label_values(
        &self,
        request: LabelValuesRequest,
        meta: &OutboundMeta,
    ) -> std::result::Result<LabelValuesResponse, Status>;

    /// Fetch store metadata. In-process backends answer from their local
    /// descriptor; remote backends issue the RPC.
    async fn info(
        &self,
        _request: InfoRequest,
        _meta: &OutboundMeta,
    ) -> std::result::Result<InfoResponse, Status> {
        let range = self.time_range();
        Ok(InfoResponse {
            labels: self
                .label_sets()
                .first()
                .map(label_set_to_wire)
                .unwrap_or_default(),
            min_time: range.min_time,
            max_time: range.max_time,
            store_type: StoreType::Unspecified as i32,
            label_sets: self.label_sets().iter().map(WireLabelSet::from).collect(),
        })
    }

    /// Label sets that each apply to some data exposed by the backend.
    fn label_sets(&self) -> Vec<LabelSet>;

    /// Minimum and maximum time of data in the backend.
    fn time_range(&self) -> TimeRange;

    /// Metadata about each TSDB backed by the store.
    fn tsdb_infos(&self) -> Vec<TsdbInfo> {
        let range = self.time_range();
        self.label_sets()
            .iter()
            .map(|set| TsdbInfo::new(set, range))
            .collect()
    }

    /// Whether the backend can evaluate shard selectors itself.
    fn supports_sharding(&self) -> bool;

    /// Whether the backend can trim replica labels and still return a
    /// sorted stream.
    fn supports_without_replica_labels(&self) -> bool;

    /// Address of the backend. The second value is true for local
    /// (in-process) backends, which have no meaningful address and cannot
    /// be matched by debug address matchers.
    fn addr(&self) -> (String, bool);

    /// Identifier of this replica endpoint (e.g. "db-rep0").
    fn replica_key(&self) -> &str;

    /// Identifier of the replica group this endpoint belongs to (e.g.
    /// "db"). Replicas of the same logical backend share a group key.
    fn group_key(&self) -> &str;

    /// Human-readable identifier used in logs and error messages.
    fn id(&self) -> String {
        let sets = self.label_sets();
        if !sets.is_empty() {
            return sets
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(";");
        }
        let (addr, is_local) = self.addr();
        if is_local {
            "local store".to_string()
        } else {
            addr
        }
    }
}

/// Static description of one backend endpoint.
#[derive(Debug, Clone)]
pub struct StoreSpec {
    /// Dial address, also the default group and replica key
    pub addr: String,

    /// External label sets the backend announces
    pub label_sets: Vec<LabelSet>,

    /// Advertised data time range
    pub time_range: TimeRange,

    /// Capability bits
    pub supports_sharding: bool,
    pub supports_without_replica_labels: bool,

    /// Replica endpoint identifier, defaults to the address
    pub replica_key: Option<String>,

    /// Replica group identifier, defaults to the address
    pub group_key: Option<String>,
}

impl StoreSpec {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            label_sets: Vec::new(),
            time_range: TimeRange::FULL,
            supports_sharding: false,
            supports_without_replica_labels: false,
            replica_key: None,
            group_key: None,
        }
    }

    pub fn with_label_sets(mut self, label_sets: Vec<LabelSet>) -> Self {
        self.label_sets = label_sets;
        self
    }

    pub fn with_time_range(mut self, time_range: TimeRange) -> Self {
        self.time_range = time_range;
        self
    }

    pub fn with_replica_key(mut self, replica_key: impl Into<String>) -> Self {
        self.replica_key = Some(replica_key.into());
        self
    }

    pub fn with_group_key(mut self, group_key: impl Into<String>) -> Self {
        self.group_key = Some(group_key.into());
        self
    }

    pub fn replica_key(&self) -> &str {
        self.replica_key.as_deref().unwrap_or(&self.addr)
    }

    pub fn group_key(&self) -> &str {
        self.group_key.as_deref().unwrap_or(&self.addr)
    }
}

/// Remote backend over a tonic channel.
#[derive(Debug, Clone)]
pub struct GrpcStoreClient {
    client: querymesh_proto::StoreClient<Channel>,
    spec: StoreSpec,
}

impl GrpcStoreClient {
    /// Dial the backend described by `spec`.
    pub async fn connect(spec: StoreSpec) -> Result<Self> {
        let endpoint = format!("http://{}", spec.addr);
        debug!(addr = %spec.addr, "connecting to store");

        let channel = Channel::from_shared(endpoint)
            .map_err(|e| Error::config(format!("invalid store address {:?}: {}", spec.addr, e)))?
            .connect()
            .await
            .map_err(|e| Error::transport(format!("connect to store {}: {}", spec.addr, e)))?;

        Ok(Self::from_channel(channel, spec))
    }

    /// Like [`GrpcStoreClient::connect`], but the connection is only
    /// established on first use, so the proxy can start before its
    /// backends do.
    pub fn connect_lazy(spec: StoreSpec) -> Result<Self> {
        let endpoint = format!("http://{}", spec.addr);
        let channel = Channel::from_shared(endpoint)
            .map_err(|e| Error::config(format!("invalid store address {:?}: {}", spec.addr, e)))?
            .connect_lazy();
        Ok(Self::from_channel(channel, spec))
    }

    /// Wrap an existing channel, e.g. one drawn from a connection pool.
    pub fn from_channel(channel: Channel, spec: StoreSpec) -> Self {
        Self {
            client: querymesh_proto::StoreClient::new(channel),
            spec,
        }
    }

    pub fn spec(&self) -> &StoreSpec {
        &self.spec
    }
}

#[async_trait]
impl StoreClient for GrpcStoreClient {
    async fn series(
        &self,
        request: SeriesRequest,
        meta: &OutboundMeta,
    ) -> std::result::Result<SeriesStream, Status> {
        let mut client = self.client.clone();
        let response = client.series(meta.request(request)).await?;
        Ok(Box::pin(response.into_inner()))
    }

    async fn label_names(
        &self,
        request: LabelNamesRequest,
        meta: &OutboundMeta,
    ) -> std::result::Result<LabelNamesResponse, Status> {
        let mut client = self.client.clone();
        Ok(client.label_names(meta.request(request)).await?.into_inner())
    }

    async fn label_values(
        &self,
        request: LabelValuesRequest,
        meta: &OutboundMeta,
    ) -> std::result::Result<LabelValuesResponse, Status> {
        let mut client = self.client.clone();
        Ok(client
            .label_values(meta.request(request))
            .await?
            .into_inner())
    }

    async fn info(
        &self,
        request: InfoRequest,
        meta: &OutboundMeta,
    ) -> std::result::Result<InfoResponse, Status> {
        let mut client = self.client.clone();
        Ok(client.info(meta.request(request)).await?.into_inner())
    }

    fn label_sets(&self) -> Vec<LabelSet> {
        self.spec.label_sets.clone()
    }

    fn time_range(&self) -> TimeRange {
        self.spec.time_range
    }

    fn supports_sharding(&self) -> bool {
        self.spec.supports_sharding
    }

    fn supports_without_replica_labels(&self) -> bool {
        self.spec.supports_without_replica_labels
    }

    fn addr(&self) -> (String, bool) {
        (self.spec.addr.clone(), false)
    }

    fn replica_key(&self) -> &str {
        self.spec.replica_key()
    }

    fn group_key(&self) -> &str {
        self.spec.group_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_key_defaults() {
        let spec = StoreSpec::new("db-0:10901");
        assert_eq!(spec.replica_key(), "db-0:10901");
        assert_eq!(spec.group_key(), "db-0:10901");

        let spec = StoreSpec::new("db-0:10901")
            .with_replica_key("db-rep0")
            .with_group_key("db");
        assert_eq!(spec.replica_key(), "db-rep0");
        assert_eq!(spec.group_key(), "db");
    }

    #[test]
    fn test_outbound_meta_request() {
        let meta = OutboundMeta::new("team-a", Some(Duration::from_secs(5)));
        let request = meta.request(());
        assert_eq!(
            request.metadata().get(DEFAULT_TENANT_HEADER).unwrap(),
            "team-a"
        );

        let meta = OutboundMeta::default();
        let request = meta.request(());
        assert!(request.metadata().get(DEFAULT_TENANT_HEADER).is_none());
    }
}
