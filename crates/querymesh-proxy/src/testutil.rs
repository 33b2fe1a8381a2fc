//! In-process test backends and fixture helpers

use crate::buffers::BufferPool;
use crate::client::{OutboundMeta, SeriesStream, StoreClient};
use async_trait::async_trait;
use futures::stream;
use prometheus::IntCounter;
use querymesh_core::{LabelSet, TimeRange};
use querymesh_proto::{
    chunk::Encoding, AggrChunk, Chunk, Label, LabelNamesRequest, LabelNamesResponse,
    LabelValuesRequest, LabelValuesResponse, Series, SeriesRequest, SeriesResponse,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tonic::Status;

pub(crate) fn test_pool() -> Arc<BufferPool> {
    Arc::new(BufferPool::new())
}

pub(crate) fn test_counter() -> IntCounter {
    IntCounter::new("test_counter", "test counter").unwrap()
}

pub(crate) fn chunk(min_time: i64) -> AggrChunk {
    chunk_with_data(min_time, &min_time.to_be_bytes())
}

pub(crate) fn chunk_with_data(min_time: i64, data: &[u8]) -> AggrChunk {
    AggrChunk {
        min_time,
        max_time: min_time + 10,
        raw: Some(Chunk {
            r#type: Encoding::Xor as i32,
            data: data.to_vec(),
        }),
    }
}

pub(crate) fn series(labels: &[(&str, &str)], chunks: &[AggrChunk]) -> Series {
    Series {
        labels: labels
            .iter()
            .map(|(n, v)| Label {
                name: n.to_string(),
                value: v.to_string(),
            })
            .collect(),
        chunks: chunks.to_vec(),
    }
}

/// A scripted in-process backend.
pub(crate) struct TestStore {
    name: String,
    addr: String,
    is_local: bool,
    label_sets: Vec<LabelSet>,
    time_range: TimeRange,
    supports_sharding: bool,
    supports_without_replica_labels: bool,
    replica_key: String,
    group_key: String,
    responses: Vec<SeriesResponse>,
    open_error: Option<Status>,
    names: Vec<String>,
    values: Vec<String>,
    unary_error: Option<Status>,
    opened: AtomicUsize,
    last_series_request: Mutex<Option<SeriesRequest>>,
    last_tenant: Mutex<Option<String>>,
}

impl TestStore {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            addr: format!("{}:10901", name),
            is_local: false,
            label_sets: Vec::new(),
            time_range: TimeRange::FULL,
            supports_sharding: false,
            supports_without_replica_labels: true,
            replica_key: name.clone(),
            group_key: name.clone(),
            name,
            responses: Vec::new(),
            open_error: None,
            names: Vec::new(),
            values: Vec::new(),
            unary_error: None,
            opened: AtomicUsize::new(0),
            last_series_request: Mutex::new(None),
            last_tenant: Mutex::new(None),
        }
    }

    pub(crate) fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    pub(crate) fn local(mut self) -> Self {
        self.is_local = true;
        self
    }

    pub(crate) fn with_label_sets(mut self, label_sets: Vec<LabelSet>) -> Self {
        self.label_sets = label_sets;
        self
    }

    pub(crate) fn with_time_range(mut self, min_time: i64, max_time: i64) -> Self {
        self.time_range = TimeRange::new(min_time, max_time);
        self
    }

    pub(crate) fn with_group(mut self, group: impl Into<String>, replica: impl Into<String>) -> Self {
        self.group_key = group.into();
        self.replica_key = replica.into();
        self
    }

    pub(crate) fn with_series(mut self, series: Vec<Series>) -> Self {
        self.responses = series.into_iter().map(SeriesResponse::from_series).collect();
        self
    }

    pub(crate) fn with_responses(mut self, responses: Vec<SeriesResponse>) -> Self {
        self.responses = responses;
        self
    }

    pub(crate) fn with_open_error(mut self, status: Status) -> Self {
        self.open_error = Some(status);
        self
    }

    pub(crate) fn with_names(mut self, names: &[&str]) -> Self {
        self.names = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub(crate) fn with_values(mut self, values: &[&str]) -> Self {
        self.values = values.iter().map(|s| s.to_string()).collect();
        self
    }

    pub(crate) fn with_unary_error(mut self, status: Status) -> Self {
        self.unary_error = Some(status);
        self
    }

    pub(crate) fn without_replica_label_support(mut self) -> Self {
        self.supports_without_replica_labels = false;
        self
    }

    pub(crate) fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub(crate) fn last_series_request(&self) -> Option<SeriesRequest> {
        self.last_series_request.lock().unwrap().clone()
    }

    pub(crate) fn last_tenant(&self) -> Option<String> {
        self.last_tenant.lock().unwrap().clone()
    }
}

#[async_trait]
impl StoreClient for TestStore {
    async fn series(
        &self,
        request: SeriesRequest,
        meta: &OutboundMeta,
    ) -> Result<SeriesStream, Status> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        *self.last_series_request.lock().unwrap() = Some(request);
        *self.last_tenant.lock().unwrap() = Some(meta.tenant.clone());

        if let Some(err) = &self.open_error {
            return Err(err.clone());
        }
        let responses: Vec<Result<SeriesResponse, Status>> =
            self.responses.iter().cloned().map(Ok).collect();
        Ok(Box::pin(stream::iter(responses)))
    }

    async fn label_names(
        &self,
        _request: LabelNamesRequest,
        _meta: &OutboundMeta,
    ) -> Result<LabelNamesResponse, Status> {
        if let Some(err) = &self.unary_error {
            return Err(err.clone());
        }
        Ok(LabelNamesResponse {
            names: self.names.clone(),
            warnings: Vec::new(),
        })
    }

    async fn label_values(
        &self,
        _request: LabelValuesRequest,
        _meta: &OutboundMeta,
    ) -> Result<LabelValuesResponse, Status> {
        if let Some(err) = &self.unary_error {
            return Err(err.clone());
        }
        Ok(LabelValuesResponse {
            values: self.values.clone(),
            warnings: Vec::new(),
        })
    }

    fn label_sets(&self) -> Vec<LabelSet> {
        self.label_sets.clone()
    }

    fn time_range(&self) -> TimeRange {
        self.time_range
    }

    fn supports_sharding(&self) -> bool {
        self.supports_sharding
    }

    fn supports_without_replica_labels(&self) -> bool {
        self.supports_without_replica_labels
    }

    fn addr(&self) -> (String, bool) {
        (self.addr.clone(), self.is_local)
    }

    fn replica_key(&self) -> &str {
        &self.replica_key
    }

    fn group_key(&self) -> &str {
        &self.group_key
    }

    fn id(&self) -> String {
        self.name.clone()
    }
}
