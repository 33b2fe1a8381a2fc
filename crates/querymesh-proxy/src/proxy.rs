//! The fan-out proxy controller
//!
//! [`ProxyStore`] serves the `Store` API and multiplexes every request
//! across the backends supplied by its registry. `Series` composes a
//! deduplicator over a loser-tree merge of per-backend cursors;
//! `LabelNames` and `LabelValues` fan out as parallel unary calls and
//! merge the string sets; `Info` aggregates locally held metadata.

use crate::buffers::BufferPool;
use crate::client::{OutboundMeta, StoreClient, DEFAULT_TENANT_HEADER};
use crate::dedup::ResponseDeduplicator;
use crate::matching::{matchers_for_label_sets, reduce_matchers, store_matches};
use crate::merge::LoserTree;
use crate::metrics::ProxyMetrics;
use crate::registry::StoreRegistry;
use crate::respset::{RespSet, RetrievalStrategy};
use crate::selector::TsdbSelector;
use querymesh_core::{strutil, LabelSet, Matcher, TimeRange};
use querymesh_proto::conversions::{label_set_to_wire, matchers_from_wire, matchers_to_wire};
use querymesh_proto::{
    InfoRequest, InfoResponse, LabelNamesRequest, LabelNamesResponse, LabelValuesRequest,
    LabelValuesResponse, LabelSet as WireLabelSet, PartialResponseStrategy, SeriesRequest,
    SeriesResponse, Store, StoreType, TsdbInfo,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Tenant carried as a request extension when no metadata header is set,
/// e.g. when an embedding query engine calls the proxy in-process.
#[derive(Debug, Clone)]
pub struct TenantId(pub String);

/// Debug matcher groups carried as a request extension. When present,
/// only non-local backends whose address satisfies at least one group
/// (inner AND, outer OR) are queried.
#[derive(Debug, Clone)]
pub struct StoreMatchers(pub Vec<Vec<Matcher>>);

/// Capacity of the outbound response channel feeding the caller's stream.
const RESPONSE_CHANNEL_CAPACITY: usize = 16;

/// The query fan-out proxy.
#[derive(Clone)]
pub struct ProxyStore {
    registry: Arc<dyn StoreRegistry>,
    store_type: StoreType,
    selector_labels: LabelSet,
    response_timeout: Option<Duration>,
    retrieval_strategy: RetrievalStrategy,
    tsdb_selector: TsdbSelector,
    buffers: Arc<BufferPool>,
    metrics: ProxyMetrics,
    debug_logging: bool,
}

impl ProxyStore {
    /// Create a proxy over the given backend registry.
    ///
    /// There is no cross-replica data-point deduplication here; that is
    /// the query engine's job. The proxy only collapses bit-identical
    /// replica responses.
    pub fn new(
        registry: Arc<dyn StoreRegistry>,
        store_type: StoreType,
        selector_labels: LabelSet,
        response_timeout: Option<Duration>,
        retrieval_strategy: RetrievalStrategy,
        metrics: ProxyMetrics,
    ) -> Self {
        Self {
            registry,
            store_type,
            selector_labels,
            response_timeout,
            retrieval_strategy,
            tsdb_selector: TsdbSelector::accept_all(),
            buffers: Arc::new(BufferPool::new()),
            metrics,
            debug_logging: false,
        }
    }

    /// Replace the TSDB selector.
    pub fn with_tsdb_selector(mut self, selector: TsdbSelector) -> Self {
        self.tsdb_selector = selector;
        self
    }

    /// Toggle per-store filter decision logging.
    pub fn with_debug_logging(mut self, enable: bool) -> Self {
        self.debug_logging = enable;
        self
    }

    /// Aggregate time range over all registered backends.
    pub fn time_range(&self) -> TimeRange {
        let stores = self.registry.snapshot();
        if stores.is_empty() {
            return TimeRange::FULL;
        }

        let mut min_time = i64::MAX;
        let mut max_time = i64::MIN;
        for store in &stores {
            let range = store.time_range();
            min_time = min_time.min(range.min_time);
            max_time = max_time.max(range.max_time);
        }
        TimeRange::new(min_time, max_time)
    }

    /// Union of the backends' label sets, each extended by the selector
    /// labels (selector wins on conflict). The proxy always announces the
    /// subset of data its selector labels represent, so when the union is
    /// empty and the selector is not, the selector itself is announced.
    pub fn label_set(&self) -> Vec<LabelSet> {
        let mut merged = BTreeSet::new();
        for store in self.registry.snapshot() {
            for set in store.label_sets() {
                merged.insert(set.extend_sorted(&self.selector_labels));
            }
        }

        let mut label_sets: Vec<LabelSet> = merged.into_iter().collect();
        if label_sets.is_empty() && !self.selector_labels.is_empty() {
            label_sets.push(self.selector_labels.clone());
        }
        label_sets
    }

    /// Metadata about every TSDB reachable through this proxy, filtered by
    /// the TSDB selector.
    pub fn tsdb_infos(&self) -> Vec<TsdbInfo> {
        let mut infos = Vec::new();
        for store in self.registry.snapshot() {
            let (matched, _) = self.tsdb_selector.match_label_sets(&store.label_sets());
            if !matched {
                continue;
            }
            infos.extend(store.tsdb_infos());
        }
        infos
    }

    fn tenant_of<T>(request: &Request<T>) -> String {
        if let Some(value) = request.metadata().get(DEFAULT_TENANT_HEADER) {
            if let Ok(tenant) = value.to_str() {
                return tenant.to_string();
            }
        }
        request
            .extensions()
            .get::<TenantId>()
            .map(|t| t.0.clone())
            .unwrap_or_default()
    }

    /// Remaining deadline of the inbound request, read from the
    /// `grpc-timeout` metadata so it can be re-applied to sub-requests.
    fn inbound_timeout<T>(request: &Request<T>) -> Option<Duration> {
        let value = request.metadata().get("grpc-timeout")?.to_str().ok()?;
        parse_grpc_timeout(value)
    }

    fn debug_matchers_of<T>(request: &Request<T>) -> Option<Vec<Vec<Matcher>>> {
        request
            .extensions()
            .get::<StoreMatchers>()
            .map(|m| m.0.clone())
    }

    /// Select the backends eligible for the request and record their
    /// group/replica membership in `tracker`.
    fn select_stores(
        &self,
        min_time: i64,
        max_time: i64,
        matchers: &[Matcher],
        debug_matchers: Option<&[Vec<Matcher>]>,
        tracker: &mut FailureTracker,
    ) -> (Vec<Arc<dyn StoreClient>>, Vec<LabelSet>) {
        let mut stores = Vec::new();
        let mut extra_label_sets = Vec::new();
        let mut debug_msgs = Vec::new();

        for store in self.registry.snapshot() {
            let (ok, reason) = store_matches(
                store.as_ref(),
                self.debug_logging,
                debug_matchers,
                min_time,
                max_time,
                matchers,
            );
            if !ok {
                if self.debug_logging {
                    debug_msgs.push(format!(
                        "store {} filtered out due to: {}",
                        store.id(),
                        reason.unwrap_or_default()
                    ));
                }
                continue;
            }

            let (matched, extra) = self.tsdb_selector.match_label_sets(&store.label_sets());
            if !matched {
                if self.debug_logging {
                    debug_msgs.push(format!(
                        "store {} filtered out due to: tsdb selector",
                        store.id()
                    ));
                }
                continue;
            }
            extra_label_sets.extend(extra);

            if self.debug_logging {
                debug_msgs.push(format!("store {} queried", store.id()));
            }
            tracker.bump_eligible(store.group_key(), store.replica_key());
            stores.push(store);
        }

        if self.debug_logging {
            debug!(stores = %debug_msgs.join(";"), "store selection");
        }
        (stores, extra_label_sets)
    }

    /// Open one cursor per store, merge, deduplicate and forward. Errors
    /// returned here abort the outbound stream.
    async fn fan_out_series(
        &self,
        tracker: &mut FailureTracker,
        stores: Vec<Arc<dyn StoreClient>>,
        sub_request: SeriesRequest,
        meta: OutboundMeta,
        tx: &mpsc::Sender<Result<SeriesResponse, Status>>,
    ) -> Result<(), Status> {
        let strategy = sub_request.partial_response_strategy();
        let disabled = sub_request.partial_response_disabled;

        let mut sets = Vec::with_capacity(stores.len());
        for store in &stores {
            let opened = RespSet::open(
                store,
                sub_request.clone(),
                &meta,
                self.retrieval_strategy,
                self.response_timeout,
                self.buffers.clone(),
                self.metrics.empty_stream_responses.clone(),
            )
            .await;

            match opened {
                Ok(set) => sets.push(set),
                Err(err) => {
                    warn!(
                        store = %store.id(),
                        group = %store.group_key(),
                        replica = %store.replica_key(),
                        error = %err,
                        "store failure"
                    );
                    tracker.record_failure(store.group_key(), store.replica_key());

                    if disabled {
                        return Err(err);
                    }
                    match strategy {
                        PartialResponseStrategy::GroupReplica => {
                            if tracker.group_exhausted(store.group_key(), store.replica_key()) {
                                error!(
                                    group = %store.group_key(),
                                    replicas = ?tracker.failed.get(store.group_key()),
                                    "no healthy replicas left for group"
                                );
                                return Err(err);
                            }
                        }
                        PartialResponseStrategy::Warn => {
                            let warning = SeriesResponse::from_warning(format!(
                                "receive series from {}: {}",
                                store.id(),
                                err
                            ));
                            if tx.send(Ok(warning)).await.is_err() {
                                return Ok(());
                            }
                        }
                        PartialResponseStrategy::Abort => return Err(err),
                    }
                }
            }
        }

        let mut dedup = ResponseDeduplicator::new(LoserTree::new(sets));
        let result = self
            .forward_merged(tracker, &mut dedup, strategy, disabled, tx)
            .await;
        dedup.close();
        result
    }

    async fn forward_merged(
        &self,
        tracker: &mut FailureTracker,
        dedup: &mut ResponseDeduplicator,
        strategy: PartialResponseStrategy,
        disabled: bool,
        tx: &mpsc::Sender<Result<SeriesResponse, Status>>,
    ) -> Result<(), Status> {
        loop {
            let resp = match dedup.next().await? {
                None => return Ok(()),
                Some(resp) => resp,
            };

            if let Some(warning) = resp.warning() {
                tracker.total_failed += 1;
                error!(warning = %warning, "series: warning from store");

                if disabled || strategy == PartialResponseStrategy::Abort {
                    return Err(Status::aborted(warning.to_string()));
                }
                if strategy == PartialResponseStrategy::GroupReplica {
                    // An in-stream warning cannot be attributed to a
                    // specific group/replica, so at most one failure is
                    // tolerated across the whole request.
                    if tracker.total_failed > 1 {
                        error!("more than one store has failed");
                        return Err(Status::aborted(warning.to_string()));
                    }
                }
            }

            if tx.send(Ok(resp)).await.is_err() {
                warn!("send series response: receiver dropped");
                return Ok(());
            }
        }
    }
}

/// Eligibility and failure counts per `(group, replica)`, owned by one
/// `Series` request.
#[derive(Debug, Default)]
struct FailureTracker {
    eligible: HashMap<String, HashMap<String, u32>>,
    failed: HashMap<String, HashMap<String, u32>>,
    total_failed: u32,
}

impl FailureTracker {
    fn bump_eligible(&mut self, group: &str, replica: &str) {
        *self
            .eligible
            .entry(group.to_string())
            .or_default()
            .entry(replica.to_string())
            .or_default() += 1;
    }

    fn record_failure(&mut self, group: &str, replica: &str) {
        *self
            .failed
            .entry(group.to_string())
            .or_default()
            .entry(replica.to_string())
            .or_default() += 1;
        self.total_failed += 1;
    }

    /// Whether the latest failure leaves the group without a healthy
    /// replica: more than one replica of the group failed, or the group
    /// has a single eligible replica that failed more than once.
    fn group_exhausted(&self, group: &str, replica: &str) -> bool {
        let failed = match self.failed.get(group) {
            None => return false,
            Some(failed) => failed,
        };
        if failed.len() > 1 {
            return true;
        }
        let solitary = self
            .eligible
            .get(group)
            .map(|replicas| replicas.len() == 1)
            .unwrap_or(false);
        solitary && failed.get(replica).copied().unwrap_or(0) > 1
    }
}

#[tonic::async_trait]
impl Store for ProxyStore {
    async fn info(
        &self,
        _request: Request<InfoRequest>,
    ) -> std::result::Result<Response<InfoResponse>, Status> {
        let stores = self.registry.snapshot();

        // Edge case: we have no data if there are no stores.
        let (min_time, max_time) = if stores.is_empty() {
            (0, 0)
        } else {
            let mut min_time = i64::MAX;
            let mut max_time = 0i64;
            for store in &stores {
                let range = store.time_range();
                min_time = min_time.min(range.min_time);
                max_time = max_time.max(range.max_time);
            }
            (min_time, max_time)
        };

        Ok(Response::new(InfoResponse {
            labels: label_set_to_wire(&self.selector_labels),
            min_time,
            max_time,
            store_type: self.store_type as i32,
            label_sets: self.label_set().iter().map(WireLabelSet::from).collect(),
        }))
    }

    type SeriesStream = ReceiverStream<std::result::Result<SeriesResponse, Status>>;

    async fn series(
        &self,
        request: Request<SeriesRequest>,
    ) -> std::result::Result<Response<Self::SeriesStream>, Status> {
        let request_id = Uuid::new_v4();
        let tenant = Self::tenant_of(&request);
        let timeout = Self::inbound_timeout(&request);
        let debug_matchers = Self::debug_matchers_of(&request);
        let original = request.into_inner();

        if self.debug_logging {
            debug!(request_id = %request_id, request = ?original, "series request");
        }

        let matchers = matchers_from_wire(&original.matchers)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let (tx, rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);

        // Requests whose matchers contradict the selector labels cannot
        // match any data behind this proxy: empty success, no fan-out.
        let matchers = match reduce_matchers(matchers, &self.selector_labels) {
            None => return Ok(Response::new(ReceiverStream::new(rx))),
            Some(matchers) => matchers,
        };
        if matchers.is_empty() {
            return Err(Status::invalid_argument(
                "no matchers specified (excluding selector labels)",
            ));
        }

        debug!(request_id = %request_id, tenant = %tenant, "tenant info in series");
        let meta = OutboundMeta::new(tenant, timeout);

        let mut tracker = FailureTracker::default();
        let (stores, extra_label_sets) = self.select_stores(
            original.min_time,
            original.max_time,
            &matchers,
            debug_matchers.as_deref(),
            &mut tracker,
        );

        if stores.is_empty() {
            debug!(request_id = %request_id, "no stores matched for this query");
            return Ok(Response::new(ReceiverStream::new(rx)));
        }

        let mut sub_request = SeriesRequest {
            matchers: matchers_to_wire(&matchers),
            ..original
        };
        if !extra_label_sets.is_empty() {
            let extra = matchers_for_label_sets(&extra_label_sets)
                .map_err(|e| Status::internal(e.to_string()))?;
            sub_request.matchers.extend(matchers_to_wire(&extra));
        }

        let proxy = self.clone();
        tokio::spawn(async move {
            let result = proxy
                .fan_out_series(&mut tracker, stores, sub_request, meta, &tx)
                .await;
            if let Err(status) = result {
                let _ = tx.send(Err(status)).await;
            }
            if !tracker.failed.is_empty() {
                warn!(
                    request_id = %request_id,
                    errors = ?tracker.failed,
                    total_failed_stores = tracker.total_failed,
                    "group/replica errors"
                );
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn label_names(
        &self,
        request: Request<LabelNamesRequest>,
    ) -> std::result::Result<Response<LabelNamesResponse>, Status> {
        let tenant = Self::tenant_of(&request);
        let timeout = Self::inbound_timeout(&request);
        let debug_matchers = Self::debug_matchers_of(&request);
        let r = request.into_inner();
        let meta = OutboundMeta::new(tenant, timeout);

        let names = Arc::new(Mutex::new(Vec::<Vec<String>>::new()));
        let warnings = Arc::new(Mutex::new(Vec::<String>::new()));
        let mut tasks: JoinSet<std::result::Result<(), Status>> = JoinSet::new();

        for store in self.registry.snapshot() {
            let (ok, _) = store_matches(
                store.as_ref(),
                self.debug_logging,
                debug_matchers.as_deref(),
                r.start,
                r.end,
                &[],
            );
            if !ok {
                continue;
            }
            let (matched, extra) = self.tsdb_selector.match_label_sets(&store.label_sets());
            if !matched {
                continue;
            }
            let extra_matchers =
                matchers_for_label_sets(&extra).map_err(|e| Status::internal(e.to_string()))?;

            let mut sub_request = r.clone();
            sub_request.matchers.extend(matchers_to_wire(&extra_matchers));

            let meta = meta.clone();
            let names = names.clone();
            let warnings = warnings.clone();
            let disabled = r.partial_response_disabled;
            tasks.spawn(async move {
                match store.label_names(sub_request, &meta).await {
                    Ok(resp) => {
                        warnings.lock().expect("warnings lock").extend(resp.warnings);
                        names.lock().expect("names lock").push(resp.names);
                        Ok(())
                    }
                    Err(err) => {
                        let wrapped =
                            format!("fetch label names from store {}: {}", store.id(), err);
                        if disabled {
                            return Err(Status::new(err.code(), wrapped));
                        }
                        warnings.lock().expect("warnings lock").push(wrapped);
                        Ok(())
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(status)) => return Err(status),
                Err(e) => return Err(Status::internal(format!("label names fan-out: {}", e))),
            }
        }

        let names = std::mem::take(&mut *names.lock().expect("names lock"));
        let warnings = std::mem::take(&mut *warnings.lock().expect("warnings lock"));
        Ok(Response::new(LabelNamesResponse {
            names: strutil::merge_unsorted(names),
            warnings,
        }))
    }

    async fn label_values(
        &self,
        request: Request<LabelValuesRequest>,
    ) -> std::result::Result<Response<LabelValuesResponse>, Status> {
        let tenant = Self::tenant_of(&request);
        let timeout = Self::inbound_timeout(&request);
        let debug_matchers = Self::debug_matchers_of(&request);
        let r = request.into_inner();

        if r.label.is_empty() {
            return Err(Status::invalid_argument(
                "label name parameter cannot be empty",
            ));
        }

        let meta = OutboundMeta::new(tenant, timeout);
        let values = Arc::new(Mutex::new(Vec::<Vec<String>>::new()));
        let warnings = Arc::new(Mutex::new(Vec::<String>::new()));
        let mut tasks: JoinSet<std::result::Result<(), Status>> = JoinSet::new();

        for store in self.registry.snapshot() {
            let (ok, _) = store_matches(
                store.as_ref(),
                self.debug_logging,
                debug_matchers.as_deref(),
                r.start,
                r.end,
                &[],
            );
            if !ok {
                continue;
            }
            let (matched, extra) = self.tsdb_selector.match_label_sets(&store.label_sets());
            if !matched {
                continue;
            }
            let extra_matchers =
                matchers_for_label_sets(&extra).map_err(|e| Status::internal(e.to_string()))?;

            let mut sub_request = r.clone();
            sub_request.matchers.extend(matchers_to_wire(&extra_matchers));

            let meta = meta.clone();
            let values = values.clone();
            let warnings = warnings.clone();
            let disabled = r.partial_response_disabled;
            tasks.spawn(async move {
                match store.label_values(sub_request, &meta).await {
                    Ok(resp) => {
                        warnings.lock().expect("warnings lock").extend(resp.warnings);
                        values.lock().expect("values lock").push(resp.values);
                        Ok(())
                    }
                    Err(err) => {
                        let wrapped =
                            format!("fetch label values from store {}: {}", store.id(), err);
                        if disabled {
                            return Err(Status::new(err.code(), wrapped));
                        }
                        warnings.lock().expect("warnings lock").push(wrapped);
                        Ok(())
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(status)) => return Err(status),
                Err(e) => return Err(Status::internal(format!("label values fan-out: {}", e))),
            }
        }

        let values = std::mem::take(&mut *values.lock().expect("values lock"));
        let warnings = std::mem::take(&mut *warnings.lock().expect("warnings lock"));
        Ok(Response::new(LabelValuesResponse {
            values: strutil::merge_unsorted(values),
            warnings,
        }))
    }
}

/// Parse a `grpc-timeout` metadata value, e.g. "5S" or "100m".
fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let n: u64 = digits.parse().ok()?;
    Some(match unit {
        "H" => Duration::from_secs(n.saturating_mul(3600)),
        "M" => Duration::from_secs(n.saturating_mul(60)),
        "S" => Duration::from_secs(n),
        "m" => Duration::from_millis(n),
        "u" => Duration::from_micros(n),
        "n" => Duration::from_nanos(n),
        _ => return None,
    })
}
