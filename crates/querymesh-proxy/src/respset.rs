//! Streaming response sets
//!
//! A [`RespSet`] wraps one backend's `Series` stream as a buffered cursor:
//! `advance` pulls the next response into `current`, backend errors and
//! silence timeouts are framed as in-band warning responses, and every
//! cursor caches an order-preserving byte key of its current series so the
//! merge layer can compare cursors with a plain memcmp.
//!
//! Three retrieval modes exist. Lazy reads one response per `advance`, so
//! back-pressure reaches the backend directly. Eager runs a dedicated
//! reader into a small bounded queue, decoupling slow consumers from the
//! backend at bounded memory cost. The buffered mode is the fallback for
//! backends that cannot trim replica labels themselves: trimming can break
//! their sort order, so the whole stream is collected, trimmed and
//! re-sorted before it takes part in the merge.

use crate::buffers::BufferPool;
use crate::client::{OutboundMeta, SeriesStream, StoreClient};
use futures::StreamExt;
use prometheus::IntCounter;
use querymesh_proto::{Series, SeriesRequest, SeriesResponse};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tonic::Status;
use tracing::debug;

/// How responses are pulled from a backend stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalStrategy {
    /// One response per `advance` call
    Lazy,
    /// A dedicated reader fills a bounded queue
    Eager,
}

impl Default for RetrievalStrategy {
    fn default() -> Self {
        RetrievalStrategy::Lazy
    }
}

/// Capacity of the eager reader's queue.
const EAGER_QUEUE_CAPACITY: usize = 16;

enum Kind {
    Lazy {
        stream: SeriesStream,
        timeout: Option<Duration>,
    },
    Eager {
        rx: mpsc::Receiver<SeriesResponse>,
        reader: JoinHandle<()>,
    },
    Buffered {
        queue: VecDeque<SeriesResponse>,
    },
}

/// A live cursor over one backend's streaming responses.
pub(crate) struct RespSet {
    store_id: String,
    kind: Kind,
    current: Option<SeriesResponse>,
    /// Sort key of the most recent series response, leased from the pool.
    /// Warnings and hints keep the key of whichever series was current
    /// when they arrived.
    key: Vec<u8>,
    done: bool,
    /// Set once an error was framed as a warning; the next advance ends
    /// the cursor without touching the stream again.
    fused: bool,
    seen: u64,
    empty_streams: IntCounter,
    pool: Arc<BufferPool>,
    closed: bool,
}

impl RespSet {
    /// Open the backend stream and wrap it. Open-time transport failures
    /// surface here so the controller can apply its partial-response
    /// policy before anything is merged.
    pub(crate) async fn open(
        store: &Arc<dyn StoreClient>,
        mut request: SeriesRequest,
        meta: &OutboundMeta,
        strategy: RetrievalStrategy,
        response_timeout: Option<Duration>,
        pool: Arc<BufferPool>,
        empty_streams: IntCounter,
    ) -> Result<Self, Status> {
        // Backends that cannot trim replica labels themselves get the
        // untrimmed request and the proxy trims locally.
        let strip_labels = if !request.without_replica_labels.is_empty()
            && !store.supports_without_replica_labels()
        {
            Some(std::mem::take(&mut request.without_replica_labels))
        } else {
            None
        };

        let stream = store.series(request, meta).await?;
        Self::with_stream(
            store.id(),
            stream,
            strategy,
            strip_labels,
            response_timeout,
            pool,
            empty_streams,
        )
        .await
    }

    pub(crate) async fn with_stream(
        store_id: String,
        mut stream: SeriesStream,
        strategy: RetrievalStrategy,
        strip_labels: Option<Vec<String>>,
        response_timeout: Option<Duration>,
        pool: Arc<BufferPool>,
        empty_streams: IntCounter,
    ) -> Result<Self, Status> {
        let key = pool.get();

        if let Some(strip) = strip_labels {
            let queue =
                buffer_and_resort(&store_id, stream, &strip, response_timeout, &empty_streams)
                    .await;
            return Ok(Self {
                store_id,
                kind: Kind::Buffered { queue },
                current: None,
                key,
                done: false,
                fused: false,
                seen: 0,
                empty_streams,
                pool,
                closed: false,
            });
        }

        let kind = match strategy {
            RetrievalStrategy::Lazy => Kind::Lazy {
                stream,
                timeout: response_timeout,
            },
            RetrievalStrategy::Eager => {
                let (tx, rx) = mpsc::channel(EAGER_QUEUE_CAPACITY);
                let id = store_id.clone();
                let counter = empty_streams.clone();
                let reader = tokio::spawn(async move {
                    let mut seen = 0u64;
                    loop {
                        let outcome = tokio::select! {
                            // Consumer dropped the cursor; stop reading.
                            _ = tx.closed() => return,
                            outcome = recv_next(&mut stream, response_timeout, &id) => outcome,
                        };
                        match outcome {
                            RecvOutcome::Msg(resp) => {
                                seen += 1;
                                if tx.send(resp).await.is_err() {
                                    return;
                                }
                            }
                            RecvOutcome::End => break,
                            RecvOutcome::Warn(warning) => {
                                let _ = tx.send(warning).await;
                                return;
                            }
                        }
                    }
                    if seen == 0 {
                        counter.inc();
                    }
                });
                Kind::Eager { rx, reader }
            }
        };

        Ok(Self {
            store_id,
            kind,
            current: None,
            key,
            done: false,
            fused: false,
            seen: 0,
            empty_streams,
            pool,
            closed: false,
        })
    }

    /// Pull the next response into `current`. Returns false once the
    /// stream is exhausted; after that `current` is empty and no further
    /// I/O happens.
    pub(crate) async fn advance(&mut self) -> bool {
        if self.done {
            return false;
        }
        if self.fused {
            self.finish();
            return false;
        }

        let next = match &mut self.kind {
            Kind::Lazy { stream, timeout } => {
                match recv_next(stream, *timeout, &self.store_id).await {
                    RecvOutcome::Msg(resp) => {
                        self.seen += 1;
                        Some(resp)
                    }
                    RecvOutcome::End => {
                        if self.seen == 0 {
                            self.empty_streams.inc();
                        }
                        None
                    }
                    RecvOutcome::Warn(warning) => {
                        self.fused = true;
                        Some(warning)
                    }
                }
            }
            Kind::Eager { rx, .. } => rx.recv().await,
            Kind::Buffered { queue } => queue.pop_front(),
        };

        match next {
            Some(resp) => {
                if let Some(series) = resp.series() {
                    write_sort_key(series, &mut self.key);
                }
                self.current = Some(resp);
                true
            }
            None => {
                self.finish();
                false
            }
        }
    }

    fn finish(&mut self) {
        self.done = true;
        self.current = None;
    }

    pub(crate) fn current(&self) -> Option<&SeriesResponse> {
        self.current.as_ref()
    }

    pub(crate) fn take_current(&mut self) -> Option<SeriesResponse> {
        self.current.take()
    }

    /// Whether the current response carries a series (and thus refreshed
    /// the sort key).
    pub(crate) fn current_is_series(&self) -> bool {
        self.current.as_ref().and_then(|r| r.series()).is_some()
    }

    pub(crate) fn key(&self) -> &[u8] {
        &self.key
    }

    pub(crate) fn done(&self) -> bool {
        self.done
    }

    pub(crate) fn store_id(&self) -> &str {
        &self.store_id
    }

    /// Release the stream and the buffer lease. Safe to call more than
    /// once and after natural end-of-stream.
    pub(crate) fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Kind::Eager { reader, .. } = &self.kind {
            reader.abort();
        }
        self.pool.put(std::mem::take(&mut self.key));
        self.finish();
    }
}

impl Drop for RespSet {
    fn drop(&mut self) {
        self.close();
    }
}

enum RecvOutcome {
    Msg(SeriesResponse),
    End,
    /// The stream failed; the error is framed as a warning response.
    Warn(SeriesResponse),
}

/// Receive the next message, bounding the silence between messages by
/// `timeout`. The timer restarts on every message, so it bounds silence
/// rather than total stream duration.
async fn recv_next(
    stream: &mut SeriesStream,
    timeout: Option<Duration>,
    store_id: &str,
) -> RecvOutcome {
    let item = match timeout {
        Some(t) => match tokio::time::timeout(t, stream.next()).await {
            Ok(item) => item,
            Err(_) => {
                debug!(store = %store_id, timeout = ?t, "store did not respond within timeout");
                return RecvOutcome::Warn(SeriesResponse::from_warning(format!(
                    "failed to receive any data in {:?} from {}",
                    t, store_id
                )));
            }
        },
        None => stream.next().await,
    };

    match item {
        None => RecvOutcome::End,
        Some(Ok(resp)) => RecvOutcome::Msg(resp),
        Some(Err(status)) => RecvOutcome::Warn(SeriesResponse::from_warning(format!(
            "receive series from {}: {}",
            store_id, status
        ))),
    }
}

/// Collect the whole stream, trim the given labels from every series and
/// re-sort the series responses. Warnings and hints are kept ahead of the
/// data since their series association is lost by the re-sort.
async fn buffer_and_resort(
    store_id: &str,
    mut stream: SeriesStream,
    strip_labels: &[String],
    timeout: Option<Duration>,
    empty_streams: &IntCounter,
) -> VecDeque<SeriesResponse> {
    let mut others = Vec::new();
    let mut series = Vec::new();

    loop {
        match recv_next(&mut stream, timeout, store_id).await {
            RecvOutcome::Msg(mut resp) => {
                match resp.result.as_mut() {
                    Some(querymesh_proto::series_response::Result::Series(s)) => {
                        s.labels.retain(|l| !strip_labels.iter().any(|n| n == &l.name));
                        series.push(resp);
                    }
                    _ => others.push(resp),
                }
            }
            RecvOutcome::End => break,
            RecvOutcome::Warn(warning) => {
                others.push(warning);
                break;
            }
        }
    }

    if others.is_empty() && series.is_empty() {
        empty_streams.inc();
    }

    series.sort_by(|a, b| match (a.series(), b.series()) {
        (Some(a), Some(b)) => series_cmp(a, b),
        _ => Ordering::Equal,
    });

    let mut queue = VecDeque::with_capacity(others.len() + series.len());
    queue.extend(others);
    queue.extend(series);
    queue
}

/// The stream ordering: lexicographic on label `(name, value)` pairs, then
/// on the minimum time of the first chunk.
pub(crate) fn series_cmp(a: &Series, b: &Series) -> Ordering {
    for (la, lb) in a.labels.iter().zip(b.labels.iter()) {
        let ord = la
            .name
            .cmp(&lb.name)
            .then_with(|| la.value.cmp(&lb.value));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.labels
        .len()
        .cmp(&b.labels.len())
        .then_with(|| a.first_chunk_min_time().cmp(&b.first_chunk_min_time()))
}

/// Encode the stream-ordering key of a series so that byte comparison of
/// two keys agrees with [`series_cmp`]. Label names and values are
/// NUL-delimited, a second NUL closes the label section, and the chunk
/// time is appended sign-biased big-endian.
pub(crate) fn write_sort_key(series: &Series, buf: &mut Vec<u8>) {
    buf.clear();
    for label in &series.labels {
        buf.extend_from_slice(label.name.as_bytes());
        buf.push(0);
        buf.extend_from_slice(label.value.as_bytes());
        buf.push(0);
    }
    buf.push(0);
    let biased = (series.first_chunk_min_time() as u64) ^ (1 << 63);
    buf.extend_from_slice(&biased.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{chunk, series, test_counter, test_pool};
    use futures::stream;

    fn ok_stream(responses: Vec<SeriesResponse>) -> SeriesStream {
        Box::pin(stream::iter(responses.into_iter().map(Ok)))
    }

    async fn respset(
        responses: Vec<SeriesResponse>,
        strategy: RetrievalStrategy,
    ) -> RespSet {
        RespSet::with_stream(
            "test-store".to_string(),
            ok_stream(responses),
            strategy,
            None,
            None,
            test_pool(),
            test_counter(),
        )
        .await
        .unwrap()
    }

    async fn drain(set: &mut RespSet) -> Vec<SeriesResponse> {
        let mut out = Vec::new();
        while set.advance().await {
            out.push(set.take_current().unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_lazy_reads_in_order() {
        let responses = vec![
            SeriesResponse::from_series(series(&[("a", "1")], &[chunk(10)])),
            SeriesResponse::from_series(series(&[("a", "2")], &[chunk(20)])),
        ];
        let mut set = respset(responses.clone(), RetrievalStrategy::Lazy).await;
        assert_eq!(drain(&mut set).await, responses);

        // Exhausted cursor stays exhausted.
        assert!(!set.advance().await);
        assert!(set.current().is_none());
    }

    #[tokio::test]
    async fn test_eager_drains_bounded_queue() {
        let responses: Vec<SeriesResponse> = (0..50)
            .map(|i| SeriesResponse::from_series(series(&[("i", &format!("{i:03}"))], &[chunk(i)])))
            .collect();
        let mut set = respset(responses.clone(), RetrievalStrategy::Eager).await;
        assert_eq!(drain(&mut set).await, responses);
    }

    #[tokio::test]
    async fn test_mid_stream_error_becomes_warning() {
        let stream: SeriesStream = Box::pin(stream::iter(vec![
            Ok(SeriesResponse::from_series(series(&[("a", "1")], &[chunk(10)]))),
            Err(Status::unavailable("backend gone")),
        ]));
        let mut set = RespSet::with_stream(
            "flaky".to_string(),
            stream,
            RetrievalStrategy::Lazy,
            None,
            None,
            test_pool(),
            test_counter(),
        )
        .await
        .unwrap();

        assert!(set.advance().await);
        assert!(set.current_is_series());

        assert!(set.advance().await);
        let warning = set.take_current().unwrap();
        assert!(warning.warning().unwrap().contains("flaky"));

        // The warning fuses the cursor; the stream is not read again.
        assert!(!set.advance().await);
    }

    #[tokio::test]
    async fn test_timeout_bounds_silence() {
        let stream: SeriesStream = Box::pin(stream::pending());
        let mut set = RespSet::with_stream(
            "silent".to_string(),
            stream,
            RetrievalStrategy::Lazy,
            None,
            Some(Duration::from_millis(20)),
            test_pool(),
            test_counter(),
        )
        .await
        .unwrap();

        assert!(set.advance().await);
        let warning = set.take_current().unwrap();
        assert!(warning.warning().unwrap().contains("failed to receive any data"));
        assert!(!set.advance().await);
    }

    #[tokio::test]
    async fn test_empty_stream_counted() {
        let counter = test_counter();
        let mut set = RespSet::with_stream(
            "empty".to_string(),
            ok_stream(vec![]),
            RetrievalStrategy::Lazy,
            None,
            None,
            test_pool(),
            counter.clone(),
        )
        .await
        .unwrap();

        assert!(!set.advance().await);
        assert_eq!(counter.get(), 1);
    }

    #[tokio::test]
    async fn test_warning_keeps_previous_key() {
        let stream: SeriesStream = Box::pin(stream::iter(vec![
            Ok(SeriesResponse::from_series(series(&[("a", "1")], &[chunk(10)]))),
            Ok(SeriesResponse::from_warning("late warning")),
        ]));
        let mut set = RespSet::with_stream(
            "s".to_string(),
            stream,
            RetrievalStrategy::Lazy,
            None,
            None,
            test_pool(),
            test_counter(),
        )
        .await
        .unwrap();

        assert!(set.advance().await);
        let key_after_series = set.key().to_vec();
        assert!(set.advance().await);
        assert!(set.current().unwrap().warning().is_some());
        assert_eq!(set.key(), key_after_series.as_slice());
    }

    #[tokio::test]
    async fn test_buffered_strips_and_resorts() {
        // After trimming the replica label the backend's order (by replica
        // first) is no longer the stream order; the cursor must repair it.
        let responses = vec![
            SeriesResponse::from_series(series(&[("a", "2"), ("replica", "r0")], &[chunk(5)])),
            SeriesResponse::from_series(series(&[("a", "1"), ("replica", "r1")], &[chunk(9)])),
        ];
        let mut set = RespSet::with_stream(
            "s".to_string(),
            ok_stream(responses),
            RetrievalStrategy::Lazy,
            Some(vec!["replica".to_string()]),
            None,
            test_pool(),
            test_counter(),
        )
        .await
        .unwrap();

        let out = drain(&mut set).await;
        let labels: Vec<Vec<String>> = out
            .iter()
            .map(|r| {
                r.series()
                    .unwrap()
                    .labels
                    .iter()
                    .map(|l| format!("{}={}", l.name, l.value))
                    .collect()
            })
            .collect();
        assert_eq!(labels, vec![vec!["a=1"], vec!["a=2"]]);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut set = respset(vec![], RetrievalStrategy::Eager).await;
        set.close();
        set.close();
        assert!(!set.advance().await);
    }

    #[test]
    fn test_sort_key_agrees_with_series_cmp() {
        let cases = vec![
            series(&[("a", "1")], &[chunk(10)]),
            series(&[("a", "1")], &[chunk(15)]),
            series(&[("a", "1"), ("b", "2")], &[chunk(5)]),
            series(&[("a", "2")], &[chunk(-100)]),
            series(&[("b", "0")], &[]),
        ];

        let mut keys = Vec::new();
        for s in &cases {
            let mut buf = Vec::new();
            write_sort_key(s, &mut buf);
            keys.push(buf);
        }

        for i in 0..cases.len() {
            for j in 0..cases.len() {
                assert_eq!(
                    keys[i].cmp(&keys[j]),
                    series_cmp(&cases[i], &cases[j]),
                    "key order disagrees for cases {} and {}",
                    i,
                    j
                );
            }
        }
    }
}
