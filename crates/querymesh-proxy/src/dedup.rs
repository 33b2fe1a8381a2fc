//! Replica deduplication
//!
//! Replicas of the same group typically emit bit-identical responses. The
//! deduplicator sits above the merge and collapses consecutive series
//! whose labels and chunk payloads are byte-equal. It is intentionally
//! conservative: equal-key series with different chunks are both
//! forwarded and left for the query engine to reconcile, so nothing is
//! ever lost. Warnings and hints pass through untouched.

use crate::merge::LoserTree;
use querymesh_proto::{Series, SeriesResponse};
use tonic::Status;

pub(crate) struct ResponseDeduplicator {
    tree: LoserTree,
    previous: Option<Series>,
}

impl ResponseDeduplicator {
    pub(crate) fn new(tree: LoserTree) -> Self {
        Self {
            tree,
            previous: None,
        }
    }

    /// Pull the next non-duplicate response.
    pub(crate) async fn next(&mut self) -> Result<Option<SeriesResponse>, Status> {
        loop {
            let resp = match self.tree.next().await? {
                None => return Ok(None),
                Some(resp) => resp,
            };

            match resp.series() {
                Some(series) => {
                    if self.previous.as_ref() == Some(series) {
                        continue;
                    }
                    self.previous = Some(series.clone());
                    return Ok(Some(resp));
                }
                None => return Ok(Some(resp)),
            }
        }
    }

    /// Close the underlying cursors. Idempotent.
    pub(crate) fn close(&mut self) {
        self.tree.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::respset::{RespSet, RetrievalStrategy};
    use crate::testutil::{chunk, chunk_with_data, series, test_counter, test_pool};
    use futures::stream;

    async fn cursor(name: &str, responses: Vec<SeriesResponse>) -> RespSet {
        RespSet::with_stream(
            name.to_string(),
            Box::pin(stream::iter(responses.into_iter().map(Ok))),
            RetrievalStrategy::Lazy,
            None,
            None,
            test_pool(),
            test_counter(),
        )
        .await
        .unwrap()
    }

    async fn drain(dedup: &mut ResponseDeduplicator) -> Vec<SeriesResponse> {
        let mut out = Vec::new();
        while let Some(resp) = dedup.next().await.unwrap() {
            out.push(resp);
        }
        out
    }

    #[tokio::test]
    async fn test_identical_replicas_collapse_to_one() {
        let replica = |_: &str| {
            vec![SeriesResponse::from_series(series(
                &[("a", "1")],
                &[chunk_with_data(10, b"X")],
            ))]
        };
        let b0 = cursor("b0", replica("r0")).await;
        let b1 = cursor("b1", replica("r1")).await;

        let mut dedup = ResponseDeduplicator::new(LoserTree::new(vec![b0, b1]));
        let out = drain(&mut dedup).await;
        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].series().unwrap().chunks[0].raw.as_ref().unwrap().data,
            b"X".to_vec()
        );
    }

    #[tokio::test]
    async fn test_two_replicas_equal_single_backend() {
        // Dedup idempotence: two identical backends produce the same
        // merged output as one.
        let payload = || {
            vec![
                SeriesResponse::from_series(series(&[("a", "1")], &[chunk(10)])),
                SeriesResponse::from_series(series(&[("a", "2")], &[chunk(20)])),
            ]
        };

        let mut single =
            ResponseDeduplicator::new(LoserTree::new(vec![cursor("b0", payload()).await]));
        let single_out = drain(&mut single).await;

        let mut pair = ResponseDeduplicator::new(LoserTree::new(vec![
            cursor("b0", payload()).await,
            cursor("b1", payload()).await,
        ]));
        let pair_out = drain(&mut pair).await;

        assert_eq!(single_out, pair_out);
    }

    #[tokio::test]
    async fn test_equal_key_different_chunks_both_forwarded() {
        let b0 = cursor(
            "b0",
            vec![SeriesResponse::from_series(series(
                &[("a", "1")],
                &[chunk_with_data(10, b"X")],
            ))],
        )
        .await;
        let b1 = cursor(
            "b1",
            vec![SeriesResponse::from_series(series(
                &[("a", "1")],
                &[chunk_with_data(10, b"Y")],
            ))],
        )
        .await;

        let mut dedup = ResponseDeduplicator::new(LoserTree::new(vec![b0, b1]));
        assert_eq!(drain(&mut dedup).await.len(), 2);
    }

    #[tokio::test]
    async fn test_warnings_not_deduplicated() {
        let warn = || vec![SeriesResponse::from_warning("same warning")];
        let b0 = cursor("b0", warn()).await;
        let b1 = cursor("b1", warn()).await;

        let mut dedup = ResponseDeduplicator::new(LoserTree::new(vec![b0, b1]));
        assert_eq!(drain(&mut dedup).await.len(), 2);
    }
}
