//! K-way ordered merge of response sets
//!
//! A tournament loser tree over the live cursors: `peek` is O(1),
//! `advance` replays one root-to-leaf path, so one comparison per level.
//! Exhausted cursors sort after live ones, and cursors with equal keys are
//! ordered by their stable index, which makes the merged output repeatable
//! when replicas emit identical data.

use crate::respset::RespSet;
use querymesh_proto::SeriesResponse;
use std::cmp::Ordering;
use tonic::Status;

pub(crate) struct LoserTree {
    sets: Vec<RespSet>,
    /// Leaf capacity, the cursor count rounded up to a power of two.
    /// Padding leaves behave like exhausted cursors.
    cap: usize,
    /// Internal nodes; index 0 holds the current winner.
    tree: Vec<usize>,
    initialized: bool,
    prev_key: Vec<u8>,
}

impl LoserTree {
    pub(crate) fn new(sets: Vec<RespSet>) -> Self {
        let cap = sets.len().next_power_of_two().max(1);
        Self {
            sets,
            cap,
            tree: vec![0; cap],
            initialized: false,
            prev_key: Vec::new(),
        }
    }

    /// Pull the next response in stream order.
    ///
    /// A cursor producing a series that sorts below its previous one has
    /// violated the ordering contract; that is a fatal protocol error
    /// attributed to the backend.
    pub(crate) async fn next(&mut self) -> Result<Option<SeriesResponse>, Status> {
        if self.sets.is_empty() {
            return Ok(None);
        }

        if !self.initialized {
            for i in 0..self.sets.len() {
                self.sets[i].advance().await;
            }
            self.build();
            self.initialized = true;
        } else {
            let winner = self.tree[0];
            if self.sets[winner].done() {
                return Ok(None);
            }

            self.prev_key.clear();
            self.prev_key.extend_from_slice(self.sets[winner].key());
            let had_series_key = !self.prev_key.is_empty();

            let advanced = self.sets[winner].advance().await;
            if advanced
                && self.sets[winner].current_is_series()
                && had_series_key
                && self.sets[winner].key() < self.prev_key.as_slice()
            {
                return Err(Status::internal(format!(
                    "store {} emitted out-of-order series",
                    self.sets[winner].store_id()
                )));
            }
            self.replay(winner);
        }

        let winner = self.tree[0];
        if self.sets[winner].done() {
            return Ok(None);
        }
        Ok(self.sets[winner].take_current())
    }

    /// The globally smallest pending response, if any.
    pub(crate) fn peek(&self) -> Option<&SeriesResponse> {
        if !self.initialized {
            return None;
        }
        self.sets.get(self.tree[0]).and_then(|s| s.current())
    }

    /// Close every cursor. Idempotent.
    pub(crate) fn close(&mut self) {
        for set in &mut self.sets {
            set.close();
        }
    }

    fn build(&mut self) {
        let cap = self.cap;
        let mut winners = vec![0usize; 2 * cap];
        for (i, slot) in winners.iter_mut().skip(cap).enumerate() {
            *slot = i;
        }
        for node in (1..cap).rev() {
            let (a, b) = (winners[2 * node], winners[2 * node + 1]);
            if Self::less(&self.sets, a, b) {
                winners[node] = a;
                self.tree[node] = b;
            } else {
                winners[node] = b;
                self.tree[node] = a;
            }
        }
        self.tree[0] = winners[1];
    }

    /// Replay the games along the path from cursor `x`'s leaf to the root.
    fn replay(&mut self, x: usize) {
        let mut winner = x;
        let mut node = (self.cap + x) / 2;
        while node != 0 {
            if Self::less(&self.sets, self.tree[node], winner) {
                std::mem::swap(&mut self.tree[node], &mut winner);
            }
            node /= 2;
        }
        self.tree[0] = winner;
    }

    /// Whether cursor `a` sorts before cursor `b`. Indices at or past the
    /// cursor count are padding and behave like exhausted cursors; equal
    /// keys fall back to the smaller index.
    fn less(sets: &[RespSet], a: usize, b: usize) -> bool {
        let a_done = a >= sets.len() || sets[a].done();
        let b_done = b >= sets.len() || sets[b].done();
        match (a_done, b_done) {
            (true, true) => a < b,
            (true, false) => false,
            (false, true) => true,
            (false, false) => match sets[a].key().cmp(sets[b].key()) {
                Ordering::Less => true,
                Ordering::Greater => false,
                Ordering::Equal => a < b,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::respset::{RespSet, RetrievalStrategy};
    use crate::testutil::{chunk, chunk_with_data, series, test_counter, test_pool};
    use futures::stream;
    use querymesh_proto::{Series, SeriesResponse};

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

    fn from_series(series: Vec<Series>) -> Vec<SeriesResponse> {
        series.into_iter().map(SeriesResponse::from_series).collect()
    }

    async fn drain(tree: &mut LoserTree) -> Vec<SeriesResponse> {
        let mut out = Vec::new();
        while let Some(resp) = tree.next().await.unwrap() {
            out.push(resp);
        }
        out
    }

    fn key_of(resp: &SeriesResponse) -> (Vec<(String, String)>, i64) {
        let series = resp.series().unwrap();
        (
            series
                .labels
                .iter()
                .map(|l| (l.name.clone(), l.value.clone()))
                .collect(),
            series.first_chunk_min_time(),
        )
    }

    #[tokio::test]
    async fn test_two_way_merge_order() {
        // Label key dominates; (a=3, t=5) sorts after (a=2, t=20).
        let b0 = cursor(
            "b0",
            from_series(vec![
                series(&[("a", "1")], &[chunk(10)]),
                series(&[("a", "2")], &[chunk(20)]),
            ]),
        )
        .await;
        let b1 = cursor(
            "b1",
            from_series(vec![
                series(&[("a", "1")], &[chunk(15)]),
                series(&[("a", "3")], &[chunk(5)]),
            ]),
        )
        .await;

        let mut tree = LoserTree::new(vec![b0, b1]);
        let merged = drain(&mut tree).await;
        let keys: Vec<_> = merged.iter().map(key_of).collect();
        assert_eq!(
            keys,
            vec![
                (vec![("a".into(), "1".into())], 10),
                (vec![("a".into(), "1".into())], 15),
                (vec![("a".into(), "2".into())], 20),
                (vec![("a".into(), "3".into())], 5),
            ]
        );
    }

    #[tokio::test]
    async fn test_merge_is_exhaustive_across_many_cursors() {
        let mut cursors = Vec::new();
        for c in 0..5 {
            let responses = from_series(
                (0..4)
                    .map(|i| {
                        series(
                            &[("series", &format!("{:02}", c + 5 * i))],
                            &[chunk((c + 5 * i) as i64)],
                        )
                    })
                    .collect(),
            );
            cursors.push(cursor(&format!("c{c}"), responses).await);
        }

        let mut tree = LoserTree::new(cursors);
        let merged = drain(&mut tree).await;
        assert_eq!(merged.len(), 20);

        let values: Vec<String> = merged
            .iter()
            .map(|r| r.series().unwrap().labels[0].value.clone())
            .collect();
        let mut sorted = values.clone();
        sorted.sort();
        assert_eq!(values, sorted);
    }

    #[tokio::test]
    async fn test_equal_keys_tie_break_by_cursor_index() {
        // Same labels and chunk time, distinguishable payloads. The merge
        // key ignores the payload, so both cursors hold equal keys and the
        // smaller cursor index must win on every run.
        let with_payload = |payload: &[u8]| {
            from_series(vec![series(&[("a", "1")], &[chunk_with_data(10, payload)])])
        };
        let b0 = cursor("b0", with_payload(b"from-b0")).await;
        let b1 = cursor("b1", with_payload(b"from-b1")).await;

        let mut tree = LoserTree::new(vec![b0, b1]);
        let merged = drain(&mut tree).await;
        let payloads: Vec<_> = merged
            .iter()
            .map(|r| r.series().unwrap().chunks[0].raw.as_ref().unwrap().data.clone())
            .collect();
        assert_eq!(payloads, vec![b"from-b0".to_vec(), b"from-b1".to_vec()]);
    }

    #[tokio::test]
    async fn test_warnings_emitted_in_band() {
        let b0 = cursor(
            "b0",
            vec![
                SeriesResponse::from_series(series(&[("a", "1")], &[chunk(10)])),
                SeriesResponse::from_warning("partial data"),
            ],
        )
        .await;
        let b1 = cursor(
            "b1",
            from_series(vec![series(&[("z", "9")], &[chunk(1)])]),
        )
        .await;

        let mut tree = LoserTree::new(vec![b0, b1]);
        let merged = drain(&mut tree).await;

        let warnings: Vec<_> = merged.iter().filter(|r| r.warning().is_some()).collect();
        assert_eq!(warnings.len(), 1);
        assert_eq!(merged.iter().filter(|r| r.series().is_some()).count(), 2);
    }

    #[tokio::test]
    async fn test_out_of_order_cursor_is_fatal() {
        let b0 = cursor(
            "bad-store",
            from_series(vec![
                series(&[("b", "2")], &[chunk(10)]),
                series(&[("a", "1")], &[chunk(10)]),
            ]),
        )
        .await;

        let mut tree = LoserTree::new(vec![b0]);
        assert!(tree.next().await.unwrap().is_some());
        let err = tree.next().await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::Internal);
        assert!(err.message().contains("bad-store"));
    }

    #[tokio::test]
    async fn test_empty_tree() {
        let mut tree = LoserTree::new(Vec::new());
        assert!(tree.next().await.unwrap().is_none());
        assert!(tree.peek().is_none());
    }

    #[tokio::test]
    async fn test_single_cursor_passthrough() {
        let responses = from_series(vec![
            series(&[("a", "1")], &[chunk(1)]),
            series(&[("a", "2")], &[chunk(2)]),
        ]);
        let b0 = cursor("b0", responses.clone()).await;
        let mut tree = LoserTree::new(vec![b0]);
        assert_eq!(drain(&mut tree).await, responses);
    }
}
