//! Pluggable TSDB selector
//!
//! The selector decides, per backend, which of its advertised label sets
//! the proxy is interested in. The matched sets are turned into extra
//! matchers AND'ed into every sub-request so backends serving several
//! TSDBs only return the selected ones.

use querymesh_core::LabelSet;
use std::fmt;
use std::sync::Arc;

/// Predicate over the label sets a backend advertises.
#[derive(Clone, Default)]
pub struct TsdbSelector {
    filter: Option<Arc<dyn Fn(&LabelSet) -> bool + Send + Sync>>,
}

impl TsdbSelector {
    /// The default selector accepts every backend and adds no matchers.
    pub fn accept_all() -> Self {
        Self { filter: None }
    }

    /// Selector keeping only label sets accepted by `filter`.
    pub fn new(filter: impl Fn(&LabelSet) -> bool + Send + Sync + 'static) -> Self {
        Self {
            filter: Some(Arc::new(filter)),
        }
    }

    /// Match the backend's label sets. Returns whether the backend should
    /// be queried at all, plus the label sets to constrain the sub-request
    /// to (empty when no constraint is needed).
    pub fn match_label_sets(&self, label_sets: &[LabelSet]) -> (bool, Vec<LabelSet>) {
        let filter = match &self.filter {
            None => return (true, Vec::new()),
            Some(f) => f,
        };

        // A backend that advertises nothing cannot be narrowed down; keep it.
        if label_sets.is_empty() {
            return (true, Vec::new());
        }

        let matched: Vec<LabelSet> = label_sets.iter().filter(|s| filter(s)).cloned().collect();
        (!matched.is_empty(), matched)
    }
}

impl fmt::Debug for TsdbSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TsdbSelector")
            .field("default", &self.filter.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_selector_accepts_all() {
        let selector = TsdbSelector::accept_all();
        let sets = vec![LabelSet::from_pairs([("tenant", "a")])];

        let (matched, extra) = selector.match_label_sets(&sets);
        assert!(matched);
        assert!(extra.is_empty());

        let (matched, extra) = selector.match_label_sets(&[]);
        assert!(matched);
        assert!(extra.is_empty());
    }

    #[test]
    fn test_filtering_selector() {
        let selector = TsdbSelector::new(|set| set.get("tenant") == Some("a"));
        let sets = vec![
            LabelSet::from_pairs([("tenant", "a")]),
            LabelSet::from_pairs([("tenant", "b")]),
        ];

        let (matched, extra) = selector.match_label_sets(&sets);
        assert!(matched);
        assert_eq!(extra, vec![LabelSet::from_pairs([("tenant", "a")])]);

        let (matched, extra) =
            selector.match_label_sets(&[LabelSet::from_pairs([("tenant", "b")])]);
        assert!(!matched);
        assert!(extra.is_empty());
    }

    #[test]
    fn test_unlabeled_backend_passes_filtering_selector() {
        let selector = TsdbSelector::new(|_| false);
        let (matched, extra) = selector.match_label_sets(&[]);
        assert!(matched);
        assert!(extra.is_empty());
    }
}
