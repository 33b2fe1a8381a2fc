//! Backend selection filters
//!
//! Every snapshot entry passes through four predicates before a sub-request
//! is dispatched to it: time-range overlap, the debug `__address__`
//! matchers, the backend's advertised external label sets, and the TSDB
//! selector (applied by the controller). This module also reduces the
//! request matchers against the proxy's own selector labels.

use crate::client::StoreClient;
use querymesh_core::{Error, LabelSet, Matcher, MatcherOp, Result};
use std::collections::{BTreeMap, BTreeSet};

/// Reserved label name carrying a backend address in debug store matchers.
pub const ADDRESS_LABEL: &str = "__address__";

/// Reduce request matchers against the proxy's selector labels.
///
/// Matchers naming a selector label are checked against the stored value
/// and dropped from the forwarded list. Returns `None` when a matcher
/// contradicts the selector, meaning the request cannot match any data in
/// this proxy's scope.
pub fn reduce_matchers(matchers: Vec<Matcher>, selector_labels: &LabelSet) -> Option<Vec<Matcher>> {
    let mut remaining = Vec::with_capacity(matchers.len());
    for matcher in matchers {
        match selector_labels.get(&matcher.name) {
            Some(value) => {
                if !matcher.matches(value) {
                    return None;
                }
            }
            None => remaining.push(matcher),
        }
    }
    Some(remaining)
}

/// Check whether a backend may hold data for the given matchers, time range
/// and debug matchers. The reason string is only rendered when `debug` is
/// set.
pub fn store_matches(
    store: &dyn StoreClient,
    debug: bool,
    debug_matchers: Option<&[Vec<Matcher>]>,
    min_time: i64,
    max_time: i64,
    matchers: &[Matcher],
) -> (bool, Option<String>) {
    let range = store.time_range();
    if !range.overlaps(min_time, max_time) {
        let reason = debug.then(|| {
            format!(
                "does not have data within this time period: [{},{}]. Store time ranges: {}",
                min_time, max_time, range
            )
        });
        return (false, reason);
    }

    let (ok, reason) = store_match_debug_metadata(store, debug, debug_matchers);
    if !ok {
        return (false, reason);
    }

    let label_sets = store.label_sets();
    if !label_sets_match(matchers, &label_sets) {
        let reason = debug.then(|| {
            format!(
                "external labels {:?} do not match request label matchers: {:?}",
                label_sets, matchers
            )
        });
        return (false, reason);
    }

    (true, None)
}

/// Check the backend address against the debug store matchers. Local
/// backends have no address and are rejected whenever matchers exist.
fn store_match_debug_metadata(
    store: &dyn StoreClient,
    debug: bool,
    debug_matchers: Option<&[Vec<Matcher>]>,
) -> (bool, Option<String>) {
    let debug_matchers = match debug_matchers {
        None => return (true, None),
        Some(m) if m.is_empty() => return (true, None),
        Some(m) => m,
    };

    let (addr, is_local) = store.addr();
    if is_local {
        return (
            false,
            debug.then(|| format!("the store is not remote, cannot match {}", ADDRESS_LABEL)),
        );
    }

    let addr_set = LabelSet::from_pairs([(ADDRESS_LABEL, addr.as_str())]);
    let matched = debug_matchers
        .iter()
        .any(|group| label_sets_match(group, std::slice::from_ref(&addr_set)));
    if !matched {
        return (
            false,
            debug.then(|| {
                format!(
                    "{} {} does not match debug store metadata matchers",
                    ADDRESS_LABEL, addr
                )
            }),
        );
    }

    (true, None)
}

/// OR across label sets: the matchers reject a single set only when the set
/// has a matcher's name and the stored value fails that matcher. An empty
/// list of sets passes unconditionally.
pub fn label_sets_match(matchers: &[Matcher], label_sets: &[LabelSet]) -> bool {
    if label_sets.is_empty() {
        return true;
    }

    label_sets.iter().any(|set| {
        matchers.iter().all(|m| match set.get(&m.name) {
            Some(value) => m.matches(value),
            None => true,
        })
    })
}

/// Build matchers constraining a sub-request to the given label sets, one
/// matcher per label name seen in any set. Sets missing a name contribute
/// an empty alternative so they stay matchable.
pub fn matchers_for_label_sets(label_sets: &[LabelSet]) -> Result<Vec<Matcher>> {
    let mut names = BTreeSet::new();
    for set in label_sets {
        for label in set.labels() {
            names.insert(label.name.as_str());
        }
    }

    let mut values_by_name: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for name in names {
        let values = values_by_name.entry(name).or_default();
        for set in label_sets {
            values.insert(set.get(name).unwrap_or(""));
        }
    }

    let mut matchers = Vec::with_capacity(values_by_name.len());
    for (name, values) in values_by_name {
        let matcher = match values.iter().next() {
            Some(value) if values.len() == 1 => Matcher::equal(name, *value),
            _ => {
                let pattern = values
                    .iter()
                    .map(|v| regex::escape(v))
                    .collect::<Vec<_>>()
                    .join("|");
                Matcher::new(MatcherOp::Regex, name, pattern)
                    .map_err(|e| Error::internal(format!("build selector matchers: {}", e)))?
            }
        };
        matchers.push(matcher);
    }
    Ok(matchers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestStore;

    #[test]
    fn test_reduce_matchers_drops_selector_labels() {
        let selector = LabelSet::from_pairs([("region", "eu")]);
        let matchers = vec![
            Matcher::equal("region", "eu"),
            Matcher::equal("job", "node"),
        ];

        let reduced = reduce_matchers(matchers, &selector).unwrap();
        assert_eq!(reduced, vec![Matcher::equal("job", "node")]);
    }

    #[test]
    fn test_reduce_matchers_rejects_contradiction() {
        let selector = LabelSet::from_pairs([("env", "prod")]);
        let matchers = vec![Matcher::equal("env", "dev")];
        assert!(reduce_matchers(matchers, &selector).is_none());
    }

    #[test]
    fn test_reduce_matchers_regex_against_selector() {
        let selector = LabelSet::from_pairs([("env", "prod")]);
        let matchers = vec![Matcher::new(MatcherOp::Regex, "env", "pro.*").unwrap()];
        assert_eq!(reduce_matchers(matchers, &selector), Some(vec![]));
    }

    #[test]
    fn test_label_sets_match_or_semantics() {
        let matchers = vec![Matcher::equal("region", "eu")];
        let sets = vec![
            LabelSet::from_pairs([("region", "us")]),
            LabelSet::from_pairs([("region", "eu")]),
        ];
        assert!(label_sets_match(&matchers, &sets));

        let sets = vec![LabelSet::from_pairs([("region", "us")])];
        assert!(!label_sets_match(&matchers, &sets));
    }

    #[test]
    fn test_label_sets_match_missing_name_passes() {
        // A set without the matcher's name cannot contradict it.
        let matchers = vec![Matcher::equal("region", "eu")];
        let sets = vec![LabelSet::from_pairs([("zone", "a")])];
        assert!(label_sets_match(&matchers, &sets));
    }

    #[test]
    fn test_label_sets_match_empty_sets_pass() {
        let matchers = vec![Matcher::equal("region", "eu")];
        assert!(label_sets_match(&matchers, &[]));
    }

    #[test]
    fn test_store_matches_time_range() {
        let store = TestStore::new("s1").with_time_range(100, 200);
        let (ok, _) = store_matches(&store, false, None, 150, 300, &[]);
        assert!(ok);
        let (ok, _) = store_matches(&store, false, None, 201, 300, &[]);
        assert!(!ok);
    }

    #[test]
    fn test_store_matches_reason_only_in_debug() {
        let store = TestStore::new("s1").with_time_range(100, 200);
        let (ok, reason) = store_matches(&store, false, None, 300, 400, &[]);
        assert!(!ok);
        assert!(reason.is_none());

        let (ok, reason) = store_matches(&store, true, None, 300, 400, &[]);
        assert!(!ok);
        assert!(reason.unwrap().contains("does not have data"));
    }

    #[test]
    fn test_debug_address_matcher() {
        let queried = TestStore::new("s1").with_addr("10.0.0.1:9090");
        let skipped = TestStore::new("s2").with_addr("10.0.0.2:9090");
        let local = TestStore::new("s3").local();

        let debug_matchers = vec![vec![Matcher::equal(ADDRESS_LABEL, "10.0.0.1:9090")]];

        let (ok, _) = store_matches(&queried, false, Some(&debug_matchers), 0, 100, &[]);
        assert!(ok);
        let (ok, _) = store_matches(&skipped, false, Some(&debug_matchers), 0, 100, &[]);
        assert!(!ok);
        // Local backends only fail when matchers exist.
        let (ok, _) = store_matches(&local, false, Some(&debug_matchers), 0, 100, &[]);
        assert!(!ok);
        let (ok, _) = store_matches(&local, false, None, 0, 100, &[]);
        assert!(ok);
    }

    #[test]
    fn test_matchers_for_label_sets() {
        let sets = vec![
            LabelSet::from_pairs([("tenant", "a")]),
            LabelSet::from_pairs([("tenant", "b"), ("zone", "z1")]),
        ];
        let matchers = matchers_for_label_sets(&sets).unwrap();
        assert_eq!(matchers.len(), 2);

        let tenant = &matchers[0];
        assert_eq!(tenant.name, "tenant");
        assert!(tenant.matches("a"));
        assert!(tenant.matches("b"));
        assert!(!tenant.matches("c"));

        // The first set has no zone label, so the empty value is allowed.
        let zone = &matchers[1];
        assert_eq!(zone.name, "zone");
        assert!(zone.matches("z1"));
        assert!(zone.matches(""));
        assert!(!zone.matches("z2"));
    }

    #[test]
    fn test_matchers_for_single_value_use_equality() {
        let sets = vec![LabelSet::from_pairs([("tenant", "a")])];
        let matchers = matchers_for_label_sets(&sets).unwrap();
        assert_eq!(matchers, vec![Matcher::equal("tenant", "a")]);
    }
}
