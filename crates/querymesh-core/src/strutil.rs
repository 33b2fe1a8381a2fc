//! String slice utilities used when merging backend responses

/// Merge unsorted string slices into one sorted slice with duplicates
/// removed.
pub fn merge_unsorted(slices: Vec<Vec<String>>) -> Vec<String> {
    let mut merged: Vec<String> = slices.into_iter().flatten().collect();
    merged.sort_unstable();
    merged.dedup();
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_unsorted() {
        let merged = merge_unsorted(vec![
            vec!["b".to_string(), "a".to_string()],
            vec!["c".to_string(), "a".to_string()],
        ]);
        assert_eq!(merged, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_merge_empty() {
        assert!(merge_unsorted(vec![]).is_empty());
        assert!(merge_unsorted(vec![vec![], vec![]]).is_empty());
    }
}
