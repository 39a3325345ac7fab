//! Source digest and per-file diffing
//!
//! All multi-file sources reduce to a map of `path -> per-file digest`.
//! The combined digest hashes the entries in key order so it is invariant
//! under listing order, and two maps diff into disjoint added / deleted /
//! changed sets.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// Per-file diff between two source fingerprints
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FileDiff {
    pub added: Vec<String>,
    pub deleted: Vec<String>,
    pub changed: Vec<String>,
}

/// Combined digest over `(key, per-key digest)` entries.
///
/// BTreeMap iteration order is lexicographic, which gives the
/// sort-before-hash property for free.
pub fn digest_sorted(hashes: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in hashes {
        hasher.update(key.as_bytes());
        hasher.update(value.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Compare old and new per-file digests.
///
/// `added` holds keys only in `new`, `deleted` keys only in `old`, and
/// `changed` keys present in both whose digests differ. The three sets are
/// pairwise disjoint by construction.
pub fn diff_file_hashes(old: &BTreeMap<String, String>, new: &BTreeMap<String, String>) -> FileDiff {
    let mut diff = FileDiff::default();

    for (file, new_hash) in new {
        match old.get(file) {
            None => diff.added.push(file.clone()),
            Some(old_hash) if old_hash != new_hash => diff.changed.push(file.clone()),
            Some(_) => {}
        }
    }

    for file in old.keys() {
        if !new.contains_key(file) {
            diff.deleted.push(file.clone());
        }
    }

    diff
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_digest_known_vector() {
        // SHA256("a" || "x" || "b" || "y")
        let hashes = map(&[("a", "x"), ("b", "y")]);
        let expected = hex::encode(Sha256::digest(b"axby"));
        assert_eq!(digest_sorted(&hashes), expected);
    }

    #[test]
    fn test_digest_invariant_under_insertion_order() {
        let mut forward = BTreeMap::new();
        forward.insert("a".to_string(), "x".to_string());
        forward.insert("b".to_string(), "y".to_string());
        forward.insert("c".to_string(), "z".to_string());

        let mut reverse = BTreeMap::new();
        reverse.insert("c".to_string(), "z".to_string());
        reverse.insert("b".to_string(), "y".to_string());
        reverse.insert("a".to_string(), "x".to_string());

        assert_eq!(digest_sorted(&forward), digest_sorted(&reverse));
    }

    #[test]
    fn test_digest_sensitive_to_values() {
        assert_ne!(
            digest_sorted(&map(&[("a", "x")])),
            digest_sorted(&map(&[("a", "y")])),
        );
    }

    #[test]
    fn test_diff_partition() {
        let old = map(&[("a", "x"), ("b", "y"), ("c", "z")]);
        let new = map(&[("a", "x"), ("c", "w"), ("d", "v")]);

        let diff = diff_file_hashes(&old, &new);
        assert_eq!(diff.added, vec!["d"]);
        assert_eq!(diff.deleted, vec!["b"]);
        assert_eq!(diff.changed, vec!["c"]);
    }

    #[test]
    fn test_diff_disjoint_sets() {
        let old = map(&[("a", "1"), ("b", "2")]);
        let new = map(&[("b", "3"), ("c", "4")]);
        let diff = diff_file_hashes(&old, &new);

        for file in &diff.added {
            assert!(!diff.deleted.contains(file));
            assert!(!diff.changed.contains(file));
        }
        for file in &diff.deleted {
            assert!(!diff.changed.contains(file));
        }
    }

    #[test]
    fn test_diff_identical_maps() {
        let m = map(&[("a", "x"), ("b", "y")]);
        assert_eq!(diff_file_hashes(&m, &m), FileDiff::default());
    }
}
