//! Selection of the entries that have to be transferred.

use crate::manifest::{Column, ContentHash, ManifestEntry, ManifestSnapshot};
use serde::Serialize;
use tracing::warn;

/// One remote entry selected for transfer.
///
/// The key is resolved against the source and destination stores to obtain
/// the two locators; the item itself is never modified after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkItem {
    pub entry: ManifestEntry,
}

impl WorkItem {
    pub fn key(&self) -> &str {
        &self.entry.key
    }

    pub fn expected_hash(&self) -> Option<&ContentHash> {
        self.entry.content_hash.as_ref()
    }

    pub fn expected_size(&self) -> Option<u64> {
        self.entry.size_bytes
    }
}

/// The work set of a run.
#[derive(Debug, Clone, Default)]
pub struct WorkPlan {
    pub items: Vec<WorkItem>,
    /// Remote entries without a sha256 that were compared by key alone even
    /// though hash verification was requested.
    pub unverifiable: usize,
}

impl WorkPlan {
    pub fn total_bytes(&self) -> u64 {
        self.items.iter().filter_map(|i| i.expected_size()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Columns a remote entry is matched on against the destination.
pub fn comparison_columns(verify_hash: bool) -> &'static [Column] {
    if verify_hash {
        &[Column::Key, Column::Sha256]
    } else {
        &[Column::Key]
    }
}

/// Remote entries the destination does not hold, plus the number of
/// hash-less rows that could only be compared by key.
///
/// With `verify_hash` off, an entry is held when its key is present (fast
/// path: a changed file under an unchanged name goes unnoticed). With it on,
/// key and sha256 must both match, except for remote rows lacking a sha256,
/// which fall back to the key comparison.
pub fn missing_entries(
    remote: &ManifestSnapshot,
    local: &ManifestSnapshot,
    verify_hash: bool,
) -> (ManifestSnapshot, usize) {
    if !verify_hash {
        return (remote.difference(local, comparison_columns(false)), 0);
    }

    let hashed = remote.filter(|e| e.content_hash.is_some());
    let unhashed = remote.filter(|e| e.content_hash.is_none());

    let mut missing = hashed.difference(local, comparison_columns(true)).into_entries();
    missing.extend(unhashed.difference(local, comparison_columns(false)).into_entries());
    (ManifestSnapshot::new(missing), unhashed.len())
}

/// Computes the work set: remote entries absent from the local state.
///
/// An empty remote manifest yields an empty work set. Output order is not
/// meaningful.
pub fn compute_work(
    remote: &ManifestSnapshot,
    local: &ManifestSnapshot,
    verify_hash: bool,
) -> WorkPlan {
    let (missing, unverifiable) = missing_entries(remote, local, verify_hash);
    if unverifiable > 0 {
        warn!(
            "{} remote entries have no sha256; they are compared by key only and not re-checked",
            unverifiable
        );
    }
    WorkPlan {
        items: missing
            .into_entries()
            .into_iter()
            .map(|entry| WorkItem { entry })
            .collect(),
        unverifiable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::tests::hash;

    fn remote(key: &str, fill: char, size: u64) -> ManifestEntry {
        ManifestEntry::new(key).with_hash(hash(fill)).with_size(size)
    }

    fn keys(plan: &WorkPlan) -> Vec<&str> {
        let mut keys: Vec<_> = plan.items.iter().map(|i| i.key()).collect();
        keys.sort();
        keys
    }

    #[test]
    fn test_empty_destination_selects_everything() {
        let remote = ManifestSnapshot::new(vec![remote("a", '1', 10), remote("b", '2', 20)]);
        let plan = compute_work(&remote, &ManifestSnapshot::default(), false);
        assert_eq!(keys(&plan), vec!["a", "b"]);
        assert_eq!(plan.total_bytes(), 30);
    }

    #[test]
    fn test_empty_remote_is_empty_work() {
        let local = ManifestSnapshot::new(vec![remote("a", '1', 10)]);
        assert!(compute_work(&ManifestSnapshot::default(), &local, true).is_empty());
    }

    #[test]
    fn test_changed_hash_is_refetched_only_when_verifying() {
        let remote = ManifestSnapshot::new(vec![remote("a", '3', 10)]);
        let local = ManifestSnapshot::new(vec![ManifestEntry::new("a")
            .with_hash(hash('1'))
            .with_size(10)]);

        assert_eq!(keys(&compute_work(&remote, &local, true)), vec!["a"]);
        assert!(compute_work(&remote, &local, false).is_empty());
    }

    #[test]
    fn test_unhashed_remote_rows_fall_back_to_key() {
        let remote = ManifestSnapshot::new(vec![
            ManifestEntry::new("legacy").with_size(5),
            ManifestEntry::new("fresh").with_size(5),
        ]);
        let local = ManifestSnapshot::new(vec![ManifestEntry::new("legacy")
            .with_hash(hash('9'))
            .with_size(5)]);

        let plan = compute_work(&remote, &local, true);
        assert_eq!(keys(&plan), vec!["fresh"]);
        assert_eq!(plan.unverifiable, 2);
    }

    #[test]
    fn test_second_run_is_idempotent() {
        let remote = ManifestSnapshot::new(vec![remote("a", '1', 10), remote("b", '2', 20)]);
        // What a hashed scan reports after a successful first run.
        let local = remote.project(&[Column::Key, Column::Sha256, Column::Size]);

        assert!(compute_work(&remote, &local, true).is_empty());
        assert!(compute_work(&remote, &local, false).is_empty());
    }
}
